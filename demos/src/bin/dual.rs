//! Demo server registering two independently-upgradeable listeners,
//! exercising multi-identifier upgrades in one process.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};

#[derive(Parser)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr_one: SocketAddr,

    #[arg(long, default_value = "127.0.0.1:8081")]
    addr_two: SocketAddr,

    /// Time allowed for the temporary child / successor to come up, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    startup_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    ecdysis::set_startup_delay(Duration::from_millis(args.startup_delay_ms));

    tracing::info!(pid = std::process::id(), "dual demo starting");

    let one = ecdysis::serve(args.addr_one, Some("one"), |req| respond(req, "one"));
    let two = ecdysis::serve(args.addr_two, Some("two"), |req| respond(req, "two"));

    let (one, two) = tokio::join!(one, two);
    one?;
    two?;

    tracing::info!("exiting");
    Ok(())
}

async fn respond(
    _req: Request<Incoming>,
    which: &'static str,
) -> Result<Response<Full<Bytes>>, Infallible> {
    tokio::time::sleep(Duration::from_millis(500)).await;
    let body = format!("Hello from {which} (pid={})\n", std::process::id());
    Ok(Response::new(Full::new(Bytes::from(body))))
}
