//! Single-listener demo server exercising the upgrade handoff end to end.
//!
//! Each response carries the serving process's pid and start time, so a
//! caller can tell from the outside when a `SIGHUP` has actually swapped
//! in a new process generation.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};

#[derive(Parser)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen_addr: SocketAddr,

    /// Identifier this listener is registered under.
    #[arg(long, default_value = "default")]
    ident: String,

    /// How long the handler sleeps before responding, simulating a slow request.
    #[arg(long, default_value_t = 250)]
    handler_delay_ms: u64,

    /// Bound on draining in-flight connections during shutdown/upgrade, in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    drain_timeout_ms: u64,

    /// Time allowed for the temporary child / successor to come up, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    startup_delay_ms: u64,

    /// Directory to chdir into before re-executing (supports symlinked deploy roots).
    #[arg(long)]
    working_dir: Option<String>,
}

static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    START.get_or_init(Instant::now);

    ecdysis::set_drain_timeout(Duration::from_millis(args.drain_timeout_ms));
    ecdysis::set_startup_delay(Duration::from_millis(args.startup_delay_ms));
    if let Some(dir) = &args.working_dir {
        ecdysis::set_working_dir(dir);
    }

    tracing::info!(pid = std::process::id(), addr = %args.listen_addr, "greeter starting");

    let delay = Duration::from_millis(args.handler_delay_ms);
    ecdysis::serve(args.listen_addr, Some(&args.ident), move |req| {
        respond(req, delay)
    })
    .await?;

    Ok(())
}

async fn respond(
    _req: Request<Incoming>,
    delay: Duration,
) -> Result<Response<Full<Bytes>>, Infallible> {
    tokio::time::sleep(delay).await;

    let elapsed = START.get().map(|s| s.elapsed()).unwrap_or_default();
    let release = read_release_marker();
    let body = format!(
        "Hello (pid={})\nStarted {:?} ago\nRelease: {release}\n",
        std::process::id(),
        elapsed
    );

    Ok(Response::builder()
        .header("Connection", "close")
        .body(Full::new(Bytes::from(body)))
        .expect("response builder"))
}

/// Read a `release` marker file out of the current working directory,
/// re-reading on every request rather than caching it at startup so a
/// symlinked deploy root (`current -> v1`, repointed to `v2`) is picked
/// up the moment a re-exec'd successor has `chdir`'d into it.
fn read_release_marker() -> String {
    std::fs::read_to_string("release")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
