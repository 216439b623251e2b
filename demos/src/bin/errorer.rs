//! Demo server that can be made to fail immediately on startup, for
//! exercising the "broken successor" recovery path: a `SIGHUP` whose
//! re-exec'd image dies right away must leave the original process
//! serving, unharmed.
//!
//! Set `ECDYSIS_DEMO_BROKEN=1` to make this binary behave like a
//! release that can't start. `--working-dir` supports the same
//! symlinked-deploy-root trick as `greeter`: a `BROKEN` marker file in
//! the current working directory has the same effect, so a deploy root
//! repointed at a broken release (`current -> v2` containing `BROKEN`)
//! fails the same way without touching the environment.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};

#[derive(Parser)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen_addr: SocketAddr,

    /// Time allowed for the temporary child / successor to come up, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    startup_delay_ms: u64,

    /// Directory to chdir into before re-executing (supports symlinked deploy roots).
    #[arg(long)]
    working_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    ecdysis::set_startup_delay(Duration::from_millis(args.startup_delay_ms));
    if let Some(dir) = &args.working_dir {
        ecdysis::set_working_dir(dir);
    }

    if std::env::var("ECDYSIS_DEMO_BROKEN").as_deref() == Ok("1") || Path::new("BROKEN").exists() {
        tracing::error!("this release is broken, refusing to start");
        std::process::exit(1);
    }

    tracing::info!(pid = std::process::id(), addr = %args.listen_addr, "errorer starting");

    ecdysis::serve(args.listen_addr, None, respond).await?;
    Ok(())
}

async fn respond(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    tokio::time::sleep(Duration::from_millis(100)).await;
    let body = format!("Hello from {} (pid={})\n", "errorer", std::process::id());
    Ok(Response::new(Full::new(Bytes::from(body))))
}
