//! The upgrade state machine.
//!
//! One process-wide [`Controller`] owns the listener registry and the
//! background tasks that drive a SIGHUP-triggered upgrade: spawning a
//! temporary child to hold the sockets, waiting for it to come up,
//! harvesting fresh descriptors, and re-executing the program image as
//! a successor.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use crate::config;
use crate::env::EnvMap;
use crate::error::Error;
use crate::listener::GracefulListener;
use crate::resume::resume_or_listen;
use crate::role::{self, Role};

/// Counts how many `serve()` calls are still "active" — accepting,
/// draining, or parked waiting for this process's image to be
/// replaced. `exec` must not run until this reaches zero.
struct ActiveBarrier {
    count: AtomicUsize,
    notify: Notify,
}

impl ActiveBarrier {
    fn new() -> Self {
        Self { count: AtomicUsize::new(0), notify: Notify::new() }
    }

    fn enter(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    async fn wait_until_zero(&self) {
        loop {
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            self.notify.notified().await;
        }
    }
}

struct Controller {
    registry: Mutex<HashMap<String, Arc<GracefulListener>>>,
    role: Role,
    barrier: ActiveBarrier,
}

static CONTROLLER: OnceLock<Controller> = OnceLock::new();

fn global() -> &'static Controller {
    CONTROLLER.get_or_init(|| {
        let env = EnvMap::from_process();
        let role = role::detect(&env);
        info!(?role, "ecdysis controller starting");

        Controller {
            registry: Mutex::new(HashMap::new()),
            role,
            barrier: ActiveBarrier::new(),
        }
    })
}

/// Run background signal-handling tasks. Idempotent: safe to call on
/// every `serve()` invocation, only actually spawns tasks once.
fn ensure_background_tasks_started(controller: &'static Controller) {
    static STARTED: OnceLock<()> = OnceLock::new();
    if STARTED.set(()).is_err() {
        return;
    }

    match controller.role {
        Role::Parent | Role::Successor => {
            tokio::spawn(run_upgrade_signal_loop(controller));
            tokio::spawn(run_stop_temporary_child());
        }
        Role::TemporaryChild => {
            tokio::spawn(run_temporary_child_signal_loop(controller));
        }
    }
}

/// Register and serve one listener identified by `ident` (default:
/// `"default"`), dispatching accepted HTTP/1.1 connections to
/// `handler` until the listener is closed by an upgrade or shutdown.
pub async fn serve<H, Fut>(addr: SocketAddr, ident: Option<&str>, handler: H) -> Result<(), Error>
where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Full<Bytes>>, Infallible>> + Send + 'static,
{
    let controller = global();
    ensure_background_tasks_started(controller);

    let ident = ident.unwrap_or("default").to_string();

    let listener = {
        let mut registry = controller.registry.lock().await;
        if registry.contains_key(&ident) {
            return Err(Error::DuplicateIdentifier(ident));
        }

        let inherited_fd = inherited_fd_for(&ident);
        let listener = Arc::new(resume_or_listen(&ident, inherited_fd, addr).await?);
        registry.insert(ident.clone(), Arc::clone(&listener));
        listener
    };

    controller.barrier.enter();

    while let Some((stream, peer, guard)) = listener.accept().await {
        let handler = handler.clone();
        // Held until the connection finishes, in addition to `guard`:
        // `wait_for_clients` below is only advisory past its timeout,
        // but `exec` itself must never run out from under a connection
        // that is still being served, or the accepted socket (closed
        // on exec, being non-inherited) gets yanked out from under it.
        controller.barrier.enter();
        tokio::spawn(async move {
            let _guard = guard;
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req| handler(req));
            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                warn!(%err, %peer, "connection error");
            }
            controller.barrier.leave();
        });
    }

    if let Err(Error::DrainTimeout { remaining }) =
        listener.wait_for_clients(config::drain_timeout()).await
    {
        warn!(ident = %ident, remaining, "drain timed out past the bound, waiting for real completion before exec");
    }

    if controller.role.is_parent_like() {
        controller.barrier.leave();
        // Wait to be replaced by `exec`; the re-exec task is the only
        // thing that can end this process from here.
        std::future::pending::<()>().await;
        unreachable!("process should have been replaced by exec");
    }

    controller.barrier.leave();
    Ok(())
}

fn inherited_fd_for(ident: &str) -> Option<RawFd> {
    let env = EnvMap::from_process();
    env.get(&EnvMap::listen_fd_key(ident))
        .and_then(|v| v.parse::<RawFd>().ok())
}

async fn run_upgrade_signal_loop(controller: &'static Controller) {
    let Ok(mut sighup) = unix_signal(SignalKind::hangup()) else {
        error!("failed to install SIGHUP handler");
        return;
    };

    loop {
        sighup.recv().await;
        info!("SIGHUP received, attempting upgrade");
        attempt_upgrade(controller).await;
    }
}

async fn run_temporary_child_signal_loop(controller: &'static Controller) {
    let Ok(mut sighup) = unix_signal(SignalKind::hangup()) else {
        error!("failed to install SIGHUP handler");
        return;
    };

    sighup.recv().await;
    info!("SIGHUP received in temporary child, closing listeners");
    let registry = controller.registry.lock().await;
    for listener in registry.values() {
        listener.close();
    }
}

async fn attempt_upgrade(controller: &'static Controller) {
    let registry = controller.registry.lock().await;
    let listeners: Vec<(String, Arc<GracefulListener>)> =
        registry.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect();

    let child_pid = match spawn_temporary_child(&listeners) {
        Ok(pid) => pid,
        Err(err) => {
            error!(%err, "failed to spawn temporary child, aborting upgrade");
            return;
        }
    };

    tokio::time::sleep(config::startup_delay()).await;

    let envelope = match harvest_fds(&listeners) {
        Ok(envelope) => envelope,
        Err(err) => {
            error!(%err, "failed to harvest listener descriptors, aborting upgrade");
            if let Err(err) = signal::kill(Pid::from_raw(child_pid), Signal::SIGHUP) {
                error!(%err, pid = child_pid, "failed to signal orphaned temporary child");
            }
            return;
        }
    };

    tokio::spawn(re_exec_when_drained(controller, envelope, child_pid));

    for (_, listener) in &listeners {
        listener.close();
    }
}

fn spawn_temporary_child(
    listeners: &[(String, Arc<GracefulListener>)],
) -> Result<i32, Error> {
    let exe = std::env::current_exe().map_err(Error::SpawnFailed)?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut fds = Vec::with_capacity(listeners.len());
    for (ident, listener) in listeners {
        match listener.prepare_fd() {
            Ok(fd) => fds.push((ident.clone(), fd)),
            Err(source) => {
                for (_, fd) in &fds {
                    unsafe { libc::close(*fd) };
                }
                return Err(Error::SpawnFailed(source));
            }
        }
    }

    let mut command = std::process::Command::new(&exe);
    command.args(&args);
    command.env(crate::env::TEMPORARY_CHILD, "1");
    for (ident, fd) in &fds {
        command.env(EnvMap::listen_fd_key(ident), fd.to_string());
    }

    match command.spawn() {
        Ok(child) => {
            let pid = child.id() as i32;
            // Don't wait on `child` — the successor reaps it later via
            // `waitpid`, once it has signaled it to exit. The child now
            // has its own copies of these fds (inherited across its
            // exec); our copies must be closed or they leak into every
            // later `execve` this process makes, including its own.
            for (_, fd) in &fds {
                unsafe { libc::close(*fd) };
            }
            info!(pid, fds = ?fds, "spawned temporary child");
            Ok(pid)
        }
        Err(err) => {
            for (_, fd) in &fds {
                unsafe { libc::close(*fd) };
            }
            Err(Error::SpawnFailed(err))
        }
    }
}

fn harvest_fds(
    listeners: &[(String, Arc<GracefulListener>)],
) -> Result<Vec<(String, RawFd)>, Error> {
    let mut fds = Vec::with_capacity(listeners.len());
    for (ident, listener) in listeners {
        match listener.prepare_fd() {
            Ok(fd) => fds.push((ident.clone(), fd)),
            Err(source) => {
                for (_, fd) in &fds {
                    unsafe { libc::close(*fd) };
                }
                return Err(Error::HarvestFailed(source));
            }
        }
    }
    Ok(fds)
}

async fn re_exec_when_drained(
    controller: &'static Controller,
    envelope: Vec<(String, RawFd)>,
    temporary_child_pid: i32,
) {
    controller.barrier.wait_until_zero().await;

    let mut env = EnvMap::from_process();
    env.remove(crate::env::TEMPORARY_CHILD);
    env.set(crate::env::TEMPORARY_CHILD_PID, temporary_child_pid.to_string());
    for (ident, fd) in &envelope {
        env.set(EnvMap::listen_fd_key(ident), fd.to_string());
    }

    if let Some(dir) = config::resolve_working_dir() {
        if let Err(err) = std::env::set_current_dir(&dir) {
            error!(%err, dir = %dir.display(), "failed to chdir before re-exec");
        }
    }

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(source) => {
            let err = Error::ExecFailed(source);
            error!(%err, "failed to resolve current executable for re-exec");
            panic!("{err}");
        }
    };
    let args: Vec<String> = std::env::args().collect();

    info!(exe = %exe.display(), envelope = ?envelope, "re-executing as successor");
    let err = Error::ExecFailed(crate::exec::exec_self(&exe, &args, &env));
    error!(%err, "execve returned unexpectedly");
    panic!("{err}");
}

async fn run_stop_temporary_child() {
    let env = EnvMap::from_process();
    let Some(pid_str) = env.get(crate::env::TEMPORARY_CHILD_PID) else {
        return;
    };
    let Ok(pid) = pid_str.parse::<i32>() else {
        warn!(pid_str, "unparseable TEMPORARY_CHILD_PID, not signaling");
        return;
    };

    tokio::time::sleep(config::startup_delay()).await;

    info!(pid, "signaling temporary child to exit");
    if let Err(err) = signal::kill(Pid::from_raw(pid), Signal::SIGHUP) {
        warn!(%err, pid, "failed to signal temporary child (may have already exited)");
        return;
    }

    let reaped = tokio::task::spawn_blocking(move || {
        nix::sys::wait::waitpid(Pid::from_raw(pid), None)
    })
    .await;

    match reaped {
        Ok(Ok(status)) => info!(pid, ?status, "temporary child reaped"),
        Ok(Err(err)) => warn!(%err, pid, "waitpid failed"),
        Err(err) => error!(%err, "waitpid task panicked"),
    }
}
