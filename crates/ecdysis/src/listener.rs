//! A TCP listener that tracks its outstanding accepted connections so
//! the upgrade controller can wait for them to drain before closing.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;

struct Shared {
    addr: SocketAddr,
    count: AtomicUsize,
    stopping: AtomicBool,
    drain_notify: Notify,
    cancel: CancellationToken,
}

/// A listener plus bookkeeping for graceful shutdown.
///
/// The network address is captured once at construction and cached, so
/// it remains available after `close()` has torn down the underlying
/// socket.
pub struct GracefulListener {
    shared: Arc<Shared>,
    inner: TcpListener,
}

/// RAII handle held for the lifetime of one accepted connection.
///
/// Dropping it decrements the owning listener's live-connection count
/// and wakes anyone waiting in [`GracefulListener::wait_for_clients`].
/// The ownership model makes a double-release impossible to express:
/// there is exactly one guard per accepted connection and exactly one
/// place it can be dropped.
pub struct ConnectionGuard {
    shared: Arc<Shared>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.shared.count.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.shared.drain_notify.notify_waiters();
        }
    }
}

impl GracefulListener {
    pub(crate) fn new(inner: TcpListener) -> io::Result<Self> {
        let addr = inner.local_addr()?;
        Ok(Self {
            shared: Arc::new(Shared {
                addr,
                count: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                drain_notify: Notify::new(),
                cancel: CancellationToken::new(),
            }),
            inner,
        })
    }

    /// The address this listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Number of connections accepted but not yet dropped.
    pub fn active_connections(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    /// Accept the next connection, or `None` once `close()` has been called.
    pub async fn accept(&self) -> Option<(TcpStream, SocketAddr, ConnectionGuard)> {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => None,
            result = self.inner.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        self.shared.count.fetch_add(1, Ordering::SeqCst);
                        let guard = ConnectionGuard { shared: Arc::clone(&self.shared) };
                        Some((stream, peer, guard))
                    }
                    Err(err) => {
                        warn!(%err, addr = %self.shared.addr, "accept failed");
                        None
                    }
                }
            }
        }
    }

    /// Stop accepting new connections. The underlying socket's file
    /// descriptor is released once the accept loop holding this
    /// listener returns and the `TcpListener` drops; no separate raw
    /// `close()` syscall is needed.
    pub fn close(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    /// Wait until every accepted connection has been dropped, or until
    /// `timeout` elapses.
    pub async fn wait_for_clients(&self, timeout: Duration) -> Result<(), Error> {
        if self.active_connections() == 0 {
            return Ok(());
        }

        tokio::select! {
            _ = self.wait_for_drain() => {
                debug!(addr = %self.shared.addr, "listener drained cleanly");
                Ok(())
            }
            _ = tokio::time::sleep(timeout) => {
                Err(Error::DrainTimeout { remaining: self.active_connections() })
            }
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            if self.shared.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            self.shared.drain_notify.notified().await;
        }
    }

    /// Duplicate the underlying socket's descriptor with close-on-exec
    /// cleared, for handoff to a spawned or exec'd process.
    pub fn prepare_fd(&self) -> io::Result<RawFd> {
        dup_cloexec_cleared(self.inner.as_raw_fd())
    }
}

/// Duplicate `fd` via `F_DUPFD_CLOEXEC` (so the duplicate never leaks
/// into an unrelated child started concurrently) then immediately
/// clear `FD_CLOEXEC` on the new descriptor so it survives the
/// deliberate `exec` it is being prepared for.
pub(crate) fn dup_cloexec_cleared(fd: RawFd) -> io::Result<RawFd> {
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }

    let flags = unsafe { libc::fcntl(dup, libc::F_GETFD) };
    if flags < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(dup) };
        return Err(err);
    }

    let result = unsafe { libc::fcntl(dup, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if result < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(dup) };
        return Err(err);
    }

    Ok(dup)
}
