//! Obtaining a graceful listener either from an inherited descriptor or
//! by opening a fresh one.

use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, RawFd};

use socket2::Socket;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::Error;
use crate::listener::GracefulListener;

/// Adopt `fd` as a listener if given, otherwise bind fresh on `addr`.
///
/// `ident` is only used for error messages and logging.
pub async fn resume_or_listen(
    ident: &str,
    fd: Option<RawFd>,
    addr: SocketAddr,
) -> Result<GracefulListener, Error> {
    let listener = match fd {
        Some(fd) => {
            let listener = from_raw_fd(ident, fd)?;
            info!(ident, fd, addr = %listener.local_addr().unwrap_or(addr), "resumed inherited listener");
            listener
        }
        None => {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| Error::ListenFailed { addr: addr.to_string(), source })?;
            info!(ident, addr = %addr, "opened fresh listener");
            listener
        }
    };

    GracefulListener::new(listener).map_err(|source| Error::ListenFailed { addr: addr.to_string(), source })
}

fn from_raw_fd(ident: &str, fd: RawFd) -> Result<TcpListener, Error> {
    // SAFETY: `fd` was handed to us by a parent process via an
    // environment variable it controls; it is expected to be a live,
    // valid stream socket for the remainder of this call.
    let socket = unsafe { Socket::from_raw_fd(fd) };

    let socket_type = socket.r#type().map_err(|source| Error::InheritFailed {
        ident: ident.to_string(),
        fd,
        source,
    })?;
    if socket_type != socket2::Type::STREAM {
        return Err(Error::InheritFailed {
            ident: ident.to_string(),
            fd,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "fd is not a stream socket"),
        });
    }

    let std_listener: std::net::TcpListener = socket.into();
    std_listener
        .set_nonblocking(true)
        .map_err(|source| Error::InheritFailed { ident: ident.to_string(), fd, source })?;

    TcpListener::from_std(std_listener).map_err(|source| Error::InheritFailed {
        ident: ident.to_string(),
        fd,
        source,
    })
}
