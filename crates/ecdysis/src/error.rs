//! Error types surfaced by the public API.

use std::io;

/// Errors returned by [`crate::serve`] and the lower-level building blocks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another live listener already registered under this identifier.
    #[error("identifier {0:?} is already registered")]
    DuplicateIdentifier(String),

    /// Binding a fresh address failed.
    #[error("failed to listen on {addr}: {source}")]
    ListenFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// An inherited file descriptor was not a usable stream socket.
    #[error("failed to adopt inherited listener {ident:?} (fd {fd}): {source}")]
    InheritFailed {
        ident: String,
        fd: i32,
        #[source]
        source: io::Error,
    },

    /// Spawning the temporary child during an upgrade failed.
    #[error("failed to spawn temporary child: {0}")]
    SpawnFailed(#[source] io::Error),

    /// Duplicating a listener's descriptor for handoff failed.
    #[error("failed to harvest listener descriptor: {0}")]
    HarvestFailed(#[source] io::Error),

    /// Re-executing the process image failed. Always fatal — by the time
    /// this can happen the listeners are already closed.
    #[error("exec failed: {0}")]
    ExecFailed(#[source] io::Error),

    /// The drain timeout elapsed before all connections finished.
    #[error("drain timed out with {remaining} connection(s) still active")]
    DrainTimeout { remaining: usize },
}
