//! # ecdysis
//!
//! Zero-downtime graceful restart for long-running network servers.
//!
//! A server built on this crate calls [`serve`] once per listening
//! address. Thereafter, sending the process `SIGHUP` causes it to:
//!
//! 1. fork a short-lived temporary child that inherits the listening
//!    sockets and keeps accepting connections,
//! 2. re-execute its own binary as a successor, which re-adopts the
//!    sockets and starts accepting in turn,
//! 3. tell the temporary child to drain and exit once the successor is
//!    up, and
//! 4. drain and exit itself.
//!
//! At every instant exactly one process-generation accepts new
//! connections, and no accepted connection is interrupted by the
//! handoff.
//!
//! ## Environment Variables
//!
//! - `TEMPORARY_CHILD` — set to `1` on the temporary child spawned during an upgrade.
//! - `LISTEN_FD_<ident>` — the inherited descriptor number for the listener registered under `<ident>`.
//! - `TEMPORARY_CHILD_PID` — the PID of the temporary child, set on the re-exec'd successor.
//!
//! ## Signals
//!
//! - `SIGHUP` — triggers an upgrade in a parent-like process, or a
//!   graceful shutdown in a temporary child.
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS); it relies on `fork`/`exec`
//! and inheritable file descriptors and will not compile elsewhere.

#[cfg(not(unix))]
compile_error!("ecdysis requires a Unix platform (Linux or macOS)");

mod config;
mod controller;
mod env;
mod error;
mod exec;
mod listener;
mod resume;
mod role;

pub use config::{set_drain_timeout, set_startup_delay, set_working_dir};
pub use controller::serve;
pub use error::Error;
pub use listener::{ConnectionGuard, GracefulListener};
pub use role::Role;
