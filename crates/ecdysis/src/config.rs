//! Process-global configuration knobs.
//!
//! These are read once per upgrade attempt, so plain atomics (and a
//! mutex-guarded path for the working directory) are simpler than
//! threading a config struct through every call site.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::sync::Mutex;

const DEFAULT_STARTUP_DELAY_NANOS: u64 = 5 * 1_000_000_000;
const DEFAULT_DRAIN_TIMEOUT_NANOS: u64 = 30 * 1_000_000_000;

// Stored as whole nanoseconds rather than seconds so sub-second
// durations (as the teacher's own `GracefulShutdown::new` accepts)
// survive the round trip instead of truncating to zero.
static STARTUP_DELAY_NANOS: AtomicU64 = AtomicU64::new(DEFAULT_STARTUP_DELAY_NANOS);
static DRAIN_TIMEOUT_NANOS: AtomicU64 = AtomicU64::new(DEFAULT_DRAIN_TIMEOUT_NANOS);

fn working_dir_cell() -> &'static Mutex<Option<PathBuf>> {
    static CELL: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();
    CELL.get_or_init(|| Mutex::new(None))
}

/// Time budget allowed for the temporary child to come up and for the
/// successor to appear, before the stop-temporary-child task acts.
///
/// Default: 5 seconds.
pub fn set_startup_delay(delay: std::time::Duration) {
    STARTUP_DELAY_NANOS.store(delay.as_nanos() as u64, Ordering::SeqCst);
}

pub fn startup_delay() -> std::time::Duration {
    std::time::Duration::from_nanos(STARTUP_DELAY_NANOS.load(Ordering::SeqCst))
}

/// Bound on how long a graceful listener waits for in-flight clients
/// to finish during shutdown or upgrade.
///
/// Default: 30 seconds.
pub fn set_drain_timeout(timeout: std::time::Duration) {
    DRAIN_TIMEOUT_NANOS.store(timeout.as_nanos() as u64, Ordering::SeqCst);
}

pub fn drain_timeout() -> std::time::Duration {
    std::time::Duration::from_nanos(DRAIN_TIMEOUT_NANOS.load(Ordering::SeqCst))
}

/// Directory to `chdir` into before re-executing the process image.
///
/// Useful when the binary is launched through a symlinked deploy root
/// (`current -> v1`, `current -> v2`): re-evaluating the symlink at
/// exec time picks up whichever release it currently points at.
pub fn set_working_dir(dir: impl Into<PathBuf>) {
    *working_dir_cell().lock().expect("working dir lock poisoned") = Some(dir.into());
}

pub fn working_dir() -> Option<PathBuf> {
    working_dir_cell()
        .lock()
        .expect("working dir lock poisoned")
        .clone()
}

#[cfg(test)]
pub(crate) fn clear_working_dir() {
    *working_dir_cell().lock().expect("working dir lock poisoned") = None;
}

pub(crate) fn resolve_working_dir() -> Option<PathBuf> {
    working_dir().filter(|p| p != Path::new(""))
}
