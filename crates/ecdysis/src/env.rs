//! The out-of-band environment map carried across spawn/exec boundaries.
//!
//! Kept separate from ad-hoc `std::env::var` calls so that building the
//! environment for a spawned child or a re-exec'd image is a pure,
//! testable operation rather than a side effect on the live process.

use std::collections::BTreeMap;
use std::ffi::OsString;

pub const TEMPORARY_CHILD: &str = "TEMPORARY_CHILD";
pub const TEMPORARY_CHILD_PID: &str = "TEMPORARY_CHILD_PID";
pub const LISTEN_FD_PREFIX: &str = "LISTEN_FD_";

/// A snapshot of a process environment, keyed for deterministic iteration.
#[derive(Debug, Clone, Default)]
pub struct EnvMap(BTreeMap<OsString, OsString>);

impl EnvMap {
    /// Capture the current process environment.
    pub fn from_process() -> Self {
        Self(std::env::vars_os().collect())
    }

    /// Read a variable, if present and valid UTF-8.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(OsString::from(key).as_os_str())?.to_str()
    }

    /// Set or overwrite a variable.
    pub fn set(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        self.0.insert(key.into(), value.into());
    }

    /// Remove a variable, if present.
    pub fn remove(&mut self, key: &str) {
        self.0.remove(OsString::from(key).as_os_str());
    }

    /// Iterate over every `LISTEN_FD_<ident>` variable, yielding `(ident, raw value)`.
    pub fn listen_fds(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().filter_map(|(k, v)| {
            let k = k.to_str()?;
            let ident = k.strip_prefix(LISTEN_FD_PREFIX)?;
            let v = v.to_str()?;
            Some((ident, v))
        })
    }

    /// True if any `LISTEN_FD_<ident>` variable is present.
    pub fn has_any_listen_fd(&self) -> bool {
        self.listen_fds().next().is_some()
    }

    /// Name the environment variable carrying a given identifier's descriptor.
    pub fn listen_fd_key(ident: &str) -> String {
        format!("{LISTEN_FD_PREFIX}{ident}")
    }

    /// Entries as `(key, value)` pairs, suitable for `Command::envs` or `execve`.
    pub fn entries(&self) -> impl Iterator<Item = (&OsString, &OsString)> {
        self.0.iter()
    }
}
