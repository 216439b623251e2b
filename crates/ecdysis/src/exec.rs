//! Raw process image replacement.
//!
//! `std::process::Command` has no way to exec in place with a caller
//! controlled fd table and environment, so this goes straight to
//! `libc::execve`.

use std::ffi::CString;
use std::path::Path;

use crate::env::EnvMap;

/// Replace the current process image with `exe`, passing `args` as its
/// argument vector and `env` as its complete environment.
///
/// On success this never returns. On failure it returns the `errno`
/// translated into an `io::Error` — the caller's listeners are still
/// open and it can retry or give up.
pub(crate) fn exec_self(exe: &Path, args: &[String], env: &EnvMap) -> std::io::Error {
    let Ok(c_exe) = CString::new(exe.to_string_lossy().as_bytes()) else {
        return std::io::Error::new(std::io::ErrorKind::InvalidInput, "executable path contains NUL");
    };

    let c_args: Result<Vec<CString>, _> = args.iter().map(|a| CString::new(a.as_bytes())).collect();
    let Ok(c_args) = c_args else {
        return std::io::Error::new(std::io::ErrorKind::InvalidInput, "argument contains NUL");
    };

    let c_env: Result<Vec<CString>, _> = env
        .entries()
        .map(|(k, v)| {
            let mut pair = k.clone();
            pair.push("=");
            pair.push(v);
            CString::new(pair.to_string_lossy().as_bytes().to_vec())
        })
        .collect();
    let Ok(c_env) = c_env else {
        return std::io::Error::new(std::io::ErrorKind::InvalidInput, "environment entry contains NUL");
    };

    let c_arg_ptrs: Vec<*const libc::c_char> = c_args
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let c_env_ptrs: Vec<*const libc::c_char> = c_env
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    unsafe {
        libc::execve(c_exe.as_ptr(), c_arg_ptrs.as_ptr(), c_env_ptrs.as_ptr());
    }

    // execve only returns on error.
    std::io::Error::last_os_error()
}
