//! Process-role detection.
//!
//! The same binary plays three different parts depending on how it was
//! launched: the originally-started parent, a short-lived temporary
//! child holding sockets across a re-exec, or the re-exec'd successor.

use crate::env::{EnvMap, TEMPORARY_CHILD};

/// Which part this process is playing, decided once at setup from the
/// inherited environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The originally-launched process.
    Parent,
    /// Spawned by a parent to hold listening sockets across its exec.
    TemporaryChild,
    /// The re-executed image of a parent.
    Successor,
}

impl Role {
    /// Parent and successor behave identically for upgrade purposes.
    pub fn is_parent_like(self) -> bool {
        matches!(self, Role::Parent | Role::Successor)
    }
}

pub fn detect(env: &EnvMap) -> Role {
    if env.get(TEMPORARY_CHILD) == Some("1") {
        return Role::TemporaryChild;
    }
    if env.has_any_listen_fd() {
        return Role::Successor;
    }
    Role::Parent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_start_is_parent() {
        let env = EnvMap::default();
        assert_eq!(detect(&env), Role::Parent);
    }

    #[test]
    fn temporary_child_flag_wins() {
        let mut env = EnvMap::default();
        env.set(TEMPORARY_CHILD, "1");
        env.set(EnvMap::listen_fd_key("http"), "3");
        assert_eq!(detect(&env), Role::TemporaryChild);
    }

    #[test]
    fn listen_fd_without_flag_is_successor() {
        let mut env = EnvMap::default();
        env.set(EnvMap::listen_fd_key("http"), "3");
        assert_eq!(detect(&env), Role::Successor);
    }

    #[test]
    fn parent_like_covers_parent_and_successor() {
        assert!(Role::Parent.is_parent_like());
        assert!(Role::Successor.is_parent_like());
        assert!(!Role::TemporaryChild.is_parent_like());
    }
}
