//! Single-writer ownership tokens.
//!
//! A container records the `(host, pid)` of the process allowed to mutate
//! it. There is no lock server: a new writer may override a stale token,
//! and callers that want to avoid clobbering a live writer claim in
//! [`ClaimMode::Defensive`] mode.

use std::fmt;
use sysinfo::{Pid, System};

/// Identity of a writing process.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerToken {
    pub host: String,
    pub pid: u32,
}

impl OwnerToken {
    /// Token for the calling process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            host: current_host(),
            pid: std::process::id(),
        }
    }

    /// Whether the process behind this token may still be running.
    ///
    /// Tokens from other hosts cannot be probed and count as alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        if self.host != current_host() {
            return true;
        }
        if self.pid == std::process::id() {
            return true;
        }
        let mut sys = System::new();
        sys.refresh_process(Pid::from_u32(self.pid))
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.pid)
    }
}

/// How to treat a container already owned by someone else.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClaimMode {
    /// Take ownership unconditionally (crash recovery).
    #[default]
    Override,
    /// Fail with `Busy` if the recorded owner may still be alive.
    Defensive,
}

fn current_host() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_token_is_alive() {
        let token = OwnerToken::current();
        assert_eq!(token.pid, std::process::id());
        assert!(token.is_alive());
        assert!(token.to_string().ends_with(&format!(":{}", token.pid)));
    }

    #[test]
    fn test_foreign_host_counts_as_alive() {
        let token = OwnerToken {
            host: "beamline-ioc-that-does-not-exist".to_string(),
            pid: 1,
        };
        assert!(token.is_alive());
    }

    #[test]
    fn test_missing_local_process_is_dead() {
        let token = OwnerToken {
            host: OwnerToken::current().host,
            pid: u32::MAX - 3,
        };
        assert!(!token.is_alive());
    }
}
