//! The small typed escape hatch the requester uses to pick an exit code.
//!
//! Everything else in the crate propagates `anyhow::Error` the way the
//! teacher does; this enum exists only so `main.rs` can decide between a
//! handful of well-known exit codes without downcasting an ad-hoc string.

use std::fmt;

/// Abstract error kinds from the requester's perspective. Carried inside an
/// `anyhow::Error` via `.context(Kind)`-style wrapping is avoided in favor
/// of returning this directly from the few call sites that must pick a
/// specific process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Local usage error: empty command, ambiguous shell operator, invalid
    /// interactive command string.
    Usage,
    /// No worker became available before the wait deadline elapsed.
    NoWorker,
}

impl ExitKind {
    pub const fn code(self) -> i32 {
        match self {
            Self::Usage => 2,
            Self::NoWorker => 4,
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usage => write!(f, "usage error"),
            Self::NoWorker => write!(f, "no active worker"),
        }
    }
}

impl std::error::Error for ExitKind {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_interface_contract() {
        assert_eq!(ExitKind::Usage.code(), 2);
        assert_eq!(ExitKind::NoWorker.code(), 4);
    }
}
