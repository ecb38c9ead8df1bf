// src/error.rs
//! Error handling for the portal simulation subsystem.
//!
//! The error taxonomy is deliberately small:
//! - **Ineligibility is not an error.** Teleport/ownership preconditions that
//!   are not yet met return `None`/`false` from the relevant query and are
//!   re-evaluated next tick. Nothing in this enum covers that case.
//! - `ResourceExhausted`: a budget (mirrors, linked gateways) is full. The
//!   operation is refused, a diagnostic is logged, and the simulation keeps
//!   running degraded.
//! - `Consistency`: programming-error class (symmetry break, double physics
//!   ownership, orphaned mirror). Asserted in debug builds, clamped to a safe
//!   default in release builds.
//! - `QueueOverflow`: the deferred-call drain loop hit its bound. Logged as
//!   a warning; a physics step must always complete within its frame budget.

use thiserror::Error;

/// Main error type for the crate. Lightweight, `Send + Sync + 'static`.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A hard budget was hit; the operation was refused.
    #[error("resource exhausted: {what} (limit {limit})")]
    ResourceExhausted { what: &'static str, limit: usize },

    /// Internal bookkeeping contradicted an invariant.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// The end-of-step drain loop exceeded its iteration bound.
    #[error("deferred queue drain exceeded {bound} iterations, {remaining} ops left")]
    QueueOverflow { bound: usize, remaining: usize },

    /// A handle referred to a body/gateway/mirror that no longer exists.
    #[error("unknown {kind} id {id}")]
    UnknownId { kind: &'static str, id: u32 },

    /// Simple custom message (allocation only on the error path).
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Create a custom error message.
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    /// Consistency violation with a formatted description.
    #[inline]
    pub fn consistency<S: Into<String>>(msg: S) -> Self {
        Self::Consistency(msg.into())
    }

    // === Kind checks ===

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::ResourceExhausted { .. })
    }

    #[inline]
    pub fn is_consistency(&self) -> bool {
        matches!(self, Error::Consistency(_))
    }
}

/// Convenient `Result` alias for the crate error type.
pub type Result<T> = std::result::Result<T, Error>;
