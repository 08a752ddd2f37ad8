//! Typed fault taxonomy for the routing core (spec.md §7). Kept separate
//! from `crate::error::AppError` (the anyhow-backed axum boundary type) —
//! `RouterError` is the core's internal, `thiserror`-derived vocabulary;
//! `crate::error::AppError` wraps it at the HTTP edge via `anyhow::Error`'s
//! blanket `From`.

use thiserror::Error;

use super::types::Constraint;

#[derive(Debug, Error)]
pub enum RouterError {
    /// Backend or provider cannot be reached. Always locally recovered
    /// before reaching this error type — surfaced only when every
    /// candidate has been exhausted.
    #[error("backend or provider unavailable: {0}")]
    Unavailable(String),

    /// No available model satisfies a hard constraint. Carries the same
    /// [`Constraint`] that would appear on the corresponding empty
    /// `RoutingDecision`.
    #[error("no model satisfies constraint: {0}")]
    OutOfConstraint(Constraint),

    /// Provider responded but rejected the model, and the Smart-lane retry
    /// also failed.
    #[error("model not found on any candidate lane: {0}")]
    ModelNotFound(String),

    /// Context deadline exceeded or explicit cancellation.
    #[error("request cancelled")]
    Cancelled,

    /// Backend could not be started by any candidate launcher.
    #[error("failed to launch local backend: {0}")]
    LaunchFailure(String),
}
