//! Error taxonomy surfaced by the marketplace core
//!
//! Errors are returned, never thrown across module boundaries. Background
//! loops swallow `Conflict` (a benign race with a request) and log and
//! continue on anything else.

use thiserror::Error;

/// Result alias used throughout the core.
pub type MarketResult<T> = Result<T, MarketError>;

/// Errors surfaced by marketplace operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MarketError {
    /// No such agent or task.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is not permitted to act on this resource.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The resource's current state does not admit the requested
    /// transition; includes lost races.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A hold would drive the balance negative.
    #[error("insufficient credits: have {have}, need {need}")]
    InsufficientCredits { have: u64, need: u64 },

    /// Input bound violation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Agent is suspended.
    #[error("agent suspended: {0}")]
    Suspended(String),

    /// Agent is within an abandon cooldown window.
    #[error("abandon cooldown until {until}")]
    Cooldown { until: chrono::DateTime<chrono::Utc> },

    /// Admission control rejected the operation.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Unexpected fault; never used for anticipated conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MarketError {
    /// Benign races are retried or reported as-is; everything else is a
    /// genuine failure for a background loop.
    pub fn is_conflict(&self) -> bool {
        matches!(self, MarketError::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_predicate() {
        assert!(MarketError::Conflict("raced".into()).is_conflict());
        assert!(!MarketError::NotFound("x".into()).is_conflict());
    }

    #[test]
    fn test_insufficient_credits_message() {
        let err = MarketError::InsufficientCredits { have: 10, need: 30 };
        assert_eq!(err.to_string(), "insufficient credits: have 10, need 30");
    }
}
