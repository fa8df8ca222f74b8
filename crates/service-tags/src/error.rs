//! Error types for tag parsing.

use thiserror::Error;

/// Errors raised while interpreting a tag value.
///
/// Routing never surfaces these: callers fall back to the documented
/// default. They exist so the reason can be logged or tested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    /// Weight is not an unsigned decimal integer.
    #[error("invalid weight '{0}'")]
    InvalidWeight(String),

    /// Weight parsed but falls outside 1..=255.
    #[error("weight {0} out of range 1..=255")]
    WeightOutOfRange(u64),
}

/// Result type alias for tag parsing.
pub type Result<T> = std::result::Result<T, TagError>;
