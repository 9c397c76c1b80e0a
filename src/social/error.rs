use std::error::Error as StdError;

use thiserror::Error;

/// Failure of a social-graph transition or profile lookup.
///
/// The engine only ever returns these; translating them into a transport
/// response is the handler's job.
#[derive(Debug, Error)]
pub enum SocialError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Conflict(&'static str),

    /// A set and its derived counter disagree. Unreachable while the engine
    /// is the only writer of both.
    #[error("invariant violated: {0}")]
    InvariantViolation(&'static str),

    #[error("storage deadline exceeded")]
    Timeout,

    #[error("storage failure: {0}")]
    Storage(#[source] Box<dyn StdError + Send + Sync>),
}

impl SocialError {
    pub fn storage<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        SocialError::Storage(err.into())
    }
}
