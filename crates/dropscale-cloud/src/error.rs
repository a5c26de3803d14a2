//! Cloud layer error types.

use thiserror::Error;

/// Errors produced by provider calls.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The provider answered with a non-success HTTP status.
    #[error("provider returned http {status}: {message}")]
    Api { status: u16, message: String },

    /// The request never produced a usable response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("could not decode provider response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl CloudError {
    /// HTTP status of the provider response, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            CloudError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the error is a known-transient provider condition.
    ///
    /// The provider answers 422 when an operation races a concurrent
    /// modification (observed when assigning several reserved addresses
    /// at once); those calls succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        self.status() == Some(422)
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        CloudError::Transport(err.to_string())
    }
}

pub type CloudResult<T> = Result<T, CloudError>;
