//! Error kinds for the encoder, the parser, and the instruction-database
//! construction helpers.

use thiserror::Error;

/// The three error kinds the core ever raises.
#[derive(Error, Debug)]
pub enum Error {
    /// A decoded instruction conflicts with its specification, a byte stream
    /// was truncated, encoder validation failed, or a setter was asked for an
    /// out-of-range register index.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The parser could not match the accumulated prefixes and opcode to any
    /// specification in the database.
    #[error("not found: {0}")]
    NotFound(String),

    /// An internal invariant was violated by a collaborator outside the
    /// core's control (e.g. the MIP solver).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
