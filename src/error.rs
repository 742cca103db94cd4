use std::result;

use thiserror::Error;

/// Errors raised by the engine.
///
/// Credential outcomes (mismatch, disabled account, expired storage, unknown account)
/// are never reported here; they end up in [`CredentialStatus`](crate::CredentialStatus).
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("Malformed Authorization header: {0}")]
    MalformedHeader(String),
    #[error("Unknown algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("Bad Qop option: {0}")]
    BadQop(String),
    #[error("Missing \"{0}\" in credential: {1}")]
    MissingRequired(&'static str, String),
    #[error("Error parsing a number.")]
    NumParseError,
    /// The identity store returned something that cannot be a single account.
    /// This means the store is misconfigured, not that the credential is bad.
    #[error("Identity store integrity fault: {0}")]
    Integrity(String),
    #[error("Could not challenge client credentials: {0}")]
    Challenge(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Nonce sweeper needs a running tokio runtime")]
    NoRuntime,
    #[error("Store error: {0}")]
    Store(String),
}

pub type Result<T> = result::Result<T, Error>;

impl From<std::num::ParseIntError> for Error {
    fn from(_: std::num::ParseIntError) -> Self {
        Error::NumParseError
    }
}
