use thiserror::Error;

/// Issuance errors, split by who is at fault.
///
/// `User` covers anything traceable to the requestor (bad common name,
/// disallowed SAN, malformed TTL, invalid CSR). `Internal` covers storage,
/// entropy, and encode/decode failures on our side. The router maps the two
/// variants to its own response statuses.
#[derive(Error, Debug)]
pub enum Error {
    /// The request itself was invalid or not permitted by the role.
    #[error("{0}")]
    User(String),

    /// Storage, randomness, or encoding failed while servicing the request.
    #[error("{0}")]
    Internal(String),
}

/// Coarse error class, for callers that only care which side failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    User,
    Internal,
}

impl Error {
    pub fn user(msg: impl Into<String>) -> Self {
        Error::User(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::User(_) => ErrorKind::User,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
