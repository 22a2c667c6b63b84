//! Error types for Keel core.
//!
//! Every error carries a stable [`ErrorCode`] so operators and API clients can
//! match on it without parsing messages. All core errors are `E1xxx`: they
//! are caused by bad input from a peer or caller.

use thiserror::Error;

/// Result type for Keel core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes, rendered as `E<code>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Malformed 32-byte hash.
    InvalidHash = 1001,
    /// Malformed or off-curve service key.
    InvalidKey = 1002,
    /// Envelope signature does not verify.
    InvalidSignature = 1003,
}

impl ErrorCode {
    /// Get the numeric code.
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "E{:04}", self.code())
    }
}

/// Errors from hashes, service keys and signatures.
#[derive(Debug, Error)]
pub enum Error {
    /// Hash of the wrong length or not hex.
    #[error("[{}] invalid hash: {0}", ErrorCode::InvalidHash)]
    InvalidHash(String),

    /// Service key that is not a valid Ed25519 point.
    #[error("[{}] invalid key: {0}", ErrorCode::InvalidKey)]
    InvalidKey(String),

    /// Signature does not match the key and message.
    #[error("[{}] signature verification failed", ErrorCode::InvalidSignature)]
    InvalidSignature,
}

impl Error {
    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidHash(_) => ErrorCode::InvalidHash,
            Error::InvalidKey(_) => ErrorCode::InvalidKey,
            Error::InvalidSignature => ErrorCode::InvalidSignature,
        }
    }

    pub(crate) fn invalid_hash(message: impl Into<String>) -> Self {
        Error::InvalidHash(message.into())
    }

    pub(crate) fn invalid_key(message: impl Into<String>) -> Self {
        Error::InvalidKey(message.into())
    }

    pub(crate) fn invalid_signature() -> Self {
        Error::InvalidSignature
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::InvalidHash(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::invalid_hash("short").code().code(), 1001);
        assert_eq!(Error::invalid_signature().code(), ErrorCode::InvalidSignature);
        assert_eq!(ErrorCode::InvalidKey.to_string(), "E1002");
    }

    #[test]
    fn test_error_display() {
        let e = Error::invalid_key("bad length");
        assert!(e.to_string().starts_with("[E1002]"));
        assert!(e.to_string().contains("bad length"));
    }

    #[test]
    fn test_from_hex() {
        let err: Error = hex::decode("zz").unwrap_err().into();
        assert!(matches!(err, Error::InvalidHash(_)));
    }
}
