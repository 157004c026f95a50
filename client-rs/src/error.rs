//! Error types for the token client

use mqttmtd::aead::AeadError;
use mqttmtd::tls::TlsError;
use mqttmtd::wire::WireError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while fetching tokens
#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not reach the issuer
    #[error("Connection error: {0}")]
    Connection(String),

    /// TLS material or handshake problem
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// The issuer closed the connection without issuing, e.g. the ACL denied the request
    #[error("Issuance denied")]
    Denied,

    /// Issuer sent something that does not parse
    #[error("Protocol error: {0}")]
    Protocol(#[from] WireError),

    /// Request rejected before contacting the issuer
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Token record could not be read or written
    #[error("Storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Token record exists but is not usable
    #[error("Corrupt token record: {0}")]
    CorruptRecord(String),

    /// Key material rejected
    #[error("Key error: {0}")]
    Key(#[from] AeadError),
}

impl ClientError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ClientError::Storage {
            path: path.into(),
            source,
        }
    }
}

/// Result type for token client operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_connection() {
        let err = ClientError::Connection("refused".to_string());
        assert_eq!(err.to_string(), "Connection error: refused");
    }

    #[test]
    fn test_error_display_denied() {
        assert_eq!(ClientError::Denied.to_string(), "Issuance denied");
    }

    #[test]
    fn test_error_display_invalid_request() {
        let err = ClientError::InvalidRequest("empty topic".to_string());
        assert_eq!(err.to_string(), "Invalid request: empty topic");
    }

    #[test]
    fn test_error_display_storage() {
        let err = ClientError::storage(
            "/tmp/tokens/PUBdA==",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.to_string(), "Storage error at /tmp/tokens/PUBdA==: denied");
    }

    #[test]
    fn test_error_display_corrupt_record() {
        let err = ClientError::CorruptRecord("truncated header".to_string());
        assert_eq!(err.to_string(), "Corrupt token record: truncated header");
    }

    #[test]
    fn test_error_from_wire() {
        let err: ClientError = WireError::Closed.into();
        assert!(matches!(err, ClientError::Protocol(WireError::Closed)));
        assert!(err.to_string().starts_with("Protocol error:"));
    }

    #[test]
    fn test_error_from_aead() {
        let err: ClientError = AeadError::UnknownType(9).into();
        assert!(matches!(err, ClientError::Key(_)));
    }

    #[test]
    fn test_result_type_err() {
        let result: Result<i32> = Err(ClientError::Denied);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_debug() {
        let err = ClientError::Connection("test".to_string());
        let debug = format!("{:?}", err);
        assert!(debug.contains("Connection"));
        assert!(debug.contains("test"));
    }
}
