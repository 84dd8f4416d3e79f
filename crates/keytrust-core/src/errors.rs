//! Error types for the verification protocol
//!
//! Each concern gets its own enum (cryptography, wire parsing, transport,
//! sessions, persistence) and [`VerifyError`] unifies them. [`CancelCode`]
//! is the machine-readable reason carried by `m.key.verification.cancel`.

use core::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures inside the pure cryptographic helpers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptographicError {
    #[error("Invalid public key: {reason}")]
    InvalidPublicKey { reason: String },
    #[error("Invalid base64 encoding")]
    InvalidBase64,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Invalid MAC key length")]
    InvalidMacKey,
    #[error("SAS rendering needs exactly {expected} bytes, got {actual}")]
    InvalidSasLength { expected: usize, actual: usize },
    #[error("Key agreement produced a non-contributory secret")]
    NonContributory,
}

/// Rejections produced while turning an inbound payload into a typed message
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Unknown event type: {event_type}")]
    UnknownEventType { event_type: String },
    #[error("Content is not a JSON object")]
    NotAnObject,
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ParseError {
    pub fn missing(field: &'static str) -> Self {
        ParseError::MissingField { field }
    }

    pub fn invalid<R: Into<String>>(field: &'static str, reason: R) -> Self {
        ParseError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures reported by the transport adapter
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Send to {user_id}/{device_id} failed: {reason}")]
    SendFailed {
        user_id: String,
        device_id: String,
        reason: String,
    },
    #[error("Key query for {user_id} failed: {reason}")]
    KeyQueryFailed { user_id: String, reason: String },
    #[error("Device listing failed: {reason}")]
    DeviceListFailed { reason: String },
    #[error("Identity unavailable: {reason}")]
    IdentityUnavailable { reason: String },
    #[error("Subscription failed: {reason}")]
    SubscriptionFailed { reason: String },
}

/// Session registry errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Session already exists for transaction {transaction_id}")]
    SessionAlreadyExists { transaction_id: String },
    #[error("Maximum sessions reached: {current}/{max}")]
    MaxSessionsReached { current: usize, max: usize },
    #[error("Manager has been disposed")]
    Disposed,
}

/// Verified-state persistence errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt state record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Unified error for the verification crates
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptographicError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl VerifyError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        VerifyError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a send failure for a peer device
    pub fn send_failed<U, D, R>(user_id: U, device_id: D, reason: R) -> Self
    where
        U: Into<String>,
        D: Into<String>,
        R: Into<String>,
    {
        VerifyError::Transport(TransportError::SendFailed {
            user_id: user_id.into(),
            device_id: device_id.into(),
            reason: reason.into(),
        })
    }

    /// Create a key query failure
    pub fn key_query_failed<U: Into<String>, R: Into<String>>(user_id: U, reason: R) -> Self {
        VerifyError::Transport(TransportError::KeyQueryFailed {
            user_id: user_id.into(),
            reason: reason.into(),
        })
    }

    /// Create a failure to list the account's devices
    pub fn device_list_failed<R: Into<String>>(reason: R) -> Self {
        VerifyError::Transport(TransportError::DeviceListFailed {
            reason: reason.into(),
        })
    }

    /// Create an identity lookup failure
    pub fn identity_unavailable<R: Into<String>>(reason: R) -> Self {
        VerifyError::Transport(TransportError::IdentityUnavailable {
            reason: reason.into(),
        })
    }

    pub fn disposed() -> Self {
        VerifyError::Session(SessionError::Disposed)
    }
}

/// Result type alias for verification operations
pub type Result<T> = core::result::Result<T, VerifyError>;

/// Alias kept for call sites that already import a different `Result`
pub type VerifyResult<T> = Result<T>;

// ----------------------------------------------------------------------------
// Cancellation Codes
// ----------------------------------------------------------------------------

/// Wire cancellation codes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CancelCode {
    User,
    Timeout,
    UnknownTransaction,
    UnknownMethod,
    UnexpectedMessage,
    KeyMismatch,
    UserMismatch,
    InvalidMessage,
    Accepted,
    MismatchedCommitment,
    MismatchedSas,
    /// A code this implementation does not know, kept as received
    Other(String),
}

impl CancelCode {
    pub fn as_str(&self) -> &str {
        match self {
            CancelCode::User => "m.user",
            CancelCode::Timeout => "m.timeout",
            CancelCode::UnknownTransaction => "m.unknown_transaction",
            CancelCode::UnknownMethod => "m.unknown_method",
            CancelCode::UnexpectedMessage => "m.unexpected_message",
            CancelCode::KeyMismatch => "m.key_mismatch",
            CancelCode::UserMismatch => "m.user_mismatch",
            CancelCode::InvalidMessage => "m.invalid_message",
            CancelCode::Accepted => "m.accepted",
            CancelCode::MismatchedCommitment => "m.mismatched_commitment",
            CancelCode::MismatchedSas => "m.mismatched_sas",
            CancelCode::Other(code) => code,
        }
    }
}

impl From<&str> for CancelCode {
    fn from(code: &str) -> Self {
        match code {
            "m.user" => CancelCode::User,
            "m.timeout" => CancelCode::Timeout,
            "m.unknown_transaction" => CancelCode::UnknownTransaction,
            "m.unknown_method" => CancelCode::UnknownMethod,
            "m.unexpected_message" => CancelCode::UnexpectedMessage,
            "m.key_mismatch" => CancelCode::KeyMismatch,
            "m.user_mismatch" => CancelCode::UserMismatch,
            "m.invalid_message" => CancelCode::InvalidMessage,
            "m.accepted" => CancelCode::Accepted,
            "m.mismatched_commitment" => CancelCode::MismatchedCommitment,
            "m.mismatched_sas" => CancelCode::MismatchedSas,
            other => CancelCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for CancelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CancelCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CancelCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(CancelCode::from(code.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_code_round_trips_known_and_unknown() {
        assert_eq!(CancelCode::from("m.key_mismatch"), CancelCode::KeyMismatch);
        assert_eq!(CancelCode::KeyMismatch.as_str(), "m.key_mismatch");

        let custom = CancelCode::from("org.example.custom");
        assert_eq!(custom, CancelCode::Other("org.example.custom".to_string()));
        assert_eq!(custom.to_string(), "org.example.custom");
    }

    #[test]
    fn test_cancel_code_serializes_as_plain_string() {
        let json = serde_json::to_string(&CancelCode::MismatchedCommitment).unwrap();
        assert_eq!(json, "\"m.mismatched_commitment\"");
        let back: CancelCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CancelCode::MismatchedCommitment);
    }

    #[test]
    fn test_convenience_constructors() {
        let err = VerifyError::send_failed("@a:x", "DEV", "offline");
        assert!(matches!(
            err,
            VerifyError::Transport(TransportError::SendFailed { .. })
        ));
        assert!(err.to_string().contains("offline"));
        assert!(matches!(
            VerifyError::device_list_failed("timeout"),
            VerifyError::Transport(TransportError::DeviceListFailed { .. })
        ));
        assert!(matches!(
            VerifyError::disposed(),
            VerifyError::Session(SessionError::Disposed)
        ));
    }
}
