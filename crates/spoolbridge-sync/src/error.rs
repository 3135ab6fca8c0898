//! # Sync Error Types
//!
//! Error taxonomy for the bridge, with the retry policy attached to each
//! kind.
//!
//! ## Error Policy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Error Kinds and Policies                            │
//! │                                                                         │
//! │  Config       startup validation failure        → fatal, exit          │
//! │  Auth         Device cipher rejected us         → fatal at startup;    │
//! │                                                   backoff in steady    │
//! │                                                   state                │
//! │  Unreachable  network failure (either service)  → per-loop backoff     │
//! │  Protocol     Device response unparseable       → skip current poll    │
//! │  Inventory    non-2xx from the Inventory        → 4xx skip spool,      │
//! │                                                   5xx bounded retry    │
//! │  Storage      mapping file write failure        → keep running on      │
//! │                                                   in-memory state      │
//! │  Channel      internal handle/channel closed    → shutdown path        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use spoolbridge_core::{CipherError, CodecError};
use thiserror::Error;

/// Result type alias for bridge operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Bridge error type covering all failure sources.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration
    // =========================================================================
    /// Invalid or missing configuration at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // Device
    // =========================================================================
    /// The Device rejected or failed authenticated decryption.
    #[error("device authentication failed: {0}")]
    Auth(String),

    /// A service could not be reached over the network.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The Device answered but the response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    // =========================================================================
    // Inventory
    // =========================================================================
    /// Non-2xx response from the Inventory REST API.
    #[error("inventory returned HTTP {status}: {body}")]
    Inventory { status: u16, body: String },

    // =========================================================================
    // Storage
    // =========================================================================
    /// The mapping file could not be written or read.
    #[error("mapping storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Internal
    // =========================================================================
    /// An internal channel or handle was closed.
    #[error("channel error: {0}")]
    Channel(String),

    /// The bridge is shutting down.
    #[error("bridge is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CipherError> for SyncError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::Auth => SyncError::Auth(err.to_string()),
            CipherError::Format(_) | CipherError::Seal => SyncError::Protocol(err.to_string()),
        }
    }
}

impl From<CodecError> for SyncError {
    fn from(err: CodecError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            SyncError::Unreachable(err.to_string())
        } else {
            SyncError::Protocol(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Unreachable(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

// =============================================================================
// Classification
// =============================================================================

impl SyncError {
    /// Returns true if retrying the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Unreachable(_) | SyncError::Storage(_) => true,
            SyncError::Inventory { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if this error must abort startup with a non-zero exit.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, SyncError::Config(_) | SyncError::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(SyncError::Unreachable("timeout".into()).is_retryable());
        assert!(SyncError::Inventory { status: 503, body: String::new() }.is_retryable());
        assert!(SyncError::Storage("disk full".into()).is_retryable());

        assert!(!SyncError::Inventory { status: 422, body: String::new() }.is_retryable());
        assert!(!SyncError::Auth("bad key".into()).is_retryable());
        assert!(!SyncError::Protocol("garbage".into()).is_retryable());
    }

    #[test]
    fn test_startup_fatality() {
        assert!(SyncError::Config("no host".into()).is_fatal_at_startup());
        assert!(SyncError::Auth("bad key".into()).is_fatal_at_startup());
        assert!(!SyncError::Unreachable("boot".into()).is_fatal_at_startup());
    }

    #[test]
    fn test_cipher_error_mapping() {
        assert!(matches!(
            SyncError::from(CipherError::Auth),
            SyncError::Auth(_)
        ));
        assert!(matches!(
            SyncError::from(CipherError::Format("short".into())),
            SyncError::Protocol(_)
        ));
    }
}
