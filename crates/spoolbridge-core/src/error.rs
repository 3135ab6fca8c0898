//! # Error Types
//!
//! Errors for the pure protocol layer: cipher failures and record codec
//! failures.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  spoolbridge-core errors (this file)                                   │
//! │  ├── CipherError       - Envelope decode / authentication failures     │
//! │  ├── CodecError        - Whole-document failures (header, empty doc)   │
//! │  └── RecordParseError  - A single malformed catalog record             │
//! │                                                                         │
//! │  spoolbridge-sync errors (separate crate)                              │
//! │  └── SyncError         - Transport, Inventory, storage failures        │
//! │                                                                         │
//! │  Flow: CipherError/CodecError → SyncError → process exit / backoff     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Cipher Error
// =============================================================================

/// Failures of the Device transport cipher.
///
/// Both decode failures are non-retryable: they indicate a wrong security
/// key, a firmware mismatch, or a tampered body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// Authentication tag mismatch during decryption.
    ///
    /// ## When This Occurs
    /// - The configured security key does not match the Device's key
    /// - The envelope was modified in transit
    #[error("authentication failed: wrong security key or tampered envelope")]
    Auth,

    /// The envelope is structurally invalid before authentication runs.
    #[error("malformed envelope: {0}")]
    Format(String),

    /// The AEAD seal operation itself failed.
    #[error("AEAD seal failed")]
    Seal,
}

// =============================================================================
// Codec Errors
// =============================================================================

/// Whole-document failures of the record codec.
///
/// These abort the entire catalog parse, unlike [`RecordParseError`] which
/// fails one record and lets the rest of the batch through.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The document has no header line.
    #[error("catalog document is empty")]
    EmptyDocument,

    /// The header line is present but a required column is missing.
    #[error("catalog header is missing required column '{0}'")]
    MissingColumn(String),

    /// The header line itself could not be tokenized.
    #[error("catalog header is malformed: {0}")]
    MalformedHeader(String),
}

/// A single catalog record that could not be parsed.
///
/// Carries the 1-based line number where the record starts so operators
/// can find the offending row in a raw dump.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("line {line}: {reason}")]
pub struct RecordParseError {
    /// 1-based line number of the first line of the record.
    pub line: usize,

    /// Human-readable parse failure description.
    pub reason: String,
}

impl RecordParseError {
    pub fn new(line: usize, reason: impl Into<String>) -> Self {
        RecordParseError {
            line,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CipherError::Format("truncated".into()).to_string(),
            "malformed envelope: truncated"
        );
        assert_eq!(
            CodecError::MissingColumn("tag_id".into()).to_string(),
            "catalog header is missing required column 'tag_id'"
        );
        assert_eq!(
            RecordParseError::new(7, "bad weight").to_string(),
            "line 7: bad weight"
        );
    }
}
