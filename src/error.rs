//! # Error Types
//!
//! A single error enum covers the whole synchronization core. Variants fall
//! into three groups:
//!
//! - **Transient**: the peer set changed underneath us or the network was slow
//!   (`PeerNotFound`, `PeerLimitReached`, `Timeout`, `Transport`). Skip and retry
//!   on the next discovery or sync tick.
//! - **Data integrity**: a payload cannot be trusted (`DecryptionFailed`,
//!   `UnknownKey`, `InvalidSyncPayload`). The payload is discarded, the process
//!   and the sync round carry on.
//! - **Configuration / logic**: surfaced to the caller (`NoKeyAvailable`,
//!   `InvalidOperation`, `InvalidKey`, storage and I/O failures).

use thiserror::Error;

/// Errors produced by the synchronization core.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("No encryption key available")]
    NoKeyAvailable,

    #[error("Encryption key {0} not found")]
    UnknownKey(String),

    #[error("Decryption failed - data may have been tampered with or the key is wrong")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid sync payload: {0}")]
    InvalidSyncPayload(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Peer {0} not found")]
    PeerNotFound(String),

    #[error("Peer limit reached ({max} peers)")]
    PeerLimitReached { max: usize },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Errors worth retrying on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::PeerNotFound(_)
                | SyncError::PeerLimitReached { .. }
                | SyncError::Timeout(_)
                | SyncError::Transport(_)
        )
    }

    /// Errors that condemn a single payload but not the process.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            SyncError::DecryptionFailed
                | SyncError::UnknownKey(_)
                | SyncError::InvalidSyncPayload(_)
        )
    }
}

/// Result type for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::PeerNotFound("p1".into()).is_transient());
        assert!(SyncError::PeerLimitReached { max: 10 }.is_transient());
        assert!(SyncError::Timeout("send".into()).is_transient());
        assert!(!SyncError::DecryptionFailed.is_transient());
        assert!(!SyncError::NoKeyAvailable.is_transient());
    }

    #[test]
    fn test_integrity_classification() {
        assert!(SyncError::DecryptionFailed.is_integrity_failure());
        assert!(SyncError::UnknownKey("k".into()).is_integrity_failure());
        assert!(SyncError::InvalidSyncPayload("bad".into()).is_integrity_failure());
        assert!(!SyncError::PeerNotFound("p1".into()).is_integrity_failure());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            SyncError::PeerLimitReached { max: 10 }.to_string(),
            "Peer limit reached (10 peers)"
        );
        assert_eq!(SyncError::UnknownKey("abc".into()).to_string(), "Encryption key abc not found");
    }
}
