//! Error types for the engagement engine
//!
//! Ticket- and session-level failures abort the whole call. Sample-level
//! failures never appear here; they are aggregated into
//! [`IngestResult`](crate::types::IngestResult) instead.

use crate::types::{PlaylistId, SessionId, TicketId, VideoId};
use std::path::PathBuf;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Video/playlist pair unknown to the catalog
    #[error("invalid target: video {video_id} in playlist {playlist_id}")]
    InvalidTarget {
        video_id: VideoId,
        playlist_id: PlaylistId,
    },

    /// No such ticket
    #[error("ticket not found: {0}")]
    TicketNotFound(TicketId),

    /// Ticket TTL elapsed, its session lapsed, or it was consumed
    #[error("ticket expired: {0}")]
    TicketExpired(TicketId),

    /// No such session
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Session was closed by the client
    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    /// Batch exceeds the configured size
    #[error("batch too large: {size} samples (max: {max})")]
    BatchTooLarge { size: usize, max: usize },

    /// Per-session pending queue is full
    #[error("session {0} has too many pending batches")]
    Backpressure(SessionId),

    /// Live session map is full
    #[error("live session capacity exceeded (max: {0})")]
    CapacityExceeded(usize),

    /// Durable log failure
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Catalog collaborator failure
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl WatchError {
    /// Caller may retry the same request unchanged
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Catalog(_) | Self::Backpressure(_) | Self::CapacityExceeded(_)
        )
    }

    /// Client must request a new ticket before sending more telemetry
    #[inline]
    #[must_use]
    pub fn requires_new_ticket(&self) -> bool {
        matches!(
            self,
            Self::TicketNotFound(_) | Self::TicketExpired(_) | Self::SessionClosed(_)
        )
    }
}

/// Durable sample log errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// IO failure
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record in the middle of a log is unreadable
    #[error("corrupt log for session {session_id} at line {line}")]
    Corrupt { session_id: SessionId, line: usize },

    /// Backend temporarily refusing writes
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Catalog collaborator errors
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Catalog could not be reached
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config text is not valid TOML for this schema
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Field value out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    /// Create invalid field error
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> TicketId {
        TicketId::from_bytes([1; 16])
    }

    #[test]
    fn watch_error_display() {
        let err = WatchError::SessionClosed(id());
        assert!(err.to_string().starts_with("session closed"));

        let err = WatchError::BatchTooLarge { size: 600, max: 500 };
        assert_eq!(err.to_string(), "batch too large: 600 samples (max: 500)");
    }

    #[test]
    fn watch_error_is_retryable() {
        assert!(WatchError::Backpressure(id()).is_retryable());
        assert!(WatchError::Storage(StoreError::Unavailable("down".into())).is_retryable());
        assert!(!WatchError::SessionClosed(id()).is_retryable());
        assert!(!WatchError::TicketExpired(id()).is_retryable());
    }

    #[test]
    fn closed_and_expired_are_distinct_from_issuance_failures() {
        let closed = WatchError::SessionClosed(id());
        let invalid = WatchError::InvalidTarget {
            video_id: VideoId::new("v1"),
            playlist_id: PlaylistId(1),
        };
        assert!(closed.requires_new_ticket());
        assert!(!invalid.requires_new_ticket());
        assert!(!WatchError::SessionNotFound(id()).requires_new_ticket());
    }

    #[test]
    fn store_error_converts() {
        let err: WatchError = StoreError::Unavailable("x".into()).into();
        assert!(matches!(err, WatchError::Storage(_)));
    }
}
