//! Durable sample log
//!
//! Append-only store of accepted samples keyed by (session id, sequence
//! number). The ingestor is its only writer and serializes appends per
//! session, so backends need no cross-writer coordination. Backends must:
//! - keep the first record for a key and ignore later ones
//! - return samples in ascending sequence order from [`SampleLog::load`]
//! - make an append visible to `load` once it returns `Ok`

pub mod file;
pub mod memory;

pub use file::FileSampleLog;
pub use memory::MemorySampleLog;

use crate::error::StoreError;
use crate::types::{EngagementSample, SessionId};
use async_trait::async_trait;
use std::fmt::Debug;

/// Append-only per-session sample log
#[async_trait]
pub trait SampleLog: Send + Sync + Debug {
    /// Durably append samples for one session
    async fn append(
        &self,
        session_id: &SessionId,
        samples: &[EngagementSample],
    ) -> Result<(), StoreError>;

    /// All samples of a session in ascending sequence order
    async fn load(&self, session_id: &SessionId) -> Result<Vec<EngagementSample>, StoreError>;

    /// Accepted sequence numbers of a session, ascending
    async fn sequences(&self, session_id: &SessionId) -> Result<Vec<u64>, StoreError> {
        Ok(self
            .load(session_id)
            .await?
            .into_iter()
            .map(|s| s.sequence_number)
            .collect())
    }
}
