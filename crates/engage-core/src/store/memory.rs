//! In-memory sample log

use super::SampleLog;
use crate::error::StoreError;
use crate::types::{EngagementSample, SessionId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Sample log held in a concurrent map of ordered per-session logs
#[derive(Debug, Default)]
pub struct MemorySampleLog {
    sessions: DashMap<SessionId, BTreeMap<u64, EngagementSample>>,
    unavailable: AtomicBool,
}

impl MemorySampleLog {
    /// Create empty log
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make appends fail with [`StoreError::Unavailable`] until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Samples stored for a session
    #[inline]
    #[must_use]
    pub fn len(&self, session_id: &SessionId) -> usize {
        self.sessions.get(session_id).map_or(0, |log| log.len())
    }

    /// Sessions with at least one sample
    #[inline]
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl SampleLog for MemorySampleLog {
    async fn append(
        &self,
        session_id: &SessionId,
        samples: &[EngagementSample],
    ) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory log marked unavailable".into()));
        }
        if samples.is_empty() {
            return Ok(());
        }
        let mut log = self.sessions.entry(*session_id).or_default();
        for sample in samples {
            log.entry(sample.sequence_number)
                .or_insert_with(|| sample.clone());
        }
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> Result<Vec<EngagementSample>, StoreError> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn sequences(&self, session_id: &SessionId) -> Result<Vec<u64>, StoreError> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|log| log.keys().copied().collect())
            .unwrap_or_default())
    }
}
