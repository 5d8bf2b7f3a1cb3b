//! Batch ingestion
//!
//! Accepts client batches of engagement samples for one session:
//! 1. Resolve the session and reserve a pending-batch slot
//! 2. Validate each sample (sequence, position, score) outside any lock
//! 3. Under the session lock, drop samples already accepted or repeated in the batch
//! 4. Durably append the new samples, then advance the session watermark
//!
//! A storage failure leaves the accepted index untouched, so the caller can
//! resend the same batch.

use crate::error::WatchError;
use crate::session::SessionRegistry;
use crate::store::SampleLog;
use crate::types::{
    EngagementSample, IngestResult, RawSample, RejectReason, SampleRejection, ScoreBounds,
    SessionId,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Validates, deduplicates and persists sample batches
#[derive(Debug, Clone)]
pub struct BatchIngestor {
    registry: Arc<SessionRegistry>,
    log: Arc<dyn SampleLog>,
    bounds: ScoreBounds,
    max_batch_size: usize,
}

impl BatchIngestor {
    /// Create ingestor
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        log: Arc<dyn SampleLog>,
        bounds: ScoreBounds,
        max_batch_size: usize,
    ) -> Self {
        Self {
            registry,
            log,
            bounds,
            max_batch_size,
        }
    }

    /// Ingest one batch for a session
    ///
    /// Sample-level problems are counted in the returned [`IngestResult`];
    /// only session-level problems fail the call.
    ///
    /// # Errors
    /// - `WatchError::SessionNotFound` for unknown sessions
    /// - `WatchError::SessionClosed` / `WatchError::TicketExpired` for finished sessions
    /// - `WatchError::BatchTooLarge` if the batch exceeds the configured size
    /// - `WatchError::Backpressure` if too many batches are in flight for the session
    /// - `WatchError::Storage` if the durable append fails; nothing is recorded
    pub async fn ingest(
        &self,
        session_id: &SessionId,
        batch: Vec<RawSample>,
    ) -> Result<IngestResult, WatchError> {
        let handle = self.registry.resolve_open(session_id)?;
        if batch.len() > self.max_batch_size {
            return Err(WatchError::BatchTooLarge {
                size: batch.len(),
                max: self.max_batch_size,
            });
        }
        let _permit = handle
            .try_reserve()
            .ok_or(WatchError::Backpressure(*session_id))?;

        let mut result = IngestResult::default();
        let mut candidates = Vec::with_capacity(batch.len());
        for raw in batch {
            match self.check(&raw) {
                Ok(sequence_number) => candidates.push(EngagementSample {
                    session_id: *session_id,
                    sequence_number,
                    playback_position_seconds: raw.playback_position_seconds,
                    score: raw.score,
                    client_timestamp: raw.client_timestamp,
                }),
                Err(reason) => {
                    result.rejected_count += 1;
                    result.rejections.push(SampleRejection {
                        sequence_number: raw.sequence_number,
                        reason,
                    });
                }
            }
        }

        let mut index = handle.lock_index().await;
        // the session may have been closed while this batch waited for the lock
        self.registry.ensure_open(&handle)?;
        if !index.is_warm() {
            let existing = self.log.sequences(session_id).await?;
            index.warm(existing);
        }

        let mut seen = HashSet::with_capacity(candidates.len());
        let mut fresh: Vec<EngagementSample> = Vec::with_capacity(candidates.len());
        for sample in candidates {
            if index.contains(sample.sequence_number) || !seen.insert(sample.sequence_number) {
                result.duplicate_count += 1;
            } else {
                fresh.push(sample);
            }
        }

        if let Some(highest) = fresh.iter().map(|s| s.sequence_number).max() {
            fresh.sort_by_key(|s| s.sequence_number);
            if let Err(e) = self.log.append(session_id, &fresh).await {
                tracing::error!("Append failed for session {}: {}", session_id, e);
                return Err(e.into());
            }
            index.extend(fresh.iter().map(|s| s.sequence_number));
            result.accepted_count = fresh.len();
            self.registry
                .touch(session_id, highest, fresh.len() as u64)?;
        }

        tracing::debug!(
            "Session {} batch: {} accepted, {} duplicate, {} rejected",
            session_id,
            result.accepted_count,
            result.duplicate_count,
            result.rejected_count
        );
        Ok(result)
    }

    /// Per-sample validation; returns the accepted sequence number
    fn check(&self, raw: &RawSample) -> Result<u64, RejectReason> {
        let sequence = u64::try_from(raw.sequence_number)
            .map_err(|_| RejectReason::NegativeSequence)?;
        let position = raw.playback_position_seconds;
        if !(position.is_finite() && position >= 0.0) {
            return Err(RejectReason::InvalidPosition { position });
        }
        if !self.bounds.contains(raw.score) {
            return Err(RejectReason::OutOfRangeScore { score: raw.score });
        }
        Ok(sequence)
    }
}
