//! Result aggregation
//!
//! Derives [`SessionResult`]s from the durable log. Results are memoized per
//! session and reused while the session version is unchanged; any accepted
//! sample or state change bumps the version and forces a recompute.

use crate::catalog::Catalog;
use crate::error::WatchError;
use crate::session::SessionRegistry;
use crate::store::SampleLog;
use crate::types::{
    EngagementSample, SessionId, SessionResult, SessionVersion, UserId, VideoId, VideoResults,
    WatchProgress, WatchSession,
};
use futures::stream::{self, Stream, StreamExt};
use moka::future::Cache;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
struct CachedResult {
    version: SessionVersion,
    result: SessionResult,
}

/// Read-only view over sessions and their samples
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    registry: Arc<SessionRegistry>,
    log: Arc<dyn SampleLog>,
    catalog: Arc<dyn Catalog>,
    cache: Cache<SessionId, Arc<CachedResult>>,
    default_interval_secs: f64,
    completion_threshold: f64,
}

impl ResultAggregator {
    /// Create aggregator
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        log: Arc<dyn SampleLog>,
        catalog: Arc<dyn Catalog>,
        cache_capacity: u64,
        default_interval_secs: f64,
        completion_threshold: f64,
    ) -> Self {
        Self {
            registry,
            log,
            catalog,
            cache: Cache::new(cache_capacity),
            default_interval_secs,
            completion_threshold,
        }
    }

    /// Derived result for one session
    ///
    /// # Errors
    /// - `WatchError::SessionNotFound` for unknown sessions
    /// - `WatchError::Storage` / `WatchError::Catalog` if a collaborator fails
    pub async fn session_result(&self, session_id: &SessionId) -> Result<SessionResult, WatchError> {
        let session = self
            .registry
            .snapshot(session_id)
            .ok_or(WatchError::SessionNotFound(*session_id))?;
        let version = session.version();

        if let Some(cached) = self.cache.get(session_id).await {
            if cached.version == version {
                return Ok(cached.result.clone());
            }
        }

        let timeline = self.log.load(session_id).await?;
        let expected = match self.catalog.video_info(&session.video_id).await? {
            Some(info) => Some(info.expected_samples(self.default_interval_secs)),
            None => {
                tracing::warn!(
                    "Video {} missing from catalog, coverage unknown",
                    session.video_id
                );
                None
            }
        };
        let result = summarize(&session, timeline, expected, self.completion_threshold);
        self.cache
            .insert(
                *session_id,
                Arc::new(CachedResult {
                    version,
                    result: result.clone(),
                }),
            )
            .await;
        Ok(result)
    }

    /// Results for all sessions of a user, most recently created first
    ///
    /// The session list is captured when the stream is created; each result
    /// is computed only when polled.
    pub fn user_results(
        &self,
        user_id: UserId,
    ) -> impl Stream<Item = Result<SessionResult, WatchError>> + '_ {
        let sessions = self.registry.sessions_for_user(user_id);
        stream::iter(sessions).then(move |session| async move {
            self.session_result(&session.session_id).await
        })
    }

    /// Resume point: last reported position in the user's most recent session of a video
    ///
    /// # Errors
    /// `WatchError::Storage` if the log cannot be read.
    pub async fn watch_progress(
        &self,
        user_id: UserId,
        video_id: &VideoId,
    ) -> Result<Option<WatchProgress>, WatchError> {
        let candidates = self
            .registry
            .sessions_for_user(user_id)
            .into_iter()
            .filter(|s| &s.video_id == video_id && s.accepted_count > 0);

        for session in candidates {
            let samples = self.log.load(&session.session_id).await?;
            if let Some(last) = samples.last() {
                return Ok(Some(WatchProgress {
                    user_id,
                    video_id: video_id.clone(),
                    session_id: session.session_id,
                    sequence_number: last.sequence_number,
                    playback_position_seconds: last.playback_position_seconds,
                    updated_at: session.last_activity_at,
                }));
            }
        }
        Ok(None)
    }

    /// Results for every session on a video, grouped by user
    ///
    /// Unknown videos yield an empty grouping. Sessions evicted while the
    /// query runs are skipped.
    ///
    /// # Errors
    /// `WatchError::Storage` / `WatchError::Catalog` if a collaborator fails.
    pub async fn video_results(&self, video_id: &VideoId) -> Result<VideoResults, WatchError> {
        let mut results_by_user: BTreeMap<UserId, Vec<SessionResult>> = BTreeMap::new();
        for session in self.registry.sessions_for_video(video_id) {
            match self.session_result(&session.session_id).await {
                Ok(result) => results_by_user.entry(result.user_id).or_default().push(result),
                Err(WatchError::SessionNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(VideoResults {
            video_id: video_id.clone(),
            results_by_user,
        })
    }
}

/// Build a session result from its ordered timeline
///
/// Coverage is the inclusive sequence span over `expected` samples, clamped
/// to `[0, 1]`; unknown expectations yield zero coverage.
#[must_use]
pub fn summarize(
    session: &WatchSession,
    mut timeline: Vec<EngagementSample>,
    expected: Option<u64>,
    completion_threshold: f64,
) -> SessionResult {
    timeline.sort_by_key(|s| s.sequence_number);

    #[allow(clippy::cast_precision_loss)]
    let average_score = (!timeline.is_empty())
        .then(|| timeline.iter().map(|s| s.score).sum::<f64>() / timeline.len() as f64);

    let coverage = match (timeline.first(), timeline.last(), expected) {
        (Some(first), Some(last), Some(expected)) if expected > 0 => {
            let span = last.sequence_number - first.sequence_number + 1;
            #[allow(clippy::cast_precision_loss)]
            let ratio = span as f64 / expected as f64;
            ratio.clamp(0.0, 1.0)
        }
        _ => 0.0,
    };

    SessionResult {
        session_id: session.session_id,
        user_id: session.user_id,
        video_id: session.video_id.clone(),
        state: session.state,
        created_at: session.created_at,
        average_score,
        timeline,
        coverage,
        completed: session.state.is_finished() && coverage > completion_threshold,
    }
}
