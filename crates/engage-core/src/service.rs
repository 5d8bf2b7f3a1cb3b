//! Watch service facade
//!
//! Wires the ticket authority, session registry, ingestor and aggregator from
//! one [`EngageConfig`]. Each transport operation maps to one method.

use crate::aggregate::ResultAggregator;
use crate::api::{ResultsQuery, TicketGrant, TicketRequest, WatchBatch, WatchEnd};
use crate::catalog::Catalog;
use crate::clock::{Clock, SystemClock};
use crate::config::EngageConfig;
use crate::error::WatchError;
use crate::ingest::BatchIngestor;
use crate::session::{RegistryStats, SessionRegistry};
use crate::store::SampleLog;
use crate::ticket::TicketAuthority;
use crate::types::{
    IngestResult, SessionId, SessionResult, Ticket, TicketId, UserId, VideoId, VideoResults,
    WatchProgress, WatchSession,
};
use futures::{Stream, TryStreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Engagement engine entry point
#[derive(Debug)]
pub struct WatchService {
    config: EngageConfig,
    tickets: Arc<TicketAuthority>,
    registry: Arc<SessionRegistry>,
    ingestor: BatchIngestor,
    aggregator: ResultAggregator,
}

impl WatchService {
    /// Create service on the system clock
    ///
    /// # Errors
    /// `WatchError::Config` if `config` does not validate.
    pub fn new(
        config: EngageConfig,
        catalog: Arc<dyn Catalog>,
        log: Arc<dyn SampleLog>,
    ) -> Result<Self, WatchError> {
        Self::with_clock(config, catalog, log, Arc::new(SystemClock))
    }

    /// Create service on an explicit clock
    ///
    /// # Errors
    /// `WatchError::Config` if `config` does not validate.
    pub fn with_clock(
        config: EngageConfig,
        catalog: Arc<dyn Catalog>,
        log: Arc<dyn SampleLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, WatchError> {
        config.validate()?;

        let tickets = Arc::new(TicketAuthority::new(
            catalog.clone(),
            clock.clone(),
            config.ticket_ttl(),
        ));
        let registry = Arc::new(SessionRegistry::new(tickets.clone(), clock, &config));
        let ingestor = BatchIngestor::new(
            registry.clone(),
            log.clone(),
            config.score_bounds(),
            config.max_batch_size,
        );
        let aggregator = ResultAggregator::new(
            registry.clone(),
            log,
            catalog,
            config.result_cache_capacity,
            config.default_sampling_interval_secs,
            config.completion_threshold,
        );

        tracing::info!(
            "Watch service ready (ticket ttl {}s, inactivity {}s, max live {})",
            config.ticket_ttl_secs,
            config.inactivity_timeout_secs,
            config.max_live_sessions
        );
        Ok(Self {
            config,
            tickets,
            registry,
            ingestor,
            aggregator,
        })
    }

    /// Start the periodic sweep if enabled in the config
    #[must_use]
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        self.config
            .sweep_interval()
            .map(|period| self.registry.spawn_sweeper(period))
    }

    /// Issue (or reuse) a ticket and open its session
    ///
    /// A reused ticket whose session already lapsed is replaced by a fresh one.
    ///
    /// # Errors
    /// - `WatchError::InvalidTarget` for unknown catalog references
    /// - `WatchError::CapacityExceeded` if no live slot is free
    pub async fn issue_ticket(&self, request: TicketRequest) -> Result<TicketGrant, WatchError> {
        let TicketRequest {
            user_id,
            video_id,
            playlist_id,
        } = request;

        let ticket = self
            .tickets
            .issue(user_id, video_id.clone(), playlist_id)
            .await?;
        match self.registry.open_for_ticket(&ticket.ticket_id) {
            Ok(session) => Ok(TicketGrant { ticket, session }),
            Err(WatchError::TicketExpired(stale)) => {
                tracing::debug!("Ticket {} lapsed before open, reissuing", stale);
                let ticket = self.tickets.issue(user_id, video_id, playlist_id).await?;
                let session = self.registry.open_for_ticket(&ticket.ticket_id)?;
                Ok(TicketGrant { ticket, session })
            }
            Err(e) => Err(e),
        }
    }

    /// Ingest one batch
    ///
    /// # Errors
    /// See [`BatchIngestor::ingest`].
    pub async fn ingest_batch(&self, batch: WatchBatch) -> Result<IngestResult, WatchError> {
        self.ingestor.ingest(&batch.session_id, batch.samples).await
    }

    /// Close a session
    ///
    /// # Errors
    /// `WatchError::SessionNotFound` for unknown sessions.
    pub async fn end_session(&self, end: WatchEnd) -> Result<WatchSession, WatchError> {
        self.registry.close(&end.session_id).await
    }

    /// Derived result for one session
    ///
    /// # Errors
    /// See [`ResultAggregator::session_result`].
    pub async fn session_result(&self, session_id: &SessionId) -> Result<SessionResult, WatchError> {
        self.aggregator.session_result(session_id).await
    }

    /// Lazy stream of a user's results, newest first
    pub fn user_results(
        &self,
        user_id: UserId,
    ) -> impl Stream<Item = Result<SessionResult, WatchError>> + '_ {
        self.aggregator.user_results(user_id)
    }

    /// Results for a video, grouped by user
    ///
    /// # Errors
    /// See [`ResultAggregator::video_results`].
    pub async fn video_results(&self, video_id: &VideoId) -> Result<VideoResults, WatchError> {
        self.aggregator.video_results(video_id).await
    }

    /// Answer a results query eagerly
    ///
    /// Video results are flattened in user order.
    ///
    /// # Errors
    /// The first error hit while computing any result.
    pub async fn results(&self, query: ResultsQuery) -> Result<Vec<SessionResult>, WatchError> {
        match query {
            ResultsQuery::Session { session_id } => {
                Ok(vec![self.session_result(&session_id).await?])
            }
            ResultsQuery::User { user_id } => self.user_results(user_id).try_collect().await,
            ResultsQuery::Video { video_id } => Ok(self
                .video_results(&video_id)
                .await?
                .results_by_user
                .into_values()
                .flatten()
                .collect()),
        }
    }

    /// Resume point for a (user, video) pair
    ///
    /// # Errors
    /// `WatchError::Storage` if the log cannot be read.
    pub async fn watch_progress(
        &self,
        user_id: UserId,
        video_id: &VideoId,
    ) -> Result<Option<WatchProgress>, WatchError> {
        self.aggregator.watch_progress(user_id, video_id).await
    }

    /// Advance the playback segment of a ticket
    ///
    /// # Errors
    /// `WatchError::TicketNotFound` / `WatchError::TicketExpired`.
    pub fn next_segment(&self, ticket_id: &TicketId) -> Result<Ticket, WatchError> {
        self.tickets.next_segment(ticket_id)
    }

    /// Active ticket for a (user, video) pair
    #[must_use]
    pub fn current_ticket(&self, user_id: UserId, video_id: &VideoId) -> Option<Ticket> {
        self.tickets.current(user_id, video_id)
    }

    /// Registry counters
    #[inline]
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngageConfig {
        &self.config
    }

    /// Session registry
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Ticket authority
    #[inline]
    #[must_use]
    pub fn tickets(&self) -> &Arc<TicketAuthority> {
        &self.tickets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::clock::ManualClock;
    use crate::store::MemorySampleLog;
    use crate::types::{PlaylistId, RawSample, SessionState, VideoInfo};
    use chrono::{Duration, Utc};

    fn service(config: EngageConfig) -> (WatchService, Arc<ManualClock>) {
        let catalog = InMemoryCatalog::new();
        catalog.insert(PlaylistId(7), VideoInfo::new(VideoId::new("v1"), 100.0));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service = WatchService::with_clock(
            config,
            Arc::new(catalog),
            Arc::new(MemorySampleLog::new()),
            clock.clone(),
        )
        .unwrap();
        (service, clock)
    }

    fn request() -> TicketRequest {
        TicketRequest {
            user_id: UserId(42),
            video_id: VideoId::new("v1"),
            playlist_id: PlaylistId(7),
        }
    }

    fn batch(session_id: SessionId, seqs: &[i64]) -> WatchBatch {
        WatchBatch {
            session_id,
            samples: seqs
                .iter()
                .map(|&seq| RawSample {
                    sequence_number: seq,
                    playback_position_seconds: seq as f64 * 10.0,
                    score: 0.5,
                    client_timestamp: Utc::now(),
                })
                .collect(),
        }
    }

    #[test]
    fn invalid_config_is_refused() {
        let result = WatchService::new(
            EngageConfig::new().with_completion_threshold(2.0),
            Arc::new(InMemoryCatalog::new()),
            Arc::new(MemorySampleLog::new()),
        );
        assert!(matches!(result, Err(WatchError::Config(_))));
    }

    #[tokio::test]
    async fn lapsed_reused_ticket_is_replaced() {
        let (service, clock) = service(EngageConfig::new().with_inactivity_timeout_secs(60));
        let first = service.issue_ticket(request()).await.unwrap();

        clock.advance(Duration::seconds(61));
        let second = service.issue_ticket(request()).await.unwrap();
        assert_ne!(first.ticket.ticket_id, second.ticket.ticket_id);
        assert_eq!(second.session.state, SessionState::Open);
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let (service, _) = service(EngageConfig::default());
        let grant = service.issue_ticket(request()).await.unwrap();
        let id = grant.session.session_id;

        let seqs: Vec<i64> = (0..10).collect();
        let ingested = service.ingest_batch(batch(id, &seqs)).await.unwrap();
        assert_eq!(ingested.accepted_count, 10);

        let ended = service.end_session(WatchEnd { session_id: id }).await.unwrap();
        assert_eq!(ended.state, SessionState::Closed);

        let result = service.session_result(&id).await.unwrap();
        assert_eq!(result.coverage, 1.0);
        assert!(result.completed);

        let all = service
            .results(ResultsQuery::User { user_id: UserId(42) })
            .await
            .unwrap();
        assert_eq!(all, vec![result]);
        assert!(service.current_ticket(UserId(42), &VideoId::new("v1")).is_none());
    }

    #[tokio::test]
    async fn video_results_group_by_user() {
        let (service, clock) = service(EngageConfig::default());
        let first = service.issue_ticket(request()).await.unwrap().session.session_id;
        service
            .ingest_batch(batch(first, &[0, 1, 2]))
            .await
            .unwrap();
        service.end_session(WatchEnd { session_id: first }).await.unwrap();

        clock.advance(Duration::seconds(5));
        let second = service.issue_ticket(request()).await.unwrap().session.session_id;
        let other = service
            .issue_ticket(TicketRequest {
                user_id: UserId(43),
                ..request()
            })
            .await
            .unwrap()
            .session
            .session_id;

        let grouped = service.video_results(&VideoId::new("v1")).await.unwrap();
        let users: Vec<UserId> = grouped.results_by_user.keys().copied().collect();
        assert_eq!(users, vec![UserId(42), UserId(43)]);
        let mine: Vec<SessionId> = grouped.results_by_user[&UserId(42)]
            .iter()
            .map(|r| r.session_id)
            .collect();
        assert_eq!(mine, vec![second, first]);
        assert_eq!(grouped.results_by_user[&UserId(43)][0].session_id, other);

        let flat = service
            .results(ResultsQuery::Video {
                video_id: VideoId::new("v1"),
            })
            .await
            .unwrap();
        assert_eq!(flat.len(), 3);

        let unknown = service.video_results(&VideoId::new("v9")).await.unwrap();
        assert!(unknown.results_by_user.is_empty());
    }

    #[tokio::test]
    async fn sweeper_disabled_by_config() {
        let mut config = EngageConfig::default();
        config.sweep_interval_secs = 0;
        let (service, _) = service(config);
        assert!(service.spawn_sweeper().is_none());
    }
}
