//! Session registry
//!
//! Owns the live watch sessions, one per ticket. Each session carries its own
//! serialization primitive: an async mutex over the accepted-sequence index,
//! held by the ingestor for dedup, append and watermark advance. There is no
//! registry-wide lock; sessions live in a sharded map keyed by session id.
//!
//! Expiry is lazy. Any access re-evaluates an open session against its
//! ticket deadline and the inactivity timeout. [`SessionRegistry::sweep`]
//! moves finished sessions out of the bounded live map into a metadata-only
//! archive, and drops archived sessions and finished tickets once they are
//! older than the configured retention.

use crate::clock::Clock;
use crate::config::EngageConfig;
use crate::error::WatchError;
use crate::ticket::TicketAuthority;
use crate::types::{SessionId, SessionState, TicketId, UserId, VideoId, WatchSession};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;

/// Accepted sequence numbers of one session
///
/// Starts cold; the ingestor warms it from the durable log on first use.
#[derive(Debug, Default)]
pub struct SequenceIndex {
    warmed: bool,
    accepted: HashSet<u64>,
}

impl SequenceIndex {
    /// Loaded from the durable log
    #[inline]
    #[must_use]
    pub fn is_warm(&self) -> bool {
        self.warmed
    }

    /// Seed from sequences already in the log
    pub fn warm(&mut self, sequences: impl IntoIterator<Item = u64>) {
        self.accepted.extend(sequences);
        self.warmed = true;
    }

    /// Sequence already accepted
    #[inline]
    #[must_use]
    pub fn contains(&self, sequence: u64) -> bool {
        self.accepted.contains(&sequence)
    }

    /// Record durably appended sequences
    pub fn extend(&mut self, sequences: impl IntoIterator<Item = u64>) {
        self.accepted.extend(sequences);
    }

    /// Accepted count
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    /// Nothing accepted yet
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }
}

/// Live session state plus its per-session primitives
#[derive(Debug)]
pub struct SessionHandle {
    meta: Mutex<WatchSession>,
    index: AsyncMutex<SequenceIndex>,
    /// Bounds batches in flight for this session
    pending: Semaphore,
}

impl SessionHandle {
    fn new(session: WatchSession, max_pending: usize) -> Self {
        Self {
            meta: Mutex::new(session),
            index: AsyncMutex::new(SequenceIndex::default()),
            pending: Semaphore::new(max_pending),
        }
    }

    /// Copy of the session record, without applying expiry
    #[must_use]
    pub fn snapshot(&self) -> WatchSession {
        self.meta.lock().clone()
    }

    /// Reserve a pending-batch slot without waiting
    #[must_use]
    pub fn try_reserve(&self) -> Option<SemaphorePermit<'_>> {
        self.pending.try_acquire().ok()
    }

    /// Enter the session's critical section
    pub async fn lock_index(&self) -> MutexGuard<'_, SequenceIndex> {
        self.index.lock().await
    }
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Sessions in the live map
    pub live: usize,
    /// Sessions moved to the archive
    pub archived: usize,
    /// Live sessions by last observed state
    pub open: usize,
    pub closed: usize,
    pub expired: usize,
}

#[derive(Debug)]
struct ArchivedSession {
    session: WatchSession,
    archived_at: DateTime<Utc>,
}

/// Registry of watch sessions
#[derive(Debug)]
pub struct SessionRegistry {
    tickets: Arc<TicketAuthority>,
    clock: Arc<dyn Clock>,
    live: DashMap<SessionId, Arc<SessionHandle>>,
    archive: DashMap<SessionId, ArchivedSession>,
    by_user: DashMap<UserId, Vec<SessionId>>,
    by_video: DashMap<VideoId, Vec<SessionId>>,
    inactivity_timeout: Duration,
    archive_retention: Duration,
    max_live: usize,
    max_pending: usize,
}

impl SessionRegistry {
    /// Create registry with limits from `config`
    #[must_use]
    pub fn new(tickets: Arc<TicketAuthority>, clock: Arc<dyn Clock>, config: &EngageConfig) -> Self {
        Self {
            tickets,
            clock,
            live: DashMap::new(),
            archive: DashMap::new(),
            by_user: DashMap::new(),
            by_video: DashMap::new(),
            inactivity_timeout: config.inactivity_timeout(),
            archive_retention: config.archive_retention(),
            max_live: config.max_live_sessions,
            max_pending: config.max_pending_batches,
        }
    }

    /// Open (or return) the session owned by a ticket
    ///
    /// Concurrent calls for one ticket converge on a single session.
    ///
    /// # Errors
    /// - `WatchError::TicketNotFound` / `WatchError::TicketExpired` if the ticket does not validate
    /// - `WatchError::TicketExpired` if the owned session already lapsed
    /// - `WatchError::CapacityExceeded` if the live map is full after a sweep
    pub fn open_for_ticket(&self, ticket_id: &TicketId) -> Result<WatchSession, WatchError> {
        let ticket = self.tickets.validate(ticket_id)?;
        let session_id = ticket.session_id();

        if let Some(handle) = self.handle(&session_id) {
            return self.ensure_open(&handle);
        }
        if let Some(archived) = self.archive.get(&session_id) {
            return Err(state_error(session_id, archived.session.state));
        }
        self.reserve_capacity()?;

        let now = self.clock.now();
        let mut created = false;
        let handle = self
            .live
            .entry(session_id)
            .or_insert_with(|| {
                created = true;
                Arc::new(SessionHandle::new(
                    WatchSession::open(&ticket, now),
                    self.max_pending,
                ))
            })
            .value()
            .clone();

        if created {
            self.by_user
                .entry(ticket.user_id)
                .or_default()
                .push(session_id);
            self.by_video
                .entry(ticket.video_id.clone())
                .or_default()
                .push(session_id);
            tracing::info!(
                "Opened session {} for user {} on video {}",
                session_id,
                ticket.user_id,
                ticket.video_id
            );
        }
        self.ensure_open(&handle)
    }

    fn reserve_capacity(&self) -> Result<(), WatchError> {
        if self.live.len() < self.max_live {
            return Ok(());
        }
        let swept = self.sweep(self.clock.now());
        if self.live.len() < self.max_live {
            tracing::debug!("Sweep freed {} live slots", swept);
            return Ok(());
        }
        tracing::warn!("Live session map full ({} sessions)", self.max_live);
        Err(WatchError::CapacityExceeded(self.max_live))
    }

    fn handle(&self, session_id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.live.get(session_id).map(|h| h.value().clone())
    }

    /// Apply lazy expiry and return the current record
    fn observe(&self, handle: &SessionHandle) -> WatchSession {
        let now = self.clock.now();
        let (session, lapsed) = {
            let mut meta = handle.meta.lock();
            let lapsed = meta.lapse(now, self.inactivity_timeout);
            (meta.clone(), lapsed)
        };
        if lapsed {
            self.tickets.retire(&session.session_id);
            tracing::info!("Session {} expired", session.session_id);
        }
        session
    }

    /// Current record if the session accepts telemetry
    ///
    /// # Errors
    /// `WatchError::SessionClosed` or `WatchError::TicketExpired` for finished sessions.
    pub fn ensure_open(&self, handle: &SessionHandle) -> Result<WatchSession, WatchError> {
        let session = self.observe(handle);
        match session.state {
            SessionState::Open => Ok(session),
            state => Err(state_error(session.session_id, state)),
        }
    }

    /// Resolve a live, open session for ingestion
    ///
    /// # Errors
    /// - `WatchError::SessionNotFound` for unknown ids
    /// - `WatchError::SessionClosed` / `WatchError::TicketExpired` for finished sessions
    pub fn resolve_open(&self, session_id: &SessionId) -> Result<Arc<SessionHandle>, WatchError> {
        let Some(handle) = self.handle(session_id) else {
            return Err(match self.archive.get(session_id) {
                Some(archived) => state_error(*session_id, archived.session.state),
                None => WatchError::SessionNotFound(*session_id),
            });
        };
        self.ensure_open(&handle)?;
        Ok(handle)
    }

    /// Session record with expiry applied
    #[must_use]
    pub fn snapshot(&self, session_id: &SessionId) -> Option<WatchSession> {
        match self.handle(session_id) {
            Some(handle) => Some(self.observe(&handle)),
            None => self.archive.get(session_id).map(|a| a.session.clone()),
        }
    }

    /// Advance activity and watermark after an accepted append
    ///
    /// `highest` is the highest sequence accepted by the batch and `accepted`
    /// the number of new samples. Never moves the watermark backward.
    ///
    /// # Errors
    /// `WatchError::SessionNotFound` if the session left the live map.
    pub fn touch(
        &self,
        session_id: &SessionId,
        highest: u64,
        accepted: u64,
    ) -> Result<WatchSession, WatchError> {
        let handle = self
            .handle(session_id)
            .ok_or(WatchError::SessionNotFound(*session_id))?;
        let now = self.clock.now();
        let mut meta = handle.meta.lock();
        meta.advance(highest, accepted, now);
        Ok(meta.clone())
    }

    /// Close a session; idempotent
    ///
    /// Waits for any in-flight batch of the session to finish. Closing an
    /// already finished session returns its record unchanged.
    ///
    /// # Errors
    /// `WatchError::SessionNotFound` for unknown ids.
    pub async fn close(&self, session_id: &SessionId) -> Result<WatchSession, WatchError> {
        let Some(handle) = self.handle(session_id) else {
            return self
                .archive
                .get(session_id)
                .map(|a| a.session.clone())
                .ok_or(WatchError::SessionNotFound(*session_id));
        };

        let _index = handle.lock_index().await;
        let now = self.clock.now();
        let (session, lapsed, closed) = {
            let mut meta = handle.meta.lock();
            let lapsed = meta.lapse(now, self.inactivity_timeout);
            let closed = meta.state == SessionState::Open;
            if closed {
                meta.state = SessionState::Closed;
            }
            (meta.clone(), lapsed, closed)
        };

        if lapsed {
            self.tickets.retire(session_id);
            tracing::info!("Session {} expired before close", session_id);
        }
        if closed {
            self.tickets.consume(session_id);
            tracing::info!(
                "Closed session {} with {} samples",
                session_id,
                session.accepted_count
            );
        }
        Ok(session)
    }

    /// Move finished sessions from the live map to the archive, then evict
    /// archived sessions and finished tickets past retention
    ///
    /// Sessions with a batch in flight are left for the next pass. Returns
    /// the number of sessions archived.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let handles: Vec<Arc<SessionHandle>> =
            self.live.iter().map(|h| h.value().clone()).collect();

        let mut archived = 0;
        for handle in handles {
            let (session, lapsed) = {
                let mut meta = handle.meta.lock();
                let lapsed = meta.lapse(now, self.inactivity_timeout);
                (meta.clone(), lapsed)
            };
            if lapsed {
                self.tickets.retire(&session.session_id);
            }
            if !session.state.is_finished() {
                continue;
            }
            let Ok(_index) = handle.index.try_lock() else {
                continue;
            };
            let session_id = session.session_id;
            // archive first so a concurrent lookup always finds one of the two
            self.archive.insert(
                session_id,
                ArchivedSession {
                    session,
                    archived_at: now,
                },
            );
            self.live.remove(&session_id);
            archived += 1;
        }

        if archived > 0 {
            tracing::debug!("Archived {} finished sessions", archived);
        }
        self.evict(now);
        archived
    }

    fn evict(&self, now: DateTime<Utc>) {
        let cutoff = now - self.archive_retention;
        let expired: Vec<WatchSession> = self
            .archive
            .iter()
            .filter(|a| a.archived_at < cutoff)
            .map(|a| a.session.clone())
            .collect();

        for session in &expired {
            self.archive.remove(&session.session_id);
            unindex(&self.by_user, &session.user_id, &session.session_id);
            unindex(&self.by_video, &session.video_id, &session.session_id);
            self.tickets.forget(&session.session_id);
        }

        // tickets that lapsed without ever opening a session
        let mut orphaned = 0;
        for ticket_id in self.tickets.stale(cutoff) {
            if self.live.contains_key(&ticket_id) || self.archive.contains_key(&ticket_id) {
                continue;
            }
            if self.tickets.forget(&ticket_id) {
                orphaned += 1;
            }
        }

        if !expired.is_empty() || orphaned > 0 {
            tracing::debug!(
                "Evicted {} archived sessions and {} orphaned tickets",
                expired.len(),
                orphaned
            );
        }
    }

    /// Run [`SessionRegistry::sweep`] every `period` until the registry is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, period: std::time::Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    tracing::debug!("Registry dropped, sweeper exiting");
                    break;
                };
                registry.sweep(registry.clock.now());
            }
        })
    }

    /// Sessions of a user, most recently created first
    #[must_use]
    pub fn sessions_for_user(&self, user_id: UserId) -> Vec<WatchSession> {
        self.sessions_in(&self.by_user, &user_id)
    }

    /// Sessions on a video, most recently created first
    #[must_use]
    pub fn sessions_for_video(&self, video_id: &VideoId) -> Vec<WatchSession> {
        self.sessions_in(&self.by_video, video_id)
    }

    fn sessions_in<K: Eq + Hash>(
        &self,
        index: &DashMap<K, Vec<SessionId>>,
        key: &K,
    ) -> Vec<WatchSession> {
        let ids = index
            .get(key)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();

        let mut sessions: Vec<WatchSession> =
            ids.iter().filter_map(|id| self.snapshot(id)).collect();
        sessions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.session_id.cmp(&a.session_id))
        });
        sessions
    }

    /// Registry counters
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            live: self.live.len(),
            archived: self.archive.len(),
            ..RegistryStats::default()
        };
        for handle in &self.live {
            match handle.meta.lock().state {
                SessionState::Open => stats.open += 1,
                SessionState::Closed => stats.closed += 1,
                SessionState::Expired => stats.expired += 1,
            }
        }
        stats
    }

    /// Ticket authority backing this registry
    #[inline]
    #[must_use]
    pub fn tickets(&self) -> &Arc<TicketAuthority> {
        &self.tickets
    }
}

fn unindex<K: Eq + Hash>(index: &DashMap<K, Vec<SessionId>>, key: &K, session_id: &SessionId) {
    if let Some(mut ids) = index.get_mut(key) {
        ids.retain(|id| id != session_id);
    }
    index.remove_if(key, |_, ids| ids.is_empty());
}

fn state_error(session_id: SessionId, state: SessionState) -> WatchError {
    match state {
        SessionState::Closed => WatchError::SessionClosed(session_id),
        SessionState::Open | SessionState::Expired => WatchError::TicketExpired(session_id),
    }
}
