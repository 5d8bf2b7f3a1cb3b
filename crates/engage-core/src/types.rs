//! Core types for watch sessions
//!
//! Defines the records shared by every component:
//! - Identifiers (users, videos, playlists, tickets)
//! - Tickets and watch sessions with their lifecycle states
//! - Engagement samples, raw and accepted
//! - Ingestion outcomes and derived session results

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Verified user identifier supplied by the identity collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Catalog video identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VideoId(pub String);

impl VideoId {
    /// Create video id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Catalog playlist identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlaylistId(pub u64);

impl fmt::Display for PlaylistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unguessable ticket identifier (128 random bits, hex encoded on the wire)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TicketId([u8; 16]);

/// Sessions are keyed by the ticket that owns them
pub type SessionId = TicketId;

impl TicketId {
    /// Draw a fresh id from the thread-local CSPRNG
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random::<[u8; 16]>())
    }

    /// Build from raw bytes
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TicketId({self})")
    }
}

/// Error parsing a ticket id from text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ticket id: expected 32 hex characters")]
pub struct TicketIdParseError;

impl FromStr for TicketId {
    type Err = TicketIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| TicketIdParseError)?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for TicketId {
    type Error = TicketIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TicketId> for String {
    fn from(value: TicketId) -> Self {
        value.to_string()
    }
}

/// Ticket lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Usable for ingestion
    Active,
    /// TTL elapsed or the owned session lapsed
    Expired,
    /// Owned session was closed by the client
    Consumed,
}

/// Time-bounded authorization for one user to watch one video
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Opaque id, doubles as the session id
    pub ticket_id: TicketId,
    pub user_id: UserId,
    pub video_id: VideoId,
    pub playlist_id: PlaylistId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TicketStatus,
    /// Playback restart counter inside this ticket, starts at 1
    pub segment: u32,
}

impl Ticket {
    /// Mint a new active ticket
    #[must_use]
    pub fn mint(
        user_id: UserId,
        video_id: VideoId,
        playlist_id: PlaylistId,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            ticket_id: TicketId::generate(),
            user_id,
            video_id,
            playlist_id,
            issued_at,
            expires_at: issued_at + ttl,
            status: TicketStatus::Active,
            segment: 1,
        }
    }

    /// Session owned by this ticket
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.ticket_id
    }

    /// Status as observed at `now`; an active ticket past its TTL reads as expired
    #[inline]
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> TicketStatus {
        match self.status {
            TicketStatus::Active if now >= self.expires_at => TicketStatus::Expired,
            status => status,
        }
    }
}

/// Watch session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Closed,
    Expired,
}

impl SessionState {
    /// Closed and expired are terminal
    #[inline]
    #[must_use]
    pub fn is_finished(self) -> bool {
        !matches!(self, SessionState::Open)
    }
}

/// Memoization key for derived results
///
/// Changes whenever a sample is accepted (including gap fills below the
/// watermark) or the session leaves the open state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionVersion {
    pub watermark: Option<u64>,
    pub accepted_count: u64,
    pub state: SessionState,
}

/// Server-side record of one viewing attempt under one ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSession {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub video_id: VideoId,
    pub playlist_id: PlaylistId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// One past the watermark; never moves backward
    pub next_expected_sequence: u64,
    /// Highest accepted sequence number
    pub watermark: Option<u64>,
    /// Distinct samples accepted so far
    pub accepted_count: u64,
}

impl WatchSession {
    /// Open a session for a ticket
    #[must_use]
    pub fn open(ticket: &Ticket, now: DateTime<Utc>) -> Self {
        Self {
            session_id: ticket.session_id(),
            user_id: ticket.user_id,
            video_id: ticket.video_id.clone(),
            playlist_id: ticket.playlist_id,
            state: SessionState::Open,
            created_at: now,
            expires_at: ticket.expires_at,
            last_activity_at: now,
            next_expected_sequence: 0,
            watermark: None,
            accepted_count: 0,
        }
    }

    /// Current memoization key
    #[inline]
    #[must_use]
    pub fn version(&self) -> SessionVersion {
        SessionVersion {
            watermark: self.watermark,
            accepted_count: self.accepted_count,
            state: self.state,
        }
    }

    /// Apply lazy expiry. Returns true when this call moved the session to expired.
    pub fn lapse(&mut self, now: DateTime<Utc>, inactivity_timeout: Duration) -> bool {
        if self.state != SessionState::Open {
            return false;
        }
        let idle = now - self.last_activity_at > inactivity_timeout;
        if now >= self.expires_at || idle {
            self.state = SessionState::Expired;
            return true;
        }
        false
    }

    /// Advance activity and watermark after an accepted append
    pub fn advance(&mut self, highest: u64, accepted: u64, now: DateTime<Utc>) {
        self.watermark = Some(self.watermark.map_or(highest, |w| w.max(highest)));
        self.next_expected_sequence = self
            .next_expected_sequence
            .max(highest.saturating_add(1));
        self.accepted_count += accepted;
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }
}

/// Sample as submitted by the client
///
/// The sequence number is signed so a negative value is reported per sample
/// instead of failing the whole batch at deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub sequence_number: i64,
    pub playback_position_seconds: f64,
    pub score: f64,
    pub client_timestamp: DateTime<Utc>,
}

/// Durably accepted engagement sample; immutable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementSample {
    pub session_id: SessionId,
    pub sequence_number: u64,
    pub playback_position_seconds: f64,
    pub score: f64,
    pub client_timestamp: DateTime<Utc>,
}

/// Inclusive score bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBounds {
    pub min: f64,
    pub max: f64,
}

impl ScoreBounds {
    /// Create bounds
    #[inline]
    #[must_use]
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Finite and within `[min, max]`
    #[inline]
    #[must_use]
    pub fn contains(&self, score: f64) -> bool {
        score.is_finite() && score >= self.min && score <= self.max
    }
}

impl Default for ScoreBounds {
    fn default() -> Self {
        Self::new(0.0, 1.0)
    }
}

/// Why a single sample was rejected
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Score outside the declared bounds or not finite
    OutOfRangeScore { score: f64 },
    /// Sequence number below zero
    NegativeSequence,
    /// Playback position negative or not finite
    InvalidPosition { position: f64 },
}

/// One rejected sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleRejection {
    pub sequence_number: i64,
    #[serde(flatten)]
    pub reason: RejectReason,
}

/// Outcome of one ingested batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub accepted_count: usize,
    pub duplicate_count: usize,
    pub rejected_count: usize,
    /// Per-sample rejection details, in batch order
    pub rejections: Vec<SampleRejection>,
}

impl IngestResult {
    /// Samples looked at
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.accepted_count + self.duplicate_count + self.rejected_count
    }
}

/// Derived view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub video_id: VideoId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    /// Mean score, `None` before any sample is accepted
    pub average_score: Option<f64>,
    /// Accepted samples ordered by sequence number
    pub timeline: Vec<EngagementSample>,
    /// Fraction of expected samples covered, in `[0, 1]`
    pub coverage: f64,
    pub completed: bool,
}

/// Every session result of one video, grouped by user
///
/// Within a user, results are ordered newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoResults {
    pub video_id: VideoId,
    pub results_by_user: BTreeMap<UserId, Vec<SessionResult>>,
}

/// Resume point for a (user, video) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchProgress {
    pub user_id: UserId,
    pub video_id: VideoId,
    pub session_id: SessionId,
    pub sequence_number: u64,
    pub playback_position_seconds: f64,
    pub updated_at: DateTime<Utc>,
}

/// Catalog facts used for coverage estimation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub video_id: VideoId,
    pub duration_secs: f64,
    /// Overrides the configured sampling interval when set
    pub sampling_interval_secs: Option<f64>,
}

impl VideoInfo {
    /// Create video info with the default sampling interval
    #[inline]
    #[must_use]
    pub fn new(video_id: VideoId, duration_secs: f64) -> Self {
        Self {
            video_id,
            duration_secs,
            sampling_interval_secs: None,
        }
    }

    /// With sampling interval
    #[inline]
    #[must_use]
    pub fn with_sampling_interval(mut self, secs: f64) -> Self {
        self.sampling_interval_secs = Some(secs);
        self
    }

    /// Expected sample count for a full viewing, at least 1
    #[must_use]
    pub fn expected_samples(&self, default_interval_secs: f64) -> u64 {
        let interval = self
            .sampling_interval_secs
            .filter(|s| s.is_finite() && *s > 0.0)
            .unwrap_or(default_interval_secs);
        if !(self.duration_secs.is_finite() && self.duration_secs > 0.0) || interval <= 0.0 {
            return 1;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let expected = (self.duration_secs / interval).ceil() as u64;
        expected.max(1)
    }
}
