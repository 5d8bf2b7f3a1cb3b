//! Testing utilities for the engage workspace
//!
//! Shared fixtures: a seeded catalog, a service on a manual clock, and
//! sample builders.

#![allow(missing_docs)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use engage_core::{
    EngageConfig, InMemoryCatalog, ManualClock, MemorySampleLog, PlaylistId, RawSample,
    SessionId, TicketGrant, TicketRequest, UserId, VideoId, VideoInfo, WatchBatch, WatchService,
};
use std::sync::Arc;

/// Playlist every fixture video belongs to
pub const PLAYLIST: PlaylistId = PlaylistId(7);

/// Video length used by fixtures, 10 samples at the default interval
pub const VIDEO_SECS: f64 = 100.0;

/// Fixed start instant so timestamps are reproducible
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn create_test_catalog() -> Arc<InMemoryCatalog> {
    let catalog = InMemoryCatalog::new();
    for video in ["v1", "v2", "v3"] {
        catalog.insert(PLAYLIST, VideoInfo::new(VideoId::new(video), VIDEO_SECS));
    }
    Arc::new(catalog)
}

/// Service wired to in-memory collaborators and a manual clock
pub struct TestHarness {
    pub service: WatchService,
    pub clock: Arc<ManualClock>,
    pub log: Arc<MemorySampleLog>,
    pub catalog: Arc<InMemoryCatalog>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(EngageConfig::new())
    }

    pub fn with_config(config: EngageConfig) -> Self {
        let clock = Arc::new(ManualClock::new(epoch()));
        let log = Arc::new(MemorySampleLog::new());
        let catalog = create_test_catalog();
        let service = WatchService::with_clock(config, catalog.clone(), log.clone(), clock.clone())
            .expect("test config is valid");
        Self {
            service,
            clock,
            log,
            catalog,
        }
    }

    /// Issue a ticket and open its session
    pub async fn open(&self, user: u64, video: &str) -> TicketGrant {
        self.service
            .issue_ticket(ticket_request(user, video))
            .await
            .expect("fixture ticket issues")
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn ticket_request(user: u64, video: &str) -> TicketRequest {
    TicketRequest {
        user_id: UserId(user),
        video_id: VideoId::new(video),
        playlist_id: PLAYLIST,
    }
}

/// Sample at 10s per sequence step
pub fn sample(seq: i64, score: f64) -> RawSample {
    RawSample {
        sequence_number: seq,
        playback_position_seconds: if seq < 0 { 0.0 } else { seq as f64 * 10.0 },
        score,
        client_timestamp: epoch() + Duration::seconds(seq.max(0) * 10),
    }
}

pub fn batch(session_id: SessionId, samples: &[(i64, f64)]) -> WatchBatch {
    WatchBatch {
        session_id,
        samples: samples.iter().map(|&(seq, score)| sample(seq, score)).collect(),
    }
}
