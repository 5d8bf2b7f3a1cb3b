//! Seeded ingestion simulator
//!
//! Drives many sessions concurrently through the full lifecycle with
//! shuffled, partially duplicated and partially invalid batches, then checks
//! the engine's guarantees against an independently computed expectation.

use engage_core::{
    EngageConfig, IngestResult, InMemoryCatalog, MemorySampleLog, PlaylistId, RawSample,
    SessionId, SessionResult, SessionState, TicketRequest, UserId, VideoId, VideoInfo, WatchBatch,
    WatchEnd, WatchService,
};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PLAYLIST: PlaylistId = PlaylistId(1);
const SAMPLE_INTERVAL_SECS: f64 = 10.0;

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Concurrent sessions
    pub sessions: usize,
    /// Distinct batches per session
    pub batches_per_session: usize,
    /// Samples per batch
    pub batch_size: usize,
    /// Probability that a batch is delivered twice
    pub duplicate_rate: f64,
    /// Probability that a sample carries an out-of-range score
    pub invalid_rate: f64,
    /// Stop checking after the first violation
    pub stop_on_first_violation: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            sessions: 100,
            batches_per_session: 20,
            batch_size: 10,
            duplicate_rate: 0.2,
            invalid_rate: 0.05,
            stop_on_first_violation: false,
        }
    }
}

/// Engine guarantees checked per session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantCheck {
    /// Every valid sample accepted exactly once
    AcceptedOncePerSequence,
    /// accepted + duplicate + rejected equals batch size
    CountsPartitionBatch,
    /// Timeline strictly ascending by sequence
    TimelineOrdered,
    /// Average matches the independently computed mean
    AverageMatches,
    /// Resending an accepted batch accepts nothing
    ReplayIsIdempotent,
    /// Session reads back as closed after ending it
    ClosedAfterEnd,
}

/// A violated guarantee
#[derive(Debug, Clone)]
pub struct Violation {
    pub session: usize,
    pub check: InvariantCheck,
    pub details: String,
}

/// Counters collected during a run
#[derive(Debug, Clone, Default)]
pub struct SimulationStats {
    pub sessions: usize,
    pub batches_sent: usize,
    pub samples_sent: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub errors: usize,
}

impl SimulationStats {
    fn record(&mut self, result: &IngestResult) {
        self.batches_sent += 1;
        self.samples_sent += result.total();
        self.accepted += result.accepted_count;
        self.duplicates += result.duplicate_count;
        self.rejected += result.rejected_count;
    }
}

/// Final report
#[derive(Debug, Clone)]
pub struct SimulatorReport {
    pub config: SimulatorConfig,
    pub stats: SimulationStats,
    pub violations: Vec<Violation>,
    pub elapsed: Duration,
}

impl SimulatorReport {
    /// No guarantee was violated and no call failed
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty() && self.stats.errors == 0
    }

    /// Human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Engage Simulator Report ===\n\n");
        report.push_str(&format!("Seed: {}\n", self.config.seed));
        report.push_str(&format!("Sessions: {}\n", self.stats.sessions));
        report.push_str(&format!("Batches Sent: {}\n", self.stats.batches_sent));
        report.push_str(&format!("Samples Sent: {}\n", self.stats.samples_sent));
        report.push_str(&format!("Accepted: {}\n", self.stats.accepted));
        report.push_str(&format!("Duplicates: {}\n", self.stats.duplicates));
        report.push_str(&format!("Rejected: {}\n", self.stats.rejected));
        report.push_str(&format!("Errors: {}\n", self.stats.errors));
        report.push_str(&format!("Elapsed: {:?}\n", self.elapsed));
        report.push_str(&format!("Violations: {}\n", self.violations.len()));

        if !self.violations.is_empty() {
            report.push_str("\n=== Violations ===\n");
            for (i, v) in self.violations.iter().enumerate() {
                report.push_str(&format!(
                    "{}. session {} {:?}: {}\n",
                    i + 1,
                    v.session,
                    v.check,
                    v.details
                ));
            }
        }

        report.push_str(&format!(
            "\n=== Result: {} ===\n",
            if self.passed() { "PASS" } else { "FAIL" }
        ));
        report
    }
}

/// Planned traffic for one session
struct SessionPlan {
    user_id: UserId,
    video_id: VideoId,
    /// Delivery order, duplicates included
    deliveries: Vec<Vec<RawSample>>,
    /// First valid score per sequence
    expected: BTreeMap<u64, f64>,
}

fn plan_session(index: usize, config: &SimulatorConfig, rng: &mut StdRng) -> SessionPlan {
    let total = config.batches_per_session * config.batch_size;
    let mut samples: Vec<RawSample> = (0..total)
        .map(|seq| {
            let invalid = rng.random_bool(config.invalid_rate);
            let score = if invalid {
                1.0 + rng.random_range(0.01..1.0)
            } else {
                f64::from(rng.random_range(0..=100u32)) / 100.0
            };
            RawSample {
                sequence_number: seq as i64,
                playback_position_seconds: seq as f64 * SAMPLE_INTERVAL_SECS,
                score,
                client_timestamp: chrono::Utc::now(),
            }
        })
        .collect();

    let expected = samples
        .iter()
        .filter(|s| s.score <= 1.0)
        .map(|s| (s.sequence_number as u64, s.score))
        .collect();

    samples.shuffle(rng);
    let mut deliveries = Vec::new();
    for chunk in samples.chunks(config.batch_size.max(1)) {
        deliveries.push(chunk.to_vec());
        if rng.random_bool(config.duplicate_rate) {
            deliveries.push(chunk.to_vec());
        }
    }
    deliveries.shuffle(rng);

    SessionPlan {
        user_id: UserId(index as u64),
        video_id: VideoId::new(format!("video-{}", index % 16)),
        deliveries,
        expected,
    }
}

struct SessionOutcome {
    index: usize,
    results: Vec<(usize, IngestResult)>,
    errors: usize,
    replay: Option<IngestResult>,
    final_result: Option<SessionResult>,
    expected: BTreeMap<u64, f64>,
}

async fn drive_session(service: Arc<WatchService>, index: usize, plan: SessionPlan) -> SessionOutcome {
    let mut outcome = SessionOutcome {
        index,
        results: Vec::new(),
        errors: 0,
        replay: None,
        final_result: None,
        expected: plan.expected,
    };

    let grant = match service
        .issue_ticket(TicketRequest {
            user_id: plan.user_id,
            video_id: plan.video_id,
            playlist_id: PLAYLIST,
        })
        .await
    {
        Ok(grant) => grant,
        Err(e) => {
            tracing::error!("Session {} could not open: {}", index, e);
            outcome.errors += 1;
            return outcome;
        }
    };
    let session_id: SessionId = grant.session.session_id;

    let first = plan.deliveries.first().cloned();
    let sends = plan.deliveries.into_iter().map(|samples| {
        let service = service.clone();
        let size = samples.len();
        async move {
            let result = service.ingest_batch(WatchBatch { session_id, samples }).await;
            (size, result)
        }
    });
    for (size, result) in join_all(sends).await {
        match result {
            Ok(result) => outcome.results.push((size, result)),
            Err(e) => {
                tracing::warn!("Session {} batch failed: {}", index, e);
                outcome.errors += 1;
            }
        }
    }

    if let Some(samples) = first {
        match service.ingest_batch(WatchBatch { session_id, samples }).await {
            Ok(result) => outcome.replay = Some(result),
            Err(_) => outcome.errors += 1,
        }
    }

    if service.end_session(WatchEnd { session_id }).await.is_err() {
        outcome.errors += 1;
    }
    match service.session_result(&session_id).await {
        Ok(result) => outcome.final_result = Some(result),
        Err(_) => outcome.errors += 1,
    }
    outcome
}

fn check_session(outcome: &SessionOutcome, violations: &mut Vec<Violation>) {
    let mut violate = |check, details: String| {
        violations.push(Violation {
            session: outcome.index,
            check,
            details,
        });
    };

    for (size, result) in &outcome.results {
        if result.total() != *size {
            violate(
                InvariantCheck::CountsPartitionBatch,
                format!("{} counted for a batch of {}", result.total(), size),
            );
        }
    }

    let accepted: usize = outcome.results.iter().map(|(_, r)| r.accepted_count).sum();
    if accepted != outcome.expected.len() {
        violate(
            InvariantCheck::AcceptedOncePerSequence,
            format!("accepted {} of {} valid sequences", accepted, outcome.expected.len()),
        );
    }

    if let Some(replay) = &outcome.replay {
        if replay.accepted_count != 0 {
            violate(
                InvariantCheck::ReplayIsIdempotent,
                format!("replay accepted {}", replay.accepted_count),
            );
        }
    }

    let Some(result) = &outcome.final_result else {
        return;
    };
    if result.state != SessionState::Closed {
        violate(
            InvariantCheck::ClosedAfterEnd,
            format!("state {:?}", result.state),
        );
    }
    if !result
        .timeline
        .windows(2)
        .all(|w| w[0].sequence_number < w[1].sequence_number)
    {
        violate(InvariantCheck::TimelineOrdered, "timeline out of order".to_string());
    }

    let expected_avg = (!outcome.expected.is_empty())
        .then(|| outcome.expected.values().sum::<f64>() / outcome.expected.len() as f64);
    let matches = match (expected_avg, result.average_score) {
        (None, None) => true,
        (Some(a), Some(b)) => (a - b).abs() < 1e-9,
        _ => false,
    };
    if !matches {
        violate(
            InvariantCheck::AverageMatches,
            format!("expected {:?}, got {:?}", expected_avg, result.average_score),
        );
    }
}

fn build_service(config: &SimulatorConfig) -> anyhow::Result<Arc<WatchService>> {
    let catalog = InMemoryCatalog::new();
    let duration = config.batches_per_session as f64 * config.batch_size as f64 * SAMPLE_INTERVAL_SECS;
    for i in 0..16 {
        catalog.insert(
            PLAYLIST,
            VideoInfo::new(VideoId::new(format!("video-{i}")), duration)
                .with_sampling_interval(SAMPLE_INTERVAL_SECS),
        );
    }

    // every delivery of a session may be in flight at once
    let engine = EngageConfig::new()
        .with_max_pending_batches(config.batches_per_session.saturating_mul(2).max(1))
        .with_max_batch_size(config.batch_size.max(1))
        .with_max_live_sessions(config.sessions.max(1));
    let service = WatchService::new(engine, Arc::new(catalog), Arc::new(MemorySampleLog::new()))?;
    Ok(Arc::new(service))
}

/// Run the simulator
///
/// # Errors
/// Fails only if the engine cannot be constructed or a session task panics.
pub async fn run_simulator(config: SimulatorConfig) -> anyhow::Result<SimulatorReport> {
    let started = Instant::now();
    let service = build_service(&config)?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut tasks = Vec::with_capacity(config.sessions);
    for index in 0..config.sessions {
        let plan = plan_session(index, &config, &mut rng);
        tasks.push(tokio::spawn(drive_session(service.clone(), index, plan)));
    }

    let mut stats = SimulationStats {
        sessions: config.sessions,
        ..SimulationStats::default()
    };
    let mut violations = Vec::new();
    for task in tasks {
        let outcome = task.await?;
        for (_, result) in &outcome.results {
            stats.record(result);
        }
        stats.errors += outcome.errors;
        if !(config.stop_on_first_violation && !violations.is_empty()) {
            check_session(&outcome, &mut violations);
        }
    }

    tracing::info!(
        "Simulation finished: {} sessions, {} violations",
        stats.sessions,
        violations.len()
    );
    Ok(SimulatorReport {
        config,
        stats,
        violations,
        elapsed: started.elapsed(),
    })
}

/// Stress run summary
#[derive(Debug, Clone)]
pub struct StressReport {
    pub sessions: usize,
    pub samples: usize,
    pub accepted: usize,
    pub elapsed: Duration,
    pub success: bool,
}

/// Ingest `samples` samples into each of `sessions` sessions as fast as possible
///
/// Each sample is sent twice from independent tasks; success requires every
/// sequence to be accepted exactly once.
///
/// # Errors
/// Fails if the engine cannot be constructed or a task panics.
pub async fn run_stress(sessions: usize, samples: usize) -> anyhow::Result<StressReport> {
    const BATCH: usize = 50;
    let batches = samples.div_ceil(BATCH);
    let config = SimulatorConfig {
        sessions,
        batches_per_session: batches.max(1),
        batch_size: BATCH,
        ..SimulatorConfig::default()
    };
    let service = build_service(&config)?;
    let started = Instant::now();

    let mut tasks = Vec::with_capacity(sessions);
    for index in 0..sessions {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            let grant = service
                .issue_ticket(TicketRequest {
                    user_id: UserId(index as u64),
                    video_id: VideoId::new(format!("video-{}", index % 16)),
                    playlist_id: PLAYLIST,
                })
                .await?;
            let session_id = grant.session.session_id;

            let all: Vec<RawSample> = (0..samples)
                .map(|seq| RawSample {
                    sequence_number: seq as i64,
                    playback_position_seconds: seq as f64,
                    score: 0.5,
                    client_timestamp: chrono::Utc::now(),
                })
                .collect();
            let sends = all.chunks(BATCH).chain(all.chunks(BATCH)).map(|chunk| {
                service.ingest_batch(WatchBatch {
                    session_id,
                    samples: chunk.to_vec(),
                })
            });

            let mut accepted = 0;
            for result in join_all(sends).await {
                accepted += result?.accepted_count;
            }
            anyhow::Ok(accepted)
        }));
    }

    let mut accepted = 0;
    let mut success = true;
    for task in tasks {
        match task.await? {
            Ok(n) => {
                accepted += n;
                success &= n == samples;
            }
            Err(e) => {
                tracing::error!("Stress session failed: {}", e);
                success = false;
            }
        }
    }

    Ok(StressReport {
        sessions,
        samples,
        accepted,
        elapsed: started.elapsed(),
        success,
    })
}
