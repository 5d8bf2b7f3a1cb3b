//! Engage Core - ticketed watch sessions and engagement telemetry
//!
//! The engine that:
//! - Issues time-bounded watch tickets, one active per (user, video)
//! - Tracks one watch session per ticket with lazy expiry
//! - Ingests client batches idempotently, tolerating reordering and gaps
//! - Derives per-session results (average score, coverage, completion)
//!
//! # Example
//!
//! ```rust,ignore
//! use engage_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = Arc::new(InMemoryCatalog::new());
//! catalog.insert(PlaylistId(7), VideoInfo::new(VideoId::new("v1"), 300.0));
//!
//! let service = WatchService::new(EngageConfig::new(), catalog, Arc::new(MemorySampleLog::new()))?;
//! let grant = service
//!     .issue_ticket(TicketRequest {
//!         user_id: UserId(42),
//!         video_id: VideoId::new("v1"),
//!         playlist_id: PlaylistId(7),
//!     })
//!     .await?;
//!
//! let result = service.session_result(&grant.session.session_id).await?;
//! println!("coverage {:.2}", result.coverage);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod aggregate;
pub mod api;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingest;
pub mod service;
pub mod session;
pub mod store;
pub mod ticket;
pub mod types;

// Re-exports for convenience
pub use aggregate::{summarize, ResultAggregator};
pub use api::{ResultsQuery, TicketGrant, TicketRequest, WatchBatch, WatchEnd};
pub use catalog::{Catalog, InMemoryCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngageConfig;
pub use error::{CatalogError, ConfigError, StoreError, WatchError};
pub use ingest::BatchIngestor;
pub use service::WatchService;
pub use session::{RegistryStats, SessionHandle, SessionRegistry};
pub use store::{FileSampleLog, MemorySampleLog, SampleLog};
pub use ticket::TicketAuthority;
pub use types::{
    EngagementSample, IngestResult, PlaylistId, RawSample, RejectReason, SampleRejection,
    ScoreBounds, SessionId, SessionResult, SessionState, SessionVersion, Ticket, TicketId,
    TicketStatus, UserId, VideoId, VideoInfo, VideoResults, WatchProgress, WatchSession,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Engage Core
    pub use crate::{
        Catalog, EngageConfig, InMemoryCatalog, IngestResult, MemorySampleLog, PlaylistId,
        RawSample, SampleLog, SessionId, SessionResult, SessionState, TicketRequest, UserId,
        VideoId, VideoInfo, WatchBatch, WatchError, WatchService,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
