//! Transport request and response bodies
//!
//! Plain serde types so an HTTP or RPC adapter can map its routes onto
//! [`WatchService`](crate::service::WatchService) without extra glue.

use crate::types::{PlaylistId, RawSample, SessionId, Ticket, UserId, VideoId, WatchSession};
use serde::{Deserialize, Serialize};

/// `POST ticket`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRequest {
    pub user_id: UserId,
    pub video_id: VideoId,
    pub playlist_id: PlaylistId,
}

/// Ticket together with the session it opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketGrant {
    pub ticket: Ticket,
    pub session: WatchSession,
}

/// `POST watch-batch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchBatch {
    pub session_id: SessionId,
    pub samples: Vec<RawSample>,
}

/// `POST watch-end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEnd {
    pub session_id: SessionId,
}

/// `GET watch-results`
///
/// Exactly one selector field; a body naming several is refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged, deny_unknown_fields)]
pub enum ResultsQuery {
    /// One session
    Session { session_id: SessionId },
    /// Every session of a user
    User { user_id: UserId },
    /// Every session on a video
    Video { video_id: VideoId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TicketId;

    #[test]
    fn batch_decodes_from_client_json() {
        let id = TicketId::from_bytes([1; 16]);
        let json = format!(
            r#"{{"session_id":"{id}","samples":[
                {{"sequence_number":1,"playback_position_seconds":0.0,"score":0.8,"client_timestamp":"2024-01-01T00:00:00Z"}},
                {{"sequence_number":-3,"playback_position_seconds":10.0,"score":0.9,"client_timestamp":"2024-01-01T00:00:10Z"}}
            ]}}"#
        );
        let batch: WatchBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(batch.session_id, id);
        assert_eq!(batch.samples.len(), 2);
        assert_eq!(batch.samples[1].sequence_number, -3);
    }

    #[test]
    fn results_query_picks_variant_by_field() {
        let q: ResultsQuery = serde_json::from_str(r#"{"user_id":42}"#).unwrap();
        assert_eq!(q, ResultsQuery::User { user_id: UserId(42) });

        let id = TicketId::from_bytes([2; 16]);
        let q: ResultsQuery =
            serde_json::from_str(&format!(r#"{{"session_id":"{id}"}}"#)).unwrap();
        assert_eq!(q, ResultsQuery::Session { session_id: id });

        let q: ResultsQuery = serde_json::from_str(r#"{"video_id":"v1"}"#).unwrap();
        assert_eq!(
            q,
            ResultsQuery::Video {
                video_id: VideoId::new("v1")
            }
        );
    }

    #[test]
    fn results_query_with_two_selectors_is_refused() {
        let id = TicketId::from_bytes([3; 16]);
        let body = format!(r#"{{"session_id":"{id}","user_id":42}}"#);
        assert!(serde_json::from_str::<ResultsQuery>(&body).is_err());
        assert!(serde_json::from_str::<ResultsQuery>(r#"{"user_id":42,"video_id":"v1"}"#).is_err());
    }

    #[test]
    fn watch_end_decodes() {
        let id = TicketId::from_bytes([4; 16]);
        let end: WatchEnd = serde_json::from_str(&format!(r#"{{"session_id":"{id}"}}"#)).unwrap();
        assert_eq!(end, WatchEnd { session_id: id });
    }

    #[test]
    fn malformed_session_id_is_refused() {
        let err = serde_json::from_str::<WatchEnd>(r#"{"session_id":"xyz"}"#);
        assert!(err.is_err());
    }
}
