//! Event types published to presentation collaborators.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `ChunkResult` | `StreamClient::subscribe_results` |
//! | `StatusEvent` | `StreamClient::subscribe_status` |
//! | `ChunkActivityEvent` | `StreamClient::subscribe_activity` |

use serde::{Deserialize, Serialize};

use crate::error::LastError;
use crate::transport::ConnectionState;

// ---------------------------------------------------------------------------
// Chunk activity events
// ---------------------------------------------------------------------------

/// Emitted once for every chunk the scheduler produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkActivityEvent {
    pub sequence_index: u64,
    pub chunk_name: String,
    pub samples: usize,
    /// Present only when the chunk was sent.
    pub request_id: Option<String>,
    pub outcome: ChunkOutcome,
}

/// What happened to a produced chunk at the flight gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChunkOutcome {
    /// Handed to the connection; now occupies the flight slot.
    Sent,
    /// Rejected because another chunk was in flight.
    DroppedBusy,
    /// Rejected because the connection was not open or the send failed.
    DroppedNotConnected,
}

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// Emitted whenever the observable session status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub connection: ConnectionState,
    pub streaming: bool,
    pub busy: bool,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Point-in-time view of the session, for polling consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub connection: ConnectionState,
    pub endpoint: String,
    pub streaming: bool,
    /// A chunk is in flight.
    pub busy: bool,
    pub pending_chunk: Option<String>,
    pub cursor: usize,
    pub total_samples: usize,
    pub sampling_rate: f64,
    pub chunk_duration_secs: f64,
    /// Sample-sequence generation; bumped on every load.
    pub generation: u64,
    pub results: usize,
    pub last_error: Option<LastError>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Idle,
            endpoint: String::new(),
            streaming: false,
            busy: false,
            pending_chunk: None,
            cursor: 0,
            total_samples: 0,
            sampling_rate: 0.0,
            chunk_duration_secs: 0.0,
            generation: 0,
            results: 0,
            last_error: None,
        }
    }
}

impl SessionStatus {
    /// Fraction of the loaded sequence already handed to the scheduler.
    pub fn progress(&self) -> f64 {
        if self.total_samples == 0 {
            return 0.0;
        }
        self.cursor as f64 / self.total_samples as f64
    }

    /// Whether the stream has nothing left to send or wait for.
    pub fn is_drained(&self) -> bool {
        !self.streaming && !self.busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_event_serializes_with_camel_case() {
        let event = ChunkActivityEvent {
            sequence_index: 2,
            chunk_name: "chunk-3".into(),
            samples: 500,
            request_id: None,
            outcome: ChunkOutcome::DroppedBusy,
        };
        let json = serde_json::to_value(&event).expect("serialize activity event");
        assert_eq!(json["sequenceIndex"], 2);
        assert_eq!(json["chunkName"], "chunk-3");
        assert_eq!(json["outcome"], "droppedBusy");
        assert!(json["requestId"].is_null());
    }

    #[test]
    fn status_event_uses_lowercase_connection_state() {
        let event = StatusEvent {
            connection: ConnectionState::Open,
            streaming: true,
            busy: false,
            detail: Some("connected".into()),
        };
        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["connection"], "open");
        assert_eq!(json["streaming"], true);

        let round_trip: StatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.connection, ConnectionState::Open);
    }

    #[test]
    fn connection_state_rejects_unknown_casing() {
        assert!(serde_json::from_str::<ConnectionState>(r#""Open""#).is_err());
    }

    #[test]
    fn progress_handles_empty_sequence() {
        let mut status = SessionStatus::default();
        assert_eq!(status.progress(), 0.0);
        status.total_samples = 3000;
        status.cursor = 1500;
        assert!((status.progress() - 0.5).abs() < 1e-12);
        assert!(status.is_drained());
    }
}
