//! JSON-lines rendering of session output.

use ecgstream_core::{BeatCounts, ChunkResult, DiagnosticsSnapshot, SessionStatus, StatusEvent};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutputLine<'a> {
    Result(ResultLine<'a>),
    Status(&'a StatusEvent),
    Summary(Summary),
}

/// Condensed view of a [`ChunkResult`]; the sample arrays are left out.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultLine<'a> {
    pub chunk_name: &'a str,
    pub request_id: &'a str,
    pub sequence_index: u64,
    pub time_range_secs: (f64, f64),
    pub decision: &'a str,
    pub abnormal: bool,
    pub beat_counts: BeatCounts,
    pub beats: usize,
    pub round_trip_ms: i64,
}

impl<'a> ResultLine<'a> {
    pub fn new(result: &'a ChunkResult) -> Self {
        Self {
            chunk_name: &result.chunk_name,
            request_id: result.request_id.as_str(),
            sequence_index: result.sequence_index,
            time_range_secs: result.time_range_secs(),
            decision: &result.decision,
            abnormal: result.is_abnormal(),
            beat_counts: result.beat_counts(),
            beats: result.features.len(),
            round_trip_ms: result.round_trip_ms(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub status: SessionStatus,
    pub diagnostics: DiagnosticsSnapshot,
    pub abnormal_chunks: usize,
}

pub fn render(line: &OutputLine<'_>) -> String {
    serde_json::to_string(line).unwrap_or_else(|e| format!(r#"{{"type":"error","message":"{e}"}}"#))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecgstream_core::ConnectionState;
    use serde_json::Value;

    #[test]
    fn status_line_is_tagged() {
        let event = StatusEvent {
            connection: ConnectionState::Open,
            streaming: true,
            busy: true,
            detail: None,
        };
        let json: Value = serde_json::from_str(&render(&OutputLine::Status(&event))).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["connection"], "open");
        assert_eq!(json["busy"], true);
    }

    #[test]
    fn summary_line_carries_counters() {
        let summary = Summary {
            status: SessionStatus::default(),
            diagnostics: DiagnosticsSnapshot {
                chunks_produced: 3,
                chunks_sent: 2,
                chunks_dropped_busy: 1,
                chunks_dropped_not_connected: 0,
                results_appended: 2,
                stale_discarded: 0,
                malformed_messages: 0,
                service_errors: 0,
                timeouts: 0,
            },
            abnormal_chunks: 1,
        };
        let json: Value = serde_json::from_str(&render(&OutputLine::Summary(summary))).unwrap();
        assert_eq!(json["type"], "summary");
        assert_eq!(json["diagnostics"]["chunksDroppedBusy"], 1);
        assert_eq!(json["status"]["connection"], "idle");
        assert_eq!(json["abnormalChunks"], 1);
    }
}
