//! Inbound result handling and the ordered result log.
//!
//! ## Accept-or-discard
//!
//! ```text
//! raw frame ─► parse ─┬─ success ─► correlate ─┬─ current / released ─► append + free slot
//!                     │                        └─ stale ─────────────► drop silently
//!                     ├─ error ───► release slot, record last error
//!                     └─ garbage ─► log + drop
//! ```
//!
//! The log is append-only while a sample sequence is loaded; it is cleared
//! only when the session is reset or a new sequence is loaded. Readers hold
//! a [`ResultLogReader`] and never mutate it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::correlation::{PendingRequest, RequestCorrelator, RequestId, Resolution};
use crate::error::{LastError, StreamError};
use crate::protocol::{is_busy_message, parse_service_message, AnalysisPayload, ServiceMessage};

/// Analysis output for one chunk, immutable once built.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    pub chunk_name: String,
    pub request_id: RequestId,
    pub sequence_index: u64,
    pub start_sample: usize,
    pub sample_count: usize,
    pub sampling_rate: f64,
    pub normalized_signal: Vec<f64>,
    pub prediction_mask: Vec<u8>,
    /// Per-beat feature records, in the order the service sent them.
    pub features: Vec<Map<String, Value>>,
    pub decision: String,
    pub signal_features: Map<String, Value>,
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Beat-class totals reported in `signal_features`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeatCounts {
    pub normal: u64,
    pub ventricular: u64,
    pub left_bundle: u64,
    pub right_bundle: u64,
    pub paced: u64,
    pub other: u64,
}

impl BeatCounts {
    pub fn total(&self) -> u64 {
        self.normal + self.ventricular + self.left_bundle + self.right_bundle + self.paced + self.other
    }
}

impl ChunkResult {
    pub fn from_payload(
        pending: &PendingRequest,
        payload: AnalysisPayload,
        received_at: DateTime<Utc>,
    ) -> Self {
        let decision = payload.decision_text();
        Self {
            chunk_name: pending.chunk_name.clone(),
            request_id: pending.request_id.clone(),
            sequence_index: pending.sequence_index,
            start_sample: pending.start_sample,
            sample_count: pending.sample_count,
            sampling_rate: pending.sampling_rate,
            normalized_signal: payload.normalized_signal,
            prediction_mask: payload.full_prediction,
            features: payload
                .features
                .map(|f| f.into_list())
                .unwrap_or_default(),
            decision,
            signal_features: payload.signal_features.unwrap_or_default(),
            sent_at: pending.sent_at,
            received_at,
        }
    }

    pub fn is_abnormal(&self) -> bool {
        self.decision.to_ascii_lowercase().contains("abnormal")
    }

    pub fn beat_counts(&self) -> BeatCounts {
        let count = |key: &str| {
            self.signal_features
                .get(key)
                .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)))
                .unwrap_or(0)
        };
        BeatCounts {
            normal: count("count_n"),
            ventricular: count("count_v"),
            left_bundle: count("count_l"),
            right_bundle: count("count_r"),
            paced: count("count_/"),
            other: count("count_else"),
        }
    }

    /// Start and end of the analysed window within the sequence, in seconds.
    pub fn time_range_secs(&self) -> (f64, f64) {
        if self.sampling_rate <= 0.0 {
            return (0.0, 0.0);
        }
        let start = self.start_sample as f64 / self.sampling_rate;
        (start, start + self.sample_count as f64 / self.sampling_rate)
    }

    pub fn round_trip_ms(&self) -> i64 {
        (self.received_at - self.sent_at).num_milliseconds()
    }
}

#[derive(Debug, Default)]
struct LogInner {
    entries: Vec<Arc<ChunkResult>>,
    request_ids: HashSet<RequestId>,
    epoch: u64,
}

/// Append-only, arrival-ordered sequence of results.
#[derive(Debug, Default)]
pub struct ResultLog {
    inner: Arc<RwLock<LogInner>>,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result. Returns `None` if its request id was already logged.
    pub fn append(&self, result: ChunkResult) -> Option<Arc<ChunkResult>> {
        let mut inner = self.inner.write();
        if !inner.request_ids.insert(result.request_id.clone()) {
            return None;
        }
        let entry = Arc::new(result);
        inner.entries.push(Arc::clone(&entry));
        Some(entry)
    }

    /// Drop every entry and start a new epoch.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.request_ids.clear();
        inner.epoch += 1;
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reader(&self) -> ResultLogReader {
        ResultLogReader {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Read-only view of a [`ResultLog`], cheap to clone and share.
#[derive(Debug, Clone)]
pub struct ResultLogReader {
    inner: Arc<RwLock<LogInner>>,
}

impl ResultLogReader {
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Arc<ChunkResult>> {
        self.inner.read().entries.get(index).cloned()
    }

    pub fn latest(&self) -> Option<Arc<ChunkResult>> {
        self.inner.read().entries.last().cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ChunkResult>> {
        self.inner.read().entries.clone()
    }

    /// Entries appended at or after `index`, for incremental consumers.
    pub fn since(&self, index: usize) -> Vec<Arc<ChunkResult>> {
        let inner = self.inner.read();
        inner.entries.get(index..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Incremented each time the log is cleared.
    pub fn epoch(&self) -> u64 {
        self.inner.read().epoch
    }
}

/// What one inbound frame did.
#[derive(Debug)]
pub enum MessageOutcome {
    Appended(Arc<ChunkResult>),
    /// Result for a request that is no longer pending; dropped.
    Stale { request_id: String },
    /// Service reported an error; the flight slot was released.
    ServiceError(StreamError),
    Malformed(StreamError),
}

/// Resolves inbound frames against the correlator and owns the result log.
#[derive(Debug, Default)]
pub struct ResultAccumulator {
    log: ResultLog,
    last_error: Option<LastError>,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(
        &mut self,
        raw: &str,
        correlator: &mut RequestCorrelator,
        generation: u64,
    ) -> MessageOutcome {
        let message = match parse_service_message(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, bytes = raw.len(), "discarding malformed message");
                return MessageOutcome::Malformed(e);
            }
        };

        match message {
            ServiceMessage::Success {
                request_id,
                chunk_name,
                result,
            } => {
                let pending = match correlator.resolve(&request_id) {
                    Resolution::Current(p) | Resolution::Released(p) => p,
                    Resolution::Stale => {
                        debug!(%request_id, %chunk_name, "discarding stale result");
                        return MessageOutcome::Stale { request_id };
                    }
                };
                if pending.generation != generation {
                    debug!(%request_id, "discarding result from a replaced sample sequence");
                    return MessageOutcome::Stale { request_id };
                }
                if chunk_name != pending.chunk_name {
                    warn!(
                        %request_id,
                        sent = %pending.chunk_name,
                        received = %chunk_name,
                        "service echoed a different chunk name"
                    );
                }

                let result = ChunkResult::from_payload(&pending, result, Utc::now());
                match self.log.append(result) {
                    Some(entry) => {
                        info!(
                            %request_id,
                            chunk_name = %entry.chunk_name,
                            decision = %entry.decision,
                            round_trip_ms = entry.round_trip_ms(),
                            "result appended"
                        );
                        MessageOutcome::Appended(entry)
                    }
                    None => MessageOutcome::Stale { request_id },
                }
            }
            ServiceMessage::Error { message } => {
                let released = correlator.release();
                let err = if is_busy_message(&message) {
                    StreamError::ServiceBusy(message)
                } else {
                    StreamError::ServiceError(message)
                };
                warn!(
                    error = %err,
                    released = ?released.as_ref().map(|p| p.request_id.as_str()),
                    "service reported an error"
                );
                self.record_error(&err);
                MessageOutcome::ServiceError(err)
            }
        }
    }

    pub fn record_error(&mut self, err: &StreamError) {
        self.last_error = Some(LastError::from_error(err));
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    /// Clear the log and the last error.
    pub fn reset(&mut self) {
        self.log.clear();
        self.last_error = None;
    }

    pub fn log(&self) -> &ResultLog {
        &self.log
    }

    pub fn reader(&self) -> ResultLogReader {
        self.log.reader()
    }
}
