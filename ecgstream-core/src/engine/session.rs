//! The session context: every piece of mutable streaming state, in one place.
//!
//! ## Data flow
//!
//! ```text
//! SampleBuffer ─► ChunkScheduler (tick) ─► RequestCorrelator (name)
//!                                               │
//!                                      dispatch() flight gate
//!                                               │
//!                                    ConnectionManager::send ⇝ service
//!                                                              │
//! ResultLog ◄─ ResultAccumulator ◄─ ConnectionManager (message) ◄┘
//! ```
//!
//! `Session` is synchronous and owns no tasks. The driver feeds it commands,
//! connection events and timer deadlines from a single task, so every
//! mutation is serialised without locks. The only shared pieces are the
//! published status snapshot, the diagnostics counters and the result log
//! reader, all of which are read-only to everyone else.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn};

use crate::{
    buffering::{Chunk, SampleBuffer},
    correlation::{PendingRequest, RequestCorrelator, RequestId},
    engine::{
        scheduler::{self, ChunkScheduler, TickHandle},
        StreamConfig,
    },
    error::{LastError, Result, StreamError},
    ipc::events::{ChunkActivityEvent, ChunkOutcome, SessionStatus, StatusEvent},
    protocol::ChunkRequest,
    results::{ChunkResult, MessageOutcome, ResultAccumulator, ResultLogReader},
    transport::{
        ConnectionEvent, ConnectionEventSender, ConnectionId, ConnectionManager, ConnectionState,
        ConnectionUpdate, Connector,
    },
};

pub struct SessionDiagnostics {
    pub chunks_produced: AtomicUsize,
    pub chunks_sent: AtomicUsize,
    pub chunks_dropped_busy: AtomicUsize,
    pub chunks_dropped_not_connected: AtomicUsize,
    pub results_appended: AtomicUsize,
    pub stale_discarded: AtomicUsize,
    pub malformed_messages: AtomicUsize,
    pub service_errors: AtomicUsize,
    pub timeouts: AtomicUsize,
}

impl Default for SessionDiagnostics {
    fn default() -> Self {
        Self {
            chunks_produced: AtomicUsize::new(0),
            chunks_sent: AtomicUsize::new(0),
            chunks_dropped_busy: AtomicUsize::new(0),
            chunks_dropped_not_connected: AtomicUsize::new(0),
            results_appended: AtomicUsize::new(0),
            stale_discarded: AtomicUsize::new(0),
            malformed_messages: AtomicUsize::new(0),
            service_errors: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
        }
    }
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.chunks_produced.store(0, Ordering::Relaxed);
        self.chunks_sent.store(0, Ordering::Relaxed);
        self.chunks_dropped_busy.store(0, Ordering::Relaxed);
        self.chunks_dropped_not_connected.store(0, Ordering::Relaxed);
        self.results_appended.store(0, Ordering::Relaxed);
        self.stale_discarded.store(0, Ordering::Relaxed);
        self.malformed_messages.store(0, Ordering::Relaxed);
        self.service_errors.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_produced: self.chunks_produced.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_dropped_busy: self.chunks_dropped_busy.load(Ordering::Relaxed),
            chunks_dropped_not_connected: self.chunks_dropped_not_connected.load(Ordering::Relaxed),
            results_appended: self.results_appended.load(Ordering::Relaxed),
            stale_discarded: self.stale_discarded.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            service_errors: self.service_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub chunks_produced: usize,
    pub chunks_sent: usize,
    pub chunks_dropped_busy: usize,
    pub chunks_dropped_not_connected: usize,
    pub results_appended: usize,
    pub stale_discarded: usize,
    pub malformed_messages: usize,
    pub service_errors: usize,
    pub timeouts: usize,
}

/// Broadcast senders for presentation subscribers.
#[derive(Debug, Clone)]
pub struct SessionChannels {
    pub results_tx: broadcast::Sender<Arc<ChunkResult>>,
    pub status_tx: broadcast::Sender<StatusEvent>,
    pub activity_tx: broadcast::Sender<ChunkActivityEvent>,
}

impl SessionChannels {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (results_tx, _) = broadcast::channel(capacity);
        let (status_tx, _) = broadcast::channel(capacity);
        let (activity_tx, _) = broadcast::channel(capacity);
        Self {
            results_tx,
            status_tx,
            activity_tx,
        }
    }
}

pub struct Session {
    config: StreamConfig,
    buffer: SampleBuffer,
    scheduler: ChunkScheduler,
    correlator: RequestCorrelator,
    connection: ConnectionManager,
    accumulator: ResultAccumulator,
    channels: SessionChannels,
    status: Arc<Mutex<SessionStatus>>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl Session {
    /// Build a session. `events` receives every connection event produced by
    /// `connector`; the owner must feed them back through
    /// [`Session::handle_connection_event`].
    ///
    /// # Errors
    /// `StreamError::InvalidConfig` if `config` does not validate.
    pub fn new(
        config: StreamConfig,
        connector: Arc<dyn Connector>,
        events: ConnectionEventSender,
    ) -> Result<Self> {
        config.validate()?;
        let scheduler = ChunkScheduler::new(config.chunk_duration_secs)?;
        let connection = ConnectionManager::new(config.endpoint.clone(), connector, events);
        let channels = SessionChannels::new(config.event_capacity);
        let session = Self {
            config,
            buffer: SampleBuffer::new(),
            scheduler,
            correlator: RequestCorrelator::new(),
            connection,
            accumulator: ResultAccumulator::new(),
            channels,
            status: Arc::new(Mutex::new(SessionStatus::default())),
            diagnostics: Arc::new(SessionDiagnostics::default()),
        };
        *session.status.lock() = session.build_status();
        Ok(session)
    }

    // ── Sample sequence ─────────────────────────────────────────────────────

    /// Replace the sample sequence and clear everything derived from the
    /// previous one: cursor, flight slot, chunk naming and result log.
    ///
    /// # Errors
    /// `StreamError::InvalidConfig` for a non-positive or non-finite rate;
    /// nothing is changed in that case.
    pub fn load(&mut self, samples: Vec<f64>, sampling_rate: f64) -> Result<u64> {
        if !(sampling_rate.is_finite() && sampling_rate > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "sampling rate must be positive, got {sampling_rate}"
            )));
        }
        self.scheduler.reset();
        if let Some(p) = self.correlator.discard() {
            debug!(request_id = %p.request_id, "discarding in-flight request on load");
        }
        self.correlator.reset_for_new_sequence();
        self.accumulator.reset();
        self.diagnostics.reset();
        let total = samples.len();
        let generation = self.buffer.load(samples, sampling_rate);
        info!(
            samples = total,
            sampling_rate,
            generation,
            duration_secs = self.buffer.duration_secs(),
            "sample sequence loaded"
        );
        self.publish_status(Some(format!("loaded {total} samples")));
        Ok(generation)
    }

    // ── Connection ──────────────────────────────────────────────────────────

    pub fn connect(&mut self) -> ConnectionId {
        self.abandon_pending("reconnecting");
        let id = self.connection.connect();
        self.publish_status(None);
        id
    }

    pub fn close(&mut self) {
        self.connection.close();
        self.abandon_pending("connection closed by client");
        self.publish_status(None);
    }

    pub fn set_endpoint(&mut self, endpoint: impl Into<String>) -> Result<()> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(StreamError::InvalidConfig("endpoint must not be empty".into()));
        }
        self.config.endpoint = endpoint.clone();
        self.connection.set_endpoint(endpoint);
        self.publish_status(None);
        Ok(())
    }

    pub fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match self.connection.handle_event(event) {
            ConnectionUpdate::Ignored => {}
            ConnectionUpdate::Opened => {
                self.publish_status(Some("connected".into()));
            }
            ConnectionUpdate::Message(text) => {
                self.on_message(&text);
            }
            ConnectionUpdate::Closed(reason) => {
                self.abandon_pending("connection closed");
                self.publish_status(Some(reason.unwrap_or_else(|| "connection closed".into())));
            }
            ConnectionUpdate::Failed(reason) => {
                let err = StreamError::TransportFailure(reason);
                self.accumulator.record_error(&err);
                self.abandon_pending("connection failed");
                self.publish_status(Some(err.to_string()));
            }
        }
    }

    // ── Scheduling ──────────────────────────────────────────────────────────

    /// Begin streaming: the first chunk is produced and offered immediately.
    ///
    /// Returns the activity for that first chunk, or `None` if the buffer was
    /// already exhausted (the scheduler stops again in that case).
    ///
    /// # Errors
    /// - `StreamError::AlreadyStreaming` if already active.
    /// - `StreamError::InvalidConfig` if a chunk would hold no samples at the
    ///   loaded sampling rate.
    pub fn start(&mut self, now: Instant) -> Result<Option<ChunkActivityEvent>> {
        self.ensure_window_holds_samples(self.scheduler.chunk_duration_secs())?;
        self.scheduler.start(now)?;
        info!(cursor = self.scheduler.cursor(), "streaming started");
        let activity = self.produce_and_dispatch(now);
        self.publish_status(None);
        Ok(activity)
    }

    /// Stop producing chunks. An in-flight request is left to complete.
    pub fn stop(&mut self) {
        if self.scheduler.is_active() {
            info!(cursor = self.scheduler.cursor(), "streaming stopped");
        }
        self.scheduler.stop();
        self.publish_status(None);
    }

    /// Rewind to the start, discard the in-flight request and clear results.
    pub fn reset(&mut self) {
        self.scheduler.reset();
        if let Some(p) = self.correlator.discard() {
            info!(request_id = %p.request_id, "in-flight request marked stale by reset");
        }
        self.accumulator.reset();
        info!("session reset");
        self.publish_status(Some("reset".into()));
    }

    /// # Errors
    /// `StreamError::InvalidConfig` for a duration the scheduler rejects, or
    /// one shorter than a sample period of the loaded sequence.
    pub fn set_chunk_duration(&mut self, secs: f64) -> Result<()> {
        scheduler::chunk_period(secs)?;
        self.ensure_window_holds_samples(secs)?;
        self.scheduler.set_chunk_duration(secs)?;
        self.config.chunk_duration_secs = secs;
        self.publish_status(None);
        Ok(())
    }

    /// An empty window would look exactly like an exhausted sequence.
    fn ensure_window_holds_samples(&self, secs: f64) -> Result<()> {
        if self.buffer.is_empty() || self.buffer.window_length(secs) > 0 {
            return Ok(());
        }
        Err(StreamError::InvalidConfig(format!(
            "chunk duration of {secs} s is shorter than one sample at {} Hz",
            self.buffer.sampling_rate()
        )))
    }

    /// Earliest instant at which [`Session::on_timer`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let tick = self.scheduler.next_deadline();
        let timeout = self
            .config
            .pending_timeout
            .and_then(|t| self.correlator.deadline(t));
        match (tick, timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire whatever is due at `now`: the scheduler tick and the pending
    /// request timeout.
    pub fn on_timer(&mut self, now: Instant) {
        self.check_timeout(now);
        if let Some(handle) = self.scheduler.poll_tick(now) {
            self.on_tick(handle, now);
        }
    }

    /// Run one scheduler tick. Ticks from a cancelled arming are ignored.
    pub fn on_tick(&mut self, handle: TickHandle, now: Instant) -> Option<ChunkActivityEvent> {
        if !self.scheduler.is_current(handle) {
            debug!(epoch = handle.epoch(), "ignoring tick from cancelled timer");
            return None;
        }
        let activity = self.produce_and_dispatch(now);
        self.publish_status(None);
        activity
    }

    fn produce_and_dispatch(&mut self, now: Instant) -> Option<ChunkActivityEvent> {
        let Some(chunk) = self.produce() else {
            info!(
                cursor = self.scheduler.cursor(),
                total = self.buffer.len(),
                "sample sequence exhausted"
            );
            self.publish_status(Some("stream complete".into()));
            return None;
        };
        let (request_id, outcome) = match self.dispatch(&chunk, now) {
            Ok(id) => (Some(id.to_string()), ChunkOutcome::Sent),
            Err(StreamError::Busy) => (None, ChunkOutcome::DroppedBusy),
            Err(_) => (None, ChunkOutcome::DroppedNotConnected),
        };
        let activity = ChunkActivityEvent {
            sequence_index: chunk.sequence_index,
            chunk_name: chunk.chunk_name,
            samples: chunk.samples.len(),
            request_id,
            outcome,
        };
        let _ = self.channels.activity_tx.send(activity.clone());
        Some(activity)
    }

    fn produce(&mut self) -> Option<Chunk> {
        let window = self.scheduler.next_window(&self.buffer)?;
        self.diagnostics
            .chunks_produced
            .fetch_add(1, Ordering::Relaxed);
        Some(Chunk {
            sequence_index: window.sequence_index,
            chunk_name: self.correlator.name_chunk(),
            samples: window.samples,
            start_sample: window.start_sample,
            sampling_rate: self.buffer.sampling_rate(),
            generation: self.buffer.generation(),
            created_at: Utc::now(),
        })
    }

    // ── Dispatch (single-flight gate) ───────────────────────────────────────

    /// Offer a chunk to the flight gate.
    ///
    /// # Errors
    /// - `StreamError::Busy` if a chunk is already in flight; nothing about
    ///   the pending request or the connection is touched.
    /// - `StreamError::NotConnected` / `StreamError::TransportFailure` if the
    ///   connection cannot take the frame; the slot stays free.
    pub fn dispatch(&mut self, chunk: &Chunk, now: Instant) -> Result<RequestId> {
        let span = info_span!(
            "chunk",
            chunk_name = %chunk.chunk_name,
            sequence_index = chunk.sequence_index,
        );
        let _enter = span.enter();

        if self.correlator.is_pending() {
            self.diagnostics
                .chunks_dropped_busy
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                pending = ?self.correlator.pending().map(|p| p.chunk_name.as_str()),
                "chunk in flight, dropping"
            );
            return Err(StreamError::Busy);
        }

        let request_id = self.correlator.allocate_request_id();
        let payload = ChunkRequest {
            request_id: request_id.as_str(),
            chunk_name: &chunk.chunk_name,
            signal: &chunk.samples,
        }
        .to_json()?;

        if let Err(e) = self.connection.send(payload) {
            self.diagnostics
                .chunks_dropped_not_connected
                .fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "chunk not sent");
            self.accumulator.record_error(&e);
            return Err(e);
        }

        self.correlator.begin(PendingRequest {
            request_id: request_id.clone(),
            chunk_name: chunk.chunk_name.clone(),
            sequence_index: chunk.sequence_index,
            generation: chunk.generation,
            start_sample: chunk.start_sample,
            sample_count: chunk.samples.len(),
            sampling_rate: chunk.sampling_rate,
            sent_at: Utc::now(),
            sent_instant: now,
        })?;
        self.diagnostics.chunks_sent.fetch_add(1, Ordering::Relaxed);
        debug!(%request_id, samples = chunk.samples.len(), "chunk sent");
        Ok(request_id)
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    /// Resolve one inbound frame. Stale and malformed frames change nothing.
    pub fn on_message(&mut self, raw: &str) -> MessageOutcome {
        let outcome =
            self.accumulator
                .on_message(raw, &mut self.correlator, self.buffer.generation());
        match &outcome {
            MessageOutcome::Appended(entry) => {
                self.diagnostics
                    .results_appended
                    .fetch_add(1, Ordering::Relaxed);
                let _ = self.channels.results_tx.send(Arc::clone(entry));
                self.publish_status(None);
            }
            MessageOutcome::Stale { .. } => {
                self.diagnostics
                    .stale_discarded
                    .fetch_add(1, Ordering::Relaxed);
            }
            MessageOutcome::ServiceError(err) => {
                self.diagnostics
                    .service_errors
                    .fetch_add(1, Ordering::Relaxed);
                if matches!(err, StreamError::ServiceBusy(_)) && self.scheduler.is_active() {
                    info!("service saturated, stopping stream");
                    self.scheduler.stop();
                }
                self.publish_status(Some(err.to_string()));
            }
            MessageOutcome::Malformed(_) => {
                self.diagnostics
                    .malformed_messages
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    fn check_timeout(&mut self, now: Instant) {
        let Some(timeout) = self.config.pending_timeout else {
            return;
        };
        if let Some(expired) = self.correlator.expire(now, timeout) {
            self.diagnostics.timeouts.fetch_add(1, Ordering::Relaxed);
            let err = StreamError::Timeout {
                request_id: expired.request_id.to_string(),
            };
            warn!(chunk_name = %expired.chunk_name, error = %err, "pending request expired");
            self.accumulator.record_error(&err);
            self.publish_status(Some(err.to_string()));
        }
    }

    fn abandon_pending(&mut self, why: &str) {
        if let Some(p) = self.correlator.discard() {
            warn!(request_id = %p.request_id, chunk_name = %p.chunk_name, "{why}: in-flight request abandoned");
        }
    }

    /// Stop streaming and close the connection.
    pub fn shutdown(&mut self) {
        self.scheduler.stop();
        self.connection.close();
        self.abandon_pending("shutting down");
        self.publish_status(Some("shut down".into()));
    }

    // ── Observation ─────────────────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_streaming(&self) -> bool {
        self.scheduler.is_active()
    }

    pub fn is_busy(&self) -> bool {
        self.correlator.is_pending()
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.correlator.pending()
    }

    pub fn cursor(&self) -> usize {
        self.scheduler.cursor()
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.accumulator.last_error()
    }

    pub fn results(&self) -> ResultLogReader {
        self.accumulator.reader()
    }

    pub fn channels(&self) -> SessionChannels {
        self.channels.clone()
    }

    pub fn status_handle(&self) -> Arc<Mutex<SessionStatus>> {
        Arc::clone(&self.status)
    }

    pub fn diagnostics(&self) -> Arc<SessionDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    pub fn status(&self) -> SessionStatus {
        self.status.lock().clone()
    }

    fn build_status(&self) -> SessionStatus {
        SessionStatus {
            connection: self.connection.state(),
            endpoint: self.connection.endpoint().to_string(),
            streaming: self.scheduler.is_active(),
            busy: self.correlator.is_pending(),
            pending_chunk: self.correlator.pending().map(|p| p.chunk_name.clone()),
            cursor: self.scheduler.cursor(),
            total_samples: self.buffer.len(),
            sampling_rate: self.buffer.sampling_rate(),
            chunk_duration_secs: self.scheduler.chunk_duration_secs(),
            generation: self.buffer.generation(),
            results: self.accumulator.log().len(),
            last_error: self.accumulator.last_error().cloned(),
        }
    }

    fn publish_status(&self, detail: Option<String>) {
        let next = self.build_status();
        let changed = {
            let mut current = self.status.lock();
            let changed = current.connection != next.connection
                || current.streaming != next.streaming
                || current.busy != next.busy;
            *current = next.clone();
            changed
        };
        if changed || detail.is_some() {
            let _ = self.channels.status_tx.send(StatusEvent {
                connection: next.connection,
                streaming: next.streaming,
                busy: next.busy,
                detail,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::ErrorKind;
    use crate::transport::testing::{opened, ManualConnector, Wire};
    use crate::transport::ConnectionEventReceiver;
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct Harness {
        session: Session,
        wire: Arc<Mutex<Wire>>,
        _events: ConnectionEventReceiver,
    }

    fn harness(config: StreamConfig) -> Harness {
        let connector = Arc::new(ManualConnector::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = Session::new(config, connector, tx).expect("valid config");
        let wire = Arc::new(Mutex::new(Wire::default()));
        let id = session.connect();
        session.handle_connection_event(opened(id, &wire));
        Harness {
            session,
            wire,
            _events: rx,
        }
    }

    fn config(secs: f64) -> StreamConfig {
        StreamConfig {
            chunk_duration_secs: secs,
            ..StreamConfig::default()
        }
    }

    fn sent(wire: &Arc<Mutex<Wire>>) -> Vec<Value> {
        wire.lock()
            .sent
            .iter()
            .map(|s| serde_json::from_str(s).expect("outbound frame is JSON"))
            .collect()
    }

    fn success(request_id: &str, chunk_name: &str) -> String {
        serde_json::json!({
            "status": "success",
            "request_id": request_id,
            "chunk_name": chunk_name,
            "result": {
                "normalized_signal": [0.1],
                "full_prediction": [1],
                "features": [],
                "signal_type": "Normal",
                "signal_features": {}
            }
        })
        .to_string()
    }

    fn reply_to_last(h: &mut Harness) -> MessageOutcome {
        let last = sent(&h.wire).pop().expect("something was sent");
        let raw = success(
            last["request_id"].as_str().unwrap(),
            last["chunk_name"].as_str().unwrap(),
        );
        h.session.on_message(&raw)
    }

    fn signal(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64).collect()
    }

    #[test]
    fn empty_stream_stops_immediately_with_no_chunks() {
        let mut h = harness(config(5.0));
        h.session.load(Vec::new(), 250.0).unwrap();
        let first = h.session.start(Instant::now()).unwrap();
        assert!(first.is_none());
        assert!(!h.session.is_streaming());
        assert!(sent(&h.wire).is_empty());
        assert!(h.session.next_deadline().is_none());
    }

    #[test]
    fn duration_shorter_than_a_sample_is_rejected_not_reported_as_exhausted() {
        let mut h = harness(config(0.001));
        h.session.load(signal(100), 250.0).unwrap();
        assert!(matches!(
            h.session.start(Instant::now()),
            Err(StreamError::InvalidConfig(_))
        ));
        assert!(!h.session.is_streaming());
        assert_eq!(h.session.diagnostics().snapshot().chunks_produced, 0);
        assert!(sent(&h.wire).is_empty());

        h.session.set_chunk_duration(0.2).unwrap();
        assert!(h.session.set_chunk_duration(0.001).is_err());
        assert_eq!(h.session.status().chunk_duration_secs, 0.2);

        let first = h.session.start(Instant::now()).unwrap().unwrap();
        assert_eq!(first.outcome, ChunkOutcome::Sent);
        assert_eq!(sent(&h.wire)[0]["signal"].as_array().unwrap().len(), 50);
    }

    #[test]
    fn remainder_scenario_sends_three_chunks_when_results_keep_up() {
        let mut h = harness(config(5.0));
        h.session.load(signal(3000), 250.0).unwrap();
        let t0 = Instant::now();
        h.session.start(t0).unwrap();
        reply_to_last(&mut h);
        h.session.on_timer(t0 + Duration::from_secs(5));
        reply_to_last(&mut h);
        h.session.on_timer(t0 + Duration::from_secs(10));
        reply_to_last(&mut h);
        h.session.on_timer(t0 + Duration::from_secs(15));

        let frames = sent(&h.wire);
        let lens: Vec<usize> = frames
            .iter()
            .map(|f| f["signal"].as_array().unwrap().len())
            .collect();
        assert_eq!(lens, vec![1250, 1250, 500]);
        let names: Vec<&str> = frames.iter().map(|f| f["chunk_name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["chunk-1", "chunk-2", "chunk-3"]);
        assert_eq!(frames[2]["signal"][0], 2500.0);
        assert!(!h.session.is_streaming(), "exhaustion stops streaming");

        let results = h.session.results().snapshot();
        let seqs: Vec<u64> = results.iter().map(|r| r.sequence_index).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn backpressure_drops_chunk_without_touching_pending_or_wire() {
        let mut h = harness(config(5.0));
        h.session.load(signal(5000), 250.0).unwrap();
        let t0 = Instant::now();
        let first = h.session.start(t0).unwrap().unwrap();
        assert_eq!(first.outcome, ChunkOutcome::Sent);
        let pending_id = h.session.pending().unwrap().request_id.clone();

        let second = h.session.on_tick_at(t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(second.outcome, ChunkOutcome::DroppedBusy);
        assert_eq!(second.sequence_index, 1);
        assert_eq!(h.session.cursor(), 2500, "cursor advances past the dropped chunk");
        assert_eq!(h.session.pending().unwrap().request_id, pending_id);
        assert_eq!(sent(&h.wire).len(), 1);

        // Result for chunk 0 frees the slot; chunk 1 is not retried.
        assert!(matches!(reply_to_last(&mut h), MessageOutcome::Appended(_)));
        assert!(!h.session.is_busy());
        let third = h.session.on_tick_at(t0 + Duration::from_secs(10)).unwrap();
        assert_eq!(third.outcome, ChunkOutcome::Sent);
        assert_eq!(third.sequence_index, 2);
        assert_eq!(third.chunk_name, "chunk-3");

        let diag = h.session.diagnostics().snapshot();
        assert_eq!(diag.chunks_produced, 3);
        assert_eq!(diag.chunks_sent, 2);
        assert_eq!(diag.chunks_dropped_busy, 1);
    }

    #[test]
    fn direct_dispatch_while_pending_is_busy() {
        let mut h = harness(config(5.0));
        h.session.load(signal(3000), 250.0).unwrap();
        h.session.start(Instant::now()).unwrap();
        let chunk = Chunk {
            sequence_index: 9,
            chunk_name: "manual".into(),
            samples: vec![1.0; 10],
            start_sample: 0,
            sampling_rate: 250.0,
            generation: 1,
            created_at: Utc::now(),
        };
        let before = h.session.pending().unwrap().request_id.clone();
        assert!(matches!(
            h.session.dispatch(&chunk, Instant::now()),
            Err(StreamError::Busy)
        ));
        assert_eq!(h.session.pending().unwrap().request_id, before);
        assert_eq!(sent(&h.wire).len(), 1);
    }

    #[test]
    fn stale_result_after_reset_is_discarded() {
        let mut h = harness(config(5.0));
        h.session.load(signal(3000), 250.0).unwrap();
        h.session.start(Instant::now()).unwrap();
        let frames = sent(&h.wire);
        let r1 = frames[0]["request_id"].as_str().unwrap().to_string();

        h.session.reset();
        assert!(!h.session.is_busy());
        assert!(!h.session.is_streaming());
        assert_eq!(h.session.cursor(), 0);

        let outcome = h.session.on_message(&success(&r1, "chunk-1"));
        assert!(matches!(outcome, MessageOutcome::Stale { .. }));
        assert!(h.session.results().is_empty());
        assert!(!h.session.is_busy(), "stale result does not reopen the slot");
        assert_eq!(h.session.diagnostics().snapshot().stale_discarded, 1);
    }

    #[test]
    fn load_mid_flight_discards_pending_and_results() {
        let mut h = harness(config(5.0));
        h.session.load(signal(3000), 250.0).unwrap();
        let t0 = Instant::now();
        h.session.start(t0).unwrap();
        reply_to_last(&mut h);
        h.session.on_timer(t0 + Duration::from_secs(5));
        let in_flight = sent(&h.wire).pop().unwrap();
        assert_eq!(h.session.results().len(), 1);

        let generation = h.session.load(signal(100), 360.0).unwrap();
        assert_eq!(generation, 2);
        assert!(h.session.results().is_empty());
        assert!(!h.session.is_busy());
        assert!(!h.session.is_streaming());

        let late = success(
            in_flight["request_id"].as_str().unwrap(),
            in_flight["chunk_name"].as_str().unwrap(),
        );
        assert!(matches!(h.session.on_message(&late), MessageOutcome::Stale { .. }));
        assert!(h.session.results().is_empty());

        // Naming restarts for the new sequence.
        let first = h.session.start(t0).unwrap().unwrap();
        assert_eq!(first.chunk_name, "chunk-1");
        assert_eq!(first.sequence_index, 0);
    }

    #[test]
    fn service_busy_frees_slot_and_stops_scheduler() {
        let mut h = harness(config(5.0));
        h.session.load(signal(5000), 250.0).unwrap();
        h.session.start(Instant::now()).unwrap();
        h.session
            .on_message(r#"{"status":"error","message":"Server busy"}"#);
        assert!(!h.session.is_busy());
        assert!(!h.session.is_streaming());
        assert!(h.session.next_deadline().is_none());
        assert_eq!(h.session.last_error().unwrap().kind, ErrorKind::ServiceBusy);
        assert_eq!(h.session.status().last_error.unwrap().kind, ErrorKind::ServiceBusy);
    }

    #[test]
    fn service_error_frees_slot_but_keeps_streaming() {
        let mut h = harness(config(5.0));
        h.session.load(signal(5000), 250.0).unwrap();
        let t0 = Instant::now();
        h.session.start(t0).unwrap();
        h.session
            .on_message(r#"{"status":"error","message":"classification failed"}"#);
        assert!(!h.session.is_busy());
        assert!(h.session.is_streaming());
        assert_eq!(h.session.last_error().unwrap().kind, ErrorKind::ServiceError);
        let next = h.session.on_tick_at(t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(next.outcome, ChunkOutcome::Sent);
    }

    #[test]
    fn not_connected_drop_keeps_slot_free() {
        let connector = Arc::new(ManualConnector::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(config(5.0), connector, tx).unwrap();
        session.load(signal(3000), 250.0).unwrap();
        let first = session.start(Instant::now()).unwrap().unwrap();
        assert_eq!(first.outcome, ChunkOutcome::DroppedNotConnected);
        assert!(!session.is_busy());
        assert_eq!(session.last_error().unwrap().kind, ErrorKind::NotConnected);
        assert_eq!(session.cursor(), 1250);
    }

    #[test]
    fn connection_failure_abandons_pending_request() {
        let mut h = harness(config(5.0));
        h.session.load(signal(3000), 250.0).unwrap();
        h.session.start(Instant::now()).unwrap();
        let conn_id = 1;
        h.session.handle_connection_event(ConnectionEvent::Failed {
            conn_id,
            reason: "reset by peer".into(),
        });
        assert_eq!(h.session.connection_state(), ConnectionState::Failed);
        assert!(!h.session.is_busy());
        assert_eq!(
            h.session.last_error().unwrap().kind,
            ErrorKind::TransportFailure
        );
        let next = h.session.on_tick_at(Instant::now() + Duration::from_secs(5)).unwrap();
        assert_eq!(next.outcome, ChunkOutcome::DroppedNotConnected);
    }

    #[test]
    fn pending_timeout_frees_slot_when_configured() {
        let mut h = harness(StreamConfig {
            chunk_duration_secs: 5.0,
            pending_timeout: Some(Duration::from_secs(3)),
            ..StreamConfig::default()
        });
        h.session.load(signal(5000), 250.0).unwrap();
        let t0 = Instant::now();
        h.session.start(t0).unwrap();
        assert_eq!(h.session.next_deadline(), Some(t0 + Duration::from_secs(3)));

        h.session.on_timer(t0 + Duration::from_secs(3));
        assert!(!h.session.is_busy());
        assert_eq!(h.session.last_error().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(h.session.diagnostics().snapshot().timeouts, 1);

        // The late result for the expired request is still accepted once.
        assert!(matches!(reply_to_last(&mut h), MessageOutcome::Appended(_)));
        assert!(matches!(reply_to_last(&mut h), MessageOutcome::Stale { .. }));
    }

    #[test]
    fn no_timeout_by_default() {
        let mut h = harness(config(5.0));
        h.session.load(signal(5000), 250.0).unwrap();
        let t0 = Instant::now();
        h.session.start(t0).unwrap();
        h.session.stop();
        h.session.on_timer(t0 + Duration::from_secs(3600));
        assert!(h.session.is_busy());
        assert!(h.session.next_deadline().is_none());
    }

    #[test]
    fn tick_from_cancelled_timer_is_ignored() {
        let mut h = harness(config(5.0));
        h.session.load(signal(5000), 250.0).unwrap();
        let t0 = Instant::now();
        h.session.start(t0).unwrap();
        let handle = h
            .session
            .scheduler
            .poll_tick(t0 + Duration::from_secs(5))
            .unwrap();
        h.session.reset();
        assert!(h.session.on_tick(handle, t0 + Duration::from_secs(5)).is_none());
        assert_eq!(sent(&h.wire).len(), 1);
    }

    #[test]
    fn result_log_is_append_only_in_arrival_order() {
        let mut h = harness(config(1.0));
        h.session.load(signal(2500), 250.0).unwrap();
        let t0 = Instant::now();
        h.session.start(t0).unwrap();
        let mut seen = Vec::new();
        for i in 1..=10u64 {
            reply_to_last(&mut h);
            let snapshot = h.session.results().snapshot();
            let ids: Vec<String> = snapshot.iter().map(|r| r.request_id.to_string()).collect();
            assert!(ids.starts_with(&seen), "earlier entries never move");
            seen = ids;
            h.session.on_timer(t0 + Duration::from_secs(i));
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn invalid_sampling_rate_is_rejected_without_side_effects() {
        let mut h = harness(config(5.0));
        h.session.load(signal(10), 250.0).unwrap();
        assert!(matches!(
            h.session.load(signal(10), 0.0),
            Err(StreamError::InvalidConfig(_))
        ));
        assert_eq!(h.session.status().generation, 1);
    }

    impl Session {
        fn on_tick_at(&mut self, now: Instant) -> Option<ChunkActivityEvent> {
            let handle = self.scheduler.poll_tick(now)?;
            self.on_tick(handle, now)
        }
    }
}
