//! `StreamClient`: top-level handle for one streaming session.
//!
//! ## Lifecycle
//!
//! ```text
//! StreamClient::spawn()
//!     └─► load()          → samples in buffer, cursor = 0, results cleared
//!         └─► connect()   → Connecting → Open
//!             └─► start() → first chunk sent now, then one per period
//!                 └─► stop() / reset() / exhaustion
//! ```
//!
//! ## Threading
//!
//! All session state lives in a single driver task (see [`driver`]). The
//! handle only sends commands and reads the shared status snapshot, the
//! diagnostics counters and the result log. Every method is safe to call
//! from any task; commands are applied in the order they are sent.

pub(crate) mod driver;
pub mod scheduler;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    error::{LastError, Result, StreamError},
    ipc::events::{ChunkActivityEvent, SessionStatus, StatusEvent},
    results::{ChunkResult, ResultLogReader},
    transport::{websocket::WebSocketConnector, ConnectionId, ConnectionState, Connector},
};

use driver::Command;
use session::{DiagnosticsSnapshot, Session, SessionChannels, SessionDiagnostics};

/// Default analysis endpoint.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws/ecg/";

/// Broadcast channel capacity: events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Configuration for `StreamClient`.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket URL of the analysis service.
    pub endpoint: String,
    /// Seconds of signal per chunk; also the tick period. Default: 6.0.
    pub chunk_duration_secs: f64,
    /// How long a sent chunk may wait for its result before the slot is
    /// freed. `None` waits forever. Default: `None`.
    pub pending_timeout: Option<Duration>,
    /// Capacity of each broadcast channel.
    pub event_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            chunk_duration_secs: 6.0,
            pending_timeout: None,
            event_capacity: BROADCAST_CAP,
        }
    }
}

impl StreamConfig {
    /// # Errors
    /// `StreamError::InvalidConfig` for an empty endpoint, a chunk duration
    /// outside `(0, MAX_CHUNK_DURATION_SECS]`, or a zero timeout.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(StreamError::InvalidConfig("endpoint must not be empty".into()));
        }
        scheduler::chunk_period(self.chunk_duration_secs)?;
        if self.pending_timeout.is_some_and(|t| t.is_zero()) {
            return Err(StreamError::InvalidConfig(
                "pending timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// The top-level client handle.
///
/// Dropping every handle stops the driver and closes the connection.
pub struct StreamClient {
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<Mutex<SessionStatus>>,
    diagnostics: Arc<SessionDiagnostics>,
    results: ResultLogReader,
    channels: SessionChannels,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl StreamClient {
    /// Spawn the driver on the current tokio runtime.
    ///
    /// # Errors
    /// `StreamError::InvalidConfig` if `config` does not validate.
    pub fn spawn(config: StreamConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = Session::new(config, connector, event_tx)?;

        let status = session.status_handle();
        let diagnostics = session.diagnostics();
        let results = session.results();
        let channels = session.channels();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(driver::run(session, command_rx, event_rx));

        Ok(Self {
            commands,
            status,
            diagnostics,
            results,
            channels,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Spawn with the tokio-tungstenite connector.
    pub fn spawn_websocket(config: StreamConfig) -> Result<Self> {
        Self::spawn(config, Arc::new(WebSocketConnector::new()))
    }

    /// Replace the sample sequence. Stops streaming, drops the in-flight
    /// request and clears results. Returns the new generation.
    pub async fn load(&self, samples: Vec<f64>, sampling_rate: f64) -> Result<u64> {
        self.request(|reply| Command::Load {
            samples,
            sampling_rate,
            reply,
        })
        .await?
    }

    /// Begin connecting. Use [`StreamClient::wait_for_connection`] to wait
    /// for the socket to open.
    pub async fn connect(&self) -> Result<ConnectionId> {
        self.request(|reply| Command::Connect { reply }).await
    }

    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Change the endpoint used by the next `connect()`.
    pub async fn set_endpoint(&self, endpoint: impl Into<String>) -> Result<()> {
        let endpoint = endpoint.into();
        self.request(|reply| Command::SetEndpoint { endpoint, reply })
            .await?
    }

    /// # Errors
    /// `StreamError::AlreadyStreaming` if the stream is already active.
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| Command::Start { reply }).await?
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Takes effect from the next produced chunk.
    pub async fn set_chunk_duration(&self, secs: f64) -> Result<()> {
        self.request(|reply| Command::SetChunkDuration { secs, reply })
            .await?
    }

    /// Stop the driver and close the connection. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let driver = self.driver.lock().take();
        let Some(driver) = driver else {
            return Ok(());
        };
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        driver
            .await
            .map_err(|e| StreamError::Other(anyhow::anyhow!("stream driver panicked: {e}")))?;
        info!("stream client shut down");
        Ok(())
    }

    /// Resolves once the connection is open.
    ///
    /// # Errors
    /// - `StreamError::TransportFailure` if the attempt failed.
    /// - `StreamError::NotConnected` if the connection is idle or closed.
    pub async fn wait_for_connection(&self) -> Result<()> {
        let mut rx = self.subscribe_status();
        loop {
            match self.connection_state() {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Connecting => {}
                ConnectionState::Failed => {
                    let reason = self
                        .last_error()
                        .map(|e| e.message)
                        .unwrap_or_else(|| "connection failed".into());
                    return Err(StreamError::TransportFailure(reason));
                }
                ConnectionState::Idle | ConnectionState::Closed => {
                    return Err(StreamError::NotConnected)
                }
            }
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(StreamError::ClientClosed),
            }
        }
    }

    /// Resolves once nothing is streaming and nothing is in flight.
    pub async fn wait_until_drained(&self) -> Result<SessionStatus> {
        let mut rx = self.subscribe_status();
        loop {
            let status = self.status();
            if status.is_drained() {
                return Ok(status);
            }
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(StreamError::ClientClosed),
            }
        }
    }

    /// Current session status (snapshot).
    pub fn status(&self) -> SessionStatus {
        self.status.lock().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.lock().connection
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.status.lock().last_error.clone()
    }

    /// Read-only view of the append-only result log.
    pub fn results(&self) -> ResultLogReader {
        self.results.clone()
    }

    /// Subscribe to results as they are appended.
    pub fn subscribe_results(&self) -> broadcast::Receiver<Arc<ChunkResult>> {
        self.channels.results_tx.subscribe()
    }

    /// Subscribe to status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.channels.status_tx.subscribe()
    }

    /// Subscribe to per-chunk dispatch outcomes.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<ChunkActivityEvent> {
        self.channels.activity_tx.subscribe()
    }

    /// Snapshot of session counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| StreamError::ClientClosed)?;
        rx.await.map_err(|_| StreamError::ClientClosed)
    }
}
