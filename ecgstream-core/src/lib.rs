//! # ecgstream-core
//!
//! Chunked ECG waveform streaming client SDK.
//!
//! ## Architecture
//!
//! ```text
//! waveform → SampleBuffer → ChunkScheduler (tick every chunk duration)
//!                                  │
//!                         single-flight dispatch gate
//!                                  │
//!                   ConnectionManager → WebSocket → analysis service
//!                                                        │
//!                  ResultAccumulator ← request correlation ┘
//!                         │
//!               ResultLog + broadcast::Sender<Arc<ChunkResult>>
//! ```
//!
//! At most one chunk is in flight. Chunks produced while the service is
//! still working on the previous one are dropped, not queued.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod protocol;
pub mod results;
pub mod transport;

// Convenience re-exports for downstream crates
pub use engine::{
    scheduler::MAX_CHUNK_DURATION_SECS, session::DiagnosticsSnapshot, StreamClient, StreamConfig,
    DEFAULT_ENDPOINT,
};
pub use error::{ErrorKind, LastError, StreamError};
pub use ipc::events::{ChunkActivityEvent, ChunkOutcome, SessionStatus, StatusEvent};
pub use results::{BeatCounts, ChunkResult, ResultLogReader};
pub use transport::{ConnectionState, Connector, Transport, WebSocketConnector};
