use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by ecgstream-core.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection is not open")]
    NotConnected,

    #[error("a chunk is already in flight; chunk dropped")]
    Busy,

    #[error("analysis service is busy: {0}")]
    ServiceBusy(String),

    #[error("analysis service error: {0}")]
    ServiceError(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("request {request_id} timed out")]
    Timeout { request_id: String },

    #[error("streaming is already active")]
    AlreadyStreaming,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("stream client has shut down")]
    ClientClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;

/// Coarse classification of a [`StreamError`], suitable for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    NotConnected,
    Busy,
    ServiceBusy,
    ServiceError,
    TransportFailure,
    MalformedMessage,
    Timeout,
    AlreadyStreaming,
    InvalidConfig,
    ClientClosed,
    Io,
    Other,
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected => ErrorKind::NotConnected,
            Self::Busy => ErrorKind::Busy,
            Self::ServiceBusy(_) => ErrorKind::ServiceBusy,
            Self::ServiceError(_) => ErrorKind::ServiceError,
            Self::TransportFailure(_) => ErrorKind::TransportFailure,
            Self::MalformedMessage(_) => ErrorKind::MalformedMessage,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::AlreadyStreaming => ErrorKind::AlreadyStreaming,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::ClientClosed => ErrorKind::ClientClosed,
            Self::Io(_) => ErrorKind::Io,
            Self::Other(_) => ErrorKind::Other,
        }
    }
}

/// The most recent error observed by the session, kept for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl LastError {
    pub fn from_error(err: &StreamError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}
