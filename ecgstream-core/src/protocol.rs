//! Wire messages exchanged with the analysis service.
//!
//! One UTF-8 JSON document per WebSocket text frame.
//!
//! ```text
//! client → service   { request_id, chunk_name, signal: [..] }
//! service → client   { status: "success", request_id, chunk_name, result: {..} }
//!                    { status: "error", message }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StreamError};

/// Decision text used when the service names neither `signal_type` nor `decision`.
pub const NO_DIAGNOSIS: &str = "No diagnosis found";

/// Outbound analysis request, one per dispatched chunk.
#[derive(Debug, Serialize)]
pub struct ChunkRequest<'a> {
    pub request_id: &'a str,
    pub chunk_name: &'a str,
    pub signal: &'a [f64],
}

impl ChunkRequest<'_> {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StreamError::Other(e.into()))
    }
}

/// Inbound message from the analysis service.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ServiceMessage {
    Success {
        request_id: String,
        chunk_name: String,
        result: AnalysisPayload,
    },
    Error {
        message: String,
    },
}

/// Per-chunk analysis output.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisPayload {
    pub normalized_signal: Vec<f64>,
    pub full_prediction: Vec<u8>,
    #[serde(default)]
    pub features: Option<FeatureRecords>,
    #[serde(default)]
    pub signal_type: Option<String>,
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub signal_features: Option<Map<String, Value>>,
}

/// `features` arrives either as a list of per-beat records or as one record.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FeatureRecords {
    List(Vec<Map<String, Value>>),
    Single(Map<String, Value>),
}

impl FeatureRecords {
    pub fn into_list(self) -> Vec<Map<String, Value>> {
        match self {
            Self::List(list) => list,
            Self::Single(record) if record.is_empty() => Vec::new(),
            Self::Single(record) => vec![record],
        }
    }
}

impl AnalysisPayload {
    /// The classification text, preferring `signal_type` over `decision`.
    pub fn decision_text(&self) -> String {
        [self.signal_type.as_deref(), self.decision.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .unwrap_or(NO_DIAGNOSIS)
            .to_string()
    }
}

/// Parse one inbound text frame.
///
/// # Errors
/// `StreamError::MalformedMessage` if the frame is not JSON or lacks
/// required fields.
pub fn parse_service_message(raw: &str) -> Result<ServiceMessage> {
    serde_json::from_str(raw).map_err(|e| StreamError::MalformedMessage(e.to_string()))
}

/// Whether a service error message reports saturation.
pub fn is_busy_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains("busy")
}
