//! Request tagging and the single-flight slot.
//!
//! ## Flight slot
//!
//! ```text
//!            begin()                 resolve() / release()
//!   Free ─────────────► Pending ─────────────────────────► Free
//!                          │  discard() (reset, load, connection lost)
//!                          └──────────────────────────────► Free
//! ```
//!
//! `release()` frees the slot on a terminal service error or timeout but
//! remembers the request as most-recently pending, so a late success for it
//! is still accepted once. `discard()` forgets it: any later result for a
//! discarded request is stale.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Result, StreamError};

/// Client-unique identifier of one dispatched chunk.
///
/// Built from the session start timestamp and a monotonic counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Metadata kept for the chunk occupying the flight slot.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub chunk_name: String,
    pub sequence_index: u64,
    pub generation: u64,
    pub start_sample: usize,
    pub sample_count: usize,
    pub sampling_rate: f64,
    pub sent_at: DateTime<Utc>,
    pub sent_instant: Instant,
}

/// How an inbound result relates to the flight slot.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Matches the request currently in flight; the slot is now free.
    Current(PendingRequest),
    /// Matches the request most recently released by an error or timeout.
    Released(PendingRequest),
    /// Unknown, already resolved, or discarded.
    Stale,
}

#[derive(Debug)]
pub struct RequestCorrelator {
    session_stamp: String,
    next_request: u64,
    next_chunk_number: u64,
    pending: Option<PendingRequest>,
    last_released: Option<PendingRequest>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::with_session_start(Utc::now())
    }

    pub fn with_session_start(started_at: DateTime<Utc>) -> Self {
        Self {
            session_stamp: format!("{:x}", started_at.timestamp_millis()),
            next_request: 0,
            next_chunk_number: 1,
            pending: None,
            last_released: None,
        }
    }

    /// Next sequential chunk name for the current sample sequence.
    pub fn name_chunk(&mut self) -> String {
        let name = format!("chunk-{}", self.next_chunk_number);
        self.next_chunk_number += 1;
        name
    }

    /// Allocate a fresh request id. Never repeats within this correlator.
    pub fn allocate_request_id(&mut self) -> RequestId {
        let id = RequestId(format!("{}-{}", self.session_stamp, self.next_request));
        self.next_request += 1;
        id
    }

    /// Occupy the flight slot.
    ///
    /// # Errors
    /// - `StreamError::Busy` if a request is already pending; the slot is
    ///   left untouched.
    pub fn begin(&mut self, request: PendingRequest) -> Result<()> {
        if self.pending.is_some() {
            return Err(StreamError::Busy);
        }
        self.last_released = None;
        self.pending = Some(request);
        Ok(())
    }

    /// Match an inbound result against the slot.
    pub fn resolve(&mut self, request_id: &str) -> Resolution {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.request_id.as_str() == request_id)
        {
            if let Some(p) = self.pending.take() {
                return Resolution::Current(p);
            }
        }
        if self
            .last_released
            .as_ref()
            .is_some_and(|p| p.request_id.as_str() == request_id)
        {
            if let Some(p) = self.last_released.take() {
                return Resolution::Released(p);
            }
        }
        Resolution::Stale
    }

    /// Free the slot after a terminal error, remembering the request.
    pub fn release(&mut self) -> Option<PendingRequest> {
        let released = self.pending.take()?;
        self.last_released = Some(released.clone());
        Some(released)
    }

    /// Free the slot and forget the request entirely.
    pub fn discard(&mut self) -> Option<PendingRequest> {
        self.last_released = None;
        self.pending.take()
    }

    /// Release the pending request if it has waited at least `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Option<PendingRequest> {
        let deadline = self.deadline(timeout)?;
        if now >= deadline {
            self.release()
        } else {
            None
        }
    }

    /// When the pending request will time out, if any.
    pub fn deadline(&self, timeout: Duration) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.sent_instant + timeout)
    }

    /// Forget everything tied to the previous sample sequence.
    pub fn reset_for_new_sequence(&mut self) {
        self.discard();
        self.next_chunk_number = 1;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pending(c: &mut RequestCorrelator) -> PendingRequest {
        PendingRequest {
            request_id: c.allocate_request_id(),
            chunk_name: c.name_chunk(),
            sequence_index: 0,
            generation: 1,
            start_sample: 0,
            sample_count: 1250,
            sampling_rate: 250.0,
            sent_at: Utc::now(),
            sent_instant: Instant::now(),
        }
    }

    #[test]
    fn request_ids_are_unique() {
        let mut c = RequestCorrelator::new();
        let ids: HashSet<RequestId> = (0..1000).map(|_| c.allocate_request_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn chunk_names_restart_with_new_sequence() {
        let mut c = RequestCorrelator::new();
        assert_eq!(c.name_chunk(), "chunk-1");
        assert_eq!(c.name_chunk(), "chunk-2");
        c.reset_for_new_sequence();
        assert_eq!(c.name_chunk(), "chunk-1");
    }

    #[test]
    fn begin_while_pending_is_busy_and_keeps_record() {
        let mut c = RequestCorrelator::new();
        let first = pending(&mut c);
        let first_id = first.request_id.clone();
        c.begin(first).unwrap();
        let second = pending(&mut c);
        assert!(matches!(c.begin(second), Err(StreamError::Busy)));
        assert_eq!(c.pending().unwrap().request_id, first_id);
    }

    #[test]
    fn resolve_frees_slot_exactly_once() {
        let mut c = RequestCorrelator::new();
        let p = pending(&mut c);
        let id = p.request_id.clone();
        c.begin(p).unwrap();
        assert!(matches!(c.resolve(id.as_str()), Resolution::Current(_)));
        assert!(!c.is_pending());
        assert!(matches!(c.resolve(id.as_str()), Resolution::Stale));
    }

    #[test]
    fn released_request_is_accepted_once() {
        let mut c = RequestCorrelator::new();
        let p = pending(&mut c);
        let id = p.request_id.clone();
        c.begin(p).unwrap();
        c.release();
        assert!(!c.is_pending());
        assert!(matches!(c.resolve(id.as_str()), Resolution::Released(_)));
        assert!(matches!(c.resolve(id.as_str()), Resolution::Stale));
    }

    #[test]
    fn new_dispatch_forgets_released_request() {
        let mut c = RequestCorrelator::new();
        let p = pending(&mut c);
        let old = p.request_id.clone();
        c.begin(p).unwrap();
        c.release();
        let next = pending(&mut c);
        c.begin(next).unwrap();
        assert!(matches!(c.resolve(old.as_str()), Resolution::Stale));
        assert!(c.is_pending());
    }

    #[test]
    fn discarded_request_is_stale() {
        let mut c = RequestCorrelator::new();
        let p = pending(&mut c);
        let id = p.request_id.clone();
        c.begin(p).unwrap();
        assert!(c.discard().is_some());
        assert!(matches!(c.resolve(id.as_str()), Resolution::Stale));
    }

    #[test]
    fn expire_after_timeout() {
        let mut c = RequestCorrelator::new();
        let p = pending(&mut c);
        let sent = p.sent_instant;
        c.begin(p).unwrap();
        let timeout = Duration::from_secs(30);
        assert!(c.expire(sent + Duration::from_secs(29), timeout).is_none());
        assert!(c.expire(sent + timeout, timeout).is_some());
        assert!(!c.is_pending());
        assert!(c.deadline(timeout).is_none());
    }
}
