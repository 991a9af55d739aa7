//! Wall-clock chunk scheduling.
//!
//! ## Tick model
//!
//! ```text
//! start()  → arm timer (epoch n), produce chunk immediately
//! tick     → slice [cursor, cursor + window) → advance cursor → emit
//!            (empty slice → stop, no chunk)
//! stop()   → disarm, cursor kept
//! reset()  → disarm, cursor = 0
//! ```
//!
//! The timer is a plain deadline owned by [`TickSchedule`]. Every arm bumps an
//! epoch carried by the returned [`TickHandle`]; a handle from an earlier arm
//! never matches again, so a tick that was queued before `stop()`/`reset()`
//! cannot fire into the new state.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::buffering::SampleBuffer;
use crate::error::{Result, StreamError};

/// Identifies one arming of a [`TickSchedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickHandle {
    epoch: u64,
}

impl TickHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    epoch: u64,
    next_due: Instant,
}

/// Cancellable repeating deadline.
#[derive(Debug, Default)]
pub struct TickSchedule {
    epoch: u64,
    armed: Option<ArmedTimer>,
}

impl TickSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer so that it first fires one `period` after `now`.
    /// Any previous arming is cancelled.
    ///
    /// A deadline past the end of the clock leaves the timer disarmed.
    pub fn arm(&mut self, period: Duration, now: Instant) -> TickHandle {
        self.epoch += 1;
        self.armed = now.checked_add(period).map(|next_due| ArmedTimer {
            epoch: self.epoch,
            next_due,
        });
        TickHandle { epoch: self.epoch }
    }

    pub fn cancel(&mut self) {
        self.armed = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Whether `handle` belongs to the currently armed timer.
    pub fn is_current(&self, handle: TickHandle) -> bool {
        self.armed.is_some_and(|a| a.epoch == handle.epoch)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.armed.map(|a| a.next_due)
    }

    /// Fire the timer if its deadline has passed, re-arming it `period` later.
    ///
    /// `period` is read at fire time, so a changed duration only affects
    /// deadlines scheduled after the current one.
    pub fn fire_if_due(&mut self, now: Instant, period: Duration) -> Option<TickHandle> {
        let armed = self.armed?;
        if now < armed.next_due {
            return None;
        }
        // Missed ticks are skipped rather than replayed in a burst.
        let next = armed
            .next_due
            .checked_add(period)
            .filter(|next| *next > now)
            .or_else(|| now.checked_add(period));
        self.armed = next.map(|next_due| ArmedTimer {
            epoch: armed.epoch,
            next_due,
        });
        Some(TickHandle { epoch: armed.epoch })
    }
}

/// A window sliced out of the sample buffer by one scheduler tick.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    pub sequence_index: u64,
    pub start_sample: usize,
    pub samples: Vec<f64>,
}

/// Owns the read cursor and the streaming-active flag.
#[derive(Debug)]
pub struct ChunkScheduler {
    cursor: usize,
    next_sequence: u64,
    chunk_duration_secs: f64,
    period: Duration,
    active: bool,
    timer: TickSchedule,
}

impl ChunkScheduler {
    pub fn new(chunk_duration_secs: f64) -> Result<Self> {
        let period = chunk_period(chunk_duration_secs)?;
        Ok(Self {
            cursor: 0,
            next_sequence: 0,
            chunk_duration_secs,
            period,
            active: false,
            timer: TickSchedule::new(),
        })
    }

    /// Mark streaming active and arm the repeating timer.
    ///
    /// The caller is expected to produce the first chunk immediately with
    /// [`ChunkScheduler::next_window`].
    ///
    /// # Errors
    /// - `StreamError::AlreadyStreaming` if already active.
    pub fn start(&mut self, now: Instant) -> Result<TickHandle> {
        if self.active {
            return Err(StreamError::AlreadyStreaming);
        }
        self.active = true;
        let handle = self.timer.arm(self.period, now);
        debug!(
            cursor = self.cursor,
            period_secs = self.chunk_duration_secs,
            epoch = handle.epoch(),
            "scheduler armed"
        );
        Ok(handle)
    }

    /// Stop ticking. The cursor is kept so streaming can resume.
    pub fn stop(&mut self) {
        self.active = false;
        self.timer.cancel();
    }

    /// Stop ticking and rewind to the start of the sequence.
    pub fn reset(&mut self) {
        self.stop();
        self.cursor = 0;
        self.next_sequence = 0;
    }

    /// Fire the timer if due. Returns the handle of the fired tick.
    pub fn poll_tick(&mut self, now: Instant) -> Option<TickHandle> {
        if !self.active {
            return None;
        }
        self.timer.fire_if_due(now, self.period)
    }

    /// Slice the next window at the cursor and advance past it.
    ///
    /// An exhausted buffer stops the scheduler and yields `None`.
    pub fn next_window(&mut self, buffer: &SampleBuffer) -> Option<SampleWindow> {
        let window_length = buffer.window_length(self.chunk_duration_secs);
        let slice = buffer.slice(self.cursor, window_length);
        if slice.is_empty() {
            debug!(cursor = self.cursor, "sample buffer exhausted, stopping");
            self.stop();
            return None;
        }

        let window = SampleWindow {
            sequence_index: self.next_sequence,
            start_sample: self.cursor,
            samples: slice.to_vec(),
        };
        self.cursor += slice.len();
        self.next_sequence += 1;
        Some(window)
    }

    /// Change the chunk duration. Takes effect from the next scheduled tick.
    pub fn set_chunk_duration(&mut self, secs: f64) -> Result<()> {
        self.period = chunk_period(secs)?;
        self.chunk_duration_secs = secs;
        Ok(())
    }

    pub fn chunk_duration_secs(&self) -> f64 {
        self.chunk_duration_secs
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.active {
            self.timer.next_due()
        } else {
            None
        }
    }

    /// Whether `handle` belongs to the current arming of the timer.
    pub fn is_current(&self, handle: TickHandle) -> bool {
        self.active && self.timer.is_current(handle)
    }
}

/// Longest accepted chunk duration: one day.
pub const MAX_CHUNK_DURATION_SECS: f64 = 86_400.0;

/// Tick period for a chunk duration.
///
/// # Errors
/// `StreamError::InvalidConfig` unless `0 < secs <= MAX_CHUNK_DURATION_SECS`.
pub fn chunk_period(secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(period) if !period.is_zero() && secs <= MAX_CHUNK_DURATION_SECS => Ok(period),
        _ => Err(StreamError::InvalidConfig(format!(
            "chunk duration must be between 0 and {MAX_CHUNK_DURATION_SECS} seconds, got {secs}"
        ))),
    }
}
