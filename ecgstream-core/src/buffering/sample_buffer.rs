//! Holder for the loaded sample sequence.

use std::sync::Arc;

/// The full, immutable sample sequence and its sampling rate.
///
/// Replaced wholesale by [`SampleBuffer::load`]; every load bumps the
/// `generation` so that anything derived from a previous sequence can be
/// recognised as stale.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: Arc<[f64]>,
    sampling_rate: f64,
    generation: u64,
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self {
            samples: Arc::from(Vec::new()),
            sampling_rate: 0.0,
            generation: 0,
        }
    }
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents. Returns the new generation.
    pub fn load(&mut self, samples: Vec<f64>, sampling_rate: f64) -> u64 {
        self.samples = Arc::from(samples);
        self.sampling_rate = sampling_rate;
        self.generation += 1;
        self.generation
    }

    /// Read-only view of up to `length` samples starting at `from`.
    ///
    /// Clamps instead of failing: a short view near the end, an empty view
    /// past the end.
    pub fn slice(&self, from: usize, length: usize) -> &[f64] {
        let start = from.min(self.samples.len());
        let end = start.saturating_add(length).min(self.samples.len());
        &self.samples[start..end]
    }

    /// Number of samples covering `duration_secs` at the loaded rate.
    pub fn window_length(&self, duration_secs: f64) -> usize {
        let raw = (duration_secs * self.sampling_rate).round();
        if raw.is_finite() && raw > 0.0 {
            raw as usize
        } else {
            0
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sampling_rate <= 0.0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sampling_rate
    }
}
