//! Typed chunk handed from the scheduler to the dispatcher.

use chrono::{DateTime, Utc};

/// A bounded, time-ordered slice of the loaded sample sequence, named and
/// ready to be offered to the flight gate.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Position of this chunk within the current sample sequence, from 0.
    pub sequence_index: u64,
    /// Human-readable name shown next to its result (e.g. `"chunk-3"`).
    pub chunk_name: String,
    /// Amplitude values for this window. The final chunk may be short.
    pub samples: Vec<f64>,
    /// Sample offset of the first value within the loaded sequence.
    pub start_sample: usize,
    /// Sampling rate of the sequence this chunk was cut from (Hz).
    pub sampling_rate: f64,
    /// Generation of the sample sequence this chunk belongs to.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sampling_rate <= 0.0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sampling_rate
    }

    /// Start and end of this chunk within the sequence, in seconds.
    pub fn time_range_secs(&self) -> (f64, f64) {
        if self.sampling_rate <= 0.0 {
            return (0.0, 0.0);
        }
        let start = self.start_sample as f64 / self.sampling_rate;
        (start, start + self.duration_secs())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(start_sample: usize, len: usize) -> Chunk {
        Chunk {
            sequence_index: 1,
            chunk_name: "chunk-2".into(),
            samples: vec![0.0; len],
            start_sample,
            sampling_rate: 250.0,
            generation: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn time_range_follows_start_sample() {
        let (start, end) = chunk(1250, 500).time_range_secs();
        assert!((start - 5.0).abs() < 1e-9);
        assert!((end - 7.0).abs() < 1e-9);
    }

    #[test]
    fn zero_rate_has_no_duration() {
        let mut c = chunk(0, 10);
        c.sampling_rate = 0.0;
        assert_eq!(c.duration_secs(), 0.0);
        assert_eq!(c.time_range_secs(), (0.0, 0.0));
    }
}
