//! Waveform file loading.
//!
//! Accepted formats:
//! - JSON object `{ "signal": [..], "fs": 250 }` (`fs` optional)
//! - JSON array of samples
//! - text, one sample per line; for CSV rows the first column is used and
//!   non-numeric lines (headers, comments) are skipped

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f64>,
    /// Rate stated by the file, if any.
    pub sampling_rate: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonWaveform {
    Object {
        signal: Vec<f64>,
        #[serde(default, alias = "sampling_rate", alias = "samplingRate")]
        fs: Option<f64>,
    },
    Samples(Vec<f64>),
}

pub fn load_waveform(path: &Path) -> Result<Waveform> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read waveform {}", path.display()))?;
    parse_waveform(&raw).with_context(|| format!("failed to parse waveform {}", path.display()))
}

pub fn parse_waveform(raw: &str) -> Result<Waveform> {
    let trimmed = raw.trim_start();
    let waveform = if trimmed.starts_with('{') || trimmed.starts_with('[') {
        match serde_json::from_str::<JsonWaveform>(trimmed)? {
            JsonWaveform::Object { signal, fs } => Waveform {
                samples: signal,
                sampling_rate: fs,
            },
            JsonWaveform::Samples(samples) => Waveform {
                samples,
                sampling_rate: None,
            },
        }
    } else {
        Waveform {
            samples: parse_text(raw),
            sampling_rate: None,
        }
    };

    if let Some(i) = waveform.samples.iter().position(|s| !s.is_finite()) {
        bail!("sample {i} is not a finite number");
    }
    if let Some(fs) = waveform.sampling_rate {
        if !(fs.is_finite() && fs > 0.0) {
            bail!("sampling rate must be positive, got {fs}");
        }
    }
    Ok(waveform)
}

fn parse_text(raw: &str) -> Vec<f64> {
    raw.lines()
        .filter_map(|line| {
            let first = line.split([',', ';', '\t']).next()?.trim();
            first.parse::<f64>().ok()
        })
        .collect()
}
