//! Command-line arguments.

use std::path::PathBuf;
use std::time::Duration;

use crate::settings::{normalize_endpoint, AppSettings};

pub const USAGE: &str = "\
Usage: ecgstream <waveform> [options]

Streams a recorded ECG waveform to the analysis service in fixed-duration
chunks and prints one JSON line per result.

Options:
  --endpoint <url>          WebSocket endpoint (default ws://localhost:8000/ws/ecg/)
  --chunk-seconds <secs>    Seconds of signal per chunk (default 6)
  --sampling-rate <hz>      Override the waveform's sampling rate
  --pending-timeout-ms <ms> Free the flight slot after this long (0 = never)
  --connect-timeout <secs>  Give up connecting after this long (default 10)
  --settings <file>         Settings file (default: user config dir)
  --save-settings           Persist the effective settings and continue
  -h, --help                Show this help";

#[derive(Debug, Clone, PartialEq)]
pub struct Args {
    pub waveform: PathBuf,
    pub endpoint: Option<String>,
    pub chunk_seconds: Option<f64>,
    pub sampling_rate: Option<f64>,
    pub pending_timeout_ms: Option<u64>,
    pub connect_timeout: Duration,
    pub settings: Option<PathBuf>,
    pub save_settings: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Run(Args),
    Help,
}

impl Args {
    /// Command-line values win over settings file and environment.
    pub fn apply_to(&self, settings: &mut AppSettings) {
        if let Some(endpoint) = &self.endpoint {
            settings.endpoint = normalize_endpoint(endpoint);
        }
        if let Some(secs) = self.chunk_seconds {
            settings.chunk_duration_secs = secs;
        }
        if let Some(ms) = self.pending_timeout_ms {
            settings.pending_timeout_ms = Some(ms);
        }
        settings.normalize();
    }
}

pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Invocation, String> {
    let mut waveform: Option<PathBuf> = None;
    let mut endpoint = None;
    let mut chunk_seconds = None;
    let mut sampling_rate = None;
    let mut pending_timeout_ms = None;
    let mut connect_timeout = Duration::from_secs(10);
    let mut settings = None;
    let mut save_settings = false;

    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--endpoint" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --endpoint".into());
                };
                endpoint = Some(v);
            }
            "--chunk-seconds" => {
                chunk_seconds = Some(positive(&mut it, "--chunk-seconds")?);
            }
            "--sampling-rate" => {
                sampling_rate = Some(positive(&mut it, "--sampling-rate")?);
            }
            "--pending-timeout-ms" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --pending-timeout-ms".into());
                };
                pending_timeout_ms = Some(
                    v.parse::<u64>()
                        .map_err(|_| "invalid value for --pending-timeout-ms".to_string())?,
                );
            }
            "--connect-timeout" => {
                connect_timeout =
                    Duration::from_secs_f64(positive(&mut it, "--connect-timeout")?.min(3600.0));
            }
            "--settings" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --settings".into());
                };
                settings = Some(PathBuf::from(v));
            }
            "--save-settings" => save_settings = true,
            "--help" | "-h" => return Ok(Invocation::Help),
            other if other.starts_with('-') => {
                return Err(format!("unknown argument: {other}"));
            }
            path => {
                if waveform.is_some() {
                    return Err(format!("unexpected extra argument: {path}"));
                }
                waveform = Some(PathBuf::from(path));
            }
        }
    }

    let Some(waveform) = waveform else {
        return Err("missing waveform file".into());
    };
    Ok(Invocation::Run(Args {
        waveform,
        endpoint,
        chunk_seconds,
        sampling_rate,
        pending_timeout_ms,
        connect_timeout,
        settings,
        save_settings,
    }))
}

fn positive(it: &mut impl Iterator<Item = String>, flag: &str) -> Result<f64, String> {
    let Some(v) = it.next() else {
        return Err(format!("missing value for {flag}"));
    };
    match v.parse::<f64>() {
        Ok(n) if n.is_finite() && n > 0.0 => Ok(n),
        _ => Err(format!("invalid value for {flag}: expected a positive number")),
    }
}
