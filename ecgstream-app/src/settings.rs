//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ecgstream_core::{StreamConfig, DEFAULT_ENDPOINT};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_SAMPLING_RATE: f64 = 250.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub endpoint: String,
    pub chunk_duration_secs: f64,
    /// Used when the waveform file does not state its own rate.
    pub default_sampling_rate: f64,
    /// `None` or `0` disables the pending-request timeout.
    pub pending_timeout_ms: Option<u64>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            chunk_duration_secs: 6.0,
            default_sampling_rate: DEFAULT_SAMPLING_RATE,
            pending_timeout_ms: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.endpoint = normalize_endpoint(&self.endpoint);
        if !self.chunk_duration_secs.is_finite() || self.chunk_duration_secs <= 0.0 {
            self.chunk_duration_secs = 6.0;
        }
        self.chunk_duration_secs = self.chunk_duration_secs.clamp(0.1, 600.0);
        if !self.default_sampling_rate.is_finite() || self.default_sampling_rate <= 0.0 {
            self.default_sampling_rate = DEFAULT_SAMPLING_RATE;
        }
        self.pending_timeout_ms = self.pending_timeout_ms.filter(|ms| *ms > 0);
    }

    /// Environment variables win over the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("ECGSTREAM_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(secs) = lookup("ECGSTREAM_CHUNK_SECONDS").and_then(|v| v.trim().parse().ok()) {
            self.chunk_duration_secs = secs;
        }
        if let Some(ms) = lookup("ECGSTREAM_PENDING_TIMEOUT_MS").and_then(|v| v.trim().parse().ok())
        {
            self.pending_timeout_ms = Some(ms);
        }
        self.normalize();
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            endpoint: self.endpoint.clone(),
            chunk_duration_secs: self.chunk_duration_secs,
            pending_timeout: self.pending_timeout_ms.map(Duration::from_millis),
            ..StreamConfig::default()
        }
    }
}

pub fn normalize_endpoint(raw: &str) -> String {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return DEFAULT_ENDPOINT.into();
    }
    if endpoint.contains("://") {
        endpoint.into()
    } else {
        format!("ws://{endpoint}")
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ecgstream")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("ecgstream")
            .join("settings.json")
    }
}

/// Read settings from `path`, falling back to defaults.
///
/// A missing file is the normal first-run case and is silent. A file that
/// exists but cannot be read or parsed is reported and left untouched, so
/// the next `save_settings` is the only thing that replaces it.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read(path) {
        Ok(bytes) => serde_json::from_slice::<AppSettings>(&bytes).unwrap_or_else(|e| {
            warn!(path = ?path, error = %e, "settings file is not valid JSON, using defaults");
            AppSettings::default()
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            warn!(path = ?path, error = %e, "settings file unreadable, using defaults");
            AppSettings::default()
        }
    };
    settings.normalize();
    settings
}

/// Write settings as pretty JSON.
///
/// The file is written beside its final location and renamed into place, so
/// an interrupted save never leaves a truncated settings file.
pub fn save_settings(path: &Path, settings: &AppSettings) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut json = serde_json::to_vec_pretty(settings).map_err(io::Error::other)?;
    json.push(b'\n');
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, &json)?;
    fs::rename(&staging, path).inspect_err(|_| {
        let _ = fs::remove_file(&staging);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&dir.path().join("absent.json"));
        assert_eq!(settings, AppSettings::default());
        assert_eq!(settings.endpoint, "ws://localhost:8000/ws/ecg/");
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let settings = AppSettings {
            endpoint: "ws://10.0.0.5:9000/ws/ecg/".into(),
            chunk_duration_secs: 5.0,
            default_sampling_rate: 360.0,
            pending_timeout_ms: Some(30_000),
        };
        save_settings(&path, &settings).expect("save");
        let raw = fs::read_to_string(&path).expect("read back");
        assert!(raw.contains("chunkDurationSecs"));
        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn corrupt_file_falls_back_and_is_replaced_on_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ \"endpoint\": ").expect("write");

        let mut settings = load_settings(&path);
        assert_eq!(settings, AppSettings::default());
        assert_eq!(fs::read_to_string(&path).expect("untouched"), "{ \"endpoint\": ");

        settings.chunk_duration_secs = 4.0;
        save_settings(&path, &settings).expect("save");
        assert_eq!(load_settings(&path).chunk_duration_secs, 4.0);
        assert!(!path.with_extension("json.tmp").exists());
        let names: Vec<String> = fs::read_dir(dir.path())
            .expect("list")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["settings.json".to_string()]);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "chunkDurationSecs": 2.5 }"#).expect("write");
        let settings = load_settings(&path);
        assert_eq!(settings.chunk_duration_secs, 2.5);
        assert_eq!(settings.default_sampling_rate, DEFAULT_SAMPLING_RATE);
    }

    #[test]
    fn normalize_repairs_bad_values() {
        let mut settings = AppSettings {
            endpoint: " localhost:8000/ws/ecg/ ".into(),
            chunk_duration_secs: -1.0,
            default_sampling_rate: f64::NAN,
            pending_timeout_ms: Some(0),
        };
        settings.normalize();
        assert_eq!(settings.endpoint, "ws://localhost:8000/ws/ecg/");
        assert_eq!(settings.chunk_duration_secs, 6.0);
        assert_eq!(settings.default_sampling_rate, DEFAULT_SAMPLING_RATE);
        assert!(settings.pending_timeout_ms.is_none());
        settings.stream_config().validate().expect("normalized settings are valid");
    }

    #[test]
    fn overrides_take_precedence() {
        let env: HashMap<&str, &str> = [
            ("ECGSTREAM_ENDPOINT", "wss://ecg.example/ws/"),
            ("ECGSTREAM_CHUNK_SECONDS", "3"),
            ("ECGSTREAM_PENDING_TIMEOUT_MS", "1500"),
        ]
        .into_iter()
        .collect();
        let mut settings = AppSettings::default();
        settings.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        let config = settings.stream_config();
        assert_eq!(config.endpoint, "wss://ecg.example/ws/");
        assert_eq!(config.chunk_duration_secs, 3.0);
        assert_eq!(config.pending_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn unparsable_override_is_ignored() {
        let mut settings = AppSettings::default();
        settings.apply_overrides(|key| (key == "ECGSTREAM_CHUNK_SECONDS").then(|| "six".into()));
        assert_eq!(settings.chunk_duration_secs, 6.0);
    }
}
