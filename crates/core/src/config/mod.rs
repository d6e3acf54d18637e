use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{LivectlError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transport: TransportConfig,
    pub schedule: ScheduleConfig,
    pub capture: CaptureConfig,
}

impl AppConfig {
    /// Loads the configuration from a JSON file. Missing keys fall back to
    /// their defaults; `None` yields the defaults outright.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => LivectlError::NotFound {
                path: path.to_path_buf(),
            },
            _ => LivectlError::Io(err),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|err| {
            LivectlError::config(format!("invalid config {}: {err}", path.display()))
        })?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }
}

/// Where the OSC remote script listens and replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub send_port: u16,
    pub reply_port: u16,
    pub reply_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            send_port: 11000,
            reply_port: 11001,
            reply_timeout_ms: 2_000,
        }
    }
}

impl TransportConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Pacing knobs for the arrangement scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Delay between the first scene fire and the play command.
    pub playback_settle_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            playback_settle_ms: 100,
        }
    }
}

impl ScheduleConfig {
    pub fn playback_settle(&self) -> Duration {
        Duration::from_millis(self.playback_settle_ms)
    }
}

/// Configuration specific to the capture subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Time given to the encoder to attach to the device before playback.
    pub encoder_settle_ms: u64,
    /// Pause between rewinding the playhead and starting playback.
    pub playback_settle_ms: u64,
    /// Added to the capture duration to form the hard encoder timeout.
    pub timeout_grace_secs: f64,
    /// Added to the session length when no duration is requested.
    pub safety_buffer_secs: f64,
    /// Explicit encoder executable; looked up on `PATH` when unset.
    pub encoder_path: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            encoder_settle_ms: 500,
            playback_settle_ms: 100,
            timeout_grace_secs: 30.0,
            safety_buffer_secs: 2.0,
            encoder_path: None,
        }
    }
}

impl CaptureConfig {
    pub fn encoder_settle(&self) -> Duration {
        Duration::from_millis(self.encoder_settle_ms)
    }

    pub fn playback_settle(&self) -> Duration {
        Duration::from_millis(self.playback_settle_ms)
    }

    /// Negative values mean no grace; values too large for a `Duration`
    /// saturate and are rejected when the deadline is computed.
    pub fn timeout_grace(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_grace_secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}
