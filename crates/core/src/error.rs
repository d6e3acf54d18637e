use std::path::PathBuf;
use std::time::Duration;

use crate::transport::{DriverError, TransportCommand};

/// Result alias that carries the custom [`LivectlError`] type.
pub type Result<T> = std::result::Result<T, LivectlError>;

/// Common error type for the core crate.
///
/// Configuration and dependency problems are always raised before the
/// controlled session is touched. The mid-run variants (`Transport`,
/// `Encoding`, `Timeout`) are raised after cleanup has been attempted.
#[derive(Debug, thiserror::Error)]
pub enum LivectlError {
    /// The song schema file does not exist.
    #[error("file not found: {}", path.display())]
    NotFound { path: PathBuf },
    /// The song schema could not be parsed.
    #[error("invalid song schema {}: {source}", path.display())]
    InvalidSchema {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// Invalid tempo, time signature, duration or output format.
    #[error("{0}")]
    Configuration(String),
    /// A required external executable could not be located.
    #[error("{program} not found")]
    DependencyMissing {
        program: String,
        guidance: &'static str,
    },
    /// No device negotiation rule exists for the running platform.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    /// A transport call failed after the session had already been mutated.
    #[error("transport command `{command}` failed ({context}): {source}")]
    Transport {
        command: TransportCommand,
        context: String,
        #[source]
        source: DriverError,
    },
    /// The encoder exited with a failure status.
    #[error("encoder failed (exit code {}):\n{stderr}\ncommand: {command}", code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Encoding {
        code: Option<i32>,
        stderr: String,
        command: String,
    },
    /// The encoder outlived its hard timeout and was killed.
    #[error("encoder timed out after {:.1} seconds\ncommand: {command}", after.as_secs_f64())]
    Timeout { after: Duration, command: String },
    /// The encoder reported success but left no artifact behind.
    #[error("encoder completed but output file not found: {}", path.display())]
    Integrity { path: PathBuf },
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Free-form message for conditions outside the taxonomy.
    #[error("{0}")]
    Message(String),
}

impl LivectlError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    /// Remediation advice suitable for showing next to the error.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::DependencyMissing { guidance, .. } => Some(*guidance),
            Self::NotFound { .. } => Some("check the path to the song schema file"),
            Self::UnsupportedPlatform(_) => {
                Some("pass --device and --backend explicitly to bypass device negotiation")
            }
            Self::Transport { .. } => {
                Some("make sure the DAW is running with its OSC remote script enabled")
            }
            Self::Encoding { .. } => {
                Some("run `livectl devices` to list capture devices and retry with --device")
            }
            _ => None,
        }
    }
}

impl From<&str> for LivectlError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LivectlError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
