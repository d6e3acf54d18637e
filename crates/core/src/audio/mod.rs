//! Capture endpoint negotiation.
//!
//! Picks a default loopback or monitor source for the host platform and
//! lists whatever endpoints the platform's discovery helpers can see.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{LivectlError, Result};

pub mod probe;

pub use probe::{default_probes, DeviceInventory, DeviceProbe, ProbeDiagnostic, ProbeError};

/// Socket exposed by WSLg for reaching the Windows audio stack over pulse.
pub const WSLG_PULSE_SERVER: &str = "/mnt/wslg/PulseServer";

/// Which OS audio subsystem the encoder should read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Pulse,
    Alsa,
    AvFoundation,
    Dshow,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pulse => "pulse",
            Self::Alsa => "alsa",
            Self::AvFoundation => "avfoundation",
            Self::Dshow => "dshow",
        }
    }

    /// Encoder `-i` argument addressing `device` on this backend.
    pub fn input_spec(self, device: &str) -> String {
        match self {
            Self::Pulse => device.to_string(),
            Self::Alsa if device == "default" || device.contains(':') => device.to_string(),
            Self::Alsa => format!("hw:{device}"),
            Self::Dshow => format!("audio={device}"),
            Self::AvFoundation => format!(":{device}"),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pulse" => Ok(Self::Pulse),
            "alsa" => Ok(Self::Alsa),
            "avfoundation" => Ok(Self::AvFoundation),
            "dshow" => Ok(Self::Dshow),
            other => Err(format!(
                "unknown backend `{other}` (expected pulse, alsa, avfoundation or dshow)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Receives a copy of the outgoing system mix.
    Loopback,
    /// A capture input such as a microphone.
    Input,
    Hardware,
    Unknown,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Loopback => "loopback",
            Self::Input => "input",
            Self::Hardware => "hardware",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub backend: Backend,
    pub kind: DeviceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Environment the encoder needs to reach this device.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, backend: Backend, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            backend,
            kind,
            note: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}, {}]", self.name, self.backend, self.kind)?;
        if let Some(note) = &self.note {
            write!(f, " - {note}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsKind {
    Linux,
    MacOs,
    Windows,
    Other(String),
}

/// The facts about the host that device negotiation keys on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: OsKind,
    pub wsl: bool,
    pub wslg_pulse: bool,
}

impl Platform {
    pub fn detect() -> Self {
        let os = match std::env::consts::OS {
            "linux" => OsKind::Linux,
            "macos" => OsKind::MacOs,
            "windows" => OsKind::Windows,
            other => OsKind::Other(other.to_string()),
        };
        let wsl = os == OsKind::Linux
            && std::fs::read_to_string("/proc/version")
                .map(|v| v.to_lowercase().contains("microsoft"))
                .unwrap_or(false);
        let platform = Self {
            os,
            wsl,
            wslg_pulse: Path::new(WSLG_PULSE_SERVER).exists(),
        };
        tracing::debug!(?platform, "detected platform");
        platform
    }

    pub fn label(&self) -> String {
        let os = match &self.os {
            OsKind::Linux => "linux",
            OsKind::MacOs => "macos",
            OsKind::Windows => "windows",
            OsKind::Other(name) => name.as_str(),
        };
        if self.wsl {
            format!("{os} (wsl)")
        } else {
            os.to_string()
        }
    }
}

/// Best-guess capture endpoint for `platform`.
pub fn default_device(platform: &Platform) -> Result<DeviceDescriptor> {
    match platform.os {
        OsKind::Linux if platform.wslg_pulse => Ok(DeviceDescriptor::new(
            "default",
            Backend::Pulse,
            DeviceKind::Loopback,
        )
        .with_note("WSLg PulseAudio, captures Windows audio")
        .with_env("PULSE_SERVER", WSLG_PULSE_SERVER)),
        OsKind::Linux => Ok(DeviceDescriptor::new("default", Backend::Alsa, DeviceKind::Hardware)),
        OsKind::MacOs => Ok(DeviceDescriptor::new(
            "BlackHole 2ch",
            Backend::AvFoundation,
            DeviceKind::Loopback,
        )
        .with_note("requires the BlackHole virtual audio driver")),
        OsKind::Windows => Ok(DeviceDescriptor::new(
            "Stereo Mix (Realtek(R) Audio)",
            Backend::Dshow,
            DeviceKind::Loopback,
        )
        .with_note("enable Stereo Mix or install a virtual audio cable")),
        OsKind::Other(ref name) => Err(LivectlError::UnsupportedPlatform(name.clone())),
    }
}
