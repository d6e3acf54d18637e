use std::fmt;
use std::process::Command;
use std::time::Duration;

use serde::Serialize;

use super::{Backend, DeviceDescriptor, DeviceKind, OsKind, Platform, WSLG_PULSE_SERVER};
use crate::process::{self, Exit};
use crate::record::EncoderCommand;

const HELPER_TIMEOUT: Duration = Duration::from_secs(5);
const ENCODER_LISTING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("could not run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out")]
    TimedOut { program: String },
    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// One independent discovery mechanism.
pub trait DeviceProbe {
    fn name(&self) -> &'static str;
    fn probe(&self) -> Result<Vec<DeviceDescriptor>, ProbeError>;
}

/// Why a probe contributed nothing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeDiagnostic {
    pub probe: String,
    pub message: String,
}

/// Everything the probes found, plus a note for each one that failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceInventory {
    pub devices: Vec<DeviceDescriptor>,
    pub diagnostics: Vec<ProbeDiagnostic>,
}

impl DeviceInventory {
    /// Runs every probe in order. A failing probe never stops the others;
    /// an empty result always carries at least one diagnostic.
    pub fn collect(platform: &Platform, probes: &[Box<dyn DeviceProbe>]) -> Self {
        let mut inventory = Self::default();
        for probe in probes {
            match probe.probe() {
                Ok(found) => {
                    tracing::debug!(probe = probe.name(), count = found.len(), "probe finished");
                    inventory.devices.extend(found);
                }
                Err(err) => {
                    tracing::debug!(probe = probe.name(), %err, "probe failed");
                    inventory.diagnostics.push(ProbeDiagnostic {
                        probe: probe.name().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
        if inventory.devices.is_empty() {
            inventory.diagnostics.push(ProbeDiagnostic {
                probe: "inventory".to_string(),
                message: format!("no audio devices found on {}", platform.label()),
            });
        }
        inventory
    }

    /// Runs the platform's default probes. `encoder` is the located encoder
    /// used for the DirectShow listing, when one was found.
    pub fn discover(platform: &Platform, encoder: Option<&EncoderCommand>) -> Self {
        Self::collect(platform, &default_probes(platform, encoder))
    }
}

impl fmt::Display for DeviceInventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for device in &self.devices {
            writeln!(f, "{device}")?;
        }
        for diag in &self.diagnostics {
            writeln!(f, "! {}: {}", diag.probe, diag.message)?;
        }
        Ok(())
    }
}

/// The probes worth running on `platform`. Without a located `encoder` the
/// DirectShow listing falls back to `ffmpeg` (through `cmd.exe` on WSL).
pub fn default_probes(
    platform: &Platform,
    encoder: Option<&EncoderCommand>,
) -> Vec<Box<dyn DeviceProbe>> {
    let mut probes: Vec<Box<dyn DeviceProbe>> = Vec::new();
    if platform.os == OsKind::Linux {
        if platform.wslg_pulse {
            probes.push(Box::new(WslgProbe));
        }
        probes.push(Box::new(PactlProbe {
            pulse_server: platform.wslg_pulse.then(|| WSLG_PULSE_SERVER.to_string()),
        }));
        probes.push(Box::new(ArecordProbe));
    }
    if platform.wsl || platform.os == OsKind::Windows {
        let encoder = match encoder {
            Some(encoder) => encoder.clone(),
            None if platform.wsl => EncoderCommand {
                program: "cmd.exe".into(),
                leading_args: vec!["/c".into(), "ffmpeg".into()],
            },
            None => EncoderCommand::new("ffmpeg"),
        };
        probes.push(Box::new(DshowProbe { encoder }));
    }
    probes
}

struct WslgProbe;

impl DeviceProbe for WslgProbe {
    fn name(&self) -> &'static str {
        "wslg"
    }

    fn probe(&self) -> Result<Vec<DeviceDescriptor>, ProbeError> {
        Ok(vec![DeviceDescriptor::new("default", Backend::Pulse, DeviceKind::Loopback)
            .with_note("WSLg PulseAudio, captures Windows audio")
            .with_env("PULSE_SERVER", WSLG_PULSE_SERVER)])
    }
}

struct PactlProbe {
    pulse_server: Option<String>,
}

impl DeviceProbe for PactlProbe {
    fn name(&self) -> &'static str {
        "pactl"
    }

    fn probe(&self) -> Result<Vec<DeviceDescriptor>, ProbeError> {
        let mut command = Command::new("pactl");
        command.args(["list", "sources", "short"]);
        if let Some(server) = &self.pulse_server {
            command.env("PULSE_SERVER", server);
        }
        let (stdout, _) = run_helper(&mut command, HELPER_TIMEOUT, true)?;
        let mut devices = parse_pactl_sources(&stdout);
        if let Some(server) = &self.pulse_server {
            for device in &mut devices {
                device.env.insert("PULSE_SERVER".to_string(), server.clone());
            }
        }
        Ok(devices)
    }
}

struct ArecordProbe;

impl DeviceProbe for ArecordProbe {
    fn name(&self) -> &'static str {
        "arecord"
    }

    fn probe(&self) -> Result<Vec<DeviceDescriptor>, ProbeError> {
        let (stdout, _) = run_helper(Command::new("arecord").arg("-l"), HELPER_TIMEOUT, true)?;
        Ok(parse_arecord_cards(&stdout))
    }
}

struct DshowProbe {
    encoder: EncoderCommand,
}

impl DeviceProbe for DshowProbe {
    fn name(&self) -> &'static str {
        "dshow"
    }

    fn probe(&self) -> Result<Vec<DeviceDescriptor>, ProbeError> {
        let mut command = self.encoder.command();
        command.args(["-hide_banner", "-list_devices", "true", "-f", "dshow", "-i", "dummy"]);
        // The listing goes to stderr and the encoder always exits non-zero
        // because `dummy` is not a real input.
        let (_, stderr) = run_helper(&mut command, ENCODER_LISTING_TIMEOUT, false)?;
        Ok(parse_dshow_listing(&stderr))
    }
}

fn run_helper(
    command: &mut Command,
    timeout: Duration,
    require_success: bool,
) -> Result<(String, String), ProbeError> {
    let program = command.get_program().to_string_lossy().into_owned();
    match process::run_bounded(command, timeout) {
        Err(source) => Err(ProbeError::Spawn { program, source }),
        Ok(Exit::TimedOut { .. }) => Err(ProbeError::TimedOut { program }),
        Ok(Exit::Finished { status, stderr, .. }) if require_success && !status.success() => {
            Err(ProbeError::Failed {
                program,
                code: status.code(),
                stderr: stderr.trim().to_string(),
            })
        }
        Ok(Exit::Finished { stdout, stderr, .. }) => Ok((stdout, stderr)),
    }
}

/// Parses `pactl list sources short`: tab separated, name in column two.
pub fn parse_pactl_sources(output: &str) -> Vec<DeviceDescriptor> {
    output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .filter(|name| !name.is_empty())
        .map(|name| {
            let kind = if name.to_lowercase().contains("monitor") {
                DeviceKind::Loopback
            } else {
                DeviceKind::Input
            };
            DeviceDescriptor::new(name, Backend::Pulse, kind)
        })
        .collect()
}

/// Parses `arecord -l`, one descriptor per `card N: ..., device M: ...` line.
/// The name is the `card,device` pair so it can be addressed as `hw:N,M`.
pub fn parse_arecord_cards(output: &str) -> Vec<DeviceDescriptor> {
    output
        .lines()
        .filter(|line| line.starts_with("card"))
        .map(|line| {
            let name = arecord_address(line).unwrap_or_else(|| line.to_string());
            DeviceDescriptor::new(name, Backend::Alsa, DeviceKind::Hardware).with_note(line.trim())
        })
        .collect()
}

fn arecord_address(line: &str) -> Option<String> {
    let (card_part, rest) = line.strip_prefix("card ")?.split_once(':')?;
    let card: u32 = card_part.trim().parse().ok()?;
    let device_part = rest.split_once("device ")?.1;
    let device: u32 = device_part.split(':').next()?.trim().parse().ok()?;
    Some(format!("{card},{device}"))
}

/// Pulls quoted audio device names out of the encoder's DirectShow listing.
pub fn parse_dshow_listing(output: &str) -> Vec<DeviceDescriptor> {
    let mut in_audio = false;
    let mut devices = Vec::new();
    for line in output.lines() {
        if line.contains("DirectShow audio devices") {
            in_audio = true;
            continue;
        }
        if line.contains("DirectShow video devices") {
            in_audio = false;
            continue;
        }
        // Newer encoders tag each entry instead of using section headers.
        let tagged_audio = line.trim_end().ends_with("(audio)");
        if !(in_audio || tagged_audio) || line.contains("Alternative name") {
            continue;
        }
        let (Some(start), Some(end)) = (line.find('"'), line.rfind('"')) else {
            continue;
        };
        if end <= start + 1 {
            continue;
        }
        let name = &line[start + 1..end];
        let lower = name.to_lowercase();
        let kind = if lower.contains("stereo mix") || lower.contains("cable output") {
            DeviceKind::Loopback
        } else {
            DeviceKind::Unknown
        };
        devices.push(DeviceDescriptor::new(name, Backend::Dshow, kind));
    }
    devices
}
