use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use livectl_core::{
    session_duration_seconds, AppConfig, ArrangementScheduler, Backend, CaptureRequest,
    CaptureSupervisor, DeviceInventory, EncoderCommand, ExecuteOptions, LivectlError, OscTransport,
    Platform, SessionHandle,
};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    match run(cli) {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            if let Some(hint) = err.hint() {
                eprintln!("hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> livectl_core::Result<String> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.connection.apply(&mut config);

    match cli.command {
        Commands::Execute {
            song,
            no_record,
            dry_run,
        } => {
            let scheduler = ArrangementScheduler::new(config.schedule.clone());
            let options = ExecuteOptions {
                record: !no_record,
                dry_run,
            };
            if dry_run {
                return Ok(scheduler.info(&song)?.to_string());
            }
            // Fail on a bad schema before binding any sockets.
            scheduler.info(&song)?;
            let session = connect(&config)?;
            Ok(scheduler.execute(&song, options, &session)?.to_string())
        }
        Commands::Info { song } => {
            let scheduler = ArrangementScheduler::new(config.schedule.clone());
            Ok(scheduler.info(&song)?.to_string())
        }
        Commands::Capture {
            output,
            device,
            no_playback,
            sample_rate,
        } => {
            let sample_rate = sample_rate.unwrap_or(config.capture.sample_rate);
            let supervisor = CaptureSupervisor::new(config.capture.clone(), Platform::detect())?;
            let request = CaptureRequest {
                duration_seconds: device.duration,
                device: device.device,
                backend: device.backend,
                sample_rate,
                start_playback: !no_playback,
                ..CaptureRequest::new(output)
            };
            let session = connect(&config)?;
            Ok(supervisor.capture(&request, &session)?.to_string())
        }
        Commands::TestCapture { output, device } => {
            let supervisor = CaptureSupervisor::new(config.capture.clone(), Platform::detect())?;
            let request = CaptureRequest {
                device: device.device,
                backend: device.backend,
                sample_rate: config.capture.sample_rate,
                ..CaptureRequest::device_check(output, device.duration.unwrap_or(5.0))
            };
            let session = connect(&config)?;
            Ok(supervisor.capture(&request, &session)?.to_string())
        }
        Commands::Devices => {
            let platform = Platform::detect();
            let mut lines = Vec::new();
            match livectl_core::default_device(&platform) {
                Ok(device) => lines.push(format!("default: {device}")),
                Err(err) => lines.push(format!("default: none ({err})")),
            }
            let encoder = match EncoderCommand::locate(&config.capture, &platform) {
                Ok(encoder) => Some(encoder),
                Err(err) => {
                    tracing::debug!(%err, "no encoder located, using the default listing command");
                    None
                }
            };
            lines.push(DeviceInventory::discover(&platform, encoder.as_ref()).to_string());
            Ok(lines.join("\n"))
        }
        Commands::Duration => {
            let session = connect(&config)?;
            let mut driver = session.lock()?;
            let seconds = session_duration_seconds(&mut *driver)?;
            Ok(format!("{seconds:.1} seconds"))
        }
        Commands::Ping => {
            let session = connect(&config)?;
            let mut driver = session.lock()?;
            driver
                .ping()
                .map_err(|err| LivectlError::msg(format!("remote script did not answer: {err}")))?;
            Ok(format!(
                "remote script answered at {}:{}",
                config.transport.host, config.transport.send_port
            ))
        }
    }
}

fn connect(config: &AppConfig) -> livectl_core::Result<SessionHandle<OscTransport>> {
    Ok(SessionHandle::new(OscTransport::connect(&config.transport)?))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive a live DAW session: arrangements and audio capture", long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct ConnectionArgs {
    /// Host running the OSC remote script.
    #[arg(long, global = true)]
    host: Option<String>,
    /// Port the remote script listens on.
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Local port replies arrive on.
    #[arg(long, global = true)]
    reply_port: Option<u16>,
}

impl ConnectionArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.transport.host = host.clone();
        }
        if let Some(port) = self.port {
            config.transport.send_port = port;
        }
        if let Some(port) = self.reply_port {
            config.transport.reply_port = port;
        }
    }
}

#[derive(Args, Debug)]
struct DeviceArgs {
    /// Recording length in seconds.
    #[arg(short, long)]
    duration: Option<f64>,
    /// Capture device name; see `livectl devices`.
    #[arg(long)]
    device: Option<String>,
    /// Capture backend (pulse, alsa, avfoundation, dshow).
    #[arg(long)]
    backend: Option<Backend>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fire each section's scene in time, recording into the arrangement.
    Execute {
        /// Song schema JSON file.
        song: PathBuf,
        /// Play the arrangement without enabling record mode.
        #[arg(long)]
        no_record: bool,
        /// Print the timing plan without touching the session.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the timing plan for a song schema.
    Info {
        song: PathBuf,
    },
    /// Record the session's audio output to a file.
    Capture {
        /// Output file (.wav, .mp3, .flac, .ogg or .m4a).
        output: PathBuf,
        #[command(flatten)]
        device: DeviceArgs,
        /// Record without starting playback.
        #[arg(long)]
        no_playback: bool,
        #[arg(long)]
        sample_rate: Option<u32>,
    },
    /// Record a few seconds without playback to check the encoder and device.
    TestCapture {
        output: PathBuf,
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// List audio capture devices.
    Devices,
    /// Print the session length in seconds.
    Duration,
    /// Check that the remote script answers.
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_execute_flags() {
        let cli = Cli::try_parse_from(["livectl", "execute", "song.json", "--dry-run"]).unwrap();
        match cli.command {
            Commands::Execute {
                song,
                no_record,
                dry_run,
            } => {
                assert_eq!(song, PathBuf::from("song.json"));
                assert!(!no_record);
                assert!(dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_capture_device_overrides() {
        let cli = Cli::try_parse_from([
            "livectl",
            "--host",
            "10.0.0.5",
            "capture",
            "out.flac",
            "--duration",
            "12.5",
            "--backend",
            "pulse",
            "--device",
            "sink.monitor",
        ])
        .unwrap();

        let mut config = AppConfig::default();
        cli.connection.apply(&mut config);
        assert_eq!(config.transport.host, "10.0.0.5");

        match cli.command {
            Commands::Capture { device, .. } => {
                assert_eq!(device.duration, Some(12.5));
                assert_eq!(device.backend, Some(Backend::Pulse));
                assert_eq!(device.device.as_deref(), Some("sink.monitor"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_backends() {
        assert!(Cli::try_parse_from(["livectl", "capture", "out.wav", "--backend", "jack"]).is_err());
    }

    #[test]
    fn dry_run_needs_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let song = dir.path().join("song.json");
        std::fs::write(
            &song,
            r#"{"metadata": {"tempo": 120}, "structure": {"sections": [{"name": "intro", "bars": 4}]}}"#,
        )
        .unwrap();

        let cli = Cli::try_parse_from(["livectl", "info", song.to_str().unwrap()]).unwrap();
        let report = run(cli).unwrap();
        assert!(report.contains("0: intro (4 bars, 8.0s)"));
    }
}
