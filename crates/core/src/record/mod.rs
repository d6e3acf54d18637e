//! Records the session's audio output by supervising an external encoder
//! bound to a loopback capture device, in step with transport playback.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::audio::{self, Backend, DeviceDescriptor, DeviceKind, Platform};
use crate::config::CaptureConfig;
use crate::process::{self, Exit, Supervised};
use crate::timeline::wall_duration;
use crate::transport::{issue, SessionHandle, SessionInfo, Transport, TransportCommand};
use crate::{LivectlError, Result};

const ENCODER: &str = "ffmpeg";
const ENCODER_GUIDANCE: &str = "install FFmpeg:\n  Linux: sudo apt install ffmpeg\n  macOS: brew install ffmpeg\n  Windows: winget install ffmpeg";
const CHANNELS: &str = "2";

/// Supported output containers and the codec flags used for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Wav,
    Mp3,
    Flac,
    Ogg,
    M4a,
}

impl OutputFormat {
    pub const EXTENSIONS: [&'static str; 5] = [".mp3", ".wav", ".flac", ".ogg", ".m4a"];

    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "wav" => Ok(Self::Wav),
            "mp3" => Ok(Self::Mp3),
            "flac" => Ok(Self::Flac),
            "ogg" => Ok(Self::Ogg),
            "m4a" => Ok(Self::M4a),
            _ => Err(LivectlError::config(format!(
                "unsupported output format: .{ext}. Use {}",
                Self::EXTENSIONS.join(", ")
            ))),
        }
    }

    pub fn codec_args(self) -> &'static [&'static str] {
        match self {
            // PCM is the container default.
            Self::Wav => &[],
            Self::Mp3 => &["-codec:a", "libmp3lame", "-q:a", "2"],
            Self::Flac => &["-codec:a", "flac"],
            Self::Ogg => &["-codec:a", "libvorbis", "-q:a", "6"],
            Self::M4a => &["-codec:a", "aac", "-b:a", "256k"],
        }
    }
}

/// How to invoke the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: PathBuf,
    /// Arguments placed before the encoder's own flags, e.g. an interop
    /// shim's `/c ffmpeg`.
    pub leading_args: Vec<OsString>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Finds the encoder: configured path first, then `PATH`, then on WSL the
    /// Windows install reached through `cmd.exe`.
    pub fn locate(config: &CaptureConfig, platform: &Platform) -> Result<Self> {
        if let Some(path) = &config.encoder_path {
            if path.is_file() {
                return Ok(Self::new(path));
            }
            return Err(missing_encoder(path.display().to_string()));
        }
        if let Some(path) = find_on_path(ENCODER) {
            tracing::debug!(path = %path.display(), "encoder found on PATH");
            return Ok(Self::new(path));
        }
        if platform.wsl && windows_encoder_available() {
            tracing::debug!("using Windows encoder through cmd.exe");
            return Ok(Self {
                program: "cmd.exe".into(),
                leading_args: vec!["/c".into(), ENCODER.into()],
            });
        }
        Err(missing_encoder(ENCODER.to_string()))
    }

    pub(crate) fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.leading_args);
        command
    }
}

fn missing_encoder(program: String) -> LivectlError {
    LivectlError::DependencyMissing {
        program,
        guidance: ENCODER_GUIDANCE,
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        let exe = candidate.with_extension("exe");
        exe.is_file().then_some(exe)
    })
}

fn windows_encoder_available() -> bool {
    let mut command = Command::new("cmd.exe");
    command.args(["/c", "where", ENCODER]);
    matches!(
        process::run_bounded(&mut command, Duration::from_secs(5)),
        Ok(Exit::Finished { status, ref stdout, .. }) if status.success() && !stdout.trim().is_empty()
    )
}

/// Parameters of one capture run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub output: PathBuf,
    pub duration_seconds: Option<f64>,
    pub device: Option<String>,
    pub backend: Option<Backend>,
    pub sample_rate: u32,
    pub start_playback: bool,
}

impl CaptureRequest {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            duration_seconds: None,
            device: None,
            backend: None,
            sample_rate: CaptureConfig::default().sample_rate,
            start_playback: true,
        }
    }

    /// A fixed-length recording with the transport left alone, used to check
    /// that the encoder and device work.
    pub fn device_check(output: impl Into<PathBuf>, seconds: f64) -> Self {
        Self {
            duration_seconds: Some(seconds),
            start_playback: false,
            ..Self::new(output)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub output: PathBuf,
    pub size_bytes: u64,
    pub duration_seconds: f64,
    pub device: String,
    pub backend: Backend,
    pub playback_started: bool,
}

impl fmt::Display for CaptureResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Successfully exported to {} ({:.1} KB, {:.1}s) from {} [{}]",
            self.output.display(),
            self.size_bytes as f64 / 1024.0,
            self.duration_seconds,
            self.device,
            self.backend
        )
    }
}

/// Session length in seconds, without any safety buffer.
pub fn session_duration_seconds<D: SessionInfo + ?Sized>(driver: &mut D) -> Result<f64> {
    let length = driver
        .song_length_beats()
        .map_err(|source| query_error("song_length", source))?;
    let tempo = driver
        .tempo()
        .map_err(|source| query_error("tempo", source))?;
    if !tempo.is_finite() || tempo <= 0.0 {
        return Err(LivectlError::config(format!(
            "session reported a non-positive tempo ({tempo})"
        )));
    }
    if !length.is_finite() || length < 0.0 {
        return Err(LivectlError::config(format!(
            "session reported an invalid song length ({length} beats)"
        )));
    }
    Ok(length / tempo * 60.0)
}

fn query_error(what: &str, source: crate::transport::DriverError) -> LivectlError {
    LivectlError::msg(format!("could not read session {what}: {source}"))
}

/// Stops playback when dropped, if it was started.
struct PlaybackGuard<'a, D: Transport> {
    driver: &'a mut D,
    active: bool,
}

impl<'a, D: Transport> PlaybackGuard<'a, D> {
    fn new(driver: &'a mut D) -> Self {
        Self {
            driver,
            active: false,
        }
    }

    fn start(&mut self, settle: Duration) -> Result<()> {
        issue(&mut *self.driver, TransportCommand::SetPosition(0.0), "capture start")?;
        thread::sleep(settle);
        self.active = true;
        issue(&mut *self.driver, TransportCommand::StartPlayback, "capture start")
    }
}

impl<D: Transport> Drop for PlaybackGuard<'_, D> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        match self.driver.stop_playback() {
            Ok(()) => tracing::debug!("playback stopped after capture"),
            Err(err) => tracing::warn!(%err, "failed to stop playback after capture"),
        }
    }
}

/// Owns one capture run at a time against a session.
#[derive(Debug, Clone)]
pub struct CaptureSupervisor {
    config: CaptureConfig,
    platform: Platform,
    encoder: EncoderCommand,
}

impl CaptureSupervisor {
    /// Locates the encoder up front so a missing binary is reported before
    /// the session is touched.
    pub fn new(config: CaptureConfig, platform: Platform) -> Result<Self> {
        let encoder = EncoderCommand::locate(&config, &platform)?;
        Ok(Self::with_encoder(config, platform, encoder))
    }

    pub fn with_encoder(config: CaptureConfig, platform: Platform, encoder: EncoderCommand) -> Self {
        Self {
            config,
            platform,
            encoder,
        }
    }

    pub fn encoder(&self) -> &EncoderCommand {
        &self.encoder
    }

    /// Explicit duration, or session length plus the safety buffer. The
    /// result is always positive and short enough to wait on.
    pub fn resolve_duration<D: SessionInfo + ?Sized>(
        &self,
        request: &CaptureRequest,
        driver: &mut D,
    ) -> Result<f64> {
        let seconds = match request.duration_seconds {
            Some(seconds) => seconds,
            None => session_duration_seconds(driver)? + self.config.safety_buffer_secs,
        };
        if seconds.is_nan() || seconds <= 0.0 {
            return Err(LivectlError::config(format!(
                "capture duration must be positive, got {seconds}"
            )));
        }
        self.capture_timeout(seconds)?;
        Ok(seconds)
    }

    /// Hard deadline for an encoder recording `duration` seconds.
    fn capture_timeout(&self, duration: f64) -> Result<Duration> {
        wall_duration(duration)?
            .checked_add(self.config.timeout_grace())
            .filter(|timeout| Instant::now().checked_add(*timeout).is_some())
            .ok_or_else(|| {
                LivectlError::config(format!(
                    "capture of {duration} seconds plus {} seconds grace is too long",
                    self.config.timeout_grace_secs
                ))
            })
    }

    /// Explicit device and backend win; gaps are filled from the platform
    /// default.
    pub fn resolve_device(&self, request: &CaptureRequest) -> Result<DeviceDescriptor> {
        if let (Some(name), Some(backend)) = (&request.device, request.backend) {
            return Ok(DeviceDescriptor::new(name.clone(), backend, DeviceKind::Unknown));
        }
        let default = audio::default_device(&self.platform)?;
        let backend = request.backend.unwrap_or(default.backend);
        let mut device = DeviceDescriptor::new(
            request.device.clone().unwrap_or_else(|| default.name.clone()),
            backend,
            default.kind,
        );
        if backend == default.backend {
            device.env = default.env;
        }
        Ok(device)
    }

    fn build_command(
        &self,
        format: OutputFormat,
        device: &DeviceDescriptor,
        duration: f64,
        request: &CaptureRequest,
    ) -> Command {
        let mut command = self.encoder.command();
        command
            .args(["-hide_banner", "-nostdin", "-y"])
            .args(["-f", device.backend.as_str()])
            .arg("-i")
            .arg(device.backend.input_spec(&device.name))
            .arg("-t")
            .arg(format!("{duration:.3}"))
            .arg("-ar")
            .arg(request.sample_rate.to_string())
            .args(["-ac", CHANNELS])
            .args(format.codec_args())
            .arg(&request.output)
            .envs(&device.env);
        command
    }

    /// Records the session output to `request.output`.
    ///
    /// Holds the session lock for the whole run. Playback, when started, is
    /// stopped on every exit path, and the encoder is killed if it outlives
    /// `duration + timeout_grace`.
    pub fn capture<D: Transport + SessionInfo>(
        &self,
        request: &CaptureRequest,
        session: &SessionHandle<D>,
    ) -> Result<CaptureResult> {
        let format = OutputFormat::from_path(&request.output)?;
        let mut driver = session.lock()?;
        let duration = self.resolve_duration(request, &mut *driver)?;
        let device = self.resolve_device(request)?;
        let timeout = self.capture_timeout(duration)?;

        let mut command = self.build_command(format, &device, duration, request);
        let described = process::describe(&command);
        tracing::info!(
            output = %request.output.display(),
            duration,
            device = %device.name,
            backend = %device.backend,
            "starting capture"
        );
        let child = Supervised::spawn(&mut command).map_err(|err| LivectlError::Encoding {
            code: None,
            stderr: format!("failed to start encoder: {err}"),
            command: described.clone(),
        })?;
        tracing::debug!(pid = child.id(), "encoder running");

        thread::sleep(self.config.encoder_settle());

        let mut playback = PlaybackGuard::new(&mut *driver);
        if request.start_playback {
            playback.start(self.config.playback_settle())?;
        }
        let playback_started = playback.active;

        let exit = child.wait_timeout(timeout)?;
        drop(playback);

        match exit {
            Exit::TimedOut { .. } => Err(LivectlError::Timeout {
                after: timeout,
                command: described,
            }),
            Exit::Finished { status, stderr, .. } if !status.success() => {
                Err(LivectlError::Encoding {
                    code: status.code(),
                    stderr: if stderr.trim().is_empty() {
                        "unknown error".to_string()
                    } else {
                        stderr.trim().to_string()
                    },
                    command: described,
                })
            }
            Exit::Finished { .. } => {
                let size_bytes = match std::fs::metadata(&request.output) {
                    Ok(meta) => meta.len(),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        return Err(LivectlError::Integrity {
                            path: request.output.clone(),
                        })
                    }
                    Err(err) => return Err(err.into()),
                };
                tracing::info!(size_bytes, "capture complete");
                Ok(CaptureResult {
                    output: request.output.clone(),
                    size_bytes,
                    duration_seconds: duration,
                    device: device.name,
                    backend: device.backend,
                    playback_started,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OsKind;
    use crate::transport::testing::RecordingTransport;

    fn linux() -> Platform {
        Platform {
            os: OsKind::Linux,
            wsl: false,
            wslg_pulse: false,
        }
    }

    fn quick_config() -> CaptureConfig {
        CaptureConfig {
            encoder_settle_ms: 0,
            playback_settle_ms: 0,
            timeout_grace_secs: 0.3,
            ..CaptureConfig::default()
        }
    }

    fn explicit(output: PathBuf, seconds: f64) -> CaptureRequest {
        CaptureRequest {
            duration_seconds: Some(seconds),
            device: Some("default".to_string()),
            backend: Some(Backend::Pulse),
            ..CaptureRequest::new(output)
        }
    }

    #[test]
    fn output_formats_come_from_extension() {
        assert_eq!(OutputFormat::from_path(Path::new("a/b.MP3")).unwrap(), OutputFormat::Mp3);
        assert_eq!(OutputFormat::from_path(Path::new("x.flac")).unwrap(), OutputFormat::Flac);
        assert!(OutputFormat::Wav.codec_args().is_empty());
        assert!(matches!(
            OutputFormat::from_path(Path::new("song")),
            Err(LivectlError::Configuration(_))
        ));
    }

    #[test]
    fn derived_duration_adds_safety_buffer() {
        let supervisor =
            CaptureSupervisor::with_encoder(quick_config(), linux(), EncoderCommand::new("ffmpeg"));
        let mut driver = RecordingTransport {
            song_length_beats: 250.0,
            tempo: 97.0,
            ..Default::default()
        };

        let seconds = supervisor
            .resolve_duration(&CaptureRequest::new("out.wav"), &mut driver)
            .unwrap();
        assert!((seconds - (250.0 / 97.0 * 60.0 + 2.0)).abs() < 1e-9);
        assert!(driver.calls.is_empty());
    }

    #[test]
    fn negative_session_length_is_rejected_before_launch() {
        let supervisor =
            CaptureSupervisor::with_encoder(quick_config(), linux(), EncoderCommand::new("ffmpeg"));
        let session = SessionHandle::new(RecordingTransport {
            song_length_beats: -400.0,
            ..Default::default()
        });

        let err = supervisor
            .capture(&CaptureRequest::new("take.wav"), &session)
            .unwrap_err();

        assert!(matches!(err, LivectlError::Configuration(_)));
        assert!(session.lock().unwrap().calls.is_empty());
    }

    #[test]
    fn unwaitable_durations_are_rejected_before_launch() {
        let supervisor =
            CaptureSupervisor::with_encoder(quick_config(), linux(), EncoderCommand::new("ffmpeg"));
        let session = SessionHandle::new(RecordingTransport::default());

        for seconds in [1e300, f64::INFINITY, f64::NAN, 0.0] {
            let err = supervisor
                .capture(&explicit(PathBuf::from("take.wav"), seconds), &session)
                .unwrap_err();
            assert!(matches!(err, LivectlError::Configuration(_)), "{seconds}: {err}");
        }

        let huge_grace = CaptureSupervisor::with_encoder(
            CaptureConfig {
                timeout_grace_secs: 1e300,
                ..quick_config()
            },
            linux(),
            EncoderCommand::new("ffmpeg"),
        );
        let err = huge_grace
            .capture(&explicit(PathBuf::from("take.wav"), 1.0), &session)
            .unwrap_err();
        assert!(matches!(err, LivectlError::Configuration(_)));
        assert!(session.lock().unwrap().calls.is_empty());
    }

    #[test]
    fn missing_configured_encoder_is_a_dependency_error() {
        let config = CaptureConfig {
            encoder_path: Some("/nonexistent/bin/ffmpeg".into()),
            ..CaptureConfig::default()
        };
        let err = CaptureSupervisor::new(config, linux()).unwrap_err();
        assert!(matches!(err, LivectlError::DependencyMissing { .. }));
        assert!(err.hint().unwrap().contains("apt install ffmpeg"));
    }

    #[test]
    fn partial_device_requests_fill_from_default() {
        let supervisor =
            CaptureSupervisor::with_encoder(quick_config(), linux(), EncoderCommand::new("ffmpeg"));
        let request = CaptureRequest {
            device: Some("1,0".to_string()),
            ..CaptureRequest::new("out.wav")
        };

        let device = supervisor.resolve_device(&request).unwrap();
        assert_eq!((device.name.as_str(), device.backend), ("1,0", Backend::Alsa));
    }

    #[cfg(unix)]
    mod with_fake_encoder {
        use super::*;

        /// Runs `script` through `/bin/sh`; the output path is the last argument.
        fn supervisor(dir: &Path, script: &str) -> CaptureSupervisor {
            let path = dir.join("encoder.sh");
            std::fs::write(&path, script).unwrap();
            let encoder = EncoderCommand {
                program: "/bin/sh".into(),
                leading_args: vec![path.into_os_string()],
            };
            CaptureSupervisor::with_encoder(quick_config(), linux(), encoder)
        }

        const WRITES_OUTPUT: &str =
            "for last; do :; done\nprintf '%s\\n' \"$*\" > \"$(dirname \"$last\")/args.txt\"\nprintf 'RIFFdata' > \"$last\"\n";

        #[test]
        fn successful_capture_reports_artifact_and_stops_playback() {
            let dir = tempfile::tempdir().unwrap();
            let supervisor = supervisor(dir.path(), WRITES_OUTPUT);
            let session = SessionHandle::new(RecordingTransport::default());
            let output = dir.path().join("take.mp3");

            let result = supervisor.capture(&explicit(output.clone(), 1.5), &session).unwrap();

            assert_eq!(result.size_bytes, 8);
            assert!(result.playback_started);
            assert_eq!(
                session.lock().unwrap().commands(),
                vec![
                    TransportCommand::SetPosition(0.0),
                    TransportCommand::StartPlayback,
                    TransportCommand::StopPlayback,
                ]
            );
            let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
            assert!(args.contains("-f pulse -i default -t 1.500 -ar 44100 -ac 2"));
            assert!(args.contains("-codec:a libmp3lame -q:a 2"));
        }

        #[test]
        fn unsupported_extension_fails_before_launch() {
            let dir = tempfile::tempdir().unwrap();
            let supervisor = supervisor(dir.path(), WRITES_OUTPUT);
            let session = SessionHandle::new(RecordingTransport::default());

            let err = supervisor
                .capture(&explicit(dir.path().join("take.xyz"), 1.0), &session)
                .unwrap_err();

            assert!(matches!(err, LivectlError::Configuration(_)));
            assert!(!dir.path().join("args.txt").exists());
            assert!(session.lock().unwrap().calls.is_empty());
        }

        #[test]
        fn failing_encoder_surfaces_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let supervisor = supervisor(dir.path(), "echo 'no such device' >&2\nexit 3\n");
            let session = SessionHandle::new(RecordingTransport::default());

            let err = supervisor
                .capture(&explicit(dir.path().join("take.wav"), 1.0), &session)
                .unwrap_err();

            match err {
                LivectlError::Encoding { code, stderr, .. } => {
                    assert_eq!(code, Some(3));
                    assert_eq!(stderr, "no such device");
                }
                other => panic!("unexpected error: {other}"),
            }
            let commands = session.lock().unwrap().commands();
            assert_eq!(commands.last(), Some(&TransportCommand::StopPlayback));
        }

        #[test]
        fn clean_exit_without_artifact_is_an_integrity_error() {
            let dir = tempfile::tempdir().unwrap();
            let supervisor = supervisor(dir.path(), "exit 0\n");
            let session = SessionHandle::new(RecordingTransport::default());
            let mut request = explicit(dir.path().join("take.flac"), 1.0);
            request.start_playback = false;

            let err = supervisor.capture(&request, &session).unwrap_err();

            assert!(matches!(err, LivectlError::Integrity { .. }));
            assert!(session.lock().unwrap().calls.is_empty());
        }

        #[test]
        fn hung_encoder_is_killed_and_playback_stopped() {
            let dir = tempfile::tempdir().unwrap();
            let supervisor = supervisor(dir.path(), "exec sleep 30\n");
            let session = SessionHandle::new(RecordingTransport::default());
            let started = std::time::Instant::now();

            let err = supervisor
                .capture(&explicit(dir.path().join("take.ogg"), 0.1), &session)
                .unwrap_err();

            match err {
                LivectlError::Timeout { after, .. } => {
                    assert!((after.as_secs_f64() - 0.4).abs() < 1e-6);
                }
                other => panic!("unexpected error: {other}"),
            }
            assert!(started.elapsed() < Duration::from_secs(10));
            let commands = session.lock().unwrap().commands();
            assert_eq!(commands.last(), Some(&TransportCommand::StopPlayback));
        }

        #[test]
        fn wrapped_encoder_is_killed_with_its_children() {
            // Without exec the shell stays in between, like an interop shim
            // launching the real encoder.
            let dir = tempfile::tempdir().unwrap();
            let supervisor = supervisor(dir.path(), "sleep 30\ntrue\n");
            let session = SessionHandle::new(RecordingTransport::default());
            let started = std::time::Instant::now();

            let err = supervisor
                .capture(&explicit(dir.path().join("take.wav"), 0.1), &session)
                .unwrap_err();

            assert!(matches!(err, LivectlError::Timeout { .. }));
            assert!(started.elapsed() < Duration::from_secs(3));
            let commands = session.lock().unwrap().commands();
            assert_eq!(commands.last(), Some(&TransportCommand::StopPlayback));
        }

        #[test]
        fn failed_playback_start_still_stops_and_kills() {
            let dir = tempfile::tempdir().unwrap();
            let supervisor = supervisor(dir.path(), "exec sleep 30\n");
            let session = SessionHandle::new(RecordingTransport {
                fail_on: Some(TransportCommand::StartPlayback),
                ..Default::default()
            });

            let err = supervisor
                .capture(&explicit(dir.path().join("take.wav"), 5.0), &session)
                .unwrap_err();

            assert!(matches!(err, LivectlError::Transport { .. }));
            let commands = session.lock().unwrap().commands();
            assert_eq!(commands.last(), Some(&TransportCommand::StopPlayback));
        }
    }
}
