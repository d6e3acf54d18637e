//! The controlled session's transport, seen from the orchestration side.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{LivectlError, Result};

pub mod osc;

pub use osc::OscTransport;

/// A single mutation of the remote transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportCommand {
    SetTempo(f64),
    SetTimeSignature { numerator: u32, denominator: u32 },
    SetPosition(f64),
    StartPlayback,
    StopPlayback,
    SetRecordMode(bool),
    FireScene(usize),
}

impl fmt::Display for TransportCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetTempo(bpm) => write!(f, "set_tempo({bpm})"),
            Self::SetTimeSignature {
                numerator,
                denominator,
            } => write!(f, "set_time_signature({numerator}, {denominator})"),
            Self::SetPosition(beat) => write!(f, "set_position({beat})"),
            Self::StartPlayback => f.write_str("start_playback()"),
            Self::StopPlayback => f.write_str("stop_playback()"),
            Self::SetRecordMode(on) => write!(f, "set_record_mode({on})"),
            Self::FireScene(index) => write!(f, "fire_scene({index})"),
        }
    }
}

/// Failure reported by a concrete driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("osc: {0}")]
    Osc(String),
    #[error("no reply to {address}")]
    NoReply { address: String },
    #[error("unexpected reply to {address}")]
    UnexpectedReply { address: String },
}

/// Ordered, synchronous access to the session's transport. Return values are
/// not consumed, only success or failure.
pub trait Transport {
    fn send(&mut self, command: TransportCommand) -> std::result::Result<(), DriverError>;

    fn set_tempo(&mut self, bpm: f64) -> std::result::Result<(), DriverError> {
        self.send(TransportCommand::SetTempo(bpm))
    }

    fn set_time_signature(
        &mut self,
        numerator: u32,
        denominator: u32,
    ) -> std::result::Result<(), DriverError> {
        self.send(TransportCommand::SetTimeSignature {
            numerator,
            denominator,
        })
    }

    fn set_position(&mut self, beat: f64) -> std::result::Result<(), DriverError> {
        self.send(TransportCommand::SetPosition(beat))
    }

    fn start_playback(&mut self) -> std::result::Result<(), DriverError> {
        self.send(TransportCommand::StartPlayback)
    }

    fn stop_playback(&mut self) -> std::result::Result<(), DriverError> {
        self.send(TransportCommand::StopPlayback)
    }

    fn set_record_mode(&mut self, enabled: bool) -> std::result::Result<(), DriverError> {
        self.send(TransportCommand::SetRecordMode(enabled))
    }

    fn fire_scene(&mut self, index: usize) -> std::result::Result<(), DriverError> {
        self.send(TransportCommand::FireScene(index))
    }
}

/// Read-only session queries used to size captures.
pub trait SessionInfo {
    fn song_length_beats(&mut self) -> std::result::Result<f64, DriverError>;
    fn tempo(&mut self) -> std::result::Result<f64, DriverError>;
}

/// Sends `command` and wraps a failure with the caller's context.
pub(crate) fn issue<D: Transport + ?Sized>(
    driver: &mut D,
    command: TransportCommand,
    context: impl Into<String>,
) -> Result<()> {
    driver
        .send(command)
        .map_err(|source| LivectlError::Transport {
            command,
            context: context.into(),
            source,
        })
}

/// Explicitly owned, shareable handle to a connected driver. Every operation
/// that mutates the transport holds the lock for its whole run, so concurrent
/// callers are serialized.
pub struct SessionHandle<D> {
    shared: Arc<Mutex<D>>,
}

impl<D> SessionHandle<D> {
    pub fn new(driver: D) -> Self {
        Self {
            shared: Arc::new(Mutex::new(driver)),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, D>> {
        self.shared
            .lock()
            .map_err(|_| LivectlError::msg("session driver has been poisoned"))
    }
}

impl<D> Clone for SessionHandle<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D> fmt::Debug for SessionHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle").finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Instant;

    use super::*;

    /// Driver that records every command with the instant it arrived.
    #[derive(Debug)]
    pub struct RecordingTransport {
        pub calls: Vec<(Instant, TransportCommand)>,
        pub fail_on: Option<TransportCommand>,
        pub song_length_beats: f64,
        pub tempo: f64,
    }

    impl Default for RecordingTransport {
        fn default() -> Self {
            Self {
                calls: Vec::new(),
                fail_on: None,
                song_length_beats: 64.0,
                tempo: 120.0,
            }
        }
    }

    impl RecordingTransport {
        pub fn commands(&self) -> Vec<TransportCommand> {
            self.calls.iter().map(|(_, c)| *c).collect()
        }

        pub fn fired_at(&self) -> Vec<(usize, Instant)> {
            self.calls
                .iter()
                .filter_map(|(at, c)| match c {
                    TransportCommand::FireScene(i) => Some((*i, *at)),
                    _ => None,
                })
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn send(&mut self, command: TransportCommand) -> std::result::Result<(), DriverError> {
            self.calls.push((Instant::now(), command));
            if self.fail_on == Some(command) {
                return Err(DriverError::Osc("simulated failure".to_string()));
            }
            Ok(())
        }
    }

    impl SessionInfo for RecordingTransport {
        fn song_length_beats(&mut self) -> std::result::Result<f64, DriverError> {
            Ok(self.song_length_beats)
        }

        fn tempo(&mut self) -> std::result::Result<f64, DriverError> {
            Ok(self.tempo)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingTransport;
    use super::*;

    #[test]
    fn provided_methods_route_through_send() {
        let mut driver = RecordingTransport::default();
        driver.set_tempo(90.0).unwrap();
        driver.set_time_signature(3, 4).unwrap();
        driver.fire_scene(2).unwrap();
        driver.set_record_mode(false).unwrap();

        assert_eq!(
            driver.commands(),
            vec![
                TransportCommand::SetTempo(90.0),
                TransportCommand::SetTimeSignature {
                    numerator: 3,
                    denominator: 4
                },
                TransportCommand::FireScene(2),
                TransportCommand::SetRecordMode(false),
            ]
        );
    }

    #[test]
    fn issue_wraps_failures_with_context() {
        let mut driver = RecordingTransport {
            fail_on: Some(TransportCommand::StartPlayback),
            ..Default::default()
        };
        let err = issue(&mut driver, TransportCommand::StartPlayback, "segment 0").unwrap_err();

        let text = err.to_string();
        assert!(text.contains("start_playback()"));
        assert!(text.contains("segment 0"));
    }

    #[test]
    fn handles_share_one_driver() {
        let handle = SessionHandle::new(RecordingTransport::default());
        let other = handle.clone();
        other.lock().unwrap().stop_playback().unwrap();

        assert_eq!(handle.lock().unwrap().calls.len(), 1);
    }
}
