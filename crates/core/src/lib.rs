//! Core library for livectl.
//!
//! Two orchestration pieces sit on top of a remotely controlled DAW session:
//! the arrangement scheduler, which turns a song schema into a timed run of
//! scene launches, and the capture supervisor, which records the session's
//! output through an external encoder. Each module owns one subsystem; the
//! transport itself is reached through the [`Transport`] trait.

pub mod audio;
pub mod config;
pub mod error;
pub mod process;
pub mod record;
pub mod scheduler;
pub mod schema;
pub mod timeline;
pub mod transport;

pub use audio::{default_device, Backend, DeviceDescriptor, DeviceInventory, DeviceKind, Platform};
pub use config::{AppConfig, CaptureConfig, ScheduleConfig, TransportConfig};
pub use error::{LivectlError, Result};
pub use record::{
    session_duration_seconds, CaptureRequest, CaptureResult, CaptureSupervisor, EncoderCommand,
};
pub use scheduler::{ArrangementScheduler, CancelToken, ExecuteOptions, ExecutionOutcome, ExecutionReport};
pub use schema::{Section, SongSchema, TimeSignature};
pub use timeline::{beats_to_seconds, seconds_to_beats, SectionTiming, TimingPlan};
pub use transport::{OscTransport, SessionHandle, SessionInfo, Transport, TransportCommand};
