//! Plays a song schema into the session by firing one scene per section at
//! its wall-clock offset, optionally recording the pass into the arrangement.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ScheduleConfig;
use crate::schema::SongSchema;
use crate::timeline::{wall_duration, TimingPlan};
use crate::transport::{issue, SessionHandle, Transport, TransportCommand};
use crate::{LivectlError, Result};

/// Longest uninterrupted sleep while pacing, so cancellation is noticed.
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Shared flag that asks a running arrangement pass to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub record: bool,
    pub dry_run: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            record: true,
            dry_run: false,
        }
    }
}

impl ExecuteOptions {
    pub fn dry_run() -> Self {
        Self {
            record: false,
            dry_run: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ExecutionOutcome {
    DryRun,
    Completed,
    Cancelled { last_completed: Option<usize> },
}

/// What an `execute` call did, rendered as a human-readable summary.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub song: String,
    pub plan: TimingPlan,
    pub recorded: bool,
    /// Scene indices fired, in order.
    pub fired: Vec<usize>,
    pub outcome: ExecutionOutcome,
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plan = &self.plan;
        writeln!(f, "Song: {}", self.song)?;
        writeln!(
            f,
            "Tempo: {} BPM, Time Signature: {}",
            plan.tempo, plan.time_signature
        )?;
        writeln!(
            f,
            "Total: {} sections, {:.0} beats, {:.1} seconds",
            plan.len(),
            plan.total_beats(),
            plan.total_seconds()
        )?;
        writeln!(f)?;
        writeln!(f, "Sections:")?;
        for s in &plan.segments {
            writeln!(
                f,
                "  {}: {} ({} bars, {:.1}s)",
                s.scene_index, s.name, s.bars, s.duration_seconds
            )?;
        }
        writeln!(f)?;

        if self.outcome == ExecutionOutcome::DryRun {
            return write!(f, "[DRY RUN] No execution performed");
        }

        writeln!(f, "Executing...")?;
        for (n, &index) in self.fired.iter().enumerate() {
            let name = plan
                .segments
                .get(index)
                .map_or("?", |s| s.name.as_str());
            writeln!(f, "  [{}/{}] {}: firing scene {}", n + 1, plan.len(), name, index)?;
        }
        writeln!(f)?;
        match self.outcome {
            ExecutionOutcome::Completed if self.recorded => write!(
                f,
                "Complete! Recorded {:.1} seconds to arrangement view.",
                plan.total_seconds()
            ),
            ExecutionOutcome::Completed => {
                write!(f, "Complete! Played {:.1} seconds.", plan.total_seconds())
            }
            ExecutionOutcome::Cancelled {
                last_completed: Some(i),
            } => write!(f, "Cancelled after section {i} completed."),
            ExecutionOutcome::Cancelled {
                last_completed: None,
            } => write!(f, "Cancelled before any section completed."),
            ExecutionOutcome::DryRun => Ok(()),
        }
    }
}

/// Drives the transport through a full arrangement pass in real time.
#[derive(Debug, Clone, Default)]
pub struct ArrangementScheduler {
    config: ScheduleConfig,
    cancel: CancelToken,
}

impl ArrangementScheduler {
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(config: ScheduleConfig, cancel: CancelToken) -> Self {
        Self { config, cancel }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Loads and times a schema without touching the session.
    pub fn info(&self, path: &Path) -> Result<ExecutionReport> {
        let plan = TimingPlan::from_schema(&SongSchema::load(path)?)?;
        Ok(ExecutionReport {
            song: song_label(path),
            plan,
            recorded: false,
            fired: Vec::new(),
            outcome: ExecutionOutcome::DryRun,
        })
    }

    /// Executes the schema at `path`. Loading and timing happen before the
    /// session lock is taken, so a bad file never mutates the transport.
    pub fn execute<D: Transport>(
        &self,
        path: &Path,
        options: ExecuteOptions,
        session: &SessionHandle<D>,
    ) -> Result<ExecutionReport> {
        let mut report = self.info(path)?;
        if options.dry_run {
            return Ok(report);
        }
        report.recorded = options.record;

        let mut driver = session.lock()?;
        tracing::info!(
            song = %report.song,
            sections = report.plan.len(),
            seconds = report.plan.total_seconds(),
            record = options.record,
            "executing arrangement"
        );

        match self.perform(&report.plan, options.record, &mut *driver, &mut report.fired) {
            Ok(outcome) => {
                if let Err(err) = self.finalize(&mut *driver, options.record) {
                    cleanup(&mut *driver, options.record);
                    return Err(err);
                }
                report.outcome = outcome;
                tracing::info!(?outcome, "arrangement pass finished");
                Ok(report)
            }
            Err(err) => {
                tracing::warn!(%err, "arrangement pass failed, cleaning up");
                cleanup(&mut *driver, options.record);
                Err(err)
            }
        }
    }

    fn perform<D: Transport + ?Sized>(
        &self,
        plan: &TimingPlan,
        record: bool,
        driver: &mut D,
        fired: &mut Vec<usize>,
    ) -> Result<ExecutionOutcome> {
        let ts = plan.time_signature;
        issue(driver, TransportCommand::SetTempo(plan.tempo), "configuring")?;
        issue(
            driver,
            TransportCommand::SetTimeSignature {
                numerator: ts.numerator,
                denominator: ts.denominator,
            },
            "configuring",
        )?;
        issue(driver, TransportCommand::SetPosition(0.0), "configuring")?;

        if record {
            issue(driver, TransportCommand::SetRecordMode(true), "arming record")?;
        }

        let mut last_completed = None;
        for (i, segment) in plan.segments.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(ExecutionOutcome::Cancelled { last_completed });
            }
            let context = format!("segment {i} ({})", segment.name);
            tracing::info!(
                segment = i,
                scene = segment.scene_index,
                name = %segment.name,
                seconds = segment.duration_seconds,
                "firing scene"
            );
            issue(driver, TransportCommand::FireScene(segment.scene_index), context.as_str())?;
            fired.push(segment.scene_index);

            if i == 0 {
                if !self.pause(self.config.playback_settle())? {
                    return Ok(ExecutionOutcome::Cancelled { last_completed });
                }
                issue(driver, TransportCommand::StartPlayback, context.as_str())?;
            }

            if !self.pause(wall_duration(segment.duration_seconds)?)? {
                return Ok(ExecutionOutcome::Cancelled { last_completed });
            }
            last_completed = Some(i);
        }
        Ok(ExecutionOutcome::Completed)
    }

    fn finalize<D: Transport + ?Sized>(&self, driver: &mut D, record: bool) -> Result<()> {
        issue(driver, TransportCommand::StopPlayback, "finalizing")?;
        if record {
            issue(driver, TransportCommand::SetRecordMode(false), "finalizing")?;
        }
        Ok(())
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` when
    /// cancelled.
    fn pause(&self, duration: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(duration).ok_or_else(|| {
            LivectlError::config(format!("cannot wait {duration:?} from now"))
        })?;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(true);
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

/// Best-effort stop after a failure; errors are logged, not raised.
fn cleanup<D: Transport + ?Sized>(driver: &mut D, record: bool) {
    if let Err(err) = driver.stop_playback() {
        tracing::warn!(%err, "cleanup: stop_playback failed");
    }
    if record {
        if let Err(err) = driver.set_record_mode(false) {
            tracing::warn!(%err, "cleanup: disabling record mode failed");
        }
    }
}

fn song_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
