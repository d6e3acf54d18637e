use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::schema::{SongSchema, TimeSignature};
use crate::{LivectlError, Result};

/// Converts a beat count into seconds at the given tempo.
pub fn beats_to_seconds(beats: f64, tempo: f64) -> Result<f64> {
    check_tempo(tempo)?;
    Ok(beats * 60.0 / tempo)
}

/// Inverse of [`beats_to_seconds`].
pub fn seconds_to_beats(seconds: f64, tempo: f64) -> Result<f64> {
    check_tempo(tempo)?;
    Ok(seconds * tempo / 60.0)
}

fn check_tempo(tempo: f64) -> Result<()> {
    if tempo.is_finite() && tempo > 0.0 {
        Ok(())
    } else {
        Err(LivectlError::config(format!(
            "tempo must be greater than zero, got {tempo}"
        )))
    }
}

/// Converts seconds into a wall-clock `Duration` that can be waited on from
/// now. Negative, non-finite and unrepresentable lengths are rejected.
pub fn wall_duration(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .ok()
        .filter(|duration| Instant::now().checked_add(*duration).is_some())
        .ok_or_else(|| {
            LivectlError::config(format!("{seconds} seconds is not a usable duration"))
        })
}

/// One section placed on the song timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionTiming {
    pub name: String,
    pub scene_index: usize,
    pub start_beat: f64,
    pub duration_beats: f64,
    pub duration_seconds: f64,
    pub bars: u32,
}

/// Contiguous, gapless sequence of [`SectionTiming`]s starting at beat 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingPlan {
    pub tempo: f64,
    pub time_signature: TimeSignature,
    pub segments: Vec<SectionTiming>,
}

impl TimingPlan {
    /// Lays the schema's sections end to end.
    pub fn from_schema(schema: &SongSchema) -> Result<Self> {
        let beats_per_bar = f64::from(schema.beats_per_bar());
        let mut current_beat = 0.0;
        let mut segments = Vec::with_capacity(schema.sections.len());

        for (scene_index, section) in schema.sections.iter().enumerate() {
            let duration_beats = f64::from(section.bars) * beats_per_bar;
            let duration_seconds = beats_to_seconds(duration_beats, schema.tempo)?;
            wall_duration(duration_seconds).map_err(|err| {
                LivectlError::config(format!("section {scene_index} ({}): {err}", section.name))
            })?;
            segments.push(SectionTiming {
                name: section.name.clone(),
                scene_index,
                start_beat: current_beat,
                duration_beats,
                duration_seconds,
                bars: section.bars,
            });
            current_beat += duration_beats;
        }

        Ok(Self {
            tempo: schema.tempo,
            time_signature: schema.time_signature,
            segments,
        })
    }

    pub fn total_beats(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_beats).sum()
    }

    pub fn total_seconds(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_seconds).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }
}
