//! Song-structure documents: tempo, time signature and an ordered list of
//! sections, each of which maps onto one scene slot in the session.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{LivectlError, Result};

pub const DEFAULT_TEMPO: f64 = 120.0;
pub const DEFAULT_BARS: u32 = 4;
const DEFAULT_BEAT_UNIT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub numerator: u32,
    pub denominator: u32,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: DEFAULT_BEAT_UNIT,
            denominator: DEFAULT_BEAT_UNIT,
        }
    }
}

impl std::fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub bars: u32,
}

/// Validated song description. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongSchema {
    pub tempo: f64,
    pub time_signature: TimeSignature,
    pub sections: Vec<Section>,
}

impl SongSchema {
    /// Reads and validates a schema file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LivectlError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let raw = std::fs::read_to_string(path)?;
        let doc: RawSong =
            serde_json::from_str(&raw).map_err(|source| LivectlError::InvalidSchema {
                path: path.to_path_buf(),
                source,
            })?;
        let schema = Self::from_raw(doc)?;
        tracing::debug!(
            path = %path.display(),
            sections = schema.sections.len(),
            tempo = schema.tempo,
            "loaded song schema"
        );
        Ok(schema)
    }

    /// Parses and validates a schema held in memory.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: RawSong = serde_json::from_str(json).map_err(|source| {
            LivectlError::InvalidSchema {
                path: "<inline>".into(),
                source,
            }
        })?;
        Self::from_raw(doc)
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.time_signature.numerator
    }

    fn from_raw(doc: RawSong) -> Result<Self> {
        let tempo = doc.metadata.tempo.unwrap_or(DEFAULT_TEMPO);
        if !tempo.is_finite() || tempo <= 0.0 {
            return Err(LivectlError::config(format!(
                "tempo must be a positive number of beats per minute, got {tempo}"
            )));
        }

        let ts = doc.metadata.time_signature;
        let time_signature = TimeSignature {
            numerator: positive_or_default(ts.numerator, "numerator")?,
            denominator: positive_or_default(ts.denominator, "denominator")?,
        };

        let sections = doc
            .structure
            .sections
            .into_iter()
            .enumerate()
            .map(|(index, section)| {
                Ok(Section {
                    bars: coerce_bars(index, section.bars)?,
                    name: section.name.unwrap_or_else(|| format!("section_{index}")),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tempo,
            time_signature,
            sections,
        })
    }
}

fn positive_or_default(value: Option<i64>, field: &str) -> Result<u32> {
    match value {
        None => Ok(DEFAULT_BEAT_UNIT),
        Some(v) if v > 0 => u32::try_from(v)
            .map_err(|_| LivectlError::config(format!("time signature {field} {v} is too large"))),
        Some(v) => Err(LivectlError::config(format!(
            "time signature {field} must be positive, got {v}"
        ))),
    }
}

/// Missing, zero and negative bar counts all become [`DEFAULT_BARS`]; counts
/// beyond `u32::MAX` are rejected.
fn coerce_bars(index: usize, bars: Option<i64>) -> Result<u32> {
    match bars {
        Some(b) if b > 0 => u32::try_from(b).map_err(|_| {
            LivectlError::config(format!("section {index}: bar count {b} is too large"))
        }),
        Some(b) => {
            tracing::warn!(section = index, bars = b, "non-positive bar count, using default");
            Ok(DEFAULT_BARS)
        }
        None => Ok(DEFAULT_BARS),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSong {
    #[serde(default)]
    metadata: RawMetadata,
    #[serde(default)]
    structure: RawStructure,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    tempo: Option<f64>,
    #[serde(default)]
    time_signature: RawTimeSignature,
}

#[derive(Debug, Default, Deserialize)]
struct RawTimeSignature {
    numerator: Option<i64>,
    denominator: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStructure {
    #[serde(default)]
    sections: Vec<RawSection>,
}

#[derive(Debug, Deserialize)]
struct RawSection {
    name: Option<String>,
    bars: Option<i64>,
}
