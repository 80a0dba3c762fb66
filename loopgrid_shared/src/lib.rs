pub mod key;
pub mod project;

pub use key::{semitone_shift, MusicalKey};
pub use project::{Composition, InstanceId, SampleKind, SampleRef, Track, TrackId};

use thiserror::Error;

/// Default tempo of a new composition.
pub const DEFAULT_BPM: f64 = 90.0;
/// One slot is one 4/4 measure.
pub const DEFAULT_BEATS_PER_SLOT: f64 = 4.0;
/// Grid width of a new composition.
pub const DEFAULT_SLOTS: usize = 16;

/// Rejected edits to a composition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EditError {
    #[error("unknown track {0}")]
    UnknownTrack(TrackId),

    #[error("no placement with instance id {0}")]
    UnknownInstance(InstanceId),

    #[error("sample '{0}' has zero length")]
    ZeroLength(String),

    #[error("placement at slot {slot} with length {duration} exceeds the {num_slots}-slot grid")]
    OutOfGrid {
        slot: usize,
        duration: usize,
        num_slots: usize,
    },

    #[error("placement at slot {slot} overlaps the sample starting at slot {existing}")]
    Overlap { slot: usize, existing: usize },

    #[error("tempo {bpm} BPM with {beats_per_slot} beats per slot does not give a positive slot length")]
    InvalidTempo { bpm: f64, beats_per_slot: f64 },

    #[error("placement at slot {slot} has offset {offset}, expected a fraction in [0, 1)")]
    InvalidOffset { slot: usize, offset: f64 },
}

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("invalid key tag '{0}'")]
    Invalid(String),
}

/// Project file load/save failures.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid project: {0}")]
    Invalid(#[from] EditError),
}
