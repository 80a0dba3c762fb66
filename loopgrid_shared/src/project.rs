use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

use crate::{key, EditError, PersistError, DEFAULT_BEATS_PER_SLOT, DEFAULT_BPM, DEFAULT_SLOTS};

/// Distinguishes two placements of the same source sample.
pub type InstanceId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub Uuid);

impl TrackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleKind {
    #[default]
    Drums,
    Bass,
    Melody,
    Fills,
    Sfx,
}

impl SampleKind {
    /// Only melodic material is retuned to the project key.
    pub fn is_pitched(self) -> bool {
        matches!(self, SampleKind::Melody)
    }

    pub fn label(self) -> &'static str {
        match self {
            SampleKind::Drums => "Drums",
            SampleKind::Bass => "Bass",
            SampleKind::Melody => "Melody",
            SampleKind::Fills => "Fills",
            SampleKind::Sfx => "SFX",
        }
    }
}

/// A sample placed (or about to be placed) on the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRef {
    /// Opaque identifier the asset source resolves to bytes (URL, path, id).
    pub source: String,
    #[serde(default)]
    pub name: String,
    /// Length in whole slots.
    pub duration: usize,
    /// Fraction of a slot before the audible content begins.
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub kind: SampleKind,
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
}

impl SampleRef {
    pub fn new(source: impl Into<String>, duration: usize) -> Self {
        let source = source.into();
        Self {
            name: source.clone(),
            source,
            duration,
            offset: 0.0,
            key: None,
            kind: SampleKind::default(),
            instance_id: None,
        }
    }

    pub fn with_kind(mut self, kind: SampleKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    /// Slots covered; a stored zero is treated as one.
    pub fn span(&self) -> usize {
        self.duration.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    pub volume: f32,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub solo: bool,
    /// A placement is stored in its first slot; the slots it covers after that stay `None`.
    pub slots: Vec<Option<SampleRef>>,
}

impl Track {
    pub fn new(name: impl Into<String>, num_slots: usize) -> Self {
        Self {
            id: TrackId::new(),
            name: name.into(),
            volume: 1.0,
            muted: false,
            solo: false,
            slots: vec![None; num_slots],
        }
    }

    /// Walks the slots left to right, yielding `(slot_index, sample)` and skipping
    /// the slots covered by each placement.
    pub fn placements(&self) -> Placements<'_> {
        Placements { slots: &self.slots, index: 0 }
    }

    pub fn end_slot(&self) -> usize {
        self.placements()
            .map(|(slot, sample)| slot + sample.span())
            .max()
            .unwrap_or(0)
    }

    fn overlapping(&self, slot: usize, span: usize) -> Option<usize> {
        self.placements()
            .find(|(start, sample)| slot.max(*start) < (slot + span).min(start + sample.span()))
            .map(|(start, _)| start)
    }

    /// Same content apart from volume.
    fn same_arrangement(&self, other: &Track) -> bool {
        self.id == other.id
            && self.muted == other.muted
            && self.solo == other.solo
            && self.slots == other.slots
    }
}

pub struct Placements<'a> {
    slots: &'a [Option<SampleRef>],
    index: usize,
}

impl<'a> Iterator for Placements<'a> {
    type Item = (usize, &'a SampleRef);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.slots.len() {
            let slot = self.index;
            match &self.slots[slot] {
                Some(sample) => {
                    self.index += sample.span();
                    return Some((slot, sample));
                }
                None => self.index += 1,
            }
        }
        None
    }
}

/// The full grid the engine plays from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_bpm")]
    pub bpm: f64,
    #[serde(default = "default_beats_per_slot")]
    pub beats_per_slot: f64,
    pub num_slots: usize,
    pub tracks: Vec<Track>,
    /// Set by the first key-tagged pitched placement and never changed after.
    #[serde(default)]
    pub project_key: Option<String>,
}

fn default_name() -> String {
    "New Project".to_string()
}

fn default_bpm() -> f64 {
    DEFAULT_BPM
}

fn default_beats_per_slot() -> f64 {
    DEFAULT_BEATS_PER_SLOT
}

impl Default for Composition {
    fn default() -> Self {
        Self {
            name: default_name(),
            bpm: DEFAULT_BPM,
            beats_per_slot: DEFAULT_BEATS_PER_SLOT,
            num_slots: DEFAULT_SLOTS,
            tracks: Vec::new(),
            project_key: None,
        }
    }
}

impl Composition {
    /// Seconds per slot.
    pub fn slot_duration(&self) -> f64 {
        self.beats_per_slot * 60.0 / self.bpm
    }

    /// Furthest slot reached by any placement; 0 when nothing is placed.
    pub fn end_slot(&self) -> usize {
        self.tracks.iter().map(Track::end_slot).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.end_slot() == 0
    }

    /// Loop length in slots, never below one.
    pub fn loop_slots(&self) -> usize {
        self.end_slot().max(1)
    }

    /// Loop length in seconds.
    pub fn total_duration(&self) -> f64 {
        self.loop_slots() as f64 * self.slot_duration()
    }

    pub fn placement_count(&self) -> usize {
        self.tracks.iter().map(|t| t.placements().count()).sum()
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn track_mut(&mut self, id: TrackId) -> Result<&mut Track, EditError> {
        self.tracks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(EditError::UnknownTrack(id))
    }

    pub fn any_solo(&self) -> bool {
        self.tracks.iter().any(|t| t.solo)
    }

    /// Not muted, and either nothing is soloed or this track is.
    pub fn is_audible(&self, track: &Track) -> bool {
        !track.muted && (!self.any_solo() || track.solo)
    }

    /// Transposition in semitones for a placement, if it should be retuned at all.
    pub fn semitones_for(&self, sample: &SampleRef) -> Option<i32> {
        if !sample.kind.is_pitched() {
            return None;
        }
        let from = sample.key.as_deref()?;
        let to = self.project_key.as_deref()?;
        key::semitone_shift(from, to).ok()
    }

    /// True when both snapshots schedule the same audio; volume changes are ignored
    /// because they are applied on the gain nodes directly.
    pub fn same_arrangement(&self, other: &Composition) -> bool {
        self.bpm == other.bpm
            && self.beats_per_slot == other.beats_per_slot
            && self.project_key == other.project_key
            && self.tracks.len() == other.tracks.len()
            && self
                .tracks
                .iter()
                .zip(&other.tracks)
                .all(|(a, b)| a.same_arrangement(b))
    }

    // --- editing ---

    pub fn add_track(&mut self, name: impl Into<String>) -> TrackId {
        let track = Track::new(name, self.num_slots);
        let id = track.id;
        self.tracks.push(track);
        id
    }

    pub fn remove_track(&mut self, id: TrackId) -> Result<Track, EditError> {
        let index = self
            .tracks
            .iter()
            .position(|t| t.id == id)
            .ok_or(EditError::UnknownTrack(id))?;
        Ok(self.tracks.remove(index))
    }

    pub fn rename_track(&mut self, id: TrackId, name: impl Into<String>) -> Result<(), EditError> {
        self.track_mut(id)?.name = name.into();
        Ok(())
    }

    /// Grows the grid on every track.
    pub fn add_slots(&mut self, amount: usize) {
        self.num_slots += amount;
        for track in &mut self.tracks {
            track.slots.resize(self.num_slots, None);
        }
    }

    /// Places a new instance of `sample` and returns its instance id.
    pub fn place_sample(
        &mut self,
        track_id: TrackId,
        slot: usize,
        sample: SampleRef,
    ) -> Result<InstanceId, EditError> {
        if sample.duration == 0 {
            return Err(EditError::ZeroLength(sample.source));
        }
        if !valid_offset(sample.offset) {
            return Err(EditError::InvalidOffset { slot, offset: sample.offset });
        }
        let num_slots = self.num_slots;
        if slot + sample.duration > num_slots {
            return Err(EditError::OutOfGrid {
                slot,
                duration: sample.duration,
                num_slots,
            });
        }

        let track = self.track_mut(track_id)?;
        if let Some(existing) = track.overlapping(slot, sample.duration) {
            return Err(EditError::Overlap { slot, existing });
        }
        if track.slots.len() < num_slots {
            track.slots.resize(num_slots, None);
        }

        let instance = Uuid::new_v4();
        let lock_key = sample.kind.is_pitched() && sample.key.is_some();
        let key = sample.key.clone();
        track.slots[slot] = Some(SampleRef {
            instance_id: Some(instance),
            ..sample
        });

        // One-shot: later key-tagged samples are retuned to this key instead.
        if lock_key && self.project_key.is_none() {
            self.project_key = key;
        }
        Ok(instance)
    }

    /// Dropping into empty space creates a track for the sample.
    pub fn place_on_new_track(
        &mut self,
        slot: usize,
        sample: SampleRef,
    ) -> Result<(TrackId, InstanceId), EditError> {
        let name = format!("{} {}", sample.kind.label(), self.tracks.len() + 1);
        let id = self.add_track(name);
        match self.place_sample(id, slot, sample) {
            Ok(instance) => Ok((id, instance)),
            Err(e) => {
                self.tracks.retain(|t| t.id != id);
                Err(e)
            }
        }
    }

    pub fn clear_instance(
        &mut self,
        track_id: TrackId,
        instance: InstanceId,
    ) -> Result<SampleRef, EditError> {
        let track = self.track_mut(track_id)?;
        let slot = track
            .slots
            .iter()
            .position(|s| s.as_ref().and_then(|s| s.instance_id) == Some(instance))
            .ok_or(EditError::UnknownInstance(instance))?;
        track.slots[slot].take().ok_or(EditError::UnknownInstance(instance))
    }

    pub fn set_volume(&mut self, id: TrackId, volume: f32) -> Result<(), EditError> {
        self.track_mut(id)?.volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    /// Muting a soloed track also drops its solo.
    pub fn toggle_mute(&mut self, id: TrackId) -> Result<bool, EditError> {
        let track = self.track_mut(id)?;
        track.muted = !track.muted;
        if track.muted {
            track.solo = false;
        }
        Ok(track.muted)
    }

    /// At most one track is soloed; soloing also unmutes it.
    pub fn toggle_solo(&mut self, id: TrackId) -> Result<bool, EditError> {
        let soloed = !self.track_mut(id)?.solo;
        for track in &mut self.tracks {
            if track.id == id {
                track.solo = soloed;
                if soloed {
                    track.muted = false;
                }
            } else if soloed {
                track.solo = false;
            }
        }
        Ok(soloed)
    }

    /// Checks what the editing methods cannot guard on their own: the tempo
    /// fields and the offsets of placements that came in through a file.
    pub fn validate(&self) -> Result<(), EditError> {
        let slot = self.slot_duration();
        if !(self.bpm.is_finite() && self.bpm > 0.0)
            || !(self.beats_per_slot.is_finite() && self.beats_per_slot > 0.0)
            || !(slot.is_finite() && slot > 0.0)
        {
            return Err(EditError::InvalidTempo {
                bpm: self.bpm,
                beats_per_slot: self.beats_per_slot,
            });
        }
        for track in &self.tracks {
            if let Some((slot, sample)) = track.placements().find(|(_, s)| !valid_offset(s.offset)) {
                return Err(EditError::InvalidOffset { slot, offset: sample.offset });
            }
        }
        Ok(())
    }

    // --- persistence ---

    pub fn from_json(json: &str) -> Result<Self, PersistError> {
        let composition: Self = serde_json::from_str(json)?;
        composition.validate()?;
        Ok(composition)
    }

    pub fn load_json(path: &Path) -> Result<Self, PersistError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn save_json(&self, path: &Path) -> Result<(), PersistError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn valid_offset(offset: f64) -> bool {
    (0.0..1.0).contains(&offset)
}
