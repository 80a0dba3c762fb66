use std::collections::{HashMap, HashSet};

use tracing::debug;

use loopgrid_shared::{Composition, TrackId};

use crate::backend::AudioBackend;
use crate::graph::GraphCommand;

/// Keeps one gain bus per track in the render graph, reconciled against each
/// new composition.
pub struct MixGraph {
    /// Last volume sent for each track with a bus.
    buses: HashMap<TrackId, f32>,
    smoothing_secs: f64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<TrackId>,
    pub removed: Vec<TrackId>,
}

impl MixGraph {
    pub fn new(smoothing_secs: f64) -> Self {
        Self { buses: HashMap::new(), smoothing_secs }
    }

    pub fn contains(&self, track: TrackId) -> bool {
        self.buses.contains_key(&track)
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    pub fn volume(&self, track: TrackId) -> Option<f32> {
        self.buses.get(&track).copied()
    }

    /// Creates buses for new tracks, drops buses of removed tracks, and ramps any
    /// volume that changed.
    pub fn sync(&mut self, composition: &Composition, backend: &mut dyn AudioBackend) -> SyncReport {
        let mut report = SyncReport::default();
        let current: HashSet<TrackId> = composition.tracks.iter().map(|t| t.id).collect();

        for track in &composition.tracks {
            match self.buses.get(&track.id).copied() {
                None => {
                    backend.send(GraphCommand::AddBus { track: track.id, gain: track.volume });
                    self.buses.insert(track.id, track.volume);
                    report.added.push(track.id);
                }
                Some(volume) if volume != track.volume => {
                    self.ramp(track.id, track.volume, backend);
                }
                Some(_) => {}
            }
        }

        let stale: Vec<TrackId> = self
            .buses
            .keys()
            .filter(|id| !current.contains(id))
            .copied()
            .collect();
        for id in stale {
            backend.send(GraphCommand::RemoveBus { track: id });
            self.buses.remove(&id);
            report.removed.push(id);
        }

        if !report.added.is_empty() || !report.removed.is_empty() {
            debug!(added = report.added.len(), removed = report.removed.len(), "mix graph synced");
        }
        report
    }

    /// Smoothly moves a bus to `volume`. Returns `false` for a track without a bus.
    pub fn set_volume(&mut self, track: TrackId, volume: f32, backend: &mut dyn AudioBackend) -> bool {
        if !self.buses.contains_key(&track) {
            return false;
        }
        self.ramp(track, volume.clamp(0.0, 1.0), backend);
        true
    }

    fn ramp(&mut self, track: TrackId, volume: f32, backend: &mut dyn AudioBackend) {
        backend.send(GraphCommand::RampGain {
            track,
            target: volume,
            time_constant: self.smoothing_secs,
        });
        self.buses.insert(track, volume);
    }
}
