use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use loopgrid_shared::{Composition, TrackId};

use crate::assets::{AssetCache, PreloadReport, SampleSource};
use crate::backend::AudioBackend;
use crate::commands::EngineCommand;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::export;
use crate::mix::MixGraph;
use crate::preview::PreviewPlayer;
use crate::scheduler::LoopScheduler;
use crate::store::CompositionStore;
use crate::transport::Transport;
use crate::transpose;

/// What a UI needs each frame to draw the playhead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackStatus {
    pub playing: bool,
    pub position: f64,
    pub total: f64,
    /// `position / total`, in `0..1`.
    pub progress: f64,
}

/// Playback and export engine for one composition. Owned by a single control
/// thread; the backend does the rendering.
pub struct LoopEngine<B: AudioBackend> {
    config: EngineConfig,
    backend: B,
    assets: Arc<AssetCache>,
    transport: Transport,
    mix: MixGraph,
    scheduler: LoopScheduler,
    preview: PreviewPlayer,
    composition: Arc<Composition>,
    store: Option<Arc<CompositionStore>>,
    updates: Option<Receiver<Arc<Composition>>>,
}

impl<B: AudioBackend> LoopEngine<B> {
    pub fn new(backend: B, source: Arc<dyn SampleSource>, config: EngineConfig) -> Self {
        let assets = Arc::new(AssetCache::new(source, backend.sample_rate()));
        let composition = Arc::new(Composition::default());
        Self {
            transport: Transport::new(composition.total_duration()),
            mix: MixGraph::new(config.gain_smoothing_secs),
            scheduler: LoopScheduler::new(),
            preview: PreviewPlayer::new(),
            config,
            backend,
            assets,
            composition,
            store: None,
            updates: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn assets(&self) -> &Arc<AssetCache> {
        &self.assets
    }

    pub fn composition(&self) -> &Arc<Composition> {
        &self.composition
    }

    pub fn sample_rate(&self) -> u32 {
        self.backend.sample_rate()
    }

    pub fn is_playing(&self) -> bool {
        self.transport.is_playing()
    }

    /// Loop position in seconds. Lock-free; safe to call every frame.
    pub fn position(&self) -> f64 {
        self.transport.position(self.backend.now())
    }

    pub fn total_duration(&self) -> f64 {
        self.composition.total_duration()
    }

    // --- transport ---

    /// Starts playback from the current position. Does nothing while playing or
    /// when no sample is placed. A device failure leaves the engine stopped; the
    /// next call tries again.
    pub fn play(&mut self) -> Result<()> {
        if self.composition.is_empty() {
            debug!("play ignored: nothing placed");
            return Ok(());
        }
        self.backend.resume()?;
        if self.transport.start(self.backend.now()) {
            info!(position = self.position(), "playback started");
            self.reschedule();
        }
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.transport.pause(self.backend.now()) {
            self.scheduler.cancel(&mut self.backend);
            debug!(position = self.position(), "playback paused");
        }
    }

    pub fn stop(&mut self) {
        self.pause();
        self.transport.seek(self.backend.now(), 0.0);
    }

    pub fn seek(&mut self, seconds: f64) {
        if self.composition.is_empty() {
            return;
        }
        self.transport.seek(self.backend.now(), seconds);
        if self.transport.is_playing() {
            self.reschedule();
        }
    }

    fn reschedule(&mut self) {
        let transposer = transpose::for_mode(self.config.transposition);
        self.scheduler.reschedule(
            &self.composition,
            &self.transport,
            &self.mix,
            &self.assets,
            transposer,
            &mut self.backend,
        );
    }

    // --- mixing ---

    /// Ramps a track's bus to `volume` and records it in the attached store, so
    /// later snapshots carry it. Returns `false` for an unknown track.
    pub fn set_track_volume(&mut self, track: TrackId, volume: f32) -> bool {
        if !self.mix.set_volume(track, volume, &mut self.backend) {
            return false;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.update(|c| c.set_volume(track, volume)) {
                warn!(track = %track, error = %e, "volume not recorded in store");
            }
        }
        // keep the local snapshot in step so the next sync does not ramp back
        let composition = Arc::make_mut(&mut self.composition);
        if let Ok(t) = composition.track_mut(track) {
            t.volume = volume.clamp(0.0, 1.0);
        }
        true
    }

    // --- composition ---

    /// Installs a new snapshot: buses are reconciled, and if playback is running
    /// and anything besides volume changed, the loop is rescheduled. A snapshot
    /// that fails validation is ignored and the current one stays in place.
    pub fn apply(&mut self, composition: Arc<Composition>) {
        if let Err(e) = composition.validate() {
            warn!(error = %e, "composition rejected");
            return;
        }
        let rearranged = !self.composition.same_arrangement(&composition);
        self.composition = composition;
        self.transport.set_total(self.composition.total_duration());
        self.mix.sync(&self.composition, &mut self.backend);

        if rearranged {
            self.preload_in_background();
            if self.transport.is_playing() {
                if self.composition.is_empty() {
                    self.pause();
                    self.transport.seek(self.backend.now(), 0.0);
                } else {
                    self.reschedule();
                }
            }
        }
    }

    /// Follows `store`: applies its current snapshot now and every later one on
    /// `poll`. Volume changes made through the engine are written back to it.
    pub fn attach(&mut self, store: &Arc<CompositionStore>) {
        self.updates = Some(store.subscribe());
        self.store = Some(store.clone());
        self.apply(store.snapshot());
    }

    fn references(&self) -> BTreeSet<String> {
        self.composition
            .tracks
            .iter()
            .flat_map(|t| t.placements().map(|(_, s)| s.source.clone()))
            .collect()
    }

    /// Decodes every referenced sample, waiting at most the configured timeout per asset.
    pub fn preload(&self) -> PreloadReport {
        self.assets.preload(self.references(), self.config.preload_timeout())
    }

    fn preload_in_background(&self) {
        let missing: Vec<String> = self
            .references()
            .into_iter()
            .filter(|r| self.assets.cached(r).is_none())
            .collect();
        if missing.is_empty() {
            return;
        }
        let assets = self.assets.clone();
        let timeout = self.config.preload_timeout();
        let spawned = std::thread::Builder::new()
            .name("loopgrid-preload".to_string())
            .spawn(move || {
                let report = assets.preload(missing, timeout);
                debug!(loaded = report.loaded.len(), failed = report.failed.len(), "background preload done");
            });
        if let Err(e) = spawned {
            warn!(error = %e, "could not start preload thread");
        }
    }

    // --- preview ---

    /// Auditions a sample outside the timeline; a second call with the same
    /// reference stops it. Returns whether a preview is now playing.
    pub fn preview_sample(&mut self, reference: &str) -> Result<bool> {
        self.backend.resume()?;
        self.preview.toggle(reference, &self.assets, &mut self.backend)
    }

    pub fn stop_preview(&mut self) {
        self.preview.stop(&mut self.backend);
    }

    pub fn previewing(&self) -> Option<&str> {
        self.preview.current()
    }

    // --- export ---

    /// Renders one loop offline and returns the WAV bytes.
    pub fn export(&self) -> Result<Vec<u8>> {
        let transposer = transpose::for_mode(self.config.export_transposition());
        let rendered = export::render_offline(
            &self.composition,
            &self.assets,
            transposer,
            self.config.export.mix,
            self.backend.sample_rate(),
            self.config.block_frames,
        )?;
        let bytes = export::encode_wav(&rendered.samples, rendered.sample_rate)?;
        info!(
            frames = rendered.frames(),
            skipped = rendered.skipped,
            bytes = bytes.len(),
            "export rendered"
        );
        Ok(bytes)
    }

    /// Exports into `dir` under `name` (or the configured default), adding `.wav`
    /// when missing. Nothing is written if the export fails.
    pub fn export_to_file(&self, dir: &Path, name: Option<&str>) -> Result<PathBuf> {
        let bytes = self.export()?;
        let name = name.unwrap_or(&self.config.export.default_file_name);
        export::write_export(dir, name, &bytes)
    }

    // --- polling ---

    /// Call once per display frame: picks up composition changes, handles ended
    /// previews, and restarts the loop when the position has run past the end.
    pub fn poll(&mut self) -> PlaybackStatus {
        if let Some(latest) = self.updates.as_ref().and_then(|rx| rx.try_iter().last()) {
            self.apply(latest);
        }

        for event in self.backend.drain_events() {
            self.preview.on_event(event);
        }

        if self.transport.is_playing() {
            let now = self.backend.now();
            let total = self.transport.total();
            let raw = self.transport.raw_elapsed(now);
            if total > 0.0 && raw >= total {
                let overshoot = (raw - total).rem_euclid(total);
                self.transport.rebase(now, overshoot);
                debug!(overshoot, "loop wrapped");
                self.reschedule();
            }
        }

        self.status()
    }

    pub fn status(&self) -> PlaybackStatus {
        let position = self.position();
        let total = self.total_duration();
        PlaybackStatus {
            playing: self.is_playing(),
            position,
            total,
            progress: if total > 0.0 { (position / total).clamp(0.0, 1.0) } else { 0.0 },
        }
    }

    pub fn handle(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Play => {
                if let Err(e) = self.play() {
                    warn!(error = %e, "play failed");
                }
            }
            EngineCommand::Pause => self.pause(),
            EngineCommand::Stop => self.stop(),
            EngineCommand::Seek(seconds) => self.seek(seconds),
            EngineCommand::SetTrackVolume { track, volume } => {
                if !self.set_track_volume(track, volume) {
                    warn!(track = %track, "volume change for unknown track");
                }
            }
            EngineCommand::Preview(reference) => {
                if let Err(e) = self.preview_sample(&reference) {
                    warn!(reference = %reference, error = %e, "preview failed");
                }
            }
            EngineCommand::StopPreview => self.stop_preview(),
            EngineCommand::Apply(composition) => self.apply(composition),
            EngineCommand::Export { response_tx } => {
                let _ = response_tx.send(self.export());
            }
            EngineCommand::ExportToFile { dir, name, response_tx } => {
                let _ = response_tx.send(self.export_to_file(&dir, name.as_deref()));
            }
            EngineCommand::GetStatus(response_tx) => {
                let _ = response_tx.send(self.status());
            }
        }
    }
}
