//! Turns a composition and a loop position into time-stamped voices.
//!
//! Every pass is recomputed from scratch: all voices from the previous pass are
//! stopped, then whatever still has to sound before the loop wraps is started
//! again from the current position.

use loopgrid_shared::{Composition, SampleRef, Track};
use tracing::{debug, warn};

use crate::assets::AssetCache;
use crate::backend::AudioBackend;
use crate::error::Result;
use crate::graph::GraphCommand;
use crate::mix::MixGraph;
use crate::nodes::{Output, VoiceId, VoiceSpec};
use crate::transport::Transport;
use crate::transpose::{Off, Transposed, Transposer};

/// Where a placement sits relative to the loop position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timing {
    /// Starts `delay` seconds from now and plays from its beginning.
    Future { delay: f64 },
    /// Already sounding: play now from `offset` seconds in, for `remaining` seconds.
    InProgress { offset: f64, remaining: f64 },
    /// Finished for this pass of the loop.
    Past,
}

pub fn classify(sample_start: f64, sample_end: f64, elapsed: f64) -> Timing {
    if sample_start >= elapsed {
        Timing::Future { delay: sample_start - elapsed }
    } else if elapsed < sample_end {
        Timing::InProgress {
            offset: elapsed - sample_start,
            remaining: sample_end - elapsed,
        }
    } else {
        Timing::Past
    }
}

/// One sample instance on the timeline, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct Placement<'a> {
    pub track: &'a Track,
    pub slot: usize,
    pub sample: &'a SampleRef,
    pub start: f64,
    pub end: f64,
}

/// Every placement of `track`, left to right.
pub fn track_placements<'a>(
    composition: &Composition,
    track: &'a Track,
) -> impl Iterator<Item = Placement<'a>> {
    let slot_duration = composition.slot_duration();
    track.placements().map(move |(slot, sample)| {
        let start = (slot as f64 + sample.offset) * slot_duration;
        Placement {
            track,
            slot,
            sample,
            start,
            end: start + sample.span() as f64 * slot_duration,
        }
    })
}

/// Decoded audio and playback rate for a placement, retuned to the project key
/// when the sample is pitched and both keys are known.
pub fn resolve(
    composition: &Composition,
    sample: &SampleRef,
    assets: &AssetCache,
    transposer: &dyn Transposer,
) -> Result<Transposed> {
    match composition.semitones_for(sample) {
        Some(semitones) if semitones != 0 => transposer.transpose(assets, &sample.source, semitones),
        _ => Off.transpose(assets, &sample.source, 0),
    }
}

/// Voice for a placement whose timing has been classified against `now_frame`.
pub fn voice_for(
    audio: &Transposed,
    placement: &Placement<'_>,
    timing: Timing,
    now_frame: u64,
    sample_rate: u32,
    output: Output,
) -> Option<VoiceSpec> {
    let sr = sample_rate as f64;
    let source_sr = audio.buffer.sample_rate as f64;
    let (start_frame, source_offset, seconds) = match timing {
        Timing::Future { delay } => (
            now_frame + (delay * sr).round() as u64,
            0.0,
            placement.end - placement.start,
        ),
        Timing::InProgress { offset, remaining } => {
            (now_frame, offset * source_sr * audio.rate, remaining)
        }
        Timing::Past => return None,
    };
    Some(VoiceSpec {
        id: VoiceId::next(),
        buffer: audio.buffer.clone(),
        output,
        start_frame,
        source_offset,
        rate: audio.rate,
        length: (seconds * sr).round() as u64,
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleReport {
    pub started: usize,
    pub skipped: usize,
}

/// Owns the voices of the current loop pass.
#[derive(Default)]
pub struct LoopScheduler {
    live: Vec<VoiceId>,
}

impl LoopScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_voices(&self) -> &[VoiceId] {
        &self.live
    }

    /// Stops every voice this scheduler started.
    pub fn cancel(&mut self, backend: &mut dyn AudioBackend) {
        if !self.live.is_empty() {
            backend.send(GraphCommand::StopVoices(std::mem::take(&mut self.live)));
        }
    }

    /// Cancels the previous pass and schedules everything audible from the current
    /// position to the end of the loop. Placements whose audio cannot be resolved
    /// are logged and left silent.
    ///
    /// Audio is resolved before the clock is read, so a decode that blocks here
    /// delays the whole pass instead of putting the voices behind the transport.
    pub fn reschedule(
        &mut self,
        composition: &Composition,
        transport: &Transport,
        mix: &MixGraph,
        assets: &AssetCache,
        transposer: &dyn Transposer,
        backend: &mut dyn AudioBackend,
    ) -> ScheduleReport {
        let mut report = ScheduleReport::default();

        // Anything already past at the first read stays past for the rest of this pass.
        let first_look = transport.position(backend.now());
        let mut resolved = Vec::new();
        for track in composition.tracks.iter().filter(|t| composition.is_audible(t)) {
            if !mix.contains(track.id) {
                continue;
            }
            for placement in track_placements(composition, track) {
                if classify(placement.start, placement.end, first_look) == Timing::Past {
                    continue;
                }
                match resolve(composition, placement.sample, assets, transposer) {
                    Ok(audio) => resolved.push((placement, audio)),
                    Err(e) => {
                        warn!(track = %track.id, slot = placement.slot, error = %e, "skipping placement");
                        report.skipped += 1;
                    }
                }
            }
        }

        self.cancel(backend);
        let now_frame = backend.frame();
        let sample_rate = backend.sample_rate();
        let elapsed = transport.position(now_frame as f64 / sample_rate as f64);

        let mut voices = Vec::with_capacity(resolved.len());
        for (placement, audio) in &resolved {
            let timing = classify(placement.start, placement.end, elapsed);
            if let Some(spec) = voice_for(
                audio,
                placement,
                timing,
                now_frame,
                sample_rate,
                Output::Bus(placement.track.id),
            ) {
                self.live.push(spec.id);
                voices.push(spec);
            }
        }
        report.started = voices.len();
        if !voices.is_empty() {
            backend.send(GraphCommand::StartVoices(voices));
        }

        debug!(elapsed, voices = report.started, skipped = report.skipped, "scheduled loop pass");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{MemorySource, SampleSource};
    use crate::backend::ManualBackend;
    use crate::testing::dc_wav;
    use crate::transpose::Detune;
    use loopgrid_shared::{SampleKind, TrackId};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    const SR: u32 = 1000;

    #[test]
    fn classification_of_a_two_second_slot() {
        // slot 0, one slot long, slot duration 2.0 s
        assert_eq!(classify(0.0, 2.0, 0.0), Timing::Future { delay: 0.0 });
        assert_eq!(
            classify(0.0, 2.0, 1.0),
            Timing::InProgress { offset: 1.0, remaining: 1.0 }
        );
        assert_eq!(classify(0.0, 2.0, 2.0), Timing::Past);
        assert_eq!(classify(4.0, 6.0, 1.0), Timing::Future { delay: 3.0 });
    }

    /// Paused transport parked at `elapsed`.
    fn at(elapsed: f64) -> Transport {
        let transport = Transport::new(16.0);
        transport.seek(0.0, elapsed);
        transport
    }

    struct Fixture {
        comp: Composition,
        backend: ManualBackend,
        mix: MixGraph,
        assets: AssetCache,
        a: TrackId,
        b: TrackId,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(MemorySource::new());
        source.insert("a.wav", dc_wav(4000, 1, SR, 0.5));
        source.insert("b.wav", dc_wav(4000, 1, SR, 0.25));

        // 120 BPM, 4 beats per slot: 2.0 s slots
        let mut comp = Composition { bpm: 120.0, ..Composition::default() };
        let a = comp.add_track("a");
        let b = comp.add_track("b");
        comp.place_sample(a, 0, SampleRef::new("a.wav", 1)).unwrap();
        comp.place_sample(b, 1, SampleRef::new("b.wav", 1)).unwrap();

        let mut backend = ManualBackend::new(SR);
        let mut mix = MixGraph::new(0.015);
        mix.sync(&comp, &mut backend);
        Fixture {
            comp,
            backend,
            mix,
            assets: AssetCache::new(source, SR),
            a,
            b,
        }
    }

    #[test]
    fn mid_sample_position_splits_current_and_future() {
        let mut f = fixture();
        let mut scheduler = LoopScheduler::new();
        let report =
            scheduler.reschedule(&f.comp, &at(1.0), &f.mix, &f.assets, &Detune, &mut f.backend);
        assert_eq!(report, ScheduleReport { started: 2, skipped: 0 });

        let voices = f.backend.graph().active_voices();
        let a = voices.iter().find(|v| v.output == Output::Bus(f.a)).unwrap();
        assert_eq!(a.start_frame, 0);
        assert_eq!(a.source_offset, 1000.0);
        assert_eq!(a.length, 1000);

        let b = voices.iter().find(|v| v.output == Output::Bus(f.b)).unwrap();
        assert_eq!(b.start_frame, 1000);
        assert_eq!(b.source_offset, 0.0);
        assert_eq!(b.length, 2000);
    }

    #[test]
    fn rescheduling_replaces_previous_pass() {
        let mut f = fixture();
        let mut scheduler = LoopScheduler::new();
        scheduler.reschedule(&f.comp, &at(0.0), &f.mix, &f.assets, &Detune, &mut f.backend);
        scheduler.reschedule(&f.comp, &at(2.5), &f.mix, &f.assets, &Detune, &mut f.backend);

        // only b is left in the loop, and only once
        let voices = f.backend.graph().active_voices();
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].output, Output::Bus(f.b));
        assert_eq!(scheduler.live_voices().len(), 1);

        scheduler.cancel(&mut f.backend);
        assert!(f.backend.graph().active_voices().is_empty());
    }

    #[test]
    fn muted_and_unsoloed_tracks_are_not_scheduled() {
        let mut f = fixture();
        let mut scheduler = LoopScheduler::new();

        f.comp.toggle_mute(f.b).unwrap();
        scheduler.reschedule(&f.comp, &at(0.0), &f.mix, &f.assets, &Detune, &mut f.backend);
        let outputs: Vec<Output> = f.backend.graph().active_voices().iter().map(|v| v.output).collect();
        assert_eq!(outputs, vec![Output::Bus(f.a)]);

        f.comp.toggle_mute(f.b).unwrap();
        f.comp.toggle_solo(f.b).unwrap();
        scheduler.reschedule(&f.comp, &at(0.0), &f.mix, &f.assets, &Detune, &mut f.backend);
        let outputs: Vec<Output> = f.backend.graph().active_voices().iter().map(|v| v.output).collect();
        assert_eq!(outputs, vec![Output::Bus(f.b)]);
    }

    #[test]
    fn missing_asset_is_skipped() {
        let mut f = fixture();
        f.comp.place_sample(f.a, 2, SampleRef::new("gone.wav", 1)).unwrap();
        let mut scheduler = LoopScheduler::new();
        let report =
            scheduler.reschedule(&f.comp, &at(0.0), &f.mix, &f.assets, &Detune, &mut f.backend);
        assert_eq!(report, ScheduleReport { started: 2, skipped: 1 });
    }

    #[test]
    fn intra_slot_offset_delays_the_start() {
        let mut f = fixture();
        f.comp.place_sample(f.a, 2, SampleRef::new("a.wav", 1).with_offset(0.25)).unwrap();
        let mut scheduler = LoopScheduler::new();
        scheduler.reschedule(&f.comp, &at(0.0), &f.mix, &f.assets, &Detune, &mut f.backend);

        let starts: Vec<u64> = f
            .backend
            .graph()
            .active_voices()
            .iter()
            .filter(|v| v.output == Output::Bus(f.a))
            .map(|v| v.start_frame)
            .collect();
        assert_eq!(starts, vec![0, 4500]);
    }

    #[test]
    fn pitched_samples_follow_the_project_key() {
        let mut f = fixture();
        let melody = SampleRef::new("a.wav", 1).with_kind(SampleKind::Melody);
        f.comp.place_sample(f.a, 2, melody.clone().with_key("C")).unwrap();
        f.comp.place_sample(f.a, 3, melody.with_key("D")).unwrap();
        let mut scheduler = LoopScheduler::new();
        scheduler.reschedule(&f.comp, &at(0.0), &f.mix, &f.assets, &Detune, &mut f.backend);

        let mut rates: Vec<f64> = f
            .backend
            .graph()
            .active_voices()
            .iter()
            .filter(|v| v.output == Output::Bus(f.a))
            .map(|v| v.rate)
            .collect();
        rates.sort_by(f64::total_cmp);
        // a.wav plain, C plain (it set the key), D moved down two semitones
        assert_eq!(rates.len(), 3);
        assert!((rates[0] - 2f64.powf(-2.0 / 12.0)).abs() < 1e-12);
        assert_eq!(rates[1], 1.0);
        assert_eq!(rates[2], 1.0);
    }

    /// Output clock that also moves while a sample is being fetched, like a real
    /// device does during a slow decode.
    struct DriftingBackend {
        inner: ManualBackend,
        drift: Arc<AtomicU64>,
    }

    impl AudioBackend for DriftingBackend {
        fn sample_rate(&self) -> u32 {
            self.inner.sample_rate()
        }

        fn frame(&self) -> u64 {
            self.inner.frame() + self.drift.load(Ordering::SeqCst)
        }

        fn send(&mut self, cmd: GraphCommand) {
            self.inner.send(cmd);
        }

        fn resume(&mut self) -> Result<()> {
            self.inner.resume()
        }

        fn drain_events(&mut self) -> Vec<crate::graph::GraphEvent> {
            self.inner.drain_events()
        }
    }

    struct SlowFetch {
        inner: MemorySource,
        drift: Arc<AtomicU64>,
        frames: u64,
    }

    impl SampleSource for SlowFetch {
        fn fetch(&self, reference: &str) -> anyhow::Result<Vec<u8>> {
            self.drift.fetch_add(self.frames, Ordering::SeqCst);
            self.inner.fetch(reference)
        }
    }

    #[test]
    fn voices_are_stamped_after_decoding() {
        let drift = Arc::new(AtomicU64::new(0));
        let inner = MemorySource::new();
        inner.insert("pad.wav", dc_wav(8000, 1, SR, 0.5));
        let source = Arc::new(SlowFetch { inner, drift: drift.clone(), frames: 300 });
        let assets = AssetCache::new(source, SR);

        let mut comp = Composition { bpm: 120.0, ..Composition::default() };
        let t = comp.add_track("pad");
        comp.place_sample(t, 0, SampleRef::new("pad.wav", 2)).unwrap();

        let mut backend = DriftingBackend { inner: ManualBackend::new(SR), drift };
        let mut mix = MixGraph::new(0.015);
        mix.sync(&comp, &mut backend);

        let transport = Transport::new(comp.total_duration());
        transport.seek(0.0, 1.0);
        transport.start(backend.now());

        let mut scheduler = LoopScheduler::new();
        scheduler.reschedule(&comp, &transport, &mix, &assets, &Detune, &mut backend);

        // the fetch cost 300 frames; the voice starts where the transport is now
        let voices = backend.inner.graph().active_voices();
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].start_frame, 300);
        assert!((voices[0].source_offset - 1300.0).abs() < 1e-6);
        assert_eq!(voices[0].length, 2700);
        assert!((transport.position(backend.now()) - 1.3).abs() < 1e-9);
    }
}
