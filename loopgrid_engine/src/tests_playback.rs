#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crossbeam_channel::unbounded;
    use loopgrid_shared::{Composition, EditError, SampleRef, TrackId};

    use crate::assets::MemorySource;
    use crate::backend::ManualBackend;
    use crate::config::EngineConfig;
    use crate::error::EngineError;
    use crate::nodes::Output;
    use crate::store::CompositionStore;
    use crate::testing::dc_wav;
    use crate::{EngineCommand, LoopEngine};

    const SR: u32 = 1000;
    const BLOCK: usize = 100;

    struct Rig {
        engine: LoopEngine<ManualBackend>,
        store: Arc<CompositionStore>,
        a: TrackId,
        b: TrackId,
    }

    /// Two tracks at 120 BPM (2 s slots): `a` (level 0.5) in slot 0, `b` (level 0.25)
    /// in slot 1. The loop is 4 s long.
    fn rig() -> Rig {
        let source = Arc::new(MemorySource::new());
        source.insert("a.wav", dc_wav(4000, 1, SR, 0.5));
        source.insert("b.wav", dc_wav(4000, 1, SR, 0.25));

        let mut comp = Composition { bpm: 120.0, ..Composition::default() };
        let a = comp.add_track("a");
        let b = comp.add_track("b");
        comp.place_sample(a, 0, SampleRef::new("a.wav", 1)).unwrap();
        comp.place_sample(b, 1, SampleRef::new("b.wav", 1)).unwrap();

        let store = Arc::new(CompositionStore::new(comp));
        let mut engine = LoopEngine::new(ManualBackend::new(SR), source, EngineConfig::default());
        engine.attach(&store);
        Rig { engine, store, a, b }
    }

    /// Renders `frames` in blocks, polling after each like a UI would.
    fn run(engine: &mut LoopEngine<ManualBackend>, frames: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(frames * 2);
        let mut left = frames;
        while left > 0 {
            let n = left.min(BLOCK);
            out.extend(engine.backend_mut().render(n));
            engine.poll();
            left -= n;
        }
        out
    }

    fn left(samples: &[f32]) -> Vec<f32> {
        samples.iter().step_by(2).copied().collect()
    }

    fn near(a: f32, b: f32) -> bool {
        (a - b).abs() < 2e-3
    }

    #[test]
    fn total_duration_tracks_the_furthest_placement() {
        let rig = rig();
        assert!((rig.engine.total_duration() - 4.0).abs() < 1e-12);
        assert_eq!(rig.engine.backend().graph().connected_buses(), 2);
    }

    #[test]
    fn loop_plays_then_wraps_to_the_start() {
        let mut rig = rig();
        rig.engine.play().unwrap();

        let audio = left(&run(&mut rig.engine, 4500));
        assert!(near(audio[10], 0.5));
        assert!(near(audio[1990], 0.5));
        assert!(near(audio[2010], 0.25));
        assert!(near(audio[3990], 0.25));
        // second pass starts with `a` again
        assert!(near(audio[4010], 0.5));
        assert!((rig.engine.position() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn position_is_monotonic_between_wraps() {
        let mut rig = rig();
        rig.engine.play().unwrap();

        let mut last = 0.0;
        let mut wraps = 0;
        for _ in 0..90 {
            run(&mut rig.engine, BLOCK);
            let status = rig.engine.poll();
            assert!(status.position >= 0.0 && status.position < status.total);
            assert!((0.0..=1.0).contains(&status.progress));
            if status.position < last {
                wraps += 1;
            }
            last = status.position;
        }
        // 9 s of a 4 s loop
        assert_eq!(wraps, 2);
    }

    #[test]
    fn solo_dominates_mute() {
        let mut rig = rig();
        let (a, b) = (rig.a, rig.b);
        // put b under a so both would sound together
        rig.store
            .update(|c| {
                let sample = c.track(b).unwrap().slots[1].clone().unwrap();
                c.clear_instance(b, sample.instance_id.unwrap())?;
                c.place_sample(b, 0, SampleRef::new("b.wav", 1))?;
                c.toggle_solo(a)?;
                c.toggle_mute(b)
            })
            .unwrap();
        rig.engine.poll();
        rig.engine.play().unwrap();
        let audio = left(&run(&mut rig.engine, 200));
        assert!(near(audio[50], 0.5));

        // unsolo: b is still muted
        rig.store.update(|c| c.toggle_solo(a)).unwrap();
        let audio = left(&run(&mut rig.engine, 200));
        assert!(near(audio[150], 0.5));

        // unmute: both
        rig.store.update(|c| c.toggle_mute(b)).unwrap();
        let audio = left(&run(&mut rig.engine, 200));
        assert!(near(audio[150], 0.75));

        // solo b: only b, even though a is not muted
        rig.store.update(|c| c.toggle_solo(b)).unwrap();
        let audio = left(&run(&mut rig.engine, 200));
        assert!(near(audio[150], 0.25));
    }

    #[test]
    fn removing_a_track_while_playing_leaves_the_rest() {
        let mut rig = rig();
        let (a, b) = (rig.a, rig.b);
        rig.engine.play().unwrap();
        run(&mut rig.engine, 500);

        rig.store.update(|c| c.remove_track(b).map(|_| ())).unwrap();
        let audio = left(&run(&mut rig.engine, 3000));

        let graph = rig.engine.backend().graph();
        assert!(!graph.has_bus(b));
        assert!(graph.has_bus(a));
        assert!(graph.active_voices().iter().all(|v| v.output != Output::Bus(b)));
        // the loop shrank to a's 2 s; a plays on without a gap and b never sounds
        assert!((rig.engine.total_duration() - 2.0).abs() < 1e-12);
        assert!(audio[BLOCK..].iter().all(|s| near(*s, 0.5)));
    }

    #[test]
    fn pause_silences_and_holds_position() {
        let mut rig = rig();
        rig.engine.play().unwrap();
        run(&mut rig.engine, 500);

        rig.engine.pause();
        assert!(!rig.engine.is_playing());
        assert!(rig.engine.backend().graph().active_voices().is_empty());
        let audio = run(&mut rig.engine, 500);
        assert!(audio.iter().all(|s| *s == 0.0));
        assert!((rig.engine.position() - 0.5).abs() < 1e-9);

        rig.engine.play().unwrap();
        let audio = left(&run(&mut rig.engine, 100));
        assert!(near(audio[50], 0.5));
        assert!((rig.engine.position() - 0.6).abs() < 1e-9);

        rig.engine.stop();
        assert_eq!(rig.engine.position(), 0.0);
    }

    #[test]
    fn seek_reschedules_from_the_new_position() {
        let mut rig = rig();
        rig.engine.play().unwrap();
        rig.engine.seek(2.5);

        let voices = rig.engine.backend().graph().active_voices();
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].output, Output::Bus(rig.b));
        assert_eq!(voices[0].source_offset, 500.0);

        let audio = left(&run(&mut rig.engine, 100));
        assert!(near(audio[50], 0.25));
    }

    #[test]
    fn seek_while_paused_reads_back() {
        let mut rig = rig();
        for t in [0.0, 1.25, 3.999] {
            rig.engine.seek(t);
            assert_eq!(rig.engine.position(), t);
        }
    }

    #[test]
    fn volume_changes_do_not_reschedule() {
        let mut rig = rig();
        let a = rig.a;
        rig.engine.play().unwrap();
        let before: Vec<_> = rig.engine.backend().graph().active_voices().iter().map(|v| v.id).collect();

        assert!(rig.engine.set_track_volume(a, 0.5));
        rig.store.update(|c| c.set_volume(a, 0.5)).unwrap();
        rig.engine.poll();

        let after: Vec<_> = rig.engine.backend().graph().active_voices().iter().map(|v| v.id).collect();
        assert_eq!(before, after);

        // ramped, not stepped
        let audio = left(&run(&mut rig.engine, 1000));
        assert!(audio[0] > 0.45);
        assert!(near(audio[900], 0.25));
    }

    #[test]
    fn empty_composition_is_inert() {
        let source = Arc::new(MemorySource::new());
        let mut engine = LoopEngine::new(ManualBackend::new(SR), source, EngineConfig::default());

        engine.play().unwrap();
        assert!(!engine.is_playing());
        engine.seek(1.0);
        assert_eq!(engine.position(), 0.0);
        assert!(matches!(engine.export(), Err(EngineError::EmptyComposition)));
        // the timeline still shows one slot
        assert!(engine.total_duration() > 0.0);
    }

    #[test]
    fn device_failure_is_retried_on_next_play() {
        let mut rig = rig();
        rig.engine.backend_mut().set_available(false);
        assert!(matches!(rig.engine.play(), Err(EngineError::DeviceUnavailable(_))));
        assert!(!rig.engine.is_playing());

        rig.engine.backend_mut().set_available(true);
        rig.engine.play().unwrap();
        assert!(rig.engine.is_playing());
    }

    #[test]
    fn missing_asset_leaves_silence_only_there() {
        let mut rig = rig();
        let b = rig.b;
        rig.store
            .update(|c| c.place_sample(b, 0, SampleRef::new("lost.wav", 1)).map(|_| ()))
            .unwrap();
        rig.engine.poll();
        rig.engine.play().unwrap();
        let audio = left(&run(&mut rig.engine, 2500));
        assert!(near(audio[100], 0.5));
        assert!(near(audio[2100], 0.25));

        // export still works with one asset missing
        let bytes = rig.engine.export().unwrap();
        assert_eq!(bytes.len(), 44 + 4000 * 4);
    }

    #[test]
    fn export_to_file_appends_extension() {
        let rig = rig();
        let dir = std::env::temp_dir().join(format!("loopgrid-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let path = rig.engine.export_to_file(&dir, Some("my beat")).unwrap();
        assert_eq!(path.file_name().unwrap(), "my beat.wav");
        let default = rig.engine.export_to_file(&dir, None).unwrap();
        assert_eq!(default.file_name().unwrap(), "loopgrid-beat.wav");

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, SR);
        assert_eq!(reader.duration(), 4000);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn preview_runs_outside_the_transport() {
        let mut rig = rig();
        assert!(rig.engine.preview_sample("b.wav").unwrap());
        assert!(!rig.engine.is_playing());

        rig.engine.play().unwrap();
        rig.engine.pause();
        let voices = rig.engine.backend().graph().active_voices();
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].output, Output::Master);

        assert!(!rig.engine.preview_sample("b.wav").unwrap());
        assert_eq!(rig.engine.previewing(), None);
    }

    #[test]
    fn commands_drive_the_engine() {
        let mut rig = rig();
        rig.engine.handle(EngineCommand::Play);
        rig.engine.handle(EngineCommand::Seek(1.0));

        let (tx, rx) = unbounded();
        rig.engine.handle(EngineCommand::GetStatus(tx));
        let status = rx.recv().unwrap();
        assert!(status.playing);
        assert!((status.position - 1.0).abs() < 1e-9);
        assert!((status.progress - 0.25).abs() < 1e-9);

        let (tx, rx) = unbounded();
        rig.engine.handle(EngineCommand::Export { response_tx: tx });
        assert!(rx.recv().unwrap().is_ok());

        rig.engine.handle(EngineCommand::Stop);
        assert!(!rig.engine.is_playing());
    }

    #[test]
    fn rejected_edits_reach_no_one() {
        let rig = rig();
        let a = rig.a;
        let err = rig.store.update(|c| c.place_sample(a, 0, SampleRef::new("a.wav", 1)));
        assert_eq!(err, Err(EditError::Overlap { slot: 0, existing: 0 }));
    }

    #[test]
    fn engine_volume_changes_reach_the_store() {
        let mut rig = rig();
        let (a, b) = (rig.a, rig.b);
        assert!(rig.engine.set_track_volume(a, 0.5));
        assert_eq!(rig.store.snapshot().track(a).unwrap().volume, 0.5);

        // an unrelated edit published afterwards keeps the new level
        rig.store.update(|c| c.toggle_mute(b)).unwrap();
        rig.engine.poll();
        assert_eq!(rig.engine.backend().graph().bus_gain(a), Some(0.5));
        assert_eq!(rig.engine.composition().track(a).unwrap().volume, 0.5);
    }

    #[test]
    fn invalid_snapshot_is_ignored() {
        let mut rig = rig();
        rig.engine.play().unwrap();
        let before = rig.engine.composition().clone();
        let voices = rig.engine.backend().graph().active_voices().len();

        rig.store.publish(Composition { bpm: 0.0, ..(*before).clone() });
        rig.engine.poll();

        assert!(Arc::ptr_eq(rig.engine.composition(), &before));
        assert!(rig.engine.is_playing());
        assert_eq!(rig.engine.total_duration(), 4.0);
        assert_eq!(rig.engine.backend().graph().active_voices().len(), voices);
    }
}
