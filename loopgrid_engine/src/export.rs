//! Offline bounce of one loop to a 16-bit stereo WAV.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{info, instrument, warn};

use loopgrid_shared::{Composition, EditError};

use crate::assets::AssetCache;
use crate::config::ExportMix;
use crate::error::{EngineError, Result};
use crate::graph::{GraphCommand, RenderGraph};
use crate::nodes::Output;
use crate::scheduler::{Timing, resolve, track_placements, voice_for};
use crate::transpose::Transposer;

/// Size of the canonical PCM header hound writes for 16-bit stereo.
pub const WAV_HEADER_BYTES: usize = 44;

#[derive(Debug, Clone)]
pub struct RenderedLoop {
    /// Interleaved stereo.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub skipped: usize,
}

impl RenderedLoop {
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }
}

/// Renders exactly one loop, `ceil(sample_rate * total_duration)` frames, with every
/// placement starting at its absolute position and each track at its static volume.
#[instrument(skip_all, fields(tracks = composition.tracks.len(), sample_rate = sample_rate))]
pub fn render_offline(
    composition: &Composition,
    assets: &AssetCache,
    transposer: &dyn Transposer,
    mix: ExportMix,
    sample_rate: u32,
    block_frames: usize,
) -> Result<RenderedLoop> {
    composition.validate()?;
    if composition.is_empty() {
        return Err(EngineError::EmptyComposition);
    }
    let total = composition.total_duration();
    let frames = sample_rate as f64 * total;
    if !frames.is_finite() || frames > usize::MAX as f64 {
        return Err(EngineError::InvalidComposition(EditError::InvalidTempo {
            bpm: composition.bpm,
            beats_per_slot: composition.beats_per_slot,
        }));
    }
    let frames = frames.ceil() as usize;

    let mut graph = RenderGraph::new(sample_rate);
    let mut considered = 0;
    let mut skipped = 0;

    for track in &composition.tracks {
        if mix == ExportMix::Monitored && !composition.is_audible(track) {
            continue;
        }
        graph.apply(GraphCommand::AddBus { track: track.id, gain: track.volume });
        for placement in track_placements(composition, track) {
            considered += 1;
            let audio = match resolve(composition, placement.sample, assets, transposer) {
                Ok(audio) => audio,
                Err(e) => {
                    warn!(track = %track.id, slot = placement.slot, error = %e, "placement left silent in export");
                    skipped += 1;
                    continue;
                }
            };
            let timing = Timing::Future { delay: placement.start };
            if let Some(spec) = voice_for(&audio, &placement, timing, 0, sample_rate, Output::Bus(track.id)) {
                graph.apply(GraphCommand::Start(spec));
            }
        }
    }

    if considered > 0 && skipped == considered {
        return Err(EngineError::NoResolvableSamples(considered));
    }

    let block = block_frames.max(1);
    let mut samples = vec![0.0f32; frames * 2];
    for chunk in samples.chunks_mut(block * 2) {
        graph.render(chunk);
    }

    Ok(RenderedLoop { samples, sample_rate, skipped })
}

/// Float sample to 16-bit: clamp to [-1, 1], scale negatives by 32768 and positives
/// by 32767, truncate.
pub fn quantize(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encodes interleaved stereo as a 16-bit PCM WAV byte stream.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    if samples.is_empty() {
        return Err(EngineError::EmptyComposition);
    }
    let spec = WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_BYTES + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            writer.write_sample(quantize(s))?;
        }
        writer.finalize()?;
    }

    let bytes = cursor.into_inner();
    if bytes.len() <= WAV_HEADER_BYTES {
        return Err(EngineError::EmptyComposition);
    }
    Ok(bytes)
}

/// `name` with `.wav` appended unless it already ends in it.
pub fn file_name_with_extension(name: &str) -> String {
    if name.to_ascii_lowercase().ends_with(".wav") {
        name.to_string()
    } else {
        format!("{name}.wav")
    }
}

pub fn write_export(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = dir.join(file_name_with_extension(name));
    std::fs::write(&path, bytes)?;
    info!(path = %path.display(), bytes = bytes.len(), "export written");
    Ok(path)
}
