//! Retuning key-tagged samples to the project key.

use std::f64::consts::PI;
use std::sync::Arc;

use crate::assets::{AssetCache, SampleBuffer};
use crate::config::TranspositionMode;
use crate::error::Result;

/// Grain length of the pitch shifter, seconds.
const GRAIN_SECS: f64 = 0.1;

/// Playback-rate multiplier for a shift of `semitones`.
pub fn rate_for(semitones: i32) -> f64 {
    2f64.powf(semitones as f64 / 12.0)
}

/// Audio to play for a placement and the rate to play it at.
#[derive(Clone, Debug)]
pub struct Transposed {
    pub buffer: Arc<SampleBuffer>,
    pub rate: f64,
}

pub trait Transposer: Send + Sync {
    fn transpose(&self, cache: &AssetCache, reference: &str, semitones: i32) -> Result<Transposed>;
}

/// Leaves audio untouched.
pub struct Off;

impl Transposer for Off {
    fn transpose(&self, cache: &AssetCache, reference: &str, _semitones: i32) -> Result<Transposed> {
        Ok(Transposed { buffer: cache.get(reference)?, rate: 1.0 })
    }
}

/// Changes playback rate; the sample also gets shorter or longer.
pub struct Detune;

impl Transposer for Detune {
    fn transpose(&self, cache: &AssetCache, reference: &str, semitones: i32) -> Result<Transposed> {
        Ok(Transposed { buffer: cache.get(reference)?, rate: rate_for(semitones) })
    }
}

/// Plays a pitch-shifted copy of the same length at normal rate.
pub struct PitchShift;

impl Transposer for PitchShift {
    fn transpose(&self, cache: &AssetCache, reference: &str, semitones: i32) -> Result<Transposed> {
        Ok(Transposed { buffer: cache.get_shifted(reference, semitones)?, rate: 1.0 })
    }
}

pub fn for_mode(mode: TranspositionMode) -> &'static dyn Transposer {
    match mode {
        TranspositionMode::Off => &Off,
        TranspositionMode::Detune => &Detune,
        TranspositionMode::PitchShift => &PitchShift,
    }
}

/// Granular overlap-add pitch shift. Each Hann-windowed grain is read at the shifted
/// rate and written back at its original position, so the length is unchanged.
pub fn pitch_shift(buffer: &SampleBuffer, semitones: i32) -> SampleBuffer {
    if semitones == 0 || buffer.frames() < 2 {
        return buffer.clone();
    }
    let rate = rate_for(semitones);
    let frames = buffer.frames();
    let grain = ((GRAIN_SECS * buffer.sample_rate as f64) as usize).clamp(16, frames.max(16));
    let hop = grain / 2;
    let window: Vec<f64> = (0..grain)
        .map(|j| 0.5 - 0.5 * (2.0 * PI * j as f64 / grain as f64).cos())
        .collect();

    let src = &buffer.data;
    let mut out = vec![0.0f32; frames * 2];
    let mut start = -(hop as i64);
    while start < frames as i64 {
        for (j, w) in window.iter().enumerate() {
            let dst = start + j as i64;
            if dst < 0 {
                continue;
            }
            let dst = dst as usize;
            if dst >= frames {
                break;
            }
            let pos = start as f64 + j as f64 * rate;
            if pos < 0.0 {
                continue;
            }
            let i = pos as usize;
            if i + 1 >= frames {
                continue;
            }
            let frac = (pos - i as f64) as f32;
            let w = *w as f32;
            for c in 0..2 {
                let a = src[i * 2 + c];
                let b = src[(i + 1) * 2 + c];
                out[dst * 2 + c] += (a + (b - a) * frac) * w;
            }
        }
        start += hop as i64;
    }
    SampleBuffer::new(out, buffer.sample_rate)
}
