use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use loopgrid_shared::TrackId;

use crate::assets::SampleBuffer;

static NEXT_VOICE: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

impl VoiceId {
    pub fn next() -> Self {
        VoiceId(NEXT_VOICE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Smoothed gain stage. Buffers are interleaved stereo.
#[derive(Clone, Debug)]
pub struct GainNode {
    gain: f32,
    target: f32,
    coeff: f32,
}

impl GainNode {
    pub fn new(gain: f32) -> Self {
        Self { gain, target: gain, coeff: 1.0 }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn set(&mut self, gain: f32) {
        self.gain = gain;
        self.target = gain;
    }

    /// First-order approach to `target`: after `time_constant` seconds the remaining
    /// distance is 1/e of the original.
    pub fn ramp_to(&mut self, target: f32, time_constant: f64, sample_rate: f32) {
        if time_constant <= 0.0 || sample_rate <= 0.0 {
            self.set(target);
            return;
        }
        self.target = target;
        self.coeff = (1.0 - (-1.0 / (time_constant * sample_rate as f64)).exp()) as f32;
    }

    pub fn process(&mut self, buffer: &mut [f32]) {
        if self.gain == self.target {
            if self.gain != 1.0 {
                for sample in buffer.iter_mut() {
                    *sample *= self.gain;
                }
            }
            return;
        }
        for frame in buffer.chunks_exact_mut(2) {
            self.gain += (self.target - self.gain) * self.coeff;
            if (self.target - self.gain).abs() < 1e-5 {
                self.gain = self.target;
            }
            frame[0] *= self.gain;
            frame[1] *= self.gain;
        }
    }
}

/// Where a voice is mixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Output {
    Bus(TrackId),
    /// Straight to the master, bypassing every track gain.
    Master,
}

/// A time-stamped play request: the renderer starts it at `start_frame` on the
/// output clock.
#[derive(Clone, Debug)]
pub struct VoiceSpec {
    pub id: VoiceId,
    pub buffer: Arc<SampleBuffer>,
    pub output: Output,
    pub start_frame: u64,
    /// Read position into the buffer, in source frames.
    pub source_offset: f64,
    /// Source frames advanced per output frame.
    pub rate: f64,
    /// Output frames to play before stopping.
    pub length: u64,
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a * (1.0 - t) + b * t
}

#[derive(Clone, Debug)]
pub struct Voice {
    pub spec: VoiceSpec,
    pos: f64,
    remaining: u64,
    active: bool,
}

impl Voice {
    pub fn new(spec: VoiceSpec) -> Self {
        Self {
            pos: spec.source_offset.max(0.0),
            remaining: spec.length,
            active: spec.length > 0,
            spec,
        }
    }

    pub fn id(&self) -> VoiceId {
        self.spec.id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Adds this voice into `out` (interleaved stereo) for the block starting at
    /// `block_start`. A voice whose start time has already passed begins at the
    /// start of the block.
    pub fn render_into(&mut self, block_start: u64, out: &mut [f32]) {
        if !self.active {
            return;
        }
        let frames = out.len() / 2;
        let begin = self.spec.start_frame.saturating_sub(block_start);
        if begin >= frames as u64 {
            return;
        }

        let data = &self.spec.buffer.data;
        let len = self.spec.buffer.frames();
        let rate = self.spec.rate;

        for frame in out.chunks_exact_mut(2).skip(begin as usize) {
            if self.remaining == 0 || self.pos >= len as f64 {
                self.active = false;
                break;
            }
            let i = self.pos as usize;
            let frac = (self.pos - i as f64) as f32;
            let next = (i + 1).min(len - 1);

            frame[0] += lerp(data[i * 2], data[next * 2], frac);
            frame[1] += lerp(data[i * 2 + 1], data[next * 2 + 1], frac);

            self.pos += rate;
            self.remaining -= 1;
        }
        if self.remaining == 0 || self.pos >= len as f64 {
            self.active = false;
        }
    }
}
