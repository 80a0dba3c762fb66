//! Helpers for building WAV fixtures in memory.

use std::io::Cursor;

/// 16-bit PCM WAV bytes with `frames` frames; every channel of frame `i` holds `f(i)`.
pub fn wav_bytes(frames: usize, channels: u16, sample_rate: u32, f: impl Fn(usize) -> f32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..frames {
            let s = (f(i).clamp(-1.0, 1.0) * 32767.0) as i16;
            for _ in 0..channels {
                writer.write_sample(s).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Constant-level WAV.
pub fn dc_wav(frames: usize, channels: u16, sample_rate: u32, level: f32) -> Vec<u8> {
    wav_bytes(frames, channels, sample_rate, |_| level)
}
