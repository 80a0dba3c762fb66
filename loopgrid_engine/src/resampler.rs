use rubato::{
    calculate_cutoff, Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};

use crate::error::{EngineError, Result};

const CHUNK: usize = 1024;
const SINC_LEN: usize = 256;

fn build(ratio: f64, channels: usize) -> Result<SincFixedIn<f32>> {
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len: SINC_LEN,
        f_cutoff: calculate_cutoff(SINC_LEN, window),
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window,
    };
    SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK, channels)
        .map_err(|e| EngineError::Resample(e.to_string()))
}

fn append(out: &mut [Vec<f32>], block: Vec<Vec<f32>>) {
    for (dst, src) in out.iter_mut().zip(block) {
        dst.extend_from_slice(&src);
    }
}

/// Converts interleaved audio from `src_rate` to `dst_rate` with a sinc resampler.
///
/// The output holds `ceil(frames * dst_rate / src_rate)` frames and is aligned with
/// the input; the filter delay is trimmed from the front.
pub fn convert(input: &[f32], channels: usize, src_rate: u32, dst_rate: u32) -> Result<Vec<f32>> {
    if channels == 0 || src_rate == 0 || dst_rate == 0 {
        return Err(EngineError::Resample(format!(
            "invalid format: {channels} channels, {src_rate} Hz -> {dst_rate} Hz"
        )));
    }
    if src_rate == dst_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let ratio = dst_rate as f64 / src_rate as f64;
    let frames = input.len() / channels;
    let expected = (frames as f64 * ratio).ceil() as usize;
    // Approximate group delay of the sinc filter, in output frames.
    let delay = (SINC_LEN as f64 / 2.0 * ratio).round() as usize;

    let mut resampler = build(ratio, channels)?;
    let planar: Vec<Vec<f32>> = (0..channels)
        .map(|c| input.iter().skip(c).step_by(channels).copied().collect())
        .collect();
    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay + CHUNK); channels];

    let mut pos = 0;
    while pos + CHUNK <= frames {
        let block: Vec<&[f32]> = planar.iter().map(|c| &c[pos..pos + CHUNK]).collect();
        let res = resampler
            .process(&block, None)
            .map_err(|e| EngineError::Resample(e.to_string()))?;
        append(&mut out, res);
        pos += CHUNK;
    }
    if pos < frames {
        let block: Vec<&[f32]> = planar.iter().map(|c| &c[pos..]).collect();
        let res = resampler
            .process_partial(Some(&*block), None)
            .map_err(|e| EngineError::Resample(e.to_string()))?;
        append(&mut out, res);
    }
    // Flush the tail still inside the filter.
    while out[0].len() < expected + delay {
        let res = resampler
            .process_partial::<Vec<f32>>(None, None)
            .map_err(|e| EngineError::Resample(e.to_string()))?;
        if res.first().is_none_or(|c| c.is_empty()) {
            break;
        }
        append(&mut out, res);
    }

    let mut interleaved = vec![0.0f32; expected * channels];
    for (c, chan) in out.iter().enumerate() {
        for (i, &s) in chan.iter().skip(delay).take(expected).enumerate() {
            interleaved[i * channels + c] = s;
        }
    }
    Ok(interleaved)
}
