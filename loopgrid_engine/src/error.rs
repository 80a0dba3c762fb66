use std::time::Duration;
use thiserror::Error;

use loopgrid_shared::EditError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("asset '{reference}' unavailable: {reason}")]
    AssetUnavailable { reference: String, reason: String },

    #[error("composition has no placed samples")]
    EmptyComposition,

    #[error("invalid composition: {0}")]
    InvalidComposition(#[from] EditError),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("decoding '{reference}' exceeded {timeout:?}")]
    RenderTimeout { reference: String, timeout: Duration },

    #[error("none of the {0} placements could be resolved to audio")]
    NoResolvableSamples(usize),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resampling failed: {0}")]
    Resample(String),
}

impl EngineError {
    pub(crate) fn asset(reference: &str, reason: impl ToString) -> Self {
        Self::AssetUnavailable {
            reference: reference.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
