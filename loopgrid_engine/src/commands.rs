use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::Sender;
use loopgrid_shared::{Composition, TrackId};

use crate::engine::PlaybackStatus;
use crate::error::EngineError;

/// Requests another thread can send to the control thread that owns the engine.
pub enum EngineCommand {
    Play,
    Pause,
    Stop,
    Seek(f64),
    SetTrackVolume { track: TrackId, volume: f32 },
    Preview(String),
    StopPreview,
    /// Replace the composition snapshot.
    Apply(Arc<Composition>),
    Export { response_tx: Sender<Result<Vec<u8>, EngineError>> },
    ExportToFile {
        dir: PathBuf,
        name: Option<String>,
        response_tx: Sender<Result<PathBuf, EngineError>>,
    },
    GetStatus(Sender<PlaybackStatus>),
}
