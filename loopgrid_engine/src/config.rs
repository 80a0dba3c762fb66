//! Engine settings, loadable from a JSON file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How key-tagged pitched samples are retuned to the project key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranspositionMode {
    Off,
    /// Playback-rate change; also changes the sample's length.
    #[default]
    Detune,
    /// Length-preserving pitch shift on a processed copy.
    PitchShift,
}

/// Which tracks end up in an exported file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportMix {
    /// Every track, ignoring mute and solo.
    #[default]
    FullMix,
    /// Only the tracks that are audible under the current mute/solo state.
    Monitored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub mix: ExportMix,
    /// Overrides `EngineConfig::transposition` for exports.
    pub transposition: Option<TranspositionMode>,
    pub default_file_name: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            mix: ExportMix::FullMix,
            transposition: None,
            default_file_name: "loopgrid-beat.wav".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time constant of volume ramps, seconds.
    pub gain_smoothing_secs: f64,
    pub transposition: TranspositionMode,
    pub export: ExportConfig,
    pub preload_timeout_ms: u64,
    pub block_frames: usize,
    pub command_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gain_smoothing_secs: 0.015,
            transposition: TranspositionMode::Detune,
            export: ExportConfig::default(),
            preload_timeout_ms: 10_000,
            block_frames: 512,
            command_queue: 1024,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn preload_timeout(&self) -> Duration {
        Duration::from_millis(self.preload_timeout_ms)
    }

    pub fn export_transposition(&self) -> TranspositionMode {
        self.export.transposition.unwrap_or(self.transposition)
    }
}
