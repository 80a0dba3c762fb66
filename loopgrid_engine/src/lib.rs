pub mod assets;
pub mod backend;
pub mod commands;
pub mod config;
pub mod engine; // LoopEngine lives here
pub mod error;
pub mod export;
pub mod graph;
pub mod mix;
pub mod nodes;
pub mod preview;
pub mod resampler;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod transpose;

// Re-exports
pub use assets::{AssetCache, FileSource, MemorySource, SampleBuffer, SampleSource};
pub use backend::{AudioBackend, CpalBackend, ManualBackend};
pub use commands::EngineCommand;
pub use config::{EngineConfig, ExportConfig, ExportMix, TranspositionMode};
pub use engine::{LoopEngine, PlaybackStatus};
pub use error::EngineError;
pub use store::CompositionStore;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests_playback;
