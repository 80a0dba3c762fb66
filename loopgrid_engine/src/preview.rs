use tracing::debug;

use crate::assets::AssetCache;
use crate::backend::AudioBackend;
use crate::error::Result;
use crate::graph::{GraphCommand, GraphEvent};
use crate::nodes::{Output, VoiceId, VoiceSpec};

/// Single-voice audition player. Routed straight to the master, so track gains,
/// mute and solo never apply.
#[derive(Default)]
pub struct PreviewPlayer {
    current: Option<(String, VoiceId)>,
}

impl PreviewPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference currently auditioning.
    pub fn current(&self) -> Option<&str> {
        self.current.as_ref().map(|(r, _)| r.as_str())
    }

    /// Starts `reference`, replacing any other preview. Asking for the one already
    /// playing stops it instead. Returns whether a preview is now playing.
    pub fn toggle(
        &mut self,
        reference: &str,
        assets: &AssetCache,
        backend: &mut dyn AudioBackend,
    ) -> Result<bool> {
        if let Some((playing, id)) = self.current.take() {
            backend.send(GraphCommand::Stop(id));
            if playing == reference {
                debug!(reference, "preview stopped");
                return Ok(false);
            }
        }

        let buffer = assets.get(reference)?;
        let spec = VoiceSpec {
            id: VoiceId::next(),
            length: buffer.frames() as u64,
            buffer,
            output: Output::Master,
            start_frame: backend.frame(),
            source_offset: 0.0,
            rate: 1.0,
        };
        let id = spec.id;
        backend.send(GraphCommand::Start(spec));
        self.current = Some((reference.to_string(), id));
        debug!(reference, "preview started");
        Ok(true)
    }

    pub fn stop(&mut self, backend: &mut dyn AudioBackend) {
        if let Some((_, id)) = self.current.take() {
            backend.send(GraphCommand::Stop(id));
        }
    }

    /// Clears the playing state when the current voice runs out. Events for older
    /// voices are ignored.
    pub fn on_event(&mut self, event: GraphEvent) {
        let GraphEvent::VoiceEnded(ended) = event;
        if self.current.as_ref().is_some_and(|(_, id)| *id == ended) {
            self.current = None;
        }
    }
}
