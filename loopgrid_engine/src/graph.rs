use std::collections::HashMap;

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use tracing::debug;

use loopgrid_shared::TrackId;

use crate::nodes::{GainNode, Output, Voice, VoiceId, VoiceSpec};

/// Commands the control thread hands to the render side. They are applied at
/// the start of the next rendered block.
#[derive(Debug)]
pub enum GraphCommand {
    AddBus { track: TrackId, gain: f32 },
    /// Disconnects the bus and silences every voice routed to it.
    RemoveBus { track: TrackId },
    RampGain { track: TrackId, target: f32, time_constant: f64 },
    SetGain { track: TrackId, gain: f32 },
    Start(VoiceSpec),
    Stop(VoiceId),
    /// A whole scheduling pass in one command.
    StartVoices(Vec<VoiceSpec>),
    StopVoices(Vec<VoiceId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphEvent {
    /// The voice played to its end. Never sent for a voice removed by `Stop`.
    VoiceEnded(VoiceId),
}

/// Per-track gain buses feeding a master node, plus the voices playing into them.
pub struct RenderGraph {
    graph: StableDiGraph<GainNode, ()>,
    master: NodeIndex,
    buses: HashMap<TrackId, NodeIndex>,
    voices: Vec<Voice>,
    sample_rate: u32,
    frame: u64,
    scratch: Vec<f32>,
    events: Vec<GraphEvent>,
}

impl RenderGraph {
    pub fn new(sample_rate: u32) -> Self {
        let mut graph = StableDiGraph::new();
        let master = graph.add_node(GainNode::new(1.0));
        Self {
            graph,
            master,
            buses: HashMap::new(),
            voices: Vec::with_capacity(64),
            sample_rate,
            frame: 0,
            scratch: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered so far; the output clock.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn apply(&mut self, cmd: GraphCommand) {
        match cmd {
            GraphCommand::AddBus { track, gain } => {
                if let Some(&idx) = self.buses.get(&track) {
                    if let Some(node) = self.graph.node_weight_mut(idx) {
                        node.set(gain);
                    }
                    return;
                }
                let idx = self.graph.add_node(GainNode::new(gain));
                self.graph.add_edge(idx, self.master, ());
                self.buses.insert(track, idx);
                debug!(track = %track, gain, "bus connected");
            }
            GraphCommand::RemoveBus { track } => {
                if let Some(idx) = self.buses.remove(&track) {
                    self.graph.remove_node(idx);
                    self.voices.retain(|v| v.spec.output != Output::Bus(track));
                    debug!(track = %track, "bus disconnected");
                }
            }
            GraphCommand::RampGain { track, target, time_constant } => {
                let sr = self.sample_rate as f32;
                if let Some(node) = self.bus_node_mut(track) {
                    node.ramp_to(target, time_constant, sr);
                }
            }
            GraphCommand::SetGain { track, gain } => {
                if let Some(node) = self.bus_node_mut(track) {
                    node.set(gain);
                }
            }
            GraphCommand::Start(spec) => {
                self.voices.push(Voice::new(spec));
            }
            GraphCommand::Stop(id) => {
                self.voices.retain(|v| v.id() != id);
            }
            GraphCommand::StartVoices(specs) => {
                self.voices.extend(specs.into_iter().map(Voice::new));
            }
            GraphCommand::StopVoices(ids) => {
                self.voices.retain(|v| !ids.contains(&v.id()));
            }
        }
    }

    fn bus_node_mut(&mut self, track: TrackId) -> Option<&mut GainNode> {
        let idx = *self.buses.get(&track)?;
        self.graph.node_weight_mut(idx)
    }

    pub fn has_bus(&self, track: TrackId) -> bool {
        self.buses.contains_key(&track)
    }

    /// Number of nodes wired into the master.
    pub fn connected_buses(&self) -> usize {
        self.graph
            .neighbors_directed(self.master, Direction::Incoming)
            .count()
    }

    pub fn bus_ids(&self) -> Vec<TrackId> {
        self.buses.keys().copied().collect()
    }

    /// Target gain of a bus (where an in-flight ramp ends).
    pub fn bus_gain(&self, track: TrackId) -> Option<f32> {
        let idx = *self.buses.get(&track)?;
        self.graph.node_weight(idx).map(GainNode::target)
    }

    pub fn active_voices(&self) -> Vec<VoiceSpec> {
        self.voices.iter().map(|v| v.spec.clone()).collect()
    }

    pub fn take_events(&mut self) -> std::vec::Drain<'_, GraphEvent> {
        self.events.drain(..)
    }

    /// Renders one block of interleaved stereo into `out` and advances the clock.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let frames = (out.len() / 2) as u64;
        let block_start = self.frame;

        if self.scratch.len() != out.len() {
            self.scratch.resize(out.len(), 0.0);
        }

        // Each bus: sum its voices, apply its gain, add into the master mix.
        for (&track, &idx) in &self.buses {
            if self.graph.find_edge(idx, self.master).is_none() {
                continue;
            }
            self.scratch.fill(0.0);
            for voice in self.voices.iter_mut().filter(|v| v.spec.output == Output::Bus(track)) {
                voice.render_into(block_start, &mut self.scratch);
            }
            if let Some(node) = self.graph.node_weight_mut(idx) {
                node.process(&mut self.scratch);
            }
            for (o, s) in out.iter_mut().zip(&self.scratch) {
                *o += *s;
            }
        }

        for voice in self.voices.iter_mut().filter(|v| v.spec.output == Output::Master) {
            voice.render_into(block_start, out);
        }
        if let Some(master) = self.graph.node_weight_mut(self.master) {
            master.process(out);
        }

        // Voices routed to a bus that no longer exists can never be heard.
        let buses = &self.buses;
        let events = &mut self.events;
        self.voices.retain(|v| {
            let routed = match v.spec.output {
                Output::Bus(track) => buses.contains_key(&track),
                Output::Master => true,
            };
            if routed && !v.is_active() {
                events.push(GraphEvent::VoiceEnded(v.id()));
            }
            routed && v.is_active()
        });

        self.frame += frames;
    }
}
