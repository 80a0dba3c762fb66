//! Host audio subsystem seam.
//!
//! The control thread only ever hands time-stamped `GraphCommand`s to a backend
//! and reads its clock; the backend owns rendering.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::graph::{GraphCommand, GraphEvent, RenderGraph};

pub trait AudioBackend {
    fn sample_rate(&self) -> u32;

    /// Frames rendered so far on the output clock.
    fn frame(&self) -> u64;

    /// Output clock in seconds. Never blocks.
    fn now(&self) -> f64 {
        self.frame() as f64 / self.sample_rate() as f64
    }

    /// Queues a command; it takes effect at the next rendered block.
    fn send(&mut self, cmd: GraphCommand);

    /// Makes sure the output is running. Safe to call repeatedly.
    fn resume(&mut self) -> Result<()>;

    /// Events produced by the renderer since the last call.
    fn drain_events(&mut self) -> Vec<GraphEvent>;
}

/// Control-side end of the command channel. Commands that do not fit in the
/// bounded channel wait in a backlog and go out, in order, on the next flush.
pub(crate) struct CommandQueue {
    tx: Sender<GraphCommand>,
    backlog: VecDeque<GraphCommand>,
}

impl CommandQueue {
    pub(crate) fn new(tx: Sender<GraphCommand>) -> Self {
        Self { tx, backlog: VecDeque::new() }
    }

    pub(crate) fn push(&mut self, cmd: GraphCommand) {
        if !self.backlog.is_empty() {
            self.backlog.push_back(cmd);
            self.flush();
            return;
        }
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(TrySendError::Full(cmd)) => {
                debug!("graph command queue full, holding command back");
                self.backlog.push_back(cmd);
            }
            Err(TrySendError::Disconnected(_)) => warn!("graph command queue closed"),
        }
    }

    /// Moves as much of the backlog into the channel as fits.
    pub(crate) fn flush(&mut self) {
        while let Some(cmd) = self.backlog.pop_front() {
            match self.tx.try_send(cmd) {
                Ok(()) => {}
                Err(TrySendError::Full(cmd)) => {
                    self.backlog.push_front(cmd);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!(dropped = self.backlog.len() + 1, "graph command queue closed");
                    self.backlog.clear();
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.backlog.len()
    }
}

/// Default output device through cpal. The stream is opened on the first
/// `resume`; a failed open is retried on the next one.
pub struct CpalBackend {
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    sample_rate: u32,
    stream: Option<cpal::Stream>,
    graph: Arc<Mutex<RenderGraph>>,
    frame: Arc<AtomicU64>,
    commands: CommandQueue,
    cmd_rx: Receiver<GraphCommand>,
    event_tx: Sender<GraphEvent>,
    event_rx: Receiver<GraphEvent>,
}

impl CpalBackend {
    pub fn new(command_queue: usize) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| EngineError::DeviceUnavailable("no output device available".to_string()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;

        let sample_rate = supported.sample_rate();
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();

        let (cmd_tx, cmd_rx) = bounded(command_queue.max(1));
        let (event_tx, event_rx) = bounded(command_queue.max(1));

        Ok(Self {
            device,
            config,
            sample_format,
            sample_rate,
            stream: None,
            graph: Arc::new(Mutex::new(RenderGraph::new(sample_rate))),
            frame: Arc::new(AtomicU64::new(0)),
            commands: CommandQueue::new(cmd_tx),
            cmd_rx,
            event_tx,
            event_rx,
        })
    }

    fn open_stream(&self) -> Result<cpal::Stream> {
        if self.sample_format != cpal::SampleFormat::F32 {
            return Err(EngineError::DeviceUnavailable(format!(
                "unsupported sample format {:?}",
                self.sample_format
            )));
        }

        let channels = self.config.channels as usize;
        let graph = self.graph.clone();
        let frame = self.frame.clone();
        let cmd_rx = self.cmd_rx.clone();
        let event_tx = self.event_tx.clone();
        let mut mix: Vec<f32> = Vec::new();

        let err_fn = |err: cpal::StreamError| {
            let s = err.to_string();
            if !s.contains("underrun") && !s.contains("overrun") {
                warn!(error = %s, "output stream error");
            }
        };

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let Some(mut graph) = graph.try_lock() else {
                        data.fill(0.0);
                        return;
                    };
                    while let Ok(cmd) = cmd_rx.try_recv() {
                        graph.apply(cmd);
                    }

                    let frames = data.len() / channels.max(1);
                    if mix.len() != frames * 2 {
                        mix.resize(frames * 2, 0.0);
                    }
                    graph.render(&mut mix);
                    for event in graph.take_events() {
                        let _ = event_tx.try_send(event);
                    }
                    frame.store(graph.frame(), Ordering::Release);

                    for (out, lr) in data.chunks_exact_mut(channels.max(1)).zip(mix.chunks_exact(2)) {
                        if out.len() == 1 {
                            out[0] = (lr[0] + lr[1]) * 0.5;
                        } else {
                            out[0] = lr[0];
                            out[1] = lr[1];
                            out[2..].fill(0.0);
                        }
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;
        Ok(stream)
    }
}

impl AudioBackend for CpalBackend {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    fn send(&mut self, cmd: GraphCommand) {
        self.commands.push(cmd);
    }

    fn resume(&mut self) -> Result<()> {
        self.commands.flush();
        if self.stream.is_none() {
            let stream = self.open_stream()?;
            self.stream = Some(stream);
            info!(sample_rate = self.sample_rate, channels = self.config.channels, "output stream opened");
        }
        if let Some(stream) = &self.stream {
            stream
                .play()
                .map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<GraphEvent> {
        self.commands.flush();
        self.event_rx.try_iter().collect()
    }
}

/// Renders only when told to. Commands apply immediately, so tests can inspect
/// the graph right after a call into the engine.
pub struct ManualBackend {
    graph: RenderGraph,
    available: bool,
    resumed: bool,
}

impl ManualBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            graph: RenderGraph::new(sample_rate),
            available: true,
            resumed: false,
        }
    }

    pub fn graph(&self) -> &RenderGraph {
        &self.graph
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Makes `resume` fail until switched back.
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    /// Renders `frames` frames of interleaved stereo and advances the clock.
    pub fn render(&mut self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * 2];
        self.graph.render(&mut out);
        out
    }

    /// Renders `frames` in blocks of `block` frames.
    pub fn render_blocks(&mut self, frames: usize, block: usize) -> Vec<f32> {
        let block = block.max(1);
        let mut out = Vec::with_capacity(frames * 2);
        let mut left = frames;
        while left > 0 {
            let n = left.min(block);
            out.extend(self.render(n));
            left -= n;
        }
        out
    }

    pub fn advance_secs(&mut self, secs: f64) -> Vec<f32> {
        let frames = (secs * self.graph.sample_rate() as f64).round() as usize;
        self.render(frames)
    }
}

impl AudioBackend for ManualBackend {
    fn sample_rate(&self) -> u32 {
        self.graph.sample_rate()
    }

    fn frame(&self) -> u64 {
        self.graph.frame()
    }

    fn send(&mut self, cmd: GraphCommand) {
        self.graph.apply(cmd);
    }

    fn resume(&mut self) -> Result<()> {
        if !self.available {
            return Err(EngineError::DeviceUnavailable("manual backend switched off".to_string()));
        }
        self.resumed = true;
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<GraphEvent> {
        self.graph.take_events().collect()
    }
}
