//! Decoded sample cache.
//!
//! A reference is fetched and decoded at most once. Each reference has its own
//! slot lock, so concurrent requests for the same reference wait on the first
//! decode instead of starting their own; different references decode in parallel.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{RecvTimeoutError, unbounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::resampler;
use crate::transpose;

/// Decoded audio, interleaved stereo at the host rate.
#[derive(Clone, Debug)]
pub struct SampleBuffer {
    pub data: Vec<f32>,
    pub sample_rate: u32,
}

impl SampleBuffer {
    pub fn new(data: Vec<f32>, sample_rate: u32) -> Self {
        Self { data, sample_rate }
    }

    pub fn frames(&self) -> usize {
        self.data.len() / 2
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Resolves a sample reference to raw file bytes.
pub trait SampleSource: Send + Sync {
    fn fetch(&self, reference: &str) -> anyhow::Result<Vec<u8>>;
}

/// References are paths relative to a root directory.
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SampleSource for FileSource {
    fn fetch(&self, reference: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(reference);
        std::fs::read(&path).with_context(|| format!("reading {}", path.display()))
    }
}

/// In-memory bytes keyed by reference.
#[derive(Default)]
pub struct MemorySource {
    files: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: impl Into<String>, bytes: Vec<u8>) {
        self.files.write().insert(reference.into(), Arc::new(bytes));
    }
}

impl SampleSource for MemorySource {
    fn fetch(&self, reference: &str) -> anyhow::Result<Vec<u8>> {
        self.files
            .read()
            .get(reference)
            .map(|b| b.as_ref().clone())
            .ok_or_else(|| anyhow::anyhow!("no such sample"))
    }
}

/// Decodes WAV bytes to interleaved stereo at `target_rate`. Mono is duplicated to
/// both channels; channels past the second are dropped.
pub fn decode_wav(bytes: &[u8], target_rate: u32) -> Result<SampleBuffer> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        return Err(EngineError::Resample("WAV has no channels".to_string()));
    }

    let raw: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let max = 2.0_f32.powi(spec.bits_per_sample as i32 - 1);
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|x| x as f32 / max))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    let stereo: Vec<f32> = match channels {
        1 => raw.iter().flat_map(|&s| [s, s]).collect(),
        2 => raw,
        n => raw.chunks_exact(n).flat_map(|c| [c[0], c[1]]).collect(),
    };

    let data = resampler::convert(&stereo, 2, spec.sample_rate, target_rate)?;
    Ok(SampleBuffer::new(data, target_rate))
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PreloadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub timed_out: Vec<String>,
}

type Slot = Arc<Mutex<Option<Arc<SampleBuffer>>>>;

enum Progress {
    Started(String, Instant),
    Finished(String, Result<()>),
}

pub struct AssetCache {
    source: Arc<dyn SampleSource>,
    sample_rate: u32,
    entries: Mutex<HashMap<String, Slot>>,
    shifted: Mutex<HashMap<(String, i32), Arc<SampleBuffer>>>,
}

impl AssetCache {
    pub fn new(source: Arc<dyn SampleSource>, sample_rate: u32) -> Self {
        Self {
            source,
            sample_rate,
            entries: Mutex::new(HashMap::new()),
            shifted: Mutex::new(HashMap::new()),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn slot(&self, reference: &str) -> Slot {
        self.entries
            .lock()
            .entry(reference.to_string())
            .or_default()
            .clone()
    }

    /// Decoded buffer for `reference`, decoding it on first use. Failures are not
    /// remembered; the next request tries again.
    pub fn get(&self, reference: &str) -> Result<Arc<SampleBuffer>> {
        let slot = self.slot(reference);
        let mut entry = slot.lock();
        if let Some(buffer) = entry.as_ref() {
            return Ok(buffer.clone());
        }

        let buffer = match self.load(reference) {
            Ok(buffer) => Arc::new(buffer),
            Err(e) => {
                let mut entries = self.entries.lock();
                if entries.get(reference).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    entries.remove(reference);
                }
                return Err(e);
            }
        };
        debug!(reference, frames = buffer.frames(), "decoded sample");

        *entry = Some(buffer.clone());
        // a failed decode may have dropped the slot while we waited on it
        self.entries
            .lock()
            .entry(reference.to_string())
            .or_insert_with(|| slot.clone());
        Ok(buffer)
    }

    fn load(&self, reference: &str) -> Result<SampleBuffer> {
        let bytes = self
            .source
            .fetch(reference)
            .map_err(|e| EngineError::asset(reference, format!("{e:#}")))?;
        decode_wav(&bytes, self.sample_rate).map_err(|e| EngineError::asset(reference, e))
    }

    /// Already-decoded buffer, without waiting on an in-flight decode.
    pub fn cached(&self, reference: &str) -> Option<Arc<SampleBuffer>> {
        let slot = self.entries.lock().get(reference)?.clone();
        let entry = slot.try_lock()?;
        entry.clone()
    }

    /// Length-preserving pitch-shifted copy, computed once per `(reference, semitones)`.
    pub fn get_shifted(&self, reference: &str, semitones: i32) -> Result<Arc<SampleBuffer>> {
        if semitones == 0 {
            return self.get(reference);
        }
        let key = (reference.to_string(), semitones);
        if let Some(buffer) = self.shifted.lock().get(&key) {
            return Ok(buffer.clone());
        }
        let source = self.get(reference)?;
        let shifted = Arc::new(transpose::pitch_shift(&source, semitones));
        debug!(reference, semitones, "pitch-shifted copy cached");
        Ok(self.shifted.lock().entry(key).or_insert(shifted).clone())
    }

    /// Decodes every distinct reference on the rayon pool. Each decode gets
    /// `timeout` from the moment it starts, so a long queue of quick decodes all
    /// land. References still queued are given up once nothing has started or
    /// finished for `timeout`. Decodes that miss their deadline keep running and
    /// land in the cache when they finish.
    pub fn preload<I, S>(self: &Arc<Self>, references: I, timeout: Duration) -> PreloadReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        // deadline per reference, set once its decode has started
        let mut pending: HashMap<String, Option<Instant>> = HashMap::new();
        let (tx, rx) = unbounded();

        for reference in references {
            let reference = reference.as_ref().to_string();
            if pending.contains_key(&reference) {
                continue;
            }
            pending.insert(reference.clone(), None);
            let cache = Arc::clone(self);
            let tx = tx.clone();
            rayon::spawn(move || {
                let _ = tx.send(Progress::Started(reference.clone(), Instant::now()));
                let result = cache.get(&reference).map(|_| ());
                let _ = tx.send(Progress::Finished(reference, result));
            });
        }
        drop(tx);

        let mut report = PreloadReport::default();
        let mut idle = Instant::now() + timeout;
        while !pending.is_empty() {
            let next = pending.values().flatten().copied().fold(idle, Instant::min);
            match rx.recv_deadline(next) {
                Ok(Progress::Started(reference, at)) => {
                    if let Some(deadline) = pending.get_mut(&reference) {
                        *deadline = Some(at + timeout);
                        idle = Instant::now() + timeout;
                    }
                }
                Ok(Progress::Finished(reference, result)) => {
                    if pending.remove(&reference).is_none() {
                        continue;
                    }
                    idle = Instant::now() + timeout;
                    match result {
                        Ok(()) => report.loaded.push(reference),
                        Err(e) => {
                            warn!(reference = %reference, error = %e, "preload failed");
                            report.failed.push((reference, e.to_string()));
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    let expired: Vec<String> = pending
                        .iter()
                        .filter(|(_, deadline)| now >= idle || deadline.is_some_and(|d| d <= now))
                        .map(|(reference, _)| reference.clone())
                        .collect();
                    for reference in expired {
                        pending.remove(&reference);
                        timed_out(&mut report, reference, timeout);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for (reference, _) in pending {
            timed_out(&mut report, reference, timeout);
        }
        report.loaded.sort();
        report.failed.sort();
        report.timed_out.sort();
        report
    }
}

fn timed_out(report: &mut PreloadReport, reference: String, timeout: Duration) {
    let err = EngineError::RenderTimeout { reference: reference.clone(), timeout };
    warn!(error = %err, "preload skipped");
    report.timed_out.push(reference);
}
