//! Loop transport clock.
//!
//! Position is derived from the audio clock and a zero-reference: while
//! playing, `position = (now - reference) mod total`. Nothing accumulates
//! between reads, so a late or skipped poll never drifts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

fn load(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Acquire))
}

fn store(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Release);
}

/// Clamps `target` into `[0, total)`. The upper end is the largest `f64` below `total`.
fn clamp_into(target: f64, total: f64) -> f64 {
    let target = target.max(0.0);
    if total > 0.0 && total.is_finite() && target >= total {
        f64::from_bits(total.to_bits() - 1)
    } else {
        target
    }
}

/// Lock-free transport state. All reads are atomic loads; the control thread is
/// the only writer.
pub struct Transport {
    /// Audio-clock time, in seconds, at which composition position 0 played.
    reference_bits: AtomicU64,
    /// Position held while paused.
    paused_bits: AtomicU64,
    /// Loop length in seconds.
    total_bits: AtomicU64,
    playing: AtomicBool,
}

impl Transport {
    pub fn new(total: f64) -> Self {
        Self {
            reference_bits: AtomicU64::new(0.0f64.to_bits()),
            paused_bits: AtomicU64::new(0.0f64.to_bits()),
            total_bits: AtomicU64::new(total.max(0.0).to_bits()),
            playing: AtomicBool::new(false),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn total(&self) -> f64 {
        load(&self.total_bits)
    }

    pub fn set_total(&self, total: f64) {
        let total = total.max(0.0);
        store(&self.total_bits, total);
        if !self.is_playing() {
            let paused = load(&self.paused_bits);
            if total > 0.0 && paused >= total {
                store(&self.paused_bits, paused.rem_euclid(total));
            }
        }
    }

    /// Unwrapped seconds since the reference while playing; the held position otherwise.
    pub fn raw_elapsed(&self, now: f64) -> f64 {
        if self.is_playing() {
            now - load(&self.reference_bits)
        } else {
            load(&self.paused_bits)
        }
    }

    /// Current loop position, always in `[0, total)` while playing.
    pub fn position(&self, now: f64) -> f64 {
        if !self.is_playing() {
            return load(&self.paused_bits);
        }
        let total = self.total();
        if total <= 0.0 {
            return 0.0;
        }
        let elapsed = (now - load(&self.reference_bits)).max(0.0);
        let wrapped = elapsed.rem_euclid(total);
        // rem_euclid can round up to `total` for tiny negative remainders
        if wrapped >= total { 0.0 } else { wrapped }
    }

    /// Starts the clock from the held position. Returns `false` if it was already running.
    pub fn start(&self, now: f64) -> bool {
        if self.is_playing() {
            return false;
        }
        store(&self.reference_bits, now - load(&self.paused_bits));
        self.playing.store(true, Ordering::Release);
        true
    }

    /// Freezes the position at its current value. Returns `false` if already paused.
    pub fn pause(&self, now: f64) -> bool {
        if !self.is_playing() {
            return false;
        }
        let position = self.position(now);
        store(&self.paused_bits, position);
        self.playing.store(false, Ordering::Release);
        true
    }

    /// Moves the position to `target`. Negative targets clamp to 0. While paused the
    /// target is clamped into `[0, total)`, so seeking past the end parks just before
    /// it; while playing wrapping happens on read.
    pub fn seek(&self, now: f64, target: f64) {
        if self.is_playing() {
            store(&self.reference_bits, now - target.max(0.0));
        } else {
            store(&self.paused_bits, clamp_into(target, self.total()));
        }
    }

    /// Resets the reference so the position reads `overshoot` at `now`. Used at wraparound.
    pub fn rebase(&self, now: f64, overshoot: f64) {
        store(&self.reference_bits, now - overshoot);
    }
}
