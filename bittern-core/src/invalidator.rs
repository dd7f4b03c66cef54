//! Background invalidator: keeps a minimum pool of invalid (allocatable)
//! blocks available, using Schmitt-trigger hysteresis so it doesn't
//! thrash at the threshold boundary (spec.md §4.9).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::directory::{BlockId, Directory};

/// Rearm point above the configured minimum, expressed as a percentage
/// (spec.md §4.9: "rearm 25% above the threshold").
const REARM_PCT_ABOVE: u32 = 25;

#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidatorStats {
    pub cycles: u64,
    pub invalidated: u64,
}

/// Schmitt-trigger pool-level monitor: `below_threshold()` becomes `true`
/// once the invalid count drops to or below `min`, and only clears once
/// the count climbs back above `min * (1 + REARM_PCT_ABOVE/100)`.
struct Hysteresis {
    armed: AtomicBool,
}

impl Hysteresis {
    fn new() -> Hysteresis {
        Hysteresis { armed: AtomicBool::new(false) }
    }

    fn update(&self, invalid_count: u32, min: u32) -> bool {
        let rearm_at = min + (min * REARM_PCT_ABOVE) / 100;
        if invalid_count <= min {
            self.armed.store(true, Ordering::SeqCst);
        } else if invalid_count > rearm_at {
            self.armed.store(false, Ordering::SeqCst);
        }
        self.armed.load(Ordering::SeqCst)
    }
}

pub struct Invalidator {
    min_invalid_count: AtomicU32,
    hysteresis: Hysteresis,
    stats: Mutex<InvalidatorStats>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Invalidator {
    pub fn new(min_invalid_count: u32) -> Invalidator {
        Invalidator {
            min_invalid_count: AtomicU32::new(min_invalid_count),
            hysteresis: Hysteresis::new(),
            stats: Mutex::new(InvalidatorStats::default()),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn set_min_invalid_count(&self, v: u32) {
        self.min_invalid_count.store(v, Ordering::Relaxed);
    }

    pub fn stats(&self) -> InvalidatorStats {
        *self.stats.lock().unwrap()
    }

    /// Whether the pool is currently below threshold. Read by the
    /// writeback worker to decide whether to shortcut-invalidate instead
    /// of flushing to clean (spec.md §4.8/§4.9's hysteresis coupling).
    pub fn below_threshold(&self) -> bool {
        self.hysteresis.armed.load(Ordering::SeqCst)
    }

    pub fn start(self: &Arc<Self>, directory: Arc<Directory>, invalidate_one: Arc<dyn Fn(BlockId) + Send + Sync>, tick_interval: std::time::Duration) {
        self.running.store(true, Ordering::SeqCst);
        let this = self.clone();
        let running = self.running.clone();
        let h = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                this.run_cycle(&directory, &invalidate_one);
                std::thread::sleep(tick_interval);
            }
        });
        *self.handle.lock().unwrap() = Some(h);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    fn run_cycle(&self, directory: &Directory, invalidate_one: &Arc<dyn Fn(BlockId) + Send + Sync>) {
        let min = self.min_invalid_count.load(Ordering::Relaxed);
        let counts = directory.counts();
        let below = self.hysteresis.update(counts.invalid_entries, min);
        if !below {
            self.stats.lock().unwrap().cycles += 1;
            return;
        }
        let deficit = min.saturating_sub(counts.invalid_entries).max(1);
        for _ in 0..deficit {
            let Some(id) = directory.get_clean() else { break };
            invalidate_one(id);
            self.stats.lock().unwrap().invalidated += 1;
        }
        self.stats.lock().unwrap().cycles += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hysteresis_arms_at_threshold_and_rearms_above_margin() {
        let h = Hysteresis::new();
        assert!(!h.update(20, 10)); // well above min, not armed
        assert!(h.update(10, 10)); // at min, arms
        assert!(h.update(11, 10)); // still within rearm band, stays armed
        assert!(!h.update(13, 10)); // > min*1.25 == 12.5, rearms
    }

    #[test]
    fn invalidator_does_nothing_above_threshold() {
        let inv = Invalidator::new(2);
        assert!(!inv.below_threshold());
    }
}
