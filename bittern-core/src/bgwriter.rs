//! Background writeback: the single worker thread that drains dirty
//! blocks using a dirty-ratio-driven adaptive policy (spec.md §4.8).
//!
//! `BgWriter` only computes *what* to flush and *how much*; driving an
//! individual block through its writeback transition is delegated back to
//! the cache via a callback, since that's the one place pmem/devio/
//! directory are already wired together.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::BgWriterConf;
use crate::directory::{BlockId, Directory, GetDirtyOutcome};

/// One row of spec.md §4.8's dirty-ratio policy table.
#[derive(Debug, Clone, Copy)]
pub struct PolicyDecision {
    pub target_queue_depth_pct_or_slots: QueueDepth,
    pub rate_per_sec: Option<u32>,
    pub min_block_age_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum QueueDepth {
    Percent(u32),
    Slots(u32),
}

impl QueueDepth {
    fn resolve(self, slot_count: u32) -> u32 {
        match self {
            QueueDepth::Percent(p) => ((slot_count as u64 * p as u64) / 100).max(1) as u32,
            QueueDepth::Slots(s) => s,
        }
    }
}

/// The "standard / dirty-ratio" default policy, spec.md §4.8's table,
/// evaluated top-down on the current dirty ratio (a percentage 0..=100).
pub fn standard_policy(dirty_pct: u32) -> PolicyDecision {
    use QueueDepth::*;
    let (depth, rate, min_age) = if dirty_pct > 95 {
        (Percent(80), None, 0)
    } else if dirty_pct > 90 {
        (Percent(32), None, 0)
    } else if dirty_pct > 85 {
        (Percent(16), None, 0)
    } else if dirty_pct > 80 {
        (Percent(8), None, 0)
    } else if dirty_pct > 75 {
        (Percent(2), None, 0)
    } else if dirty_pct > 70 {
        (Percent(1), None, 0)
    } else if dirty_pct > 60 {
        (Slots(2), Some(300), 1)
    } else if dirty_pct > 50 {
        (Slots(2), Some(200), 1)
    } else if dirty_pct > 40 {
        (Slots(2), Some(100), 5)
    } else if dirty_pct > 30 {
        (Slots(2), Some(50), 10)
    } else if dirty_pct > 20 {
        (Slots(1), Some(50), 20)
    } else {
        (Slots(1), Some(30), 30)
    };
    PolicyDecision { target_queue_depth_pct_or_slots: depth, rate_per_sec: rate, min_block_age_secs: min_age }
}

/// Flush-aggressively override used when the cache is in write-through
/// mode (spec.md §4.8: "policy is overridden to flush aggressively").
pub fn writethrough_policy() -> PolicyDecision {
    PolicyDecision { target_queue_depth_pct_or_slots: QueueDepth::Percent(100), rate_per_sec: None, min_block_age_secs: 0 }
}

/// Smooths the per-cycle greedyness bias (-10..+20) from a short moving
/// window of observed dirty-ratio deltas, per SPEC_FULL.md's supplemented
/// feature grounded in the original's bgwriter.
pub struct GreedynessTracker {
    window: Mutex<std::collections::VecDeque<f64>>,
    base: AtomicI32,
}

const WINDOW_LEN: usize = 8;

impl GreedynessTracker {
    pub fn new(base: i32) -> GreedynessTracker {
        GreedynessTracker { window: Mutex::new(std::collections::VecDeque::with_capacity(WINDOW_LEN)), base: AtomicI32::new(base) }
    }

    pub fn set_base(&self, base: i32) {
        self.base.store(base, Ordering::Relaxed);
    }

    /// Records the current dirty ratio and returns the bias to apply this
    /// cycle: the configured base, nudged up when the ratio has been
    /// climbing over the window and down when it has been falling,
    /// clamped to spec.md's -10..+20.
    pub fn observe(&self, dirty_ratio: f64) -> i32 {
        let mut w = self.window.lock().unwrap();
        if w.len() == WINDOW_LEN {
            w.pop_front();
        }
        w.push_back(dirty_ratio);
        let trend = if w.len() >= 2 { w[w.len() - 1] - w[0] } else { 0.0 };
        let nudge = (trend * 100.0) as i32; // percentage points of ratio change across the window
        (self.base.load(Ordering::Relaxed) + nudge).clamp(-10, 20)
    }
}

/// Greedyness-biased queue depth, clamped to `[1, target]` as spec.md
/// §4.8 requires.
fn biased_depth(target: u32, greedyness: i32) -> u32 {
    let biased = target as i64 + greedyness as i64;
    biased.clamp(1, target.max(1) as i64) as u32
}

/// Whether the next dirty block in cluster order is address-contiguous
/// with the previous one, ending a cluster early otherwise (SPEC_FULL.md's
/// supplemented cluster-contiguity check).
pub fn is_contiguous(prev_sector: u64, candidate_sector: u64) -> bool {
    candidate_sector == prev_sector + crate::layout::SECTORS_PER_BLOCK
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BgWriterStats {
    pub cycles: u64,
    pub flushed: u64,
    pub shortcut_invalidated: u64,
}

/// Drives dirty blocks through `writeback_one`/`writeback_invalidate_one`
/// on a background thread, per the policy computed each cycle.
pub struct BgWriter {
    conf: Mutex<BgWriterConf>,
    greedyness: GreedynessTracker,
    stats: Mutex<BgWriterStats>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl BgWriter {
    pub fn new(conf: BgWriterConf) -> BgWriter {
        BgWriter {
            greedyness: GreedynessTracker::new(conf.greedyness),
            conf: Mutex::new(conf),
            stats: Mutex::new(BgWriterStats::default()),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn set_conf(&self, conf: BgWriterConf) {
        self.greedyness.set_base(conf.greedyness);
        *self.conf.lock().unwrap() = conf;
    }

    pub fn conf(&self) -> BgWriterConf {
        *self.conf.lock().unwrap()
    }

    pub fn stats(&self) -> BgWriterStats {
        *self.stats.lock().unwrap()
    }

    /// Starts the worker. `writeback_one` flushes a held dirty block to
    /// clean; `invalidate_one` flushes-and-invalidates it instead, used
    /// when the invalidator is below its hysteresis threshold.
    /// `invalidator_pressure` reports whether that's currently the case.
    pub fn start(
        self: &Arc<Self>,
        directory: Arc<Directory>,
        writeback_one: Arc<dyn Fn(BlockId) + Send + Sync>,
        invalidate_one: Arc<dyn Fn(BlockId) + Send + Sync>,
        invalidator_pressure: Arc<dyn Fn() -> bool + Send + Sync>,
        cache_mode_is_writethrough: Arc<dyn Fn() -> bool + Send + Sync>,
        tick_interval: std::time::Duration,
    ) {
        self.running.store(true, Ordering::SeqCst);
        let this = self.clone();
        let running = self.running.clone();
        let h = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                this.run_cycle(&directory, &writeback_one, &invalidate_one, &invalidator_pressure, &cache_mode_is_writethrough);
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

    fn run_cycle(
        &self,
        directory: &Directory,
        writeback_one: &Arc<dyn Fn(BlockId) + Send + Sync>,
        invalidate_one: &Arc<dyn Fn(BlockId) + Send + Sync>,
        invalidator_pressure: &Arc<dyn Fn() -> bool + Send + Sync>,
        cache_mode_is_writethrough: &Arc<dyn Fn() -> bool + Send + Sync>,
    ) {
        let dirty_ratio = directory.dirty_ratio();
        let policy = if cache_mode_is_writethrough() { writethrough_policy() } else { standard_policy((dirty_ratio * 100.0) as u32) };
        let greedyness = self.greedyness.observe(dirty_ratio);
        let target = policy.target_queue_depth_pct_or_slots.resolve(directory.slot_count());
        let depth = biased_depth(target, greedyness);
        let cluster_size = self.conf.lock().unwrap().cluster_size.max(1);

        let mut flushed_this_cycle = 0u32;
        let mut last_sector: Option<u64> = None;
        let shortcut = invalidator_pressure();

        while flushed_this_cycle < depth {
            match directory.get_dirty_from_head(policy.min_block_age_secs) {
                GetDirtyOutcome::Ok(id) => {
                    let sector = directory.snapshot(id).sector;
                    if let (Some(prev), Some(cur)) = (last_sector, sector) {
                        if flushed_this_cycle % cluster_size == 0 && !is_contiguous(prev, cur) {
                            // Non-contiguous next candidate ends the cluster early; put it
                            // back and stop this cycle.
                            directory.update_held(
                                id,
                                crate::statemachine::State::Dirty,
                                crate::statemachine::TransitionPath::None,
                                None,
                                None,
                            );
                            directory.move_to_dirty(id);
                            break;
                        }
                    }
                    if shortcut {
                        invalidate_one(id);
                        self.stats.lock().unwrap().shortcut_invalidated += 1;
                    } else {
                        writeback_one(id);
                        self.stats.lock().unwrap().flushed += 1;
                    }
                    last_sector = sector;
                    flushed_this_cycle += 1;
                    if let Some(rate) = policy.rate_per_sec {
                        std::thread::sleep(std::time::Duration::from_millis(1000 / rate.max(1) as u64));
                    }
                }
                GetDirtyOutcome::Busy | GetDirtyOutcome::TooYoung | GetDirtyOutcome::Empty => break,
            }
        }
        self.stats.lock().unwrap().cycles += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_table_matches_spec_breakpoints() {
        assert!(matches!(standard_policy(96).target_queue_depth_pct_or_slots, QueueDepth::Percent(80)));
        assert!(matches!(standard_policy(91).target_queue_depth_pct_or_slots, QueueDepth::Percent(32)));
        assert!(matches!(standard_policy(10).target_queue_depth_pct_or_slots, QueueDepth::Slots(1)));
        assert_eq!(standard_policy(10).rate_per_sec, Some(30));
        assert_eq!(standard_policy(10).min_block_age_secs, 30);
    }

    #[test]
    fn idle_cache_uses_lowest_tier() {
        let p = standard_policy(0);
        assert!(matches!(p.target_queue_depth_pct_or_slots, QueueDepth::Slots(1)));
    }

    #[test]
    fn full_dirty_uses_highest_tier() {
        let p = standard_policy(100);
        assert!(matches!(p.target_queue_depth_pct_or_slots, QueueDepth::Percent(80)));
        assert_eq!(p.rate_per_sec, None);
        assert_eq!(p.min_block_age_secs, 0);
    }

    #[test]
    fn biased_depth_is_clamped() {
        assert_eq!(biased_depth(10, -20), 1);
        assert_eq!(biased_depth(1, 20), 1);
        assert_eq!(biased_depth(10, 5), 15.min(10));
    }

    #[test]
    fn contiguity_check() {
        assert!(is_contiguous(0, crate::layout::SECTORS_PER_BLOCK));
        assert!(!is_contiguous(0, crate::layout::SECTORS_PER_BLOCK * 2));
    }

    #[test]
    fn greedyness_tracks_rising_trend_upward() {
        let g = GreedynessTracker::new(0);
        let mut last = 0;
        for i in 0..8 {
            last = g.observe(i as f64 / 10.0);
        }
        assert!(last >= 0);
    }
}
