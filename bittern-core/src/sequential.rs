//! Sequential-I/O bypass: per-process stream trackers that route long
//! sequential runs straight to the backing device, skipping the directory
//! entirely (spec.md §4.10).

use spin::Mutex;

const MAX_STREAMS: usize = 32;

#[derive(Debug, Clone, Copy)]
struct Stream {
    pid: u32,
    last_sector: u64,
    length_sectors: u64,
    bypassing: bool,
    last_hit: std::time::Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// No existing stream matched; a new one was opened (or an LRU victim
    /// was reused), not yet past threshold.
    Tracking,
    /// The stream crossed the bypass threshold on a prior request; this
    /// one should bypass the cache.
    Bypass,
    /// Bypass is disabled, or the request didn't extend any live stream
    /// far enough yet.
    NoBypass,
}

/// One direction's (read or write) LRU of up to 32 per-process stream
/// records.
pub struct StreamTracker {
    direction: &'static str,
    streams: Mutex<Vec<Stream>>,
    threshold_sectors: Mutex<u32>,
    timeout: Mutex<std::time::Duration>,
    enabled: std::sync::atomic::AtomicBool,
    hits: std::sync::atomic::AtomicU64,
}

impl StreamTracker {
    pub fn new(direction: &'static str, conf: crate::config::BypassConf) -> StreamTracker {
        StreamTracker {
            direction,
            streams: Mutex::new(Vec::with_capacity(MAX_STREAMS)),
            threshold_sectors: Mutex::new(conf.threshold_sectors),
            timeout: Mutex::new(std::time::Duration::from_millis(conf.timeout_ms as u64)),
            enabled: std::sync::atomic::AtomicBool::new(conf.enabled),
            hits: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn set_conf(&self, conf: crate::config::BypassConf) {
        self.enabled.store(conf.enabled, std::sync::atomic::Ordering::Relaxed);
        *self.threshold_sectors.lock() = conf.threshold_sectors;
        *self.timeout.lock() = std::time::Duration::from_millis(conf.timeout_ms as u64);
    }

    /// Observes one request. `start_sector`/`len_sectors` describe the
    /// request; `pid` identifies the originating process. A request that
    /// already hit an existing valid cache block must never be marked
    /// bypass (spec.md §4.10's "never bypassed if it hits" rule) -- the
    /// caller passes `already_cache_hit` so this tracker can still update
    /// its stream length bookkeeping without emitting `Bypass`.
    pub fn observe(&self, pid: u32, start_sector: u64, len_sectors: u64, already_cache_hit: bool) -> StreamOutcome {
        if !self.enabled.load(std::sync::atomic::Ordering::Relaxed) {
            return StreamOutcome::NoBypass;
        }
        let threshold = *self.threshold_sectors.lock() as u64;
        let now = std::time::Instant::now();
        let mut streams = self.streams.lock();

        if let Some(pos) = streams.iter().position(|s| s.pid == pid && s.last_sector == start_sector) {
            let s = &mut streams[pos];
            s.length_sectors += len_sectors;
            s.last_sector = start_sector + len_sectors;
            s.last_hit = now;
            if s.length_sectors >= threshold {
                s.bypassing = true;
            }
            let bypassing = s.bypassing;
            if bypassing && !already_cache_hit {
                self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return StreamOutcome::Bypass;
            }
            return StreamOutcome::Tracking;
        }

        // No matching stream: open (or recycle) one rooted at this request.
        let fresh = Stream {
            pid,
            last_sector: start_sector + len_sectors,
            length_sectors: len_sectors,
            bypassing: false,
            last_hit: now,
        };
        if streams.len() < MAX_STREAMS {
            streams.push(fresh);
        } else if let Some(victim) = streams.iter().enumerate().min_by_key(|(_, s)| s.last_hit).map(|(i, _)| i) {
            streams[victim] = fresh;
        }
        StreamOutcome::Tracking
    }

    /// Reclaims streams that haven't seen a hit in `timeout`. Run
    /// periodically by the background reclaim worker.
    pub fn reclaim_stale(&self) {
        let timeout = *self.timeout.lock();
        let now = std::time::Instant::now();
        self.streams.lock().retain(|s| now.duration_since(s.last_hit) < timeout);
    }

    pub fn bypass_hits(&self) -> u64 {
        self.hits.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn live_stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// `sequential` observability key: one line per live stream.
    pub fn dump(&self) -> Vec<String> {
        let streams = self.streams.lock();
        streams
            .iter()
            .map(|s| {
                format!(
                    "{}: pid={} last_sector={} length_sectors={} bypassing={}",
                    self.direction, s.pid, s.last_sector, s.length_sectors, s.bypassing
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BypassConf;

    fn tracker(threshold_sectors: u32) -> StreamTracker {
        StreamTracker::new("write", BypassConf { enabled: true, threshold_sectors, timeout_ms: 5_000 })
    }

    #[test]
    fn short_run_does_not_bypass() {
        let t = tracker(100);
        assert_eq!(t.observe(1, 0, 8, false), StreamOutcome::Tracking);
        assert_eq!(t.observe(1, 8, 8, false), StreamOutcome::Tracking);
    }

    #[test]
    fn sequential_run_crosses_threshold_then_bypasses() {
        // threshold 4 sectors (2 KiB); 16 requests of 8 sectors (4 KiB) each.
        let t = tracker(4);
        let mut bypassed = 0;
        let mut sector = 0u64;
        for _ in 0..16 {
            match t.observe(42, sector, 8, false) {
                StreamOutcome::Bypass => bypassed += 1,
                StreamOutcome::Tracking => {}
                StreamOutcome::NoBypass => panic!("bypass is enabled"),
            }
            sector += 8;
        }
        assert!(bypassed >= 14, "expected most requests past the first to bypass, got {bypassed}");
        assert_eq!(t.bypass_hits(), bypassed);
    }

    #[test]
    fn cache_hit_is_never_marked_bypass_even_once_streaming() {
        let t = tracker(4);
        t.observe(1, 0, 8, false);
        t.observe(1, 8, 8, false);
        // Stream is now past threshold, but this particular request hit
        // an existing valid block, so it must not bypass.
        assert_eq!(t.observe(1, 16, 8, true), StreamOutcome::Tracking);
    }

    #[test]
    fn disabled_tracker_never_bypasses() {
        let t = StreamTracker::new("read", BypassConf { enabled: false, threshold_sectors: 1, timeout_ms: 5_000 });
        for i in 0..10 {
            assert_eq!(t.observe(1, i * 8, 8, false), StreamOutcome::NoBypass);
        }
    }

    #[test]
    fn reclaim_drops_stale_streams() {
        let t = StreamTracker::new("read", BypassConf { enabled: true, threshold_sectors: 1000, timeout_ms: 1 });
        t.observe(1, 0, 8, false);
        assert_eq!(t.live_stream_count(), 1);
        std::thread::sleep(std::time::Duration::from_millis(20));
        t.reclaim_stale();
        assert_eq!(t.live_stream_count(), 0);
    }

    #[test]
    fn different_pids_do_not_share_a_stream() {
        let t = tracker(1000);
        t.observe(1, 0, 8, false);
        t.observe(2, 8, 8, false); // same sector range, different pid
        assert_eq!(t.live_stream_count(), 2);
    }
}
