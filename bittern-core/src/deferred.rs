//! Deferred-request scheduler: the two FIFO queues that absorb contention
//! on busy blocks and buffer/slot exhaustion (spec.md §4.5), plus the
//! worker that re-attempts each queue's head whenever its generation
//! counter advances.
//!
//! Each queue holds a retry thunk rather than the original request type,
//! so `deferred` has no dependency on `cache`'s request shape -- it only
//! knows how to re-run "the thing that failed" when conditions might have
//! changed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Condvar;

use spin::Mutex;

/// A queued retry: re-running it returns `true` if the work completed
/// (and should be dropped from the queue) or `false` if it must be
/// requeued (conditions still aren't met).
pub type Retry = Box<dyn FnMut() -> bool + Send>;

struct Entry {
    retry: Retry,
    enqueued_at: std::time::Instant,
}

struct QueueInner {
    entries: std::collections::VecDeque<Entry>,
    max_depth: usize,
    requeue_count: u64,
    total_wait: std::time::Duration,
}

/// One of the two deferred queues (`wait_busy` or `wait_page`). Armed by a
/// generation counter: the worker only wakes (and walks the queue once)
/// when the counter advances past what it last observed.
pub struct DeferredQueue {
    name: &'static str,
    inner: Mutex<QueueInner>,
    generation: AtomicU64,
    condvar: Condvar,
    wake_lock: std::sync::Mutex<()>,
}

/// Point-in-time stats for the `dump_deferred*` / `stats` observability
/// keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub curr_depth: usize,
    pub max_depth: usize,
    pub requeue_count: u64,
}

impl DeferredQueue {
    pub fn new(name: &'static str) -> DeferredQueue {
        DeferredQueue {
            name,
            inner: Mutex::new(QueueInner {
                entries: std::collections::VecDeque::new(),
                max_depth: 0,
                requeue_count: 0,
                total_wait: std::time::Duration::ZERO,
            }),
            generation: AtomicU64::new(0),
            condvar: Condvar::new(),
            wake_lock: std::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn push(&self, retry: Retry) {
        let mut g = self.inner.lock();
        g.entries.push_back(Entry { retry, enqueued_at: std::time::Instant::now() });
        g.max_depth = g.max_depth.max(g.entries.len());
        drop(g);
        self.bump();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumps the generation counter and wakes the worker. Called whenever
    /// something happens that might unblock the head of this queue: any
    /// request completion for `wait_busy`, any resource release for
    /// `wait_page`.
    pub fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _lock = self.wake_lock.lock().unwrap();
        self.condvar.notify_all();
    }

    /// Walks the queue once, re-attempting every entry in FIFO order.
    /// Entries whose retry returns `false` go back to the tail; the scan
    /// stops re-attempting once the queue has been walked exactly once
    /// (so a permanently-stuck head doesn't spin the worker).
    fn drain_once(&self) {
        let mut g = self.inner.lock();
        let rounds = g.entries.len();
        for _ in 0..rounds {
            let Some(mut entry) = g.entries.pop_front() else { break };
            // Re-attempt without holding the queue lock across user code.
            drop(g);
            let done = (entry.retry)();
            g = self.inner.lock();
            if done {
                g.total_wait += entry.enqueued_at.elapsed();
            } else {
                g.requeue_count += 1;
                g.entries.push_back(entry);
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        let g = self.inner.lock();
        QueueStats { curr_depth: g.entries.len(), max_depth: g.max_depth, requeue_count: g.requeue_count }
    }

    fn observed_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Runs one queue's worker loop on the calling thread until `stop` fires.
/// Blocks on the queue's own generation counter between wake-ups, exactly
/// as spec.md §4.5 describes: "its worker wakes on its own generation
/// counter".
fn worker_loop(queue: &DeferredQueue, stop: &std::sync::atomic::AtomicBool) {
    let mut last_seen = queue.observed_generation();
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let lock = queue.wake_lock.lock().unwrap();
        let (_lock, _timeout) = queue
            .condvar
            .wait_timeout(lock, std::time::Duration::from_millis(50))
            .unwrap();
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let now = queue.observed_generation();
        if now != last_seen || !queue.is_empty() {
            last_seen = now;
            queue.drain_once();
        }
    }
}

/// Owns both deferred queues and the two worker threads spec.md §2's
/// component table lists (one per queue).
pub struct DeferredScheduler {
    pub wait_busy: std::sync::Arc<DeferredQueue>,
    pub wait_page: std::sync::Arc<DeferredQueue>,
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl DeferredScheduler {
    pub fn start() -> DeferredScheduler {
        let wait_busy = std::sync::Arc::new(DeferredQueue::new("wait_busy"));
        let wait_page = std::sync::Arc::new(DeferredQueue::new("wait_page"));
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut workers = Vec::new();
        for q in [wait_busy.clone(), wait_page.clone()] {
            let stop = stop.clone();
            workers.push(std::thread::spawn(move || worker_loop(&q, &stop)));
        }

        DeferredScheduler { wait_busy, wait_page, stop, workers }
    }
}

impl Drop for DeferredScheduler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.wait_busy.bump();
        self.wait_page.bump();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn push_and_stats_track_depth() {
        let q = DeferredQueue::new("t");
        q.push(Box::new(|| false));
        q.push(Box::new(|| false));
        assert_eq!(q.stats().curr_depth, 2);
        assert_eq!(q.stats().max_depth, 2);
    }

    #[test]
    fn drain_once_requeues_failures_and_drops_successes() {
        let q = DeferredQueue::new("t");
        let succeeded = Arc::new(AtomicUsize::new(0));
        let s = succeeded.clone();
        q.push(Box::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
            true
        }));
        q.push(Box::new(|| false));
        q.drain_once();
        assert_eq!(succeeded.load(Ordering::SeqCst), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn scheduler_worker_eventually_drains_pushed_retry() {
        let sched = DeferredScheduler::start();
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        sched.wait_page.push(Box::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
            true
        }));
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
