//! Verifier: an optional background consistency scan comparing in-memory,
//! on-media, and backing-device contents for clean blocks (spec.md
//! §4.11).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::directory::{BlockId, Directory};
use crate::hash::Hash128;
use crate::statemachine::State;

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifierCounts {
    pub verified: u64,
    pub not_verified_dirty: u64,
    pub busy: u64,
    pub invalid: u64,
    pub errors: u64,
}

/// Per-block outcome the scan loop reports back up to `cache`, which owns
/// the actual page reads (cache + backing device) and metadata-slot read.
pub enum VerifyOutcome {
    Verified,
    Mismatch { block: BlockId, expected: Hash128, got_cache: Hash128, got_device: Hash128 },
    SkippedDirty,
    SkippedBusy,
    SkippedInvalid,
}

pub struct Verifier {
    running: Arc<AtomicBool>,
    one_shot: AtomicBool,
    scan_delay: Mutex<std::time::Duration>,
    bugon_on_errors: AtomicBool,
    counts: Mutex<VerifierCounts>,
    cursor: AtomicU64,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Verifier {
    pub fn new(conf: crate::config::VerifierConf) -> Verifier {
        Verifier {
            running: Arc::new(AtomicBool::new(conf.running)),
            one_shot: AtomicBool::new(conf.one_shot),
            scan_delay: Mutex::new(std::time::Duration::from_millis(conf.scan_delay_ms as u64)),
            bugon_on_errors: AtomicBool::new(conf.bugon_on_errors),
            counts: Mutex::new(VerifierCounts::default()),
            cursor: AtomicU64::new(0),
            handle: Mutex::new(None),
        }
    }

    pub fn set_conf(&self, conf: crate::config::VerifierConf) {
        self.running.store(conf.running, Ordering::SeqCst);
        self.one_shot.store(conf.one_shot, Ordering::SeqCst);
        *self.scan_delay.lock().unwrap() = std::time::Duration::from_millis(conf.scan_delay_ms as u64);
        self.bugon_on_errors.store(conf.bugon_on_errors, Ordering::SeqCst);
    }

    pub fn counts(&self) -> VerifierCounts {
        *self.counts.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One step of the scan: acquires the next block by id (wrapping),
    /// releases it, and folds `verify_one`'s outcome into the running
    /// counts. `verify_one` is the cache-supplied closure that actually
    /// reads cache+device pages and checks hashes; this module only owns
    /// the scan cursor and policy (running/one-shot/delay/fatal).
    fn step(&self, directory: &Directory, verify_one: &dyn Fn(BlockId) -> VerifyOutcome) {
        let slot_count = directory.slot_count();
        if slot_count == 0 {
            return;
        }
        let id = (self.cursor.fetch_add(1, Ordering::SeqCst) % slot_count as u64) as u32 + 1;

        let Some(held) = directory.get_by_id(id) else {
            self.counts.lock().unwrap().busy += 1;
            return;
        };
        let snap = directory.snapshot(held);
        let outcome = if snap.state != State::Clean {
            directory.put(held, false);
            match snap.state {
                State::Dirty => VerifyOutcome::SkippedDirty,
                _ => VerifyOutcome::SkippedInvalid,
            }
        } else {
            let outcome = verify_one(held);
            directory.put(held, false);
            outcome
        };

        let mut counts = self.counts.lock().unwrap();
        match outcome {
            VerifyOutcome::Verified => counts.verified += 1,
            VerifyOutcome::SkippedDirty => counts.not_verified_dirty += 1,
            VerifyOutcome::SkippedBusy => counts.busy += 1,
            VerifyOutcome::SkippedInvalid => counts.invalid += 1,
            VerifyOutcome::Mismatch { .. } => {
                counts.errors += 1;
                if self.bugon_on_errors.load(Ordering::SeqCst) {
                    drop(counts);
                    panic!("verifier: cache/device content mismatch and bugon_on_errors is set");
                }
            }
        }
    }

    pub fn start(self: &Arc<Self>, directory: Arc<Directory>, verify_one: Arc<dyn Fn(BlockId) -> VerifyOutcome + Send + Sync>) {
        let this = self.clone();
        let h = std::thread::spawn(move || loop {
            if !this.running.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(50));
                continue;
            }
            this.step(&directory, verify_one.as_ref());
            if this.one_shot.load(Ordering::SeqCst) && this.cursor.load(Ordering::SeqCst) >= directory.slot_count() as u64 {
                this.running.store(false, Ordering::SeqCst);
            }
            let delay = *this.scan_delay.lock().unwrap();
            std::thread::sleep(delay.max(std::time::Duration::from_millis(1)));
        });
        *self.handle.lock().unwrap() = Some(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplacementPolicy;
    use crate::directory::{AllocateAs, GetOutcome};
    use crate::statemachine::TransitionPath;

    #[test]
    fn step_skips_invalid_blocks() {
        let dir = Arc::new(Directory::new(4, ReplacementPolicy::Fifo));
        let v = Verifier::new(crate::config::VerifierConf { running: true, one_shot: false, scan_delay_ms: 0, bugon_on_errors: false });
        v.step(&dir, &|_| VerifyOutcome::Verified);
        assert_eq!(v.counts().invalid, 1);
    }

    #[test]
    fn step_skips_dirty_blocks_without_invoking_verify_one() {
        let dir = Arc::new(Directory::new(2, ReplacementPolicy::Fifo));
        let id = match dir.get(1, AllocateAs::DirtyNoData) {
            GetOutcome::MissInvalidIdle(id) => id,
            other => panic!("{other:?}"),
        };
        dir.update_held(id, State::Dirty, TransitionPath::None, Some(1), None);
        dir.move_to_dirty(id);

        let v = Verifier::new(crate::config::VerifierConf { running: true, one_shot: false, scan_delay_ms: 0, bugon_on_errors: false });
        v.cursor.store((id - 1) as u64, Ordering::SeqCst);
        v.step(&dir, &|_| panic!("must not verify a dirty block"));
        assert_eq!(v.counts().not_verified_dirty, 1);
    }
}
