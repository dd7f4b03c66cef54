//! The cache engine's pivot: the `Cache` type that owns every other
//! module's instance, the per-request path dispatcher that drives a held
//! block through its state-machine transition, and the control-message
//! surface (spec.md §5, §6).
//!
//! `map()` is the single external entry point: it validates the request,
//! looks the target block up under the directory lock, and either hands
//! the rest of the work to a pool worker thread or defers the request
//! onto one of the two deferred queues. The pool worker drives pmem/devio
//! calls through `block_on`, converting their completion-callback idiom
//! into a plain blocking call on that thread -- the same pattern already
//! used by `pmem`'s and `devio`'s own unit tests -- so each transition
//! handler below reads as straight-line code even though the layers
//! underneath are asynchronous.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};

use crate::bgwriter::BgWriter;
use crate::bufpool::BufferPool;
use crate::config::{BgWriterConf, CacheMode, ReplacementPolicy, Tunables, VerifierConf};
use crate::deferred::DeferredScheduler;
use crate::devio::DevIo;
use crate::directory::{BlockId, Directory, GetOutcome};
use crate::error::{Error, Result};
use crate::hash::{murmurhash3_128, Hash128};
use crate::invalidator::Invalidator;
use crate::layout::{self, OnMediaState, SuperBlock, CACHE_BLOCK_SIZE, SECTORS_PER_BLOCK, SECTOR_SIZE};
use crate::pmem::{Completion, FilePmem, PageHandle, PmemInterface};
use crate::sequential::{StreamOutcome, StreamTracker};
use crate::statemachine::{terminal_state, PathKind, State, TransitionPath, WorkItem};
use crate::verifier::{VerifyOutcome, Verifier};

/// Number of worker threads draining admitted requests. Distinct from
/// `pmem`'s own I/O pool: this pool runs the state-machine handlers
/// (directory bookkeeping plus the blocking pmem/devio calls they issue),
/// not raw device I/O.
const WORKER_COUNT: usize = 16;

/// One buffer per four cache slots, floored at 32 -- generous enough that
/// ordinary traffic never blocks on `AllocMode::Wait`, without sizing the
/// pool to the whole cache.
const BUFPOOL_SLOTS_PER_BUFFER: u32 = 4;
const BUFPOOL_MIN_BUFFERS: usize = 32;

fn sector_align(sector: u64) -> u64 {
    sector - sector % SECTORS_PER_BLOCK
}

fn intra_offset(sector: u64) -> usize {
    ((sector - sector_align(sector)) * SECTOR_SIZE as u64) as usize
}

fn full_block(len_bytes: u32) -> bool {
    len_bytes as usize == CACHE_BLOCK_SIZE
}

fn parse_u32(s: &str) -> Result<u32> {
    s.parse().map_err(|_| Error::InvalidArgument(format!("expected an integer, got {s:?}")))
}

fn parse_i32(s: &str) -> Result<i32> {
    s.parse().map_err(|_| Error::InvalidArgument(format!("expected an integer, got {s:?}")))
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        other => Err(Error::InvalidArgument(format!("expected a boolean, got {other:?}"))),
    }
}

/// Runs an async pmem/devio call to completion on the calling thread,
/// converting its `Completion` callback into a blocking return value.
fn block_on<T: Send + 'static>(f: impl FnOnce(Completion<T>)) -> Result<T> {
    let (tx, rx) = std::sync::mpsc::channel();
    f(Box::new(move |r| {
        let _ = tx.send(r);
    }));
    rx.recv().expect("completion channel closed without firing")
}

/// One step of a work item's path: advances it, asserts the path isn't
/// already exhausted, and returns the phase just entered.
fn step(wi: &mut WorkItem) -> TransitionPath {
    wi.advance().expect("path has more phases than this handler drove")
}

/// The final step of a work item's path: asserts there is no phase left.
fn finish_path(wi: &mut WorkItem) {
    let done = wi.advance();
    debug_assert!(done.is_none(), "path has a trailing phase this handler didn't drive");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    Flush,
    Discard,
}

/// One block-I/O request, already known by the caller to address a range
/// that fits entirely within a single cache block (spec.md §6's
/// precondition -- a caller spanning more must split it first).
#[derive(Debug, Clone)]
pub struct Request {
    pub kind: RequestKind,
    /// Absolute backing-device sector, 512-byte-aligned.
    pub sector: u64,
    pub len_bytes: u32,
    pub pid: u32,
    /// Write payload; ignored for `Read`/`Flush`/`Discard`.
    pub data: Vec<u8>,
}

impl Request {
    pub fn read(sector: u64, len_bytes: u32, pid: u32) -> Request {
        Request { kind: RequestKind::Read, sector, len_bytes, pid, data: Vec::new() }
    }
    pub fn write(sector: u64, pid: u32, data: Vec<u8>) -> Request {
        let len_bytes = data.len() as u32;
        Request { kind: RequestKind::Write, sector, len_bytes, pid, data }
    }
    pub fn flush() -> Request {
        Request { kind: RequestKind::Flush, sector: 0, len_bytes: 0, pid: 0, data: Vec::new() }
    }
    pub fn discard(sector: u64, len_bytes: u32, pid: u32) -> Request {
        Request { kind: RequestKind::Discard, sector, len_bytes, pid, data: Vec::new() }
    }
}

/// The result handed back to `map()`'s completion closure.
#[derive(Debug, Clone, Default)]
pub struct CompletedRequest {
    /// Read result; empty for writes, flushes, and discards.
    pub data: Vec<u8>,
}

impl CompletedRequest {
    fn empty() -> CompletedRequest {
        CompletedRequest::default()
    }
    fn data(data: Vec<u8>) -> CompletedRequest {
        CompletedRequest { data }
    }
}

pub type RequestCompletion = Box<dyn FnOnce(Result<CompletedRequest>) + Send>;

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub reads: u64,
    pub writes: u64,
    pub read_hits: u64,
    pub read_misses: u64,
    pub write_hits: u64,
    pub write_misses: u64,
    pub read_device_requests: u64,
    pub write_device_requests: u64,
    pub flushes: u64,
    pub discards: u64,
    pub dirty_write_clones: u64,
    pub writebacks: u64,
    pub writeback_invalidations: u64,
    pub clean_invalidations: u64,
    pub bypassed: u64,
    pub verify_mismatches: u64,
}

/// Fixed-size pool draining admitted requests. Kept separate from
/// `pmem::FilePmem`'s own I/O pool: jobs submitted here run a whole
/// transition handler (directory bookkeeping plus the blocking pmem/devio
/// calls it issues), not a single device operation.
struct WorkerPool {
    tx: Sender<Box<dyn FnOnce() + Send>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(n: usize) -> WorkerPool {
        let (tx, rx) = bounded::<Box<dyn FnOnce() + Send>>(4096);
        let mut workers = Vec::with_capacity(n);
        for _ in 0..n.max(1) {
            let rx = rx.clone();
            workers.push(std::thread::spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            }));
        }
        WorkerPool { tx, workers: Mutex::new(workers) }
    }

    fn submit(&self, job: Box<dyn FnOnce() + Send>) {
        let _ = self.tx.send(job);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for w in workers {
            let _ = w.join();
        }
    }
}

/// The cache engine: owns the directory, the pmem/devio device handles,
/// every background worker, and the control-message surface.
pub struct Cache {
    slot_count: u32,
    directory: Arc<Directory>,
    pmem: Arc<dyn PmemInterface>,
    devio: Arc<DevIo>,
    #[allow(dead_code)]
    bufpool: Arc<BufferPool>,
    xid: Arc<layout::XidGenerator>,
    tunables: Mutex<Tunables>,
    deferred: DeferredScheduler,
    bgwriter: Arc<BgWriter>,
    invalidator: Arc<Invalidator>,
    verifier: Arc<Verifier>,
    read_bypass: Arc<StreamTracker>,
    write_bypass: Arc<StreamTracker>,
    pending: AtomicU64,
    work_seq: AtomicU64,
    failed: AtomicBool,
    stats: Mutex<CacheStats>,
    tracked_hashes: Mutex<Option<hashbrown::HashMap<u64, Hash128>>>,
    workers: WorkerPool,
    write_to_a: AtomicBool,
    superblock: Mutex<SuperBlock>,
}

impl Cache {
    /// `cache-create`: initializes a fresh on-media layout, then opens it.
    pub fn create(backing: std::fs::File, cache_dev: std::fs::File, slot_count: u32, tunables: Tunables) -> Result<Arc<Cache>> {
        layout::initialize(&cache_dev, slot_count)?;
        let (sb, outcome) = layout::restore(&cache_dev)?;
        Cache::from_parts(backing, cache_dev, sb, outcome, tunables)
    }

    /// `cache-restore`: reads back an existing on-media layout.
    pub fn restore(backing: std::fs::File, cache_dev: std::fs::File, tunables: Tunables) -> Result<Arc<Cache>> {
        let (sb, outcome) = layout::restore(&cache_dev)?;
        Cache::from_parts(backing, cache_dev, sb, outcome, tunables)
    }

    fn from_parts(
        backing: std::fs::File,
        cache_dev: std::fs::File,
        sb: SuperBlock,
        outcome: layout::RestoreOutcome,
        tunables: Tunables,
    ) -> Result<Arc<Cache>> {
        let slot_count = sb.slot_count;
        let bufpool_capacity = ((slot_count / BUFPOOL_SLOTS_PER_BUFFER) as usize).max(BUFPOOL_MIN_BUFFERS);
        let bufpool = Arc::new(BufferPool::new(bufpool_capacity));
        let pmem: Arc<dyn PmemInterface> = Arc::new(FilePmem::new(cache_dev, slot_count, bufpool.clone()));
        let devio = DevIo::new(backing, tunables.devio_fua_insert as u64, tunables.devio_worker_delay_ms as u64);
        let directory = Arc::new(Directory::new(slot_count, tunables.replacement));
        let restored: Vec<(BlockId, crate::layout::MetadataSlot)> = outcome.slots.iter().map(|rs| (rs.block_id, rs.slot)).collect();
        directory.restore_from(&restored);
        let xid = Arc::new(layout::XidGenerator::starting_at(outcome.max_xid));

        let cache = Arc::new(Cache {
            slot_count,
            directory,
            pmem,
            devio,
            bufpool,
            xid,
            read_bypass: Arc::new(StreamTracker::new("read", tunables.read_bypass)),
            write_bypass: Arc::new(StreamTracker::new("write", tunables.write_bypass)),
            bgwriter: Arc::new(BgWriter::new(tunables.bgwriter)),
            invalidator: Arc::new(Invalidator::new(tunables.invalidator_min_invalid_count)),
            verifier: Arc::new(Verifier::new(tunables.verifier)),
            tunables: Mutex::new(tunables),
            deferred: DeferredScheduler::start(),
            pending: AtomicU64::new(0),
            work_seq: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            stats: Mutex::new(CacheStats::default()),
            tracked_hashes: Mutex::new(None),
            workers: WorkerPool::new(WORKER_COUNT),
            write_to_a: AtomicBool::new(true),
            superblock: Mutex::new(sb),
        });
        cache.start_background_workers();
        Ok(cache)
    }

    fn start_background_workers(self: &Arc<Self>) {
        let directory = self.directory.clone();
        let weak: Weak<Cache> = Arc::downgrade(self);

        self.bgwriter.start(
            directory.clone(),
            Arc::new({
                let weak = weak.clone();
                move |id: BlockId| {
                    if let Some(c) = weak.upgrade() {
                        do_writeback(&c, id);
                    }
                }
            }),
            Arc::new({
                let weak = weak.clone();
                move |id: BlockId| {
                    if let Some(c) = weak.upgrade() {
                        do_writeback_invalidate(&c, id);
                    }
                }
            }),
            Arc::new({
                let weak = weak.clone();
                move || weak.upgrade().map(|c| c.invalidator.below_threshold()).unwrap_or(false)
            }),
            Arc::new({
                let weak = weak.clone();
                move || weak.upgrade().map(|c| c.cache_mode() == CacheMode::Writethrough).unwrap_or(false)
            }),
            std::time::Duration::from_millis(200),
        );

        self.invalidator.start(
            directory.clone(),
            Arc::new({
                let weak = weak.clone();
                move |id: BlockId| {
                    if let Some(c) = weak.upgrade() {
                        do_clean_invalidate(&c, id);
                    }
                }
            }),
            std::time::Duration::from_millis(200),
        );

        self.verifier.start(
            directory,
            Arc::new(move |id: BlockId| weak.upgrade().map(|c| verify_one(&c, id)).unwrap_or(VerifyOutcome::SkippedInvalid)),
        );
    }

    fn next_work_id(&self) -> u64 {
        self.work_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn cache_mode(&self) -> CacheMode {
        self.tunables.lock().unwrap().cache_mode
    }

    fn is_writeback(&self) -> bool {
        self.cache_mode() == CacheMode::Writeback
    }

    fn admit(&self) -> bool {
        let cap = self.tunables.lock().unwrap().max_pending_requests as u64;
        let mut cur = self.pending.load(Ordering::SeqCst);
        loop {
            if cur >= cap {
                return false;
            }
            match self.pending.compare_exchange_weak(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn complete(&self, completion: RequestCompletion, result: Result<CompletedRequest>) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.deferred.wait_page.bump();
        self.deferred.wait_busy.bump();
        completion(result);
    }

    fn read_cache_page(&self, id: BlockId) -> Result<PageHandle> {
        block_on(|c| self.pmem.get_page_for_read(id - 1, c))
    }
    fn write_cache_page(&self, id: BlockId) -> Result<PageHandle> {
        block_on(|c| self.pmem.get_page_for_write(id - 1, c))
    }
    fn put_cache_page(&self, handle: PageHandle, dirty: bool) -> Result<()> {
        block_on(|c| self.pmem.put_page(handle, dirty, c))
    }
    fn device_read(&self, sector: u64, len: usize) -> Result<Vec<u8>> {
        block_on(|c| self.devio.submit_read(sector, len, c))
    }
    fn device_write(&self, sector: u64, data: Vec<u8>) -> Result<()> {
        block_on(|c| self.devio.submit_write(sector, data, c))
    }

    fn persist_metadata(&self, id: BlockId, state: OnMediaState, xid: u64, sector: Option<u64>, hash_data: Hash128) -> Result<()> {
        let slot = crate::layout::MetadataSlot { block_id: id, state, xid, sector, hash_data };
        block_on(|c| self.pmem.write_metadata_slot(id - 1, slot.to_bytes(), c))
    }

    fn track_hash_if_enabled(&self, sector: u64, hash: Hash128) {
        if let Some(map) = self.tracked_hashes.lock().unwrap().as_mut() {
            map.insert(sector, hash);
        }
    }

    fn set_tracked_hashes_enabled(&self, enabled: bool) {
        let mut g = self.tracked_hashes.lock().unwrap();
        *g = if enabled { Some(hashbrown::HashMap::new()) } else { None };
    }

    fn dump_tracked_hashes(&self) -> String {
        match self.tracked_hashes.lock().unwrap().as_ref() {
            None => "disabled".to_string(),
            Some(map) => map.iter().map(|(s, h)| format!("sector={s} hash={:x}{:x}", h.hi64, h.lo64)).collect::<Vec<_>>().join("\n"),
        }
    }

    /// External entry point (spec.md §6): validates the request and
    /// returns once it has been accepted. Actual I/O, and the caller's
    /// own `completion`, run asynchronously from here on.
    pub fn map(self: &Arc<Self>, req: Request, completion: RequestCompletion) -> Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::FailAll);
        }
        if req.len_bytes == 0 || req.len_bytes as usize % SECTOR_SIZE != 0 {
            return Err(Error::InvalidArgument("request length must be a nonzero multiple of 512 bytes".into()));
        }
        let block_sector = sector_align(req.sector);
        let offset = intra_offset(req.sector);
        if offset + req.len_bytes as usize > CACHE_BLOCK_SIZE {
            return Err(Error::InvalidArgument("request spans more than one cache block".into()));
        }
        if req.kind == RequestKind::Write && req.data.len() != req.len_bytes as usize {
            return Err(Error::InvalidArgument("write payload length does not match len_bytes".into()));
        }

        match req.kind {
            RequestKind::Flush => {
                self.stats.lock().unwrap().flushes += 1;
                completion(Ok(CompletedRequest::empty()));
                return Ok(());
            }
            RequestKind::Discard => {
                self.stats.lock().unwrap().discards += 1;
                completion(Ok(CompletedRequest::empty()));
                return Ok(());
            }
            RequestKind::Read => self.stats.lock().unwrap().reads += 1,
            RequestKind::Write => self.stats.lock().unwrap().writes += 1,
        }

        if !self.admit() {
            self.defer_admission(req, completion);
            return Ok(());
        }
        self.dispatch_or_defer(req, completion);
        Ok(())
    }

    /// Admission was over `max_pending_requests`; retry on `wait_page`
    /// until a slot opens up.
    fn defer_admission(self: &Arc<Self>, req: Request, completion: RequestCompletion) {
        let this = self.clone();
        let mut req_opt = Some(req);
        let mut completion_opt = Some(completion);
        self.deferred.wait_page.push(Box::new(move || {
            if !this.admit() {
                return false;
            }
            let req = req_opt.take().expect("retry thunk invoked twice");
            let completion = completion_opt.take().expect("retry thunk invoked twice");
            this.dispatch_or_defer(req, completion);
            true
        }));
    }

    fn defer_busy(self: &Arc<Self>, req: Request, completion: RequestCompletion) {
        let this = self.clone();
        let mut req_opt = Some(req);
        let mut completion_opt = Some(completion);
        self.deferred.wait_busy.push(Box::new(move || {
            let req = req_opt.take().expect("retry thunk invoked twice");
            let completion = completion_opt.take().expect("retry thunk invoked twice");
            this.dispatch_or_defer(req, completion);
            true
        }));
    }

    fn defer_page(self: &Arc<Self>, req: Request, completion: RequestCompletion) {
        let this = self.clone();
        let mut req_opt = Some(req);
        let mut completion_opt = Some(completion);
        self.deferred.wait_page.push(Box::new(move || {
            let req = req_opt.take().expect("retry thunk invoked twice");
            let completion = completion_opt.take().expect("retry thunk invoked twice");
            this.dispatch_or_defer(req, completion);
            true
        }));
    }

    /// Already admitted (pending counted): looks the block up under the
    /// directory lock and either submits the real work to the pool, or
    /// defers on whichever queue fits (spec.md §4.5).
    fn dispatch_or_defer(self: &Arc<Self>, req: Request, completion: RequestCompletion) {
        let block_sector = sector_align(req.sector);

        let is_read = req.kind == RequestKind::Read;
        let tracker: &Arc<StreamTracker> = if is_read { &self.read_bypass } else { &self.write_bypass };
        let len_sectors = req.len_bytes as u64 / SECTOR_SIZE as u64;
        let already_hit = self.directory.contains(block_sector);
        let outcome = tracker.observe(req.pid, req.sector, len_sectors, already_hit);

        if !already_hit && outcome == StreamOutcome::Bypass {
            let this = self.clone();
            self.workers.submit(Box::new(move || run_bypass(&this, req, completion)));
            return;
        }

        let allocate_as = match (req.kind, self.cache_mode()) {
            (RequestKind::Write, CacheMode::Writeback) => crate::directory::AllocateAs::DirtyNoData,
            _ => crate::directory::AllocateAs::CleanNoData,
        };

        match self.directory.get(block_sector, allocate_as) {
            GetOutcome::HitIdle(id) => {
                let this = self.clone();
                self.workers.submit(Box::new(move || execute(this, req, completion, id, false)));
            }
            GetOutcome::MissInvalidIdle(id) => {
                let this = self.clone();
                self.workers.submit(Box::new(move || execute(this, req, completion, id, true)));
            }
            GetOutcome::HitBusy(id) => {
                self.directory.put(id, false);
                self.defer_busy(req, completion);
            }
            GetOutcome::Miss => {
                self.defer_page(req, completion);
            }
        }
    }

    /// Control-message setter (spec.md §6's full key list).
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut t = self.tunables.lock().unwrap();
        match key {
            "cache_mode" => t.cache_mode = CacheMode::parse(value)?,
            "replacement" => {
                let p = ReplacementPolicy::parse(value)?;
                t.replacement = p;
                self.directory.set_replacement(p);
            }
            "max_pending_requests" => t.set_max_pending_requests(parse_u32(value)?)?,
            "invalidator_conf_min_invalid_count" => {
                let v = parse_u32(value)?;
                t.set_invalidator_min_invalid_count(v)?;
                self.invalidator.set_min_invalid_count(v);
            }
            "enable_extra_checksum_check" => {
                let v = parse_bool(value)?;
                t.enable_extra_checksum_check = v;
                self.set_tracked_hashes_enabled(v);
            }
            "devio_worker_delay_ms" => t.set_devio_worker_delay_ms(parse_u32(value)?)?,
            "devio_fua_insert" => t.set_devio_fua_insert(parse_u32(value)?)?,
            "read_bypass_enabled" => {
                t.read_bypass.enabled = parse_bool(value)?;
                self.read_bypass.set_conf(t.read_bypass);
            }
            "read_bypass_threshold_sectors" => {
                t.read_bypass.threshold_sectors = parse_u32(value)?;
                self.read_bypass.set_conf(t.read_bypass);
            }
            "write_bypass_enabled" => {
                t.write_bypass.enabled = parse_bool(value)?;
                self.write_bypass.set_conf(t.write_bypass);
            }
            "write_bypass_threshold_sectors" => {
                t.write_bypass.threshold_sectors = parse_u32(value)?;
                self.write_bypass.set_conf(t.write_bypass);
            }
            "bgwriter_conf_greedyness" => {
                t.bgwriter.greedyness = parse_i32(value)?;
                self.bgwriter.set_conf(t.bgwriter);
            }
            "bgwriter_conf_cluster_size" => {
                t.bgwriter.cluster_size = parse_u32(value)?;
                self.bgwriter.set_conf(t.bgwriter);
            }
            "bgwriter_conf_max_queue_depth_pct" => {
                t.bgwriter.max_queue_depth_pct = parse_u32(value)?;
                self.bgwriter.set_conf(t.bgwriter);
            }
            "bgwriter_conf_flush_on_exit" => {
                t.bgwriter.flush_on_exit = parse_bool(value)?;
                self.bgwriter.set_conf(t.bgwriter);
            }
            "verifier_running" => {
                t.verifier.running = parse_bool(value)?;
                self.verifier.set_conf(t.verifier);
            }
            "verifier_one_shot" => {
                t.verifier.one_shot = parse_bool(value)?;
                self.verifier.set_conf(t.verifier);
            }
            "verifier_scan_delay_ms" => {
                t.verifier.scan_delay_ms = parse_u32(value)?;
                self.verifier.set_conf(t.verifier);
            }
            "verifier_bugon_on_errors" => {
                t.verifier.bugon_on_errors = parse_bool(value)?;
                self.verifier.set_conf(t.verifier);
            }
            "trace" => t.trace = parse_u32(value)?.min(u16::MAX as u32) as u16,
            "error_state" => {
                // Set-only per spec.md §6; there is no path back out of
                // fail-all from the control plane.
                if !parse_bool(value)? {
                    return Err(Error::InvalidArgument("error_state can only be set to the fail-all value".into()));
                }
                self.failed.store(true, Ordering::SeqCst);
            }
            "zero_stats" => *self.stats.lock().unwrap() = CacheStats::default(),
            "invalidate_cache" => self.invalidate_all_clean(),
            other => return Err(Error::InvalidArgument(format!("unknown control key {other:?}"))),
        }
        Ok(())
    }

    /// `invalidate_cache` control command: drops every idle clean block.
    /// Dirty blocks are left untouched -- spec.md's control surface has no
    /// "discard dirty data" command, only `teardown`'s flush-then-drain.
    fn invalidate_all_clean(&self) {
        while let Some(id) = self.directory.get_clean() {
            do_clean_invalidate(self, id);
        }
    }

    /// Control-message / observability getter (spec.md §6).
    pub fn get(&self, key: &str) -> Result<String> {
        match key {
            "cache_mode" => Ok(self.tunables.lock().unwrap().cache_mode.as_str().to_string()),
            "replacement" => Ok(self.tunables.lock().unwrap().replacement.as_str().to_string()),
            "max_pending_requests" => Ok(self.tunables.lock().unwrap().max_pending_requests.to_string()),
            "pending_requests" => Ok(self.pending.load(Ordering::SeqCst).to_string()),
            "pmem_stats" => Ok(format!("{:?}", self.bufpool.stats())),
            "devio_stats" => Ok(format!("{:?}", self.devio.stats())),
            "cache_states" => Ok(format!("{:?}", self.directory.counts())),
            "redblack_info" => Ok(format!("tree_len={} depth_estimate={}", self.directory.tree_len(), self.directory.redblack_depth_estimate())),
            "sequential" => Ok([self.read_bypass.dump(), self.write_bypass.dump()].concat().join("\n")),
            "stats" => Ok(format!("{:?}", *self.stats.lock().unwrap())),
            "bgwriter_stats" => Ok(format!("{:?}", self.bgwriter.stats())),
            "invalidator_stats" => Ok(format!("{:?}", self.invalidator.stats())),
            "verifier_stats" => Ok(format!("{:?}", self.verifier.counts())),
            "deferred_stats" => Ok(format!("wait_busy={:?} wait_page={:?}", self.deferred.wait_busy.stats(), self.deferred.wait_page.stats())),
            "tracked_hashes" => Ok(self.dump_tracked_hashes()),
            "tree_walk" => Ok(self.directory.tree_walk_consistent().to_string()),
            "stats_extra" => Ok(format!(
                "pending={} failed={} dirty_ratio={:.4}",
                self.pending.load(Ordering::SeqCst),
                self.failed.load(Ordering::SeqCst),
                self.directory.dirty_ratio()
            )),
            "conf" => Ok(format!("{:?}", *self.tunables.lock().unwrap())),
            "info" => Ok(format!(
                "slot_count={} cache_mode={} replacement={} failed={}",
                self.slot_count,
                self.cache_mode().as_str(),
                self.tunables.lock().unwrap().replacement.as_str(),
                self.failed.load(Ordering::SeqCst)
            )),
            "build_info" => Ok(format!("bittern-core {}", env!("CARGO_PKG_VERSION"))),
            "trace" => Ok(self.tunables.lock().unwrap().trace.to_string()),
            "verifier" => Ok(format!("{:?} running={}", self.verifier.counts(), self.verifier.is_running())),
            "kthreads" => Ok(format!(
                "bgwriter=running invalidator=running verifier={} devio_worker=running",
                if self.verifier.is_running() { "running" } else { "stopped" }
            )),
            "bgwriter" => Ok(format!("{:?}", self.bgwriter.conf())),
            "bgwriter_policy" => Ok(format!(
                "{:?}",
                if self.cache_mode() == CacheMode::Writethrough {
                    crate::bgwriter::writethrough_policy()
                } else {
                    crate::bgwriter::standard_policy((self.directory.dirty_ratio() * 100.0) as u32)
                }
            )),
            "timers" => Ok(format!(
                "devio_worker_delay_ms={} devio_fua_insert={} verifier_scan_delay_ms={}",
                self.tunables.lock().unwrap().devio_worker_delay_ms,
                self.tunables.lock().unwrap().devio_fua_insert,
                self.tunables.lock().unwrap().verifier.scan_delay_ms
            )),
            "pmem_api" => Ok(format!(
                "supports_direct_page_access={} layout_variant={:?}",
                self.pmem.supports_direct_page_access(),
                self.pmem.layout_variant()
            )),
            "dump_blocks_clean" => Ok(format!("{:?}", self.directory.dump_clean())),
            "dump_blocks_dirty" => Ok(format!("{:?}", self.directory.dump_dirty())),
            "dump_blocks_busy" => Ok(format!("{:?}", self.directory.dump_busy())),
            "dump_blocks_pending" => Ok(self.pending.load(Ordering::SeqCst).to_string()),
            "dump_blocks_deferred" => Ok(format!(
                "wait_busy={} wait_page={}",
                self.deferred.wait_busy.len(),
                self.deferred.wait_page.len()
            )),
            "dump_blocks_deferred_wait_busy" => Ok(self.deferred.wait_busy.len().to_string()),
            "dump_blocks_deferred_wait_page" => Ok(self.deferred.wait_page.len().to_string()),
            other => Err(Error::InvalidArgument(format!("unknown control key {other:?}"))),
        }
    }

    /// Cancellation & teardown sequencing (spec.md §5): force
    /// write-through, drain dirty blocks, stop the background workers in
    /// order, then wait for in-flight requests to finish.
    pub fn teardown(self: &Arc<Self>) {
        {
            let mut t = self.tunables.lock().unwrap();
            t.cache_mode = CacheMode::Writethrough;
        }
        while self.directory.counts().valid_entries_dirty > 0 {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        self.invalidator.stop();
        self.bgwriter.stop();
        {
            let mut conf = self.tunables.lock().unwrap().verifier;
            conf.running = false;
            self.verifier.set_conf(conf);
        }
        while self.pending.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }
}

fn fail_request(cache: &Arc<Cache>, id: BlockId, completion: RequestCompletion, e: Error) {
    if e.is_fatal() {
        cache.failed.store(true, Ordering::SeqCst);
    }
    cache.directory.move_to_invalid(id, None);
    cache.complete(completion, Err(e));
}

fn run_bypass(cache: &Arc<Cache>, req: Request, completion: RequestCompletion) {
    let result = match req.kind {
        RequestKind::Read => cache.device_read(req.sector, req.len_bytes as usize).map(CompletedRequest::data),
        RequestKind::Write => cache.device_write(req.sector, req.data.clone()).map(|()| CompletedRequest::empty()),
        _ => unreachable!("flush/discard never reach dispatch"),
    };
    if let Err(e) = &result {
        if e.is_fatal() {
            cache.failed.store(true, Ordering::SeqCst);
        }
    }
    cache.stats.lock().unwrap().bypassed += 1;
    cache.complete(completion, result);
}

/// Dispatches an already-held block (`id`) to the matching path handler.
fn execute(cache: Arc<Cache>, req: Request, completion: RequestCompletion, id: BlockId, is_new: bool) {
    let mode = cache.cache_mode();
    let full = full_block(req.len_bytes);
    match req.kind {
        RequestKind::Read => {
            if is_new {
                run_read_miss(&cache, req, completion, id);
            } else {
                run_read_hit(&cache, req, completion, id);
            }
        }
        RequestKind::Write => {
            if is_new {
                match (mode, full) {
                    (CacheMode::Writethrough, true) => run_write_miss_wt(&cache, req, completion, id),
                    (CacheMode::Writethrough, false) => run_partial_write_miss_wt(&cache, req, completion, id),
                    (CacheMode::Writeback, true) => run_write_miss_wb(&cache, req, completion, id),
                    (CacheMode::Writeback, false) => run_partial_write_miss_wb(&cache, req, completion, id),
                }
            } else {
                let prior = cache.directory.snapshot(id).state;
                match (mode, full, prior) {
                    (CacheMode::Writethrough, true, _) => run_write_hit_wt(&cache, req, completion, id),
                    (CacheMode::Writethrough, false, _) => run_partial_write_hit_wt(&cache, req, completion, id),
                    (CacheMode::Writeback, true, State::Dirty) => run_write_hit_wb_dirty_clone(&cache, req, completion, id),
                    (CacheMode::Writeback, false, State::Dirty) => run_partial_write_hit_wb_dirty_clone(&cache, req, completion, id),
                    (CacheMode::Writeback, true, _) => run_write_hit_wb_clean(&cache, req, completion, id),
                    (CacheMode::Writeback, false, _) => run_partial_write_hit_wb_clean(&cache, req, completion, id),
                }
            }
        }
        _ => unreachable!("flush/discard never reach dispatch"),
    }
}

fn run_read_hit(cache: &Arc<Cache>, req: Request, completion: RequestCompletion, id: BlockId) {
    let snap = cache.directory.snapshot(id);
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::ReadHit, id, snap.xid, cache.is_writeback());

    let outcome = (|| -> Result<Vec<u8>> {
        let p = step(&mut wi);
        cache.directory.update_held(id, snap.state, p, None, None);
        let handle = cache.read_cache_page(id)?;
        let offset = intra_offset(req.sector);
        let out = handle.as_slice()[offset..offset + req.len_bytes as usize].to_vec();
        cache.put_cache_page(handle, false)?;
        let p = step(&mut wi);
        cache.directory.update_held(id, snap.state, p, None, None);
        finish_path(&mut wi);
        Ok(out)
    })();

    match outcome {
        Ok(data) => {
            cache.directory.update_held(id, snap.state, TransitionPath::None, None, None);
            cache.directory.put(id, true);
            cache.stats.lock().unwrap().read_hits += 1;
            cache.complete(completion, Ok(CompletedRequest::data(data)));
        }
        Err(e) => fail_request(cache, id, completion, e),
    }
}

fn run_read_miss(cache: &Arc<Cache>, req: Request, completion: RequestCompletion, id: BlockId) {
    let block_sector = sector_align(req.sector);
    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::ReadMiss, id, xid, cache.is_writeback());

    let outcome = (|| -> Result<(Vec<u8>, Hash128)> {
        let p = step(&mut wi);
        cache.directory.update_held(id, State::CleanNoData, p, Some(xid), None);
        let page = cache.device_read(block_sector, CACHE_BLOCK_SIZE)?;
        let hash = murmurhash3_128(&page);

        let p = step(&mut wi);
        cache.directory.update_held(id, State::CleanNoData, p, None, Some(hash));
        let mut handle = cache.write_cache_page(id)?;
        handle.as_mut_slice().copy_from_slice(&page);
        cache.put_cache_page(handle, true)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::CleanNoData, p, None, None);
        cache.persist_metadata(id, OnMediaState::Clean, xid, Some(block_sector), hash)?;
        finish_path(&mut wi);
        Ok((page, hash))
    })();

    match outcome {
        Ok((page, hash)) => {
            cache.directory.update_held(id, terminal_state(PathKind::ReadMiss), TransitionPath::None, None, Some(hash));
            cache.directory.move_to_clean(id);
            let offset = intra_offset(req.sector);
            let out = page[offset..offset + req.len_bytes as usize].to_vec();
            cache.stats.lock().unwrap().read_misses += 1;
            cache.stats.lock().unwrap().read_device_requests += 1;
            cache.track_hash_if_enabled(block_sector, hash);
            cache.complete(completion, Ok(CompletedRequest::data(out)));
        }
        Err(e) => {
            cache.stats.lock().unwrap().read_misses += 1;
            fail_request(cache, id, completion, e);
        }
    }
}

fn run_write_miss_wt(cache: &Arc<Cache>, req: Request, completion: RequestCompletion, id: BlockId) {
    let block_sector = sector_align(req.sector);
    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::WriteMissWt, id, xid, cache.is_writeback());

    let outcome = (|| -> Result<Hash128> {
        let p = step(&mut wi);
        cache.directory.update_held(id, State::CleanNoData, p, Some(xid), None);
        cache.device_write(block_sector, req.data.clone())?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::CleanNoData, p, None, None);
        let mut handle = cache.write_cache_page(id)?;
        handle.as_mut_slice().copy_from_slice(&req.data);
        let hash = murmurhash3_128(handle.as_slice());
        cache.put_cache_page(handle, true)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::CleanNoData, p, None, Some(hash));
        cache.persist_metadata(id, OnMediaState::Clean, xid, Some(block_sector), hash)?;
        finish_path(&mut wi);
        Ok(hash)
    })();

    match outcome {
        Ok(hash) => {
            cache.directory.update_held(id, terminal_state(PathKind::WriteMissWt), TransitionPath::None, None, Some(hash));
            cache.directory.move_to_clean(id);
            cache.stats.lock().unwrap().write_misses += 1;
            cache.stats.lock().unwrap().write_device_requests += 1;
            cache.track_hash_if_enabled(block_sector, hash);
            cache.complete(completion, Ok(CompletedRequest::empty()));
        }
        Err(e) => {
            cache.stats.lock().unwrap().write_misses += 1;
            fail_request(cache, id, completion, e);
        }
    }
}

fn run_write_miss_wb(cache: &Arc<Cache>, req: Request, completion: RequestCompletion, id: BlockId) {
    let block_sector = sector_align(req.sector);
    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::WriteMissWb, id, xid, cache.is_writeback());

    let outcome = (|| -> Result<Hash128> {
        let p = step(&mut wi);
        cache.directory.update_held(id, State::DirtyNoData, p, Some(xid), None);
        let mut handle = cache.write_cache_page(id)?;
        handle.as_mut_slice().copy_from_slice(&req.data);
        let hash = murmurhash3_128(handle.as_slice());
        cache.put_cache_page(handle, true)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::DirtyNoData, p, None, Some(hash));
        cache.persist_metadata(id, OnMediaState::Dirty, xid, Some(block_sector), hash)?;
        finish_path(&mut wi);
        Ok(hash)
    })();

    match outcome {
        Ok(hash) => {
            cache.directory.update_held(id, terminal_state(PathKind::WriteMissWb), TransitionPath::None, None, Some(hash));
            cache.directory.move_to_dirty(id);
            cache.stats.lock().unwrap().write_misses += 1;
            cache.track_hash_if_enabled(block_sector, hash);
            cache.complete(completion, Ok(CompletedRequest::empty()));
        }
        Err(e) => {
            cache.stats.lock().unwrap().write_misses += 1;
            fail_request(cache, id, completion, e);
        }
    }
}

fn run_write_hit_wt(cache: &Arc<Cache>, req: Request, completion: RequestCompletion, id: BlockId) {
    let block_sector = sector_align(req.sector);
    let prior = cache.directory.snapshot(id).state;
    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::WriteHitWt, id, xid, cache.is_writeback());

    let outcome = (|| -> Result<Hash128> {
        let p = step(&mut wi);
        cache.directory.update_held(id, prior, p, Some(xid), None);
        cache.device_write(block_sector, req.data.clone())?;

        let p = step(&mut wi);
        cache.directory.update_held(id, prior, p, None, None);
        let mut handle = cache.write_cache_page(id)?;
        handle.as_mut_slice().copy_from_slice(&req.data);
        let hash = murmurhash3_128(handle.as_slice());
        cache.put_cache_page(handle, true)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, prior, p, None, Some(hash));
        cache.persist_metadata(id, OnMediaState::Clean, xid, Some(block_sector), hash)?;
        finish_path(&mut wi);
        Ok(hash)
    })();

    match outcome {
        Ok(hash) => {
            cache.directory.update_held(id, terminal_state(PathKind::WriteHitWt), TransitionPath::None, None, Some(hash));
            cache.directory.move_to_clean(id);
            cache.stats.lock().unwrap().write_hits += 1;
            cache.stats.lock().unwrap().write_device_requests += 1;
            cache.track_hash_if_enabled(block_sector, hash);
            cache.complete(completion, Ok(CompletedRequest::empty()));
        }
        Err(e) => fail_request(cache, id, completion, e),
    }
}

fn run_partial_write_hit_wt(cache: &Arc<Cache>, req: Request, completion: RequestCompletion, id: BlockId) {
    let block_sector = sector_align(req.sector);
    let prior = cache.directory.snapshot(id).state;
    let offset = intra_offset(req.sector);
    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::PartialWriteHitWt, id, xid, cache.is_writeback());

    let outcome = (|| -> Result<(Box<[u8; CACHE_BLOCK_SIZE]>, Hash128)> {
        let p = step(&mut wi);
        cache.directory.update_held(id, prior, p, Some(xid), None);
        let handle = cache.read_cache_page(id)?;
        let merged = crate::statemachine::merge_partial_write(&handle.page, offset, &req.data);
        cache.put_cache_page(handle, false)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, prior, p, None, None);
        cache.device_write(block_sector, merged.page.to_vec())?;

        let p = step(&mut wi);
        cache.directory.update_held(id, prior, p, None, None);
        let mut wh = cache.write_cache_page(id)?;
        wh.as_mut_slice().copy_from_slice(merged.page.as_slice());
        cache.put_cache_page(wh, true)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, prior, p, None, Some(merged.hash));
        cache.persist_metadata(id, OnMediaState::Clean, xid, Some(block_sector), merged.hash)?;
        finish_path(&mut wi);
        Ok((merged.page, merged.hash))
    })();

    match outcome {
        Ok((_page, hash)) => {
            cache.directory.update_held(id, terminal_state(PathKind::PartialWriteHitWt), TransitionPath::None, None, Some(hash));
            cache.directory.move_to_clean(id);
            cache.stats.lock().unwrap().write_hits += 1;
            cache.stats.lock().unwrap().write_device_requests += 1;
            cache.track_hash_if_enabled(block_sector, hash);
            cache.complete(completion, Ok(CompletedRequest::empty()));
        }
        Err(e) => fail_request(cache, id, completion, e),
    }
}

fn run_write_hit_wb_clean(cache: &Arc<Cache>, req: Request, completion: RequestCompletion, id: BlockId) {
    let block_sector = sector_align(req.sector);
    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::WriteHitWbClean, id, xid, cache.is_writeback());

    let outcome = (|| -> Result<Hash128> {
        let p = step(&mut wi);
        cache.directory.update_held(id, State::Clean, p, Some(xid), None);
        let mut handle = cache.write_cache_page(id)?;
        handle.as_mut_slice().copy_from_slice(&req.data);
        let hash = murmurhash3_128(handle.as_slice());
        cache.put_cache_page(handle, true)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::Clean, p, None, Some(hash));
        cache.persist_metadata(id, OnMediaState::Dirty, xid, Some(block_sector), hash)?;
        finish_path(&mut wi);
        Ok(hash)
    })();

    match outcome {
        Ok(hash) => {
            cache.directory.update_held(id, terminal_state(PathKind::WriteHitWbClean), TransitionPath::None, None, Some(hash));
            cache.directory.move_to_dirty(id);
            cache.stats.lock().unwrap().write_hits += 1;
            cache.track_hash_if_enabled(block_sector, hash);
            cache.complete(completion, Ok(CompletedRequest::empty()));
        }
        Err(e) => fail_request(cache, id, completion, e),
    }
}

fn run_partial_write_hit_wb_clean(cache: &Arc<Cache>, req: Request, completion: RequestCompletion, id: BlockId) {
    let block_sector = sector_align(req.sector);
    let offset = intra_offset(req.sector);
    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::PartialWriteHitWbClean, id, xid, cache.is_writeback());

    let outcome = (|| -> Result<Hash128> {
        let p = step(&mut wi);
        cache.directory.update_held(id, State::Clean, p, Some(xid), None);
        let handle = cache.read_cache_page(id)?;
        let merged = crate::statemachine::merge_partial_write(&handle.page, offset, &req.data);
        cache.put_cache_page(handle, false)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::Clean, p, None, None);
        let mut wh = cache.write_cache_page(id)?;
        wh.as_mut_slice().copy_from_slice(merged.page.as_slice());
        cache.put_cache_page(wh, true)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::Clean, p, None, Some(merged.hash));
        cache.persist_metadata(id, OnMediaState::Dirty, xid, Some(block_sector), merged.hash)?;
        finish_path(&mut wi);
        Ok(merged.hash)
    })();

    match outcome {
        Ok(hash) => {
            cache.directory.update_held(id, terminal_state(PathKind::PartialWriteHitWbClean), TransitionPath::None, None, Some(hash));
            cache.directory.move_to_dirty(id);
            cache.stats.lock().unwrap().write_hits += 1;
            cache.track_hash_if_enabled(block_sector, hash);
            cache.complete(completion, Ok(CompletedRequest::empty()));
        }
        Err(e) => fail_request(cache, id, completion, e),
    }
}

/// A write hit on an already-dirty block, in writeback mode, must not
/// mutate the held slot in place: a concurrent writeback may already be
/// mid-flight reading it for the backing-device DMA. Instead the
/// original is invalidated and a freshly allocated clone slot takes over
/// the sector with the new data (spec.md §4.6/§9's dirty-write-clone
/// rule; the same phase pair, `DirtyInvalidateStart`/`End`, also drives
/// the original's half of this path).
fn run_write_hit_wb_dirty_clone(cache: &Arc<Cache>, req: Request, completion: RequestCompletion, original: BlockId) {
    let block_sector = sector_align(req.sector);
    let Some(clone_id) = cache.directory.get_clone(original) else {
        cache.directory.put(original, false);
        cache.defer_page(req, completion);
        return;
    };

    let xid = cache.xid.next();
    let mut wi_clone = WorkItem::new(cache.next_work_id(), PathKind::WriteHitWbDirtyCloneClone, clone_id, xid, true);
    wi_clone.clone_of = Some(original);

    let outcome = (|| -> Result<Hash128> {
        let p = step(&mut wi_clone);
        cache.directory.update_held(clone_id, State::DirtyNoData, p, Some(xid), None);
        let mut handle = cache.write_cache_page(clone_id)?;
        handle.as_mut_slice().copy_from_slice(&req.data);
        let hash = murmurhash3_128(handle.as_slice());
        cache.put_cache_page(handle, true)?;

        let p = step(&mut wi_clone);
        cache.directory.update_held(clone_id, State::DirtyNoData, p, None, Some(hash));
        cache.persist_metadata(clone_id, OnMediaState::Dirty, xid, Some(block_sector), hash)?;
        finish_path(&mut wi_clone);
        Ok(hash)
    })();

    match outcome {
        Ok(hash) => {
            cache.directory.update_held(clone_id, terminal_state(PathKind::WriteHitWbDirtyCloneClone), TransitionPath::None, None, Some(hash));
            cache.directory.move_to_dirty(clone_id);
            cache.directory.ensure_in_tree(clone_id);

            // Only now is the clone durable and discoverable at
            // `block_sector`: invalidate the original (spec.md §5 requires
            // original-invalidate to follow clone-write durability, and §9
            // requires the sector to never be absent from the tree).
            let orig_xid = cache.xid.next();
            let mut wi_orig = WorkItem::new(cache.next_work_id(), PathKind::WriteHitWbDirtyCloneOriginal, original, orig_xid, true);
            let p = step(&mut wi_orig);
            cache.directory.update_held(original, State::Dirty, p, None, None);
            let p = step(&mut wi_orig);
            cache.directory.update_held(original, State::Dirty, p, None, None);
            finish_path(&mut wi_orig);
            cache.directory.update_held(original, terminal_state(PathKind::WriteHitWbDirtyCloneOriginal), TransitionPath::None, None, None);
            cache.directory.move_to_invalid(original, Some(true));

            cache.stats.lock().unwrap().write_hits += 1;
            cache.stats.lock().unwrap().dirty_write_clones += 1;
            cache.track_hash_if_enabled(block_sector, hash);
            cache.complete(completion, Ok(CompletedRequest::empty()));
        }
        Err(e) => {
            // The clone never became durable; the original's dirty content
            // is untouched and stays authoritative for this sector.
            cache.directory.put(original, false);
            fail_request(cache, clone_id, completion, e);
        }
    }
}

fn run_partial_write_hit_wb_dirty_clone(cache: &Arc<Cache>, req: Request, completion: RequestCompletion, original: BlockId) {
    let block_sector = sector_align(req.sector);
    let offset = intra_offset(req.sector);

    let base = match cache.read_cache_page(original) {
        Ok(handle) => {
            let page = *handle.page.clone();
            if let Err(e) = cache.put_cache_page(handle, false) {
                fail_request(cache, original, completion, e);
                return;
            }
            page
        }
        Err(e) => {
            fail_request(cache, original, completion, e);
            return;
        }
    };

    let Some(clone_id) = cache.directory.get_clone(original) else {
        cache.directory.put(original, false);
        cache.defer_page(req, completion);
        return;
    };

    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::PartialWriteHitWbDirtyClone, clone_id, xid, true);
    wi.clone_of = Some(original);

    // Fold the read-existing-page step into the phase record even though
    // the actual read already happened above (it had to, to size the
    // merge before a clone slot was known to exist).
    let p = step(&mut wi);
    cache.directory.update_held(clone_id, State::DirtyNoData, p, Some(xid), None);
    let merged = crate::statemachine::merge_partial_write(&base, offset, &req.data);

    let outcome = (|| -> Result<Hash128> {
        let p = step(&mut wi);
        cache.directory.update_held(clone_id, State::DirtyNoData, p, None, None);
        let mut handle = cache.write_cache_page(clone_id)?;
        handle.as_mut_slice().copy_from_slice(merged.page.as_slice());
        cache.put_cache_page(handle, true)?;

        let p = step(&mut wi);
        cache.directory.update_held(clone_id, State::DirtyNoData, p, None, Some(merged.hash));
        cache.persist_metadata(clone_id, OnMediaState::Dirty, xid, Some(block_sector), merged.hash)?;
        finish_path(&mut wi);
        Ok(merged.hash)
    })();

    match outcome {
        Ok(hash) => {
            cache.directory.update_held(clone_id, terminal_state(PathKind::PartialWriteHitWbDirtyClone), TransitionPath::None, None, Some(hash));
            cache.directory.move_to_dirty(clone_id);
            cache.directory.ensure_in_tree(clone_id);

            // Only now is the clone durable and discoverable at
            // `block_sector`: invalidate the original (spec.md §5/§9).
            cache.directory.update_held(original, terminal_state(PathKind::DirtyInvalidate), TransitionPath::None, None, None);
            cache.directory.move_to_invalid(original, Some(true));

            cache.stats.lock().unwrap().write_hits += 1;
            cache.stats.lock().unwrap().dirty_write_clones += 1;
            cache.track_hash_if_enabled(block_sector, hash);
            cache.complete(completion, Ok(CompletedRequest::empty()));
        }
        Err(e) => {
            // The clone never became durable; the original's dirty content
            // is untouched and stays authoritative for this sector.
            cache.directory.put(original, false);
            fail_request(cache, clone_id, completion, e);
        }
    }
}

fn run_partial_write_miss_wt(cache: &Arc<Cache>, req: Request, completion: RequestCompletion, id: BlockId) {
    let block_sector = sector_align(req.sector);
    let offset = intra_offset(req.sector);
    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::PartialWriteMissWt, id, xid, cache.is_writeback());

    let outcome = (|| -> Result<Hash128> {
        let p = step(&mut wi);
        cache.directory.update_held(id, State::CleanNoData, p, Some(xid), None);
        let existing = cache.device_read(block_sector, CACHE_BLOCK_SIZE)?;
        let base: [u8; CACHE_BLOCK_SIZE] = existing.try_into().map_err(|_| Error::Corruption("short device read".into()))?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::CleanNoData, p, None, None);
        let merged = crate::statemachine::merge_partial_write(&base, offset, &req.data);

        let p = step(&mut wi);
        cache.directory.update_held(id, State::CleanNoData, p, None, None);
        cache.device_write(block_sector, merged.page.to_vec())?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::CleanNoData, p, None, Some(merged.hash));
        let mut handle = cache.write_cache_page(id)?;
        handle.as_mut_slice().copy_from_slice(merged.page.as_slice());
        cache.put_cache_page(handle, true)?;
        cache.persist_metadata(id, OnMediaState::Clean, xid, Some(block_sector), merged.hash)?;
        finish_path(&mut wi);
        Ok(merged.hash)
    })();

    match outcome {
        Ok(hash) => {
            cache.directory.update_held(id, terminal_state(PathKind::PartialWriteMissWt), TransitionPath::None, None, Some(hash));
            cache.directory.move_to_clean(id);
            cache.stats.lock().unwrap().write_misses += 1;
            cache.stats.lock().unwrap().write_device_requests += 1;
            cache.stats.lock().unwrap().read_device_requests += 1;
            cache.track_hash_if_enabled(block_sector, hash);
            cache.complete(completion, Ok(CompletedRequest::empty()));
        }
        Err(e) => {
            cache.stats.lock().unwrap().write_misses += 1;
            fail_request(cache, id, completion, e);
        }
    }
}

fn run_partial_write_miss_wb(cache: &Arc<Cache>, req: Request, completion: RequestCompletion, id: BlockId) {
    let block_sector = sector_align(req.sector);
    let offset = intra_offset(req.sector);
    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::PartialWriteMissWb, id, xid, cache.is_writeback());

    let outcome = (|| -> Result<Hash128> {
        let p = step(&mut wi);
        cache.directory.update_held(id, State::DirtyNoData, p, Some(xid), None);
        let existing = cache.device_read(block_sector, CACHE_BLOCK_SIZE)?;
        let base: [u8; CACHE_BLOCK_SIZE] = existing.try_into().map_err(|_| Error::Corruption("short device read".into()))?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::DirtyNoData, p, None, None);
        let merged = crate::statemachine::merge_partial_write(&base, offset, &req.data);

        let p = step(&mut wi);
        cache.directory.update_held(id, State::DirtyNoData, p, None, Some(merged.hash));
        let mut handle = cache.write_cache_page(id)?;
        handle.as_mut_slice().copy_from_slice(merged.page.as_slice());
        cache.put_cache_page(handle, true)?;
        cache.persist_metadata(id, OnMediaState::Dirty, xid, Some(block_sector), merged.hash)?;
        finish_path(&mut wi);
        Ok(merged.hash)
    })();

    match outcome {
        Ok(hash) => {
            cache.directory.update_held(id, terminal_state(PathKind::PartialWriteMissWb), TransitionPath::None, None, Some(hash));
            cache.directory.move_to_dirty(id);
            cache.stats.lock().unwrap().write_misses += 1;
            cache.stats.lock().unwrap().read_device_requests += 1;
            cache.track_hash_if_enabled(block_sector, hash);
            cache.complete(completion, Ok(CompletedRequest::empty()));
        }
        Err(e) => {
            cache.stats.lock().unwrap().write_misses += 1;
            fail_request(cache, id, completion, e);
        }
    }
}

/// Background writeback's entry point (`bgwriter::BgWriter::writeback_one`):
/// flushes an already-held dirty block to clean.
fn do_writeback(cache: &Arc<Cache>, id: BlockId) {
    let snap = cache.directory.snapshot(id);
    let Some(sector) = snap.sector else {
        cache.directory.put(id, false);
        return;
    };
    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::Writeback, id, xid, false);

    let outcome = (|| -> Result<()> {
        let p = step(&mut wi);
        cache.directory.update_held(id, State::Dirty, p, None, None);
        let handle = cache.read_cache_page(id)?;
        let page = *handle.page.clone();
        cache.put_cache_page(handle, false)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::Dirty, p, None, None);
        cache.device_write(sector, page.to_vec())?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::Dirty, p, None, None);
        cache.persist_metadata(id, OnMediaState::Clean, xid, Some(sector), snap.hash_data)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::Dirty, p, None, None);
        finish_path(&mut wi);
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            cache.directory.update_held(id, terminal_state(PathKind::Writeback), TransitionPath::None, Some(xid), None);
            cache.directory.move_to_clean(id);
            cache.stats.lock().unwrap().writebacks += 1;
        }
        Err(e) => {
            if e.is_fatal() {
                cache.failed.store(true, Ordering::SeqCst);
            }
            cache.directory.update_held(id, State::Dirty, TransitionPath::None, None, None);
            cache.directory.move_to_dirty(id);
        }
    }
}

/// Background writeback's shortcut when the invalidator is starved
/// (`bgwriter::BgWriter::invalidate_one`): flushes and invalidates in one
/// pass instead of leaving the block clean for a later separate evict.
fn do_writeback_invalidate(cache: &Arc<Cache>, id: BlockId) {
    let snap = cache.directory.snapshot(id);
    let Some(sector) = snap.sector else {
        cache.directory.put(id, false);
        return;
    };
    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::WritebackInvalidate, id, xid, false);

    let outcome = (|| -> Result<()> {
        let p = step(&mut wi);
        cache.directory.update_held(id, State::Dirty, p, None, None);
        let handle = cache.read_cache_page(id)?;
        let page = *handle.page.clone();
        cache.put_cache_page(handle, false)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::Dirty, p, None, None);
        cache.device_write(sector, page.to_vec())?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::Dirty, p, None, None);
        cache.persist_metadata(id, OnMediaState::Invalid, xid, None, Hash128::ZERO)?;

        let p = step(&mut wi);
        cache.directory.update_held(id, State::Dirty, p, None, None);
        finish_path(&mut wi);
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            cache.directory.update_held(id, terminal_state(PathKind::WritebackInvalidate), TransitionPath::None, None, None);
            cache.directory.move_to_invalid(id, Some(true));
            cache.stats.lock().unwrap().writeback_invalidations += 1;
        }
        Err(e) => {
            if e.is_fatal() {
                cache.failed.store(true, Ordering::SeqCst);
            }
            cache.directory.update_held(id, State::Dirty, TransitionPath::None, None, None);
            cache.directory.move_to_dirty(id);
        }
    }
}

/// Invalidator's entry point (spec.md §4.9): drops an idle clean block
/// with no device I/O needed, since its contents already match the
/// backing device.
fn do_clean_invalidate(cache: &Cache, id: BlockId) {
    let xid = cache.xid.next();
    let mut wi = WorkItem::new(cache.next_work_id(), PathKind::CleanInvalidate, id, xid, false);
    let p = step(&mut wi);
    cache.directory.update_held(id, State::Clean, p, None, None);
    let p = step(&mut wi);
    cache.directory.update_held(id, State::Clean, p, None, None);
    finish_path(&mut wi);
    cache.directory.update_held(id, terminal_state(PathKind::CleanInvalidate), TransitionPath::None, None, None);
    cache.directory.move_to_invalid(id, Some(false));
    cache.stats.lock().unwrap().clean_invalidations += 1;
}

/// The verifier's `verify_one` callback: compares cached contents, the
/// recorded `hash_data`, and the backing device's current contents.
fn verify_one(cache: &Arc<Cache>, id: BlockId) -> VerifyOutcome {
    let snap = cache.directory.snapshot(id);
    let Some(sector) = snap.sector else {
        return VerifyOutcome::SkippedInvalid;
    };
    let cache_hash = match cache.read_cache_page(id) {
        Ok(handle) => {
            let h = murmurhash3_128(handle.as_slice());
            let _ = cache.put_cache_page(handle, false);
            h
        }
        Err(_) => return VerifyOutcome::SkippedInvalid,
    };
    let device_hash = match cache.device_read(sector, CACHE_BLOCK_SIZE) {
        Ok(data) => murmurhash3_128(&data),
        Err(_) => return VerifyOutcome::SkippedInvalid,
    };
    if cache_hash == snap.hash_data && cache_hash == device_hash {
        VerifyOutcome::Verified
    } else {
        cache.stats.lock().unwrap().verify_mismatches += 1;
        VerifyOutcome::Mismatch { block: id, expected: snap.hash_data, got_cache: cache_hash, got_device: device_hash }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemPmem;
    use std::sync::mpsc;
    use tempfile::tempfile;

    fn fixture(slot_count: u32) -> Arc<Cache> {
        let backing = tempfile().unwrap();
        backing.set_len(1 << 20).unwrap();
        let cache_dev = tempfile().unwrap();
        cache_dev.set_len(layout::required_device_size(slot_count)).unwrap();
        Cache::create(backing, cache_dev, slot_count, Tunables::defaults(slot_count)).unwrap()
    }

    fn blocking_map(cache: &Arc<Cache>, req: Request) -> Result<CompletedRequest> {
        let (tx, rx) = mpsc::channel();
        cache.map(req, Box::new(move |r| tx.send(r).unwrap())).unwrap();
        rx.recv_timeout(std::time::Duration::from_secs(5)).expect("request never completed")
    }

    #[test]
    fn write_then_read_back_under_writethrough() {
        let cache = fixture(8);
        cache.set("cache_mode", "writethrough").unwrap();
        let payload = vec![0x42u8; CACHE_BLOCK_SIZE];
        blocking_map(&cache, Request::write(0, 1, payload.clone())).unwrap();
        let read = blocking_map(&cache, Request::read(0, CACHE_BLOCK_SIZE as u32, 1)).unwrap();
        assert_eq!(read.data, payload);
        assert_eq!(cache.get("cache_mode").unwrap(), "writethrough");
    }

    #[test]
    fn write_then_read_back_under_writeback_is_dirty() {
        let cache = fixture(8);
        let payload = vec![0x7Eu8; CACHE_BLOCK_SIZE];
        blocking_map(&cache, Request::write(8, 1, payload.clone())).unwrap();
        assert_eq!(cache.directory.counts().valid_entries_dirty, 1);
        let read = blocking_map(&cache, Request::read(8, CACHE_BLOCK_SIZE as u32, 1)).unwrap();
        assert_eq!(read.data, payload);
    }

    #[test]
    fn second_write_hit_on_dirty_block_clones() {
        let cache = fixture(8);
        blocking_map(&cache, Request::write(0, 1, vec![1u8; CACHE_BLOCK_SIZE])).unwrap();
        blocking_map(&cache, Request::write(0, 1, vec![2u8; CACHE_BLOCK_SIZE])).unwrap();
        assert_eq!(cache.stats.lock().unwrap().dirty_write_clones, 1);
        let read = blocking_map(&cache, Request::read(0, CACHE_BLOCK_SIZE as u32, 1)).unwrap();
        assert!(read.data.iter().all(|&b| b == 2));
    }

    #[test]
    fn flush_and_discard_complete_without_touching_directory() {
        let cache = fixture(4);
        blocking_map(&cache, Request::flush()).unwrap();
        blocking_map(&cache, Request::discard(0, 512, 1)).unwrap();
        assert_eq!(cache.directory.counts().invalid_entries, 4);
        assert_eq!(cache.stats.lock().unwrap().flushes, 1);
        assert_eq!(cache.stats.lock().unwrap().discards, 1);
    }

    #[test]
    fn misaligned_length_is_rejected_synchronously() {
        let cache = fixture(4);
        let err = cache.map(Request::read(0, 100, 1), Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn request_spanning_two_blocks_is_rejected() {
        let cache = fixture(4);
        let err = cache.map(Request::read(7, CACHE_BLOCK_SIZE as u32, 1), Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn control_plane_round_trips_cache_mode() {
        let cache = fixture(4);
        cache.set("cache_mode", "writethrough").unwrap();
        assert_eq!(cache.get("cache_mode").unwrap(), "writethrough");
        assert!(cache.set("cache_mode", "bogus").is_err());
    }

    #[test]
    fn invalidate_cache_command_drops_clean_blocks_only() {
        let cache = fixture(4);
        blocking_map(&cache, Request::write(0, 1, vec![1u8; CACHE_BLOCK_SIZE])).unwrap();
        cache.set("cache_mode", "writethrough").unwrap();
        blocking_map(&cache, Request::write(8, 1, vec![1u8; CACHE_BLOCK_SIZE])).unwrap();
        assert_eq!(cache.directory.counts().valid_entries_clean, 1);
        cache.set("invalidate_cache", "1").unwrap();
        let counts = cache.directory.counts();
        assert_eq!(counts.valid_entries_clean, 0);
        assert_eq!(counts.valid_entries_dirty, 1);
    }

    #[test]
    fn zero_stats_resets_counters() {
        let cache = fixture(4);
        blocking_map(&cache, Request::read(0, CACHE_BLOCK_SIZE as u32, 1)).unwrap();
        assert!(cache.stats.lock().unwrap().read_misses > 0);
        cache.set("zero_stats", "1").unwrap();
        assert_eq!(cache.stats.lock().unwrap().read_misses, 0);
    }

    #[test]
    fn error_state_can_only_be_set_to_fail_all() {
        let cache = fixture(4);
        assert!(cache.set("error_state", "0").is_err());
        cache.set("error_state", "1").unwrap();
        assert!(cache.failed.load(Ordering::SeqCst));
    }

    #[test]
    fn observability_keys_cover_the_full_surface() {
        let cache = fixture(4);
        for key in [
            "conf",
            "stats",
            "stats_extra",
            "pmem_stats",
            "info",
            "build_info",
            "trace",
            "verifier",
            "replacement",
            "cache_mode",
            "redblack_info",
            "sequential",
            "kthreads",
            "bgwriter",
            "bgwriter_policy",
            "timers",
            "tracked_hashes",
            "cache_states",
            "pmem_api",
            "dump_blocks_clean",
            "dump_blocks_dirty",
            "dump_blocks_busy",
            "dump_blocks_pending",
            "dump_blocks_deferred",
            "dump_blocks_deferred_wait_busy",
            "dump_blocks_deferred_wait_page",
        ] {
            cache.get(key).unwrap_or_else(|e| panic!("key {key:?} should be answerable: {e}"));
        }
    }

    #[test]
    fn in_memory_pmem_double_is_usable_directly() {
        let pmem = MemPmem::new(2);
        let (tx, rx) = mpsc::channel();
        pmem.write_metadata_slot(0, [7u8; crate::layout::METADATA_SLOT_SIZE], Box::new(move |r| tx.send(r).unwrap()));
        rx.recv().unwrap().unwrap();
    }

    #[test]
    fn teardown_waits_for_dirty_count_to_reach_zero() {
        let cache = fixture(4);
        blocking_map(&cache, Request::write(0, 1, vec![9u8; CACHE_BLOCK_SIZE])).unwrap();
        assert_eq!(cache.directory.counts().valid_entries_dirty, 1);
        cache.teardown();
        assert_eq!(cache.directory.counts().valid_entries_dirty, 0);
        assert_eq!(cache.get("cache_mode").unwrap(), "writethrough");
    }
}
