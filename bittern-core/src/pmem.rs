//! Persistent-memory interface: the narrow abstraction over the cache
//! device spec.md §4.1 names — read/write metadata slots, get/put data
//! pages, clone a read page into a write page, write a header.
//!
//! All data operations work on a single 4 KiB unit and are asynchronous:
//! every method takes a completion closure and returns immediately once
//! the operation is queued. `FilePmem`, the concrete implementation here,
//! is backed by a regular file opened on the cache device; since a file
//! descriptor never hands back a mappable page the way real persistent
//! memory would, `supports_direct_page_access()` is always `false` and
//! every page operation double-buffers through `bufpool::BufferPool`.

use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::bufpool::{AllocMode, BufferPool, PoolUser};
use crate::error::{DeviceKind, Error, Result};
use crate::layout::{self, LayoutVariant, CACHE_BLOCK_SIZE, METADATA_SLOT_SIZE};

pub type Completion<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// An owned 4 KiB page, checked out of the process-wide buffer pool for
/// the duration of one pmem operation.
pub struct PageHandle {
    pub slot: u32,
    pub page: Box<[u8; CACHE_BLOCK_SIZE]>,
}

impl PageHandle {
    pub fn as_slice(&self) -> &[u8] {
        self.page.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.page.as_mut_slice()
    }
}

/// The narrow pmem interface. All I/O methods are asynchronous: they
/// queue work and return immediately, invoking `completion` once the
/// operation lands (on whatever thread the implementation's worker pool
/// runs on, never on the caller's stack).
pub trait PmemInterface: Send + Sync {
    /// Whether this implementation can only ever hand back 4 KiB pages
    /// (true for every implementation today; kept as a query because
    /// upper layers are required to ask rather than assume).
    fn supports_direct_page_access(&self) -> bool;

    fn layout_variant(&self) -> LayoutVariant;

    fn read_metadata_slot(&self, slot: u32, completion: Completion<[u8; METADATA_SLOT_SIZE]>);
    fn write_metadata_slot(&self, slot: u32, data: [u8; METADATA_SLOT_SIZE], completion: Completion<()>);

    fn get_page_for_read(&self, slot: u32, completion: Completion<PageHandle>);
    fn get_page_for_write(&self, slot: u32, completion: Completion<PageHandle>);

    /// Commits a page checked out via `get_page_for_write` to its data
    /// slot and releases it. A page checked out via `get_page_for_read`
    /// is released without a write.
    fn put_page(&self, handle: PageHandle, dirty: bool, completion: Completion<()>);

    /// Copies a page already fetched for read into a freshly-checked-out
    /// write page bound to `dst_slot`, without a round trip to the
    /// device. Used by dirty-write cloning to seed the clone's untouched
    /// half of a partial write from the original's cached content.
    fn clone_read_page_to_write_page(&self, src: &PageHandle, dst_slot: u32, completion: Completion<PageHandle>);

    fn write_header(&self, bytes: Vec<u8>, write_to_a: bool, completion: Completion<()>);
}

enum Job {
    ReadMetadata { slot: u32, completion: Completion<[u8; METADATA_SLOT_SIZE]> },
    WriteMetadata { slot: u32, data: [u8; METADATA_SLOT_SIZE], completion: Completion<()> },
    GetPageForRead { slot: u32, offset: u64, completion: Completion<PageHandle> },
    GetPageForWrite { slot: u32, completion: Completion<PageHandle> },
    PutPage { offset: u64, page: Box<[u8; CACHE_BLOCK_SIZE]>, dirty: bool, completion: Completion<()> },
    WriteHeader { bytes: Vec<u8>, write_to_a: bool, completion: Completion<()> },
    Shutdown,
}

/// Fixed-size worker pool executing queued pmem jobs against the cache
/// device file. Modeled on the teacher's queued disk-I/O worker: a
/// bounded channel feeding a handful of blocking-I/O threads, rather than
/// true kernel-level async, since a hosted process talking to a file
/// descriptor has no asynchronous page-fault-driven DMA path to model.
struct IoPool {
    tx: Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IoPool {
    fn new(file: Arc<std::fs::File>, bufpool: Arc<BufferPool>, worker_count: usize) -> IoPool {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = bounded(1024);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count.max(1) {
            let file = file.clone();
            let bufpool = bufpool.clone();
            let rx = rx.clone();
            workers.push(std::thread::spawn(move || io_worker_loop(file, bufpool, rx)));
        }
        IoPool { tx, workers: Mutex::new(workers) }
    }

    fn submit(&self, job: Job) {
        let _ = self.tx.send(job);
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for _ in &workers {
            let _ = self.tx.send(Job::Shutdown);
        }
        for w in workers {
            let _ = w.join();
        }
    }
}

fn array_ref(s: &[u8]) -> &[u8; CACHE_BLOCK_SIZE] {
    s.try_into().expect("buffer pool pages are always CACHE_BLOCK_SIZE")
}

fn io_worker_loop(file: Arc<std::fs::File>, bufpool: Arc<BufferPool>, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Shutdown => return,
            Job::ReadMetadata { slot, completion } => {
                let mut buf = [0u8; METADATA_SLOT_SIZE];
                let result = file
                    .read_exact_at(&mut buf, layout::metadata_slot_offset(slot))
                    .map(|_| buf)
                    .map_err(|e| Error::DeviceError { device: DeviceKind::Cache, source: e });
                completion(result);
            }
            Job::WriteMetadata { slot, data, completion } => {
                let result = file
                    .write_all_at(&data, layout::metadata_slot_offset(slot))
                    .map_err(|e| Error::DeviceError { device: DeviceKind::Cache, source: e });
                completion(result);
            }
            Job::GetPageForRead { slot, offset, completion } => {
                let mut handle = match bufpool.allocate(PoolUser::Map, AllocMode::Wait) {
                    Some(h) => h,
                    None => {
                        completion(Err(Error::ResourceExhausted("buffer pool exhausted".into())));
                        continue;
                    }
                };
                let result = file
                    .read_exact_at(handle.as_mut_slice(), offset)
                    .map_err(|e| Error::DeviceError { device: DeviceKind::Cache, source: e });
                match result {
                    Ok(()) => {
                        let page = Box::new(*array_ref(handle.as_slice()));
                        completion(Ok(PageHandle { slot, page }));
                    }
                    Err(e) => completion(Err(e)),
                }
            }
            Job::GetPageForWrite { slot, completion } => {
                completion(Ok(PageHandle { slot, page: Box::new([0u8; CACHE_BLOCK_SIZE]) }));
            }
            Job::PutPage { offset, page, dirty, completion } => {
                if !dirty {
                    completion(Ok(()));
                    continue;
                }
                let result = file
                    .write_all_at(page.as_slice(), offset)
                    .map_err(|e| Error::DeviceError { device: DeviceKind::Cache, source: e });
                completion(result);
            }
            Job::WriteHeader { bytes, write_to_a, completion } => {
                let offset = if write_to_a { layout::SUPERBLOCK_A_OFFSET } else { layout::SUPERBLOCK_B_OFFSET };
                let result = file
                    .write_all_at(&bytes, offset)
                    .map_err(|e| Error::DeviceError { device: DeviceKind::Cache, source: e });
                completion(result);
            }
        }
    }
    let _ = bufpool;
}

/// Concrete pmem implementation backed by a real file (or block device
/// node) holding the cache device's data area.
pub struct FilePmem {
    file: Arc<std::fs::File>,
    slot_count: u32,
    pool: IoPool,
}

const PMEM_WORKER_COUNT: usize = 8;

impl FilePmem {
    pub fn new(file: std::fs::File, slot_count: u32, bufpool: Arc<BufferPool>) -> FilePmem {
        let file = Arc::new(file);
        let pool = IoPool::new(file.clone(), bufpool, PMEM_WORKER_COUNT);
        FilePmem { file, slot_count, pool }
    }

    fn data_offset(&self, slot: u32) -> u64 {
        layout::data_page_offset(self.slot_count, slot)
    }
}

impl PmemInterface for FilePmem {
    fn supports_direct_page_access(&self) -> bool {
        false
    }

    fn layout_variant(&self) -> LayoutVariant {
        LayoutVariant::SinglePage
    }

    fn read_metadata_slot(&self, slot: u32, completion: Completion<[u8; METADATA_SLOT_SIZE]>) {
        self.pool.submit(Job::ReadMetadata { slot, completion });
    }

    fn write_metadata_slot(&self, slot: u32, data: [u8; METADATA_SLOT_SIZE], completion: Completion<()>) {
        self.pool.submit(Job::WriteMetadata { slot, data, completion });
    }

    fn get_page_for_read(&self, slot: u32, completion: Completion<PageHandle>) {
        let offset = self.data_offset(slot);
        self.pool.submit(Job::GetPageForRead { slot, offset, completion });
    }

    fn get_page_for_write(&self, slot: u32, completion: Completion<PageHandle>) {
        self.pool.submit(Job::GetPageForWrite { slot, completion });
    }

    fn put_page(&self, handle: PageHandle, dirty: bool, completion: Completion<()>) {
        let offset = self.data_offset(handle.slot);
        self.pool.submit(Job::PutPage { offset, page: handle.page, dirty, completion });
    }

    fn clone_read_page_to_write_page(&self, src: &PageHandle, dst_slot: u32, completion: Completion<PageHandle>) {
        let page = Box::new(*src.page);
        completion(Ok(PageHandle { slot: dst_slot, page }));
    }

    fn write_header(&self, bytes: Vec<u8>, write_to_a: bool, completion: Completion<()>) {
        self.pool.submit(Job::WriteHeader { bytes, write_to_a, completion });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::required_device_size;
    use std::sync::mpsc;
    use tempfile::tempfile;

    fn new_fixture(slot_count: u32) -> FilePmem {
        let f = tempfile().unwrap();
        f.set_len(required_device_size(slot_count)).unwrap();
        let bufpool = Arc::new(BufferPool::new(16));
        FilePmem::new(f, slot_count, bufpool)
    }

    #[test]
    fn metadata_roundtrip_through_pool() {
        let pmem = new_fixture(8);
        let mut data = [0u8; METADATA_SLOT_SIZE];
        data[0] = 0xAB;
        let (tx, rx) = mpsc::channel();
        pmem.write_metadata_slot(3, data, Box::new(move |r| tx.send(r).unwrap()));
        rx.recv().unwrap().unwrap();

        let (tx, rx) = mpsc::channel();
        pmem.read_metadata_slot(3, Box::new(move |r| tx.send(r).unwrap()));
        let read_back = rx.recv().unwrap().unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn data_page_roundtrip_through_pool() {
        let pmem = new_fixture(8);
        let (tx, rx) = mpsc::channel();
        pmem.get_page_for_write(2, Box::new(move |r| tx.send(r).unwrap()));
        let mut handle = rx.recv().unwrap().unwrap();
        handle.as_mut_slice().fill(0x7A);

        let (tx, rx) = mpsc::channel();
        pmem.put_page(handle, true, Box::new(move |r| tx.send(r).unwrap()));
        rx.recv().unwrap().unwrap();

        let (tx, rx) = mpsc::channel();
        pmem.get_page_for_read(2, Box::new(move |r| tx.send(r).unwrap()));
        let read_back = rx.recv().unwrap().unwrap();
        assert!(read_back.as_slice().iter().all(|&b| b == 0x7A));
    }

    #[test]
    fn never_supports_direct_page_access() {
        let pmem = new_fixture(4);
        assert!(!pmem.supports_direct_page_access());
    }
}
