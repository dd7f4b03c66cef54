//! In-memory doubles used by unit tests: a `PmemInterface` backed by
//! plain `Vec`s instead of a file, so the directory, state machine, and
//! restore logic can be exercised without a real block device.

use std::sync::Mutex;

use crate::error::Result;
use crate::layout::{LayoutVariant, CACHE_BLOCK_SIZE, METADATA_SLOT_SIZE};
use crate::pmem::{Completion, PageHandle, PmemInterface};

/// A synchronous, in-memory pmem implementation. Every operation
/// completes on the caller's own stack -- convenient for deterministic
/// tests, unlike `FilePmem` which always completes on a worker thread.
pub struct MemPmem {
    metadata: Vec<Mutex<[u8; METADATA_SLOT_SIZE]>>,
    data: Vec<Mutex<[u8; CACHE_BLOCK_SIZE]>>,
}

impl MemPmem {
    pub fn new(slot_count: u32) -> MemPmem {
        MemPmem {
            metadata: (0..slot_count).map(|_| Mutex::new([0u8; METADATA_SLOT_SIZE])).collect(),
            data: (0..slot_count).map(|_| Mutex::new([0u8; CACHE_BLOCK_SIZE])).collect(),
        }
    }
}

impl PmemInterface for MemPmem {
    fn supports_direct_page_access(&self) -> bool {
        false
    }

    fn layout_variant(&self) -> LayoutVariant {
        LayoutVariant::SinglePage
    }

    fn read_metadata_slot(&self, slot: u32, completion: Completion<[u8; METADATA_SLOT_SIZE]>) {
        let data = *self.metadata[slot as usize].lock().unwrap();
        completion(Ok(data));
    }

    fn write_metadata_slot(&self, slot: u32, data: [u8; METADATA_SLOT_SIZE], completion: Completion<()>) {
        *self.metadata[slot as usize].lock().unwrap() = data;
        completion(Ok(()));
    }

    fn get_page_for_read(&self, slot: u32, completion: Completion<PageHandle>) {
        let page = Box::new(*self.data[slot as usize].lock().unwrap());
        completion(Ok(PageHandle { slot, page }));
    }

    fn get_page_for_write(&self, slot: u32, completion: Completion<PageHandle>) {
        completion(Ok(PageHandle { slot, page: Box::new([0u8; CACHE_BLOCK_SIZE]) }));
    }

    fn put_page(&self, handle: PageHandle, dirty: bool, completion: Completion<()>) {
        if dirty {
            *self.data[handle.slot as usize].lock().unwrap() = *handle.page;
        }
        completion(Ok(()));
    }

    fn clone_read_page_to_write_page(&self, src: &PageHandle, dst_slot: u32, completion: Completion<PageHandle>) {
        completion(Ok(PageHandle { slot: dst_slot, page: Box::new(*src.page) }));
    }

    fn write_header(&self, _bytes: Vec<u8>, _write_to_a: bool, completion: Completion<()>) {
        completion(Ok(()));
    }
}

/// Runs an async-style pmem/devio call to completion on the calling
/// thread and returns its result, converting the `Completion` callback
/// idiom the lower layers use into a plain blocking call -- the same
/// pattern `pmem`'s and `devio`'s own unit tests already use.
pub fn block_on<T: Send + 'static>(f: impl FnOnce(Completion<T>)) -> Result<T> {
    let (tx, rx) = std::sync::mpsc::channel();
    f(Box::new(move |r| {
        let _ = tx.send(r);
    }));
    rx.recv().expect("completion channel closed without firing")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_pmem_roundtrips_data_page() {
        let pmem = MemPmem::new(4);
        let mut handle = block_on::<PageHandle>(|c| pmem.get_page_for_write(1, c)).unwrap();
        handle.as_mut_slice().fill(0x5A);
        block_on::<()>(|c| pmem.put_page(handle, true, c)).unwrap();
        let read_back = block_on::<PageHandle>(|c| pmem.get_page_for_read(1, c)).unwrap();
        assert!(read_back.as_slice().iter().all(|&b| b == 0x5A));
    }
}
