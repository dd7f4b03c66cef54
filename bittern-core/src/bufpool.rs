//! Process-wide pool of 4 KiB page buffers.
//!
//! Used when the pmem interface cannot DMA directly into the cache memory
//! (always true for a regular file descriptor standing in for a real
//! persistent-memory device), so every data read/write double-buffers
//! through here. A fixed-size free list, counted per sub-pool so
//! `pmem_stats`/`conf` can report in-use/high-water per caller, mirrors
//! the teacher's `MemoryPool` (`nos-memory-management/src/allocator/mempool.rs`)
//! generalized from a raw-pointer arena to a safe `Vec<Box<Page>>` stack,
//! since a hosted crate has no reason to hand-roll unsafe pointer
//! bookkeeping the way a `no_std` allocator must.

use std::sync::{Condvar, Mutex};

use crate::layout::CACHE_BLOCK_SIZE;

pub type Page = [u8; CACHE_BLOCK_SIZE];

/// Which caller is borrowing a buffer, purely for the in-use breakdown
/// `pmem_stats` exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolUser {
    Map,
    BgWriter,
    Invalidator,
    Verifier,
    Restore,
}

const SUB_POOL_COUNT: usize = 5;

fn user_index(u: PoolUser) -> usize {
    match u {
        PoolUser::Map => 0,
        PoolUser::BgWriter => 1,
        PoolUser::Invalidator => 2,
        PoolUser::Verifier => 3,
        PoolUser::Restore => 4,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub total_buffers: usize,
    pub free_count: usize,
    pub in_use: [usize; SUB_POOL_COUNT],
    pub high_water: usize,
}

struct Inner {
    free: Vec<Box<Page>>,
    in_use: [usize; SUB_POOL_COUNT],
    high_water: usize,
    total: usize,
}

/// How `allocate` behaves when the pool is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Return `None` immediately; the caller defers the request.
    NoWait,
    /// Block on the pool's waitqueue until a buffer is freed.
    Wait,
}

pub struct BufferPool {
    inner: Mutex<Inner>,
    freed: Condvar,
}

/// An owned buffer checked out of the pool. Returned on drop.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    user: PoolUser,
    page: Option<Box<Page>>,
}

impl<'a> PooledBuffer<'a> {
    pub fn as_slice(&self) -> &[u8] {
        self.page.as_ref().unwrap().as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.page.as_mut().unwrap().as_mut_slice()
    }
}

impl<'a> Drop for PooledBuffer<'a> {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            self.pool.release(self.user, page);
        }
    }
}

impl BufferPool {
    pub fn new(capacity: usize) -> BufferPool {
        let free = (0..capacity).map(|_| Box::new([0u8; CACHE_BLOCK_SIZE])).collect();
        BufferPool {
            inner: Mutex::new(Inner { free, in_use: [0; SUB_POOL_COUNT], high_water: 0, total: capacity }),
            freed: Condvar::new(),
        }
    }

    pub fn allocate(&self, user: PoolUser, mode: AllocMode) -> Option<PooledBuffer<'_>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(page) = inner.free.pop() {
                inner.in_use[user_index(user)] += 1;
                let in_use_total: usize = inner.in_use.iter().sum();
                inner.high_water = inner.high_water.max(in_use_total);
                return Some(PooledBuffer { pool: self, user, page: Some(page) });
            }
            match mode {
                AllocMode::NoWait => return None,
                AllocMode::Wait => {
                    inner = self.freed.wait(inner).unwrap();
                }
            }
        }
    }

    fn release(&self, user: PoolUser, page: Box<Page>) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_use[user_index(user)] -= 1;
        inner.free.push(page);
        drop(inner);
        self.freed.notify_one();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            total_buffers: inner.total,
            free_count: inner.free.len(),
            in_use: inner.in_use,
            high_water: inner.high_water,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release_roundtrip() {
        let pool = BufferPool::new(2);
        {
            let mut buf = pool.allocate(PoolUser::Map, AllocMode::NoWait).unwrap();
            buf.as_mut_slice()[0] = 7;
            assert_eq!(pool.stats().free_count, 1);
        }
        assert_eq!(pool.stats().free_count, 2);
    }

    #[test]
    fn nowait_returns_none_when_exhausted() {
        let pool = BufferPool::new(1);
        let _a = pool.allocate(PoolUser::Map, AllocMode::NoWait).unwrap();
        assert!(pool.allocate(PoolUser::BgWriter, AllocMode::NoWait).is_none());
    }

    #[test]
    fn high_water_tracks_peak_usage() {
        let pool = BufferPool::new(3);
        let a = pool.allocate(PoolUser::Map, AllocMode::NoWait).unwrap();
        let b = pool.allocate(PoolUser::Map, AllocMode::NoWait).unwrap();
        assert_eq!(pool.stats().high_water, 2);
        drop(a);
        drop(b);
        assert_eq!(pool.stats().high_water, 2);
    }

    #[test]
    fn wait_mode_unblocks_on_release() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let pool = Arc::new(BufferPool::new(1));
        let held = pool.allocate(PoolUser::Map, AllocMode::NoWait).unwrap();

        let pool2 = pool.clone();
        let handle = thread::spawn(move || {
            let _b = pool2.allocate(PoolUser::BgWriter, AllocMode::Wait).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        drop(held);
        handle.join().unwrap();
    }
}
