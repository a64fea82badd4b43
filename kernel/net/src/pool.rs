//! Fixed-size index pool backing the connection and TCP record arenas.
//!
//! Records live in a `Vec` sized once at construction; the pool only hands
//! out and takes back their indices.  It performs no locking: every caller
//! already holds the stack lock.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

/// Pool usage counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Successful allocations
    pub allocs: AtomicU64,
    /// Indices returned
    pub frees: AtomicU64,
    /// Allocation attempts on an exhausted pool
    pub empty_errors: AtomicU64,
    /// Largest number of indices simultaneously in use
    pub high_water: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`] plus occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub total: usize,
    pub in_use: usize,
    pub high_water: usize,
    pub allocs: u64,
    pub frees: u64,
    pub empty_errors: u64,
}

/// Free-index stack over `0..total`.
#[derive(Debug)]
pub struct IdPool {
    free: Vec<u16>,
    total: usize,
    stats: PoolStats,
}

impl IdPool {
    /// Create a pool of `total` indices.  Index 0 is handed out first.
    pub fn new(total: usize) -> Self {
        let free = (0..total as u16).rev().collect();
        IdPool {
            free,
            total,
            stats: PoolStats::default(),
        }
    }

    /// Pop a free index, or `None` when exhausted.
    pub fn alloc(&mut self) -> Option<u16> {
        match self.free.pop() {
            Some(id) => {
                self.stats.allocs.fetch_add(1, Ordering::Relaxed);
                let in_use = self.in_use() as u64;
                self.stats.high_water.fetch_max(in_use, Ordering::Relaxed);
                Some(id)
            }
            None => {
                self.stats.empty_errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Push an index back.  The caller guarantees it is currently in use.
    pub fn free(&mut self, id: u16) {
        debug_assert!((id as usize) < self.total, "pool index out of range");
        debug_assert!(!self.free.contains(&id), "pool index freed twice");
        self.free.push(id);
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.total - self.free.len()
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total: self.total,
            in_use: self.in_use(),
            high_water: self.stats.high_water.load(Ordering::Relaxed) as usize,
            allocs: self.stats.allocs.load(Ordering::Relaxed),
            frees: self.stats.frees.load(Ordering::Relaxed),
            empty_errors: self.stats.empty_errors.load(Ordering::Relaxed),
        }
    }
}
