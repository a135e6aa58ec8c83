use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use log::warn;
use serde::Serialize;
use thiserror::Error;

/// Slot indexes and generation numbers must both fit into 16 bits.
pub const MAX_SLOTS: usize = 32_000;

const MAX_GENERATION: u16 = 32_000;

/// Indirect reference into a [`HandlePool`]: slot index in the high 16 bits,
/// generation number in the low 16.  A generation of 0 is the universal
/// null sentinel, so `Handle::NULL` never resolves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct Handle(u32);

impl Handle {
    pub const NULL: Handle = Handle(0);

    fn pack(index: u16, generation: u16) -> Self {
        Handle(((index as u32) << 16) | (generation as u32))
    }

    pub fn index(self) -> usize {
        (self.0 >> 16) as usize
    }

    pub fn generation(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn is_null(self) -> bool {
        self.generation() == 0
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool capacity {0} not in 1..={MAX_SLOTS}")]
    CapacityExceeded(usize),
    #[error("all {0} slots occupied")]
    Full(usize),
    #[error("handle generation does not match its slot")]
    Mismatch,
    #[error("null handle")]
    NullHandle,
}

/// Error counters, kept per pool instance and reset with it.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PoolStats {
    pub stores: u64,
    pub releases: u64,
    pub full_errors: u64,
    pub mismatch_errors: u64,
    pub resolve_misses: u64,
}

/// Fixed-capacity slot arena handing out generation-tagged handles instead
/// of references.  A stale handle resolves to `None`, never to whatever
/// re-occupied its slot.
pub struct HandlePool<T> {
    slots: Vec<Option<T>>,
    generations: Vec<u16>,
    free_stack: Vec<u16>,
    generation_counter: u16,
    stores: u64,
    releases: u64,
    full_errors: u64,
    mismatch_errors: u64,
    // relaxed atomic so resolve stays `&self` and the pool stays shareable
    // behind a reader lock
    resolve_misses: AtomicU64,
}

impl<T> HandlePool<T> {
    pub fn with_capacity(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 || capacity > MAX_SLOTS {
            return Err(PoolError::CapacityExceeded(capacity));
        }
        let mut slots = Vec::new();
        slots.resize_with(capacity, || None);
        // reversed so the very first store hands out index 0, then 1, 2, ..
        // while released indexes still come back most-recent-first
        let free_stack = (0..capacity as u16).rev().collect();
        Ok(Self {
            slots,
            generations: vec![0; capacity],
            free_stack,
            generation_counter: 0,
            stores: 0,
            releases: 0,
            full_errors: 0,
            mismatch_errors: 0,
            resolve_misses: AtomicU64::new(0),
        })
    }

    fn next_generation(&mut self) -> u16 {
        self.generation_counter += 1;
        if self.generation_counter >= MAX_GENERATION {
            self.generation_counter = 1;
        }
        self.generation_counter
    }

    pub fn store(&mut self, value: T) -> Result<Handle, PoolError> {
        let index = match self.free_stack.pop() {
            Some(i) => i,
            None => {
                self.full_errors += 1;
                return Err(PoolError::Full(self.slots.len()));
            }
        };
        let generation = self.next_generation();
        self.slots[index as usize] = Some(value);
        self.generations[index as usize] = generation;
        self.stores += 1;
        Ok(Handle::pack(index, generation))
    }

    /// Hot path: one sentinel check and one generation compare.
    pub fn resolve(&self, handle: Handle) -> Option<&T> {
        let generation = handle.generation();
        if generation == 0 {
            return None;
        }
        let index = handle.index();
        if self.generations.get(index) == Some(&generation) {
            return self.slots[index].as_ref();
        }
        self.resolve_misses.fetch_add(1, Relaxed);
        None
    }

    pub fn resolve_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let generation = handle.generation();
        if generation == 0 {
            return None;
        }
        let index = handle.index();
        if self.generations.get(index) == Some(&generation) {
            return self.slots[index].as_mut();
        }
        self.resolve_misses.fetch_add(1, Relaxed);
        None
    }

    /// Vacates the slot and returns its payload.  The slot generation is
    /// reset to the null sentinel, so every outstanding copy of `handle`
    /// is dead from here on.
    pub fn release(&mut self, handle: Handle) -> Result<T, PoolError> {
        if handle.is_null() {
            return Err(PoolError::NullHandle);
        }
        let index = handle.index();
        if self.generations.get(index) != Some(&handle.generation()) {
            self.mismatch_errors += 1;
            warn!(
                "release refused: generation {} does not own slot {}",
                handle.generation(),
                index
            );
            return Err(PoolError::Mismatch);
        }
        match self.slots[index].take() {
            Some(value) => {
                self.generations[index] = 0;
                self.free_stack.push(index as u16);
                self.releases += 1;
                Ok(value)
            }
            None => {
                self.mismatch_errors += 1;
                Err(PoolError::Mismatch)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free_stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_stack.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            stores: self.stores,
            releases: self.releases,
            full_errors: self.full_errors,
            mismatch_errors: self.mismatch_errors,
            resolve_misses: self.resolve_misses.load(Relaxed),
        }
    }

    pub fn reset_stats(&mut self) {
        self.stores = 0;
        self.releases = 0;
        self.full_errors = 0;
        self.mismatch_errors = 0;
        self.resolve_misses.store(0, Relaxed);
    }
}
