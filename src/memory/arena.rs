//! Scratch arena for kernel temporaries
//!
//! im2col columns, packed inputs and Winograd tiles are borrowed from a
//! [`ScratchArena`] owned by the kernel context instead of being allocated
//! per call. A [`ScratchBuf`] guard hands the block back when it goes out
//! of scope, so early returns through `?` release it as well.
//!
//! Blocks are kept in a free list and picked best-fit: the smallest cached
//! block that holds the request.

use bytemuck::Pod;
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

/// Counters describing arena activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Requests served by a fresh allocation
    pub allocations: usize,
    /// Requests served from the free list
    pub reuses: usize,
    /// Bytes held by live guards
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`
    pub peak_bytes: usize,
}

#[derive(Debug, Default)]
struct ArenaState {
    free_blocks: Vec<Vec<u64>>,
    stats: ArenaStats,
}

/// Reusable scratch memory for one kernel context
#[derive(Debug, Default)]
pub struct ScratchArena {
    state: RefCell<ArenaState>,
}

impl ScratchArena {
    /// Block sizes are rounded up to this many bytes
    pub const GRANULE: usize = 64;

    /// Cached blocks beyond this count are released
    const MAX_FREE_BLOCKS: usize = 32;

    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-filled scratch slice of `len` elements.
    ///
    /// `T` must have an alignment of at most 8 bytes.
    pub fn alloc<T: Pod>(&self, len: usize) -> ScratchBuf<'_, T> {
        let bytes = Self::align_up(len * std::mem::size_of::<T>(), Self::GRANULE);
        let words = bytes / 8;

        let mut state = self.state.borrow_mut();
        let mut storage = match Self::find_best_fit(&state.free_blocks, words) {
            Some(idx) => {
                state.stats.reuses += 1;
                state.free_blocks.swap_remove(idx)
            }
            None => {
                state.stats.allocations += 1;
                Vec::with_capacity(words)
            }
        };
        storage.clear();
        storage.resize(words, 0);

        state.stats.live_bytes += bytes;
        state.stats.peak_bytes = state.stats.peak_bytes.max(state.stats.live_bytes);
        tracing::trace!(
            "scratch alloc {} bytes (live {}, cached blocks {})",
            bytes,
            state.stats.live_bytes,
            state.free_blocks.len()
        );

        ScratchBuf {
            arena: self,
            storage,
            len,
            bytes,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn stats(&self) -> ArenaStats {
        self.state.borrow().stats
    }

    /// Bytes currently cached in the free list
    pub fn cached_bytes(&self) -> usize {
        self.state
            .borrow()
            .free_blocks
            .iter()
            .map(|b| b.capacity() * 8)
            .sum()
    }

    /// Drop every cached block
    pub fn release_cached(&self) {
        self.state.borrow_mut().free_blocks.clear();
    }

    fn give_back(&self, storage: Vec<u64>, bytes: usize) {
        let mut state = self.state.borrow_mut();
        state.stats.live_bytes -= bytes;
        state.free_blocks.push(storage);
        if state.free_blocks.len() > Self::MAX_FREE_BLOCKS {
            // evict the smallest block
            if let Some(idx) = state
                .free_blocks
                .iter()
                .enumerate()
                .min_by_key(|(_, b)| b.capacity())
                .map(|(i, _)| i)
            {
                state.free_blocks.swap_remove(idx);
            }
        }
    }

    /// Smallest free block with capacity for `words`
    fn find_best_fit(blocks: &[Vec<u64>], words: usize) -> Option<usize> {
        blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity() >= words)
            .min_by_key(|(_, b)| b.capacity())
            .map(|(idx, _)| idx)
    }

    fn align_up(size: usize, alignment: usize) -> usize {
        (size.max(1) + alignment - 1) & !(alignment - 1)
    }
}

/// Scratch slice on loan from a [`ScratchArena`]
pub struct ScratchBuf<'a, T: Pod> {
    arena: &'a ScratchArena,
    storage: Vec<u64>,
    len: usize,
    bytes: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Pod> Deref for ScratchBuf<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &bytemuck::cast_slice::<u64, T>(&self.storage)[..self.len]
    }
}

impl<T: Pod> DerefMut for ScratchBuf<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut bytemuck::cast_slice_mut::<u64, T>(&mut self.storage)[..self.len]
    }
}

impl<T: Pod> Drop for ScratchBuf<'_, T> {
    fn drop(&mut self) {
        let storage = std::mem::take(&mut self.storage);
        self.arena.give_back(storage, self.bytes);
    }
}
