// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory fake chunk/buffer pool, shipped so downstream crates (and this crate's own
//! tests) can exercise the real ABD API without standing up an actual slab allocator. Ships as
//! `FixedBlockTestMemory`-style doubles behind a `test-util` feature rather than only inside
//! `#[cfg(test)]`, so consumers outside this crate can use them too.

use std::alloc::{Layout, alloc, dealloc};
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::pool::{BufKind, BufPool, ChunkPool};

/// A [`ChunkPool`] that allocates every chunk straight from the global allocator and tracks how
/// many chunks are currently outstanding, for use in tests that assert on pool-level bookkeeping.
#[derive(Debug)]
pub struct TestChunkPool {
    chunk_size: usize,
    outstanding: AtomicUsize,
}

impl TestChunkPool {
    /// Creates a pool vending chunks of exactly `chunk_size` bytes.
    #[must_use]
    pub const fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            outstanding: AtomicUsize::new(0),
        }
    }

    fn layout(&self) -> Layout {
        Layout::array::<MaybeUninit<u8>>(self.chunk_size)
            .expect("chunk_size is validated to be a small power of two at init time")
    }

    /// Number of chunks currently allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

// SAFETY: chunks are plain heap allocations with no thread affinity; concurrent alloc/free calls
// only touch the global allocator and the outstanding counter, both already thread-safe.
unsafe impl ChunkPool for TestChunkPool {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn alloc_chunk(&self) -> NonNull<MaybeUninit<u8>> {
        // SAFETY: layout has nonzero size because chunk_size is validated nonzero at init.
        let raw = unsafe { alloc(self.layout()) }.cast::<MaybeUninit<u8>>();
        let ptr = NonNull::new(raw).expect("allocation failure is a fatal error");
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        ptr
    }

    fn free_chunk(&self, ptr: NonNull<MaybeUninit<u8>>, _routed_for_reclaim: bool) {
        // SAFETY: ptr was obtained from alloc_chunk with the same layout.
        unsafe { dealloc(ptr.as_ptr().cast::<u8>(), self.layout()) };
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A [`BufPool`] that allocates every buffer straight from the global allocator.
#[derive(Debug, Default)]
pub struct TestBufPool {
    outstanding: AtomicUsize,
}

impl TestBufPool {
    /// Creates an empty pool.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Number of buffers currently allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

fn buf_layout(size: usize) -> Layout {
    Layout::array::<MaybeUninit<u8>>(size).expect("buffer size exceeds addressable memory")
}

// SAFETY: buffers are plain heap allocations with no thread affinity.
unsafe impl BufPool for TestBufPool {
    fn alloc_buf(&self, size: usize, _kind: BufKind) -> NonNull<MaybeUninit<u8>> {
        // SAFETY: size is validated nonzero by Abd construction before this is called.
        let raw = unsafe { alloc(buf_layout(size)) }.cast::<MaybeUninit<u8>>();
        let ptr = NonNull::new(raw).expect("allocation failure is a fatal error");
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        ptr
    }

    fn free_buf(&self, ptr: NonNull<MaybeUninit<u8>>, size: usize, _kind: BufKind) {
        // SAFETY: ptr and size were obtained from a matching alloc_buf call.
        unsafe { dealloc(ptr.as_ptr().cast::<u8>(), buf_layout(size)) };
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}
