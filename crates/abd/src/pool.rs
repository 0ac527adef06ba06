// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The external collaborator contract: the slab allocator that actually owns memory.
//!
//! This crate never allocates raw memory itself. It calls into a [`ChunkPool`] for fixed-size
//! scattered chunks and a [`BufPool`] for variable-size linear buffers, and expects both to be
//! infallible: allocator exhaustion is handled upstream, outside this crate, the same way a ZFS
//! `abd` module treats `kmem`/`vmem` exhaustion as fatal rather than recoverable here.

use std::mem::MaybeUninit;
use std::ptr::NonNull;

/// Which consumer-facing category a linear buffer belongs to.
///
/// Mirrors the metadata vs. file-data split that a ZFS-style `abd` routes to distinct
/// `kmem_cache`/`zio_buf_alloc` pools so that metadata and file data never compete for the same
/// slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufKind {
    /// Filesystem metadata.
    Metadata,
    /// File data.
    FileData,
}

/// Supplies fixed-size chunks for scattered ABDs.
///
/// # Safety
///
/// Implementors must return pointers that are valid for reads and writes of exactly
/// `chunk_size()` bytes until passed back to `free_chunk`, and must be safe to call from any
/// thread without external synchronization (the ABD handle lock serializes access to a given
/// chunk's *logical owner*, not the pool itself).
pub unsafe trait ChunkPool: Send + Sync {
    /// The fixed size of every chunk this pool vends, in bytes. Must not change across the
    /// lifetime of the pool: the iterator treats a mismatch between an ABD's recorded chunk size
    /// and this value as a fatal configuration error.
    fn chunk_size(&self) -> usize;

    /// Allocates one chunk. Must never return a null-equivalent failure; allocator exhaustion is
    /// expected to be fatal upstream, not a recoverable condition in this crate.
    fn alloc_chunk(&self) -> NonNull<MaybeUninit<u8>>;

    /// Returns a chunk previously obtained from [`alloc_chunk`](Self::alloc_chunk).
    ///
    /// `routed_for_reclaim` is `true` when the chunk is being freed as part of compaction
    /// (`try_move`): such frees should go straight to the slab instead of a per-CPU magazine
    /// cache, so the memory can actually be reclaimed by the caller that asked for compaction.
    /// Implementations that have no such distinction may ignore the flag.
    fn free_chunk(&self, ptr: NonNull<MaybeUninit<u8>>, routed_for_reclaim: bool);
}

/// Supplies variable-size contiguous buffers for linear ABDs and for scattered borrow scratch.
///
/// # Safety
///
/// Implementors must return pointers valid for reads and writes of exactly `size` bytes until
/// passed back to `free_buf` with the same `size` and `kind`, and must tolerate concurrent calls
/// from multiple threads.
pub unsafe trait BufPool: Send + Sync {
    /// Allocates `size` bytes for the given [`BufKind`]. Must never fail; exhaustion is fatal
    /// upstream.
    fn alloc_buf(&self, size: usize, kind: BufKind) -> NonNull<MaybeUninit<u8>>;

    /// Returns a buffer previously obtained from [`alloc_buf`](Self::alloc_buf). `size` and
    /// `kind` must match the original allocation exactly.
    fn free_buf(&self, ptr: NonNull<MaybeUninit<u8>>, size: usize, kind: BufKind);
}
