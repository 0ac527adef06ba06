// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Handle construction, lifecycle, and ownership transfer.

use std::mem::size_of;
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::chunk::RawPtr;
use crate::config::{Runtime, runtime};
use crate::flags::AbdFlags;
use crate::kind::Kind;
use crate::pool::BufKind;

#[cfg(debug_assertions)]
const ABD_MAGIC: u32 = 0x0A3D_0A3D;

/// Mutable state guarded by the per-handle lock.
///
/// Every data-plane operation in this crate acquires the owning `Abd`'s lock before touching any
/// of these fields; see the crate-level concurrency notes for the locking discipline across
/// parent/child and dual-ABD operations.
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) flags: AbdFlags,
    pub(crate) kind: Kind,
    pub(crate) parent: Option<Abd>,
    pub(crate) children_refcount: usize,
    pub(crate) create_time: Instant,
    /// Set once by `to_buf` (never by `to_buf_ephemeral`). Unlike `AbdFlags::NOMOVE`, this is
    /// never cleared by the refcount-reaches-zero path, because a raw pointer handed out by
    /// `to_buf` has no refcount tracking it back to zero.
    pub(crate) pinned_no_move: bool,
}

impl Inner {
    fn sync_nomove(&mut self) {
        if self.children_refcount > 0 || self.pinned_no_move {
            self.flags.insert(AbdFlags::NOMOVE);
        } else {
            self.flags.remove(AbdFlags::NOMOVE);
        }
    }
}

struct AbdHandle {
    size: NonZero<usize>,
    #[cfg(debug_assertions)]
    magic: u32,
    lock: Mutex<Inner>,
}

/// A handle for a block-sized byte payload, backed by either one contiguous buffer or an ordered
/// list of fixed-size chunks.
///
/// `Abd` is a cheap `Arc`-backed reference: cloning it does not copy the payload, only the
/// handle. See the crate-level documentation for the full invariant list and lifecycle table.
#[derive(Clone)]
pub struct Abd(Arc<AbdHandle>);

impl std::fmt::Debug for Abd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.0.lock.lock();
        f.debug_struct("Abd")
            .field("size", &self.0.size)
            .field("flags", &inner.flags)
            .field("is_linear", &inner.kind.is_linear())
            .field("children_refcount", &inner.children_refcount)
            .finish_non_exhaustive()
    }
}

impl Abd {
    fn new(size: NonZero<usize>, flags: AbdFlags, kind: Kind, parent: Option<Self>) -> Self {
        let inner = Inner {
            flags,
            kind,
            parent,
            children_refcount: 0,
            create_time: Instant::now(),
            pinned_no_move: false,
        };
        Self(Arc::new(AbdHandle {
            size,
            #[cfg(debug_assertions)]
            magic: ABD_MAGIC,
            lock: Mutex::new(inner),
        }))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        #[cfg(debug_assertions)]
        debug_assert_eq!(self.0.magic, ABD_MAGIC, "Abd handle is corrupted or foreign");
        self.0.lock.lock()
    }

    /// Logical payload size in bytes. Fixed for the lifetime of the handle.
    #[must_use]
    pub fn size(&self) -> usize {
        self.0.size.get()
    }

    pub(crate) fn size_nonzero(&self) -> NonZero<usize> {
        self.0.size
    }

    pub(crate) fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    fn struct_bytes(&self, chunk_count: usize) -> u64 {
        let base = size_of::<AbdHandle>();
        let tail = chunk_count * size_of::<RawPtr>();
        (base + tail) as u64
    }

    /// Whether this handle is backed by one contiguous region rather than a chunk list.
    #[must_use]
    pub fn is_linear(&self) -> bool {
        self.lock().kind.is_linear()
    }

    /// Reads the current child refcount. Exposed only for tests that assert on quiescence; not
    /// meaningful as a stable part of the public contract.
    #[cfg(any(test, feature = "test-util"))]
    #[must_use]
    pub fn children_refcount_for_test(&self) -> usize {
        self.lock().children_refcount
    }
}

fn validate_size(rt: &Runtime, size: usize) {
    assert!(size > 0, "abd size must be nonzero");
    assert!(
        size <= rt.config.max_block_size,
        "abd size {size} exceeds configured max_block_size {}",
        rt.config.max_block_size
    );
}

/// Allocates a new owning ABD, preferring scattered storage when enabled by the installed
/// [`crate::config::Config`].
#[must_use]
pub fn alloc(size: usize, is_metadata: bool) -> Abd {
    let rt = runtime();
    validate_size(&rt, size);
    if rt.config.scatter_enabled {
        alloc_scattered(&rt, size, is_metadata)
    } else {
        alloc_linear_impl(&rt, size, is_metadata)
    }
}

/// Allocates a new owning linear ABD.
#[must_use]
pub fn alloc_linear(size: usize, is_metadata: bool) -> Abd {
    let rt = runtime();
    validate_size(&rt, size);
    alloc_linear_impl(&rt, size, is_metadata)
}

/// Allocates a new owning ABD matching `template`'s linear/metadata-ness, at a possibly different
/// size.
#[must_use]
pub fn alloc_sametype(template: &Abd, size: usize) -> Abd {
    let (is_linear, is_metadata) = {
        let inner = template.lock();
        (inner.kind.is_linear(), inner.flags.contains(AbdFlags::META))
    };
    if is_linear {
        alloc_linear(size, is_metadata)
    } else {
        alloc(size, is_metadata)
    }
}

/// Allocates a new owning ABD intended for an I/O path.
///
/// Semantically identical to [`alloc`] today; kept as a distinct entry point because scatter-
/// gather I/O may one day want different placement behavior here, the same way a ZFS
/// `abd_alloc_for_io` anticipates a future divergence from plain `abd_alloc`.
#[must_use]
pub fn alloc_for_io(size: usize, is_metadata: bool) -> Abd {
    alloc(size, is_metadata)
}

fn alloc_scattered(rt: &Runtime, size: usize, is_metadata: bool) -> Abd {
    let chunk_size = rt.chunk_pool.chunk_size();
    let chunk_count = size.div_ceil(chunk_size);
    let mut chunks = Vec::with_capacity(chunk_count);
    for _ in 0..chunk_count {
        chunks.push(RawPtr::new(rt.chunk_pool.alloc_chunk()));
    }

    let is_small = size < chunk_size;
    let mut flags = AbdFlags::OWNER;
    if is_metadata {
        flags.insert(AbdFlags::META);
    }
    if is_small {
        flags.insert(AbdFlags::SMALL);
    }

    let kind = Kind::Scattered {
        inner_offset: 0,
        chunk_size,
        chunks,
    };
    let handle = Abd::new(
        NonZero::new(size).expect("validated nonzero above"),
        flags,
        kind,
        None,
    );

    let waste = (chunk_count * chunk_size - size) as u64;
    rt.stats.scatter_allocated(size as u64, waste, is_metadata, is_small);
    rt.stats.struct_allocated(handle.struct_bytes(chunk_count));
    trace!(size, is_metadata, chunk_count, "allocated scattered abd");
    handle
}

fn alloc_linear_impl(rt: &Runtime, size: usize, is_metadata: bool) -> Abd {
    let kind_tag = if is_metadata {
        BufKind::Metadata
    } else {
        BufKind::FileData
    };
    let buf = rt.buf_pool.alloc_buf(size, kind_tag);

    let mut flags = AbdFlags::LINEAR | AbdFlags::OWNER;
    if is_metadata {
        flags.insert(AbdFlags::META);
    }

    let kind = Kind::Linear {
        buf: RawPtr::new(buf),
    };
    let handle = Abd::new(
        NonZero::new(size).expect("validated nonzero above"),
        flags,
        kind,
        None,
    );

    rt.stats.linear_allocated(size as u64, is_metadata);
    rt.stats.struct_allocated(handle.struct_bytes(0));
    trace!(size, is_metadata, "allocated linear abd");
    handle
}

/// Constructs a non-owning view over `[off, parent.size())` of `parent`.
#[must_use]
pub fn get_offset(parent: &Abd, off: usize) -> Abd {
    let size = parent.size().checked_sub(off).expect("offset exceeds parent size");
    get_offset_size(parent, off, size)
}

/// Constructs a non-owning view over `[off, off + size)` of `parent`.
///
/// # Panics
///
/// Panics if `size` is zero or if `off + size` exceeds `parent.size()`.
#[must_use]
pub fn get_offset_size(parent: &Abd, off: usize, size: usize) -> Abd {
    assert!(size > 0, "get_offset_size: size must be nonzero");
    assert!(
        off.checked_add(size).is_some_and(|end| end <= parent.size()),
        "get_offset_size: [{off}, {off}+{size}) is out of bounds for parent of size {}",
        parent.size()
    );

    let rt = runtime();
    let mut parent_inner = parent.lock();
    let (kind, chunk_count) = match &parent_inner.kind {
        Kind::Linear { buf } => {
            // SAFETY: off <= parent.size() was checked above, so this stays within the parent's
            // allocation.
            let view_buf = unsafe { buf.add(off) };
            (Kind::Linear { buf: view_buf }, 0)
        }
        Kind::Scattered {
            inner_offset,
            chunk_size,
            chunks,
        } => {
            let new_inner_offset = inner_offset + off;
            let drop_count = new_inner_offset / chunk_size;
            let view_inner_offset = new_inner_offset % chunk_size;
            let chunk_count = (view_inner_offset + size).div_ceil(*chunk_size);
            let view_chunks = chunks[drop_count..drop_count + chunk_count].to_vec();
            (
                Kind::Scattered {
                    inner_offset: view_inner_offset,
                    chunk_size: *chunk_size,
                    chunks: view_chunks,
                },
                chunk_count,
            )
        }
    };

    let mut flags = AbdFlags::NOMOVE;
    if kind.is_linear() {
        flags.insert(AbdFlags::LINEAR);
    }

    parent_inner.children_refcount += size;
    parent_inner.sync_nomove();
    drop(parent_inner);

    let child = Abd::new(
        NonZero::new(size).expect("validated nonzero above"),
        flags,
        kind,
        Some(parent.clone()),
    );
    rt.stats.struct_allocated(child.struct_bytes(chunk_count));
    trace!(off, size, "constructed abd view");
    child
}

/// Constructs a non-owning linear ABD that aliases caller-supplied storage.
///
/// # Safety
///
/// `buf` must be valid for reads and writes of `size` bytes for as long as the returned `Abd` (or
/// any view derived from it) is alive.
#[must_use]
pub unsafe fn get_from_buf(buf: NonNull<u8>, size: usize) -> Abd {
    let rt = runtime();
    validate_size(&rt, size);

    let kind = Kind::Linear {
        buf: RawPtr::new(buf.cast()),
    };
    let handle = Abd::new(
        NonZero::new(size).expect("validated nonzero above"),
        AbdFlags::LINEAR | AbdFlags::NOMOVE,
        kind,
        None,
    );
    {
        let mut inner = handle.lock();
        inner.pinned_no_move = true;
    }
    rt.stats.struct_allocated(handle.struct_bytes(0));
    handle
}

/// Destroys an owning ABD, releasing its backing storage.
///
/// # Panics
///
/// Panics if `abd` is not an owner, or if it still has a parent (views may never be freed this
/// way; use [`put`] instead).
pub fn free(abd: Abd) {
    let rt = runtime();
    let (flags, kind, chunk_count) = {
        let mut inner = abd.lock();
        assert!(inner.flags.contains(AbdFlags::OWNER), "free: abd is not an owner");
        assert!(inner.parent.is_none(), "free: owner abd must not have a parent");
        inner.flags.insert(AbdFlags::NOMOVE);
        let chunk_count = match &inner.kind {
            Kind::Scattered { chunks, .. } => chunks.len(),
            Kind::Linear { .. } => 0,
        };
        (inner.flags, std::mem::replace(&mut inner.kind, placeholder_kind()), chunk_count)
    };

    let is_metadata = flags.contains(AbdFlags::META);
    let size = abd.size();
    match kind {
        Kind::Linear { buf } => {
            let kind_tag = if is_metadata {
                BufKind::Metadata
            } else {
                BufKind::FileData
            };
            rt.buf_pool.free_buf(buf.as_non_null(), size, kind_tag);
            rt.stats.linear_freed(size as u64, is_metadata);
        }
        Kind::Scattered {
            chunk_size, chunks, ..
        } => {
            let is_small = size < chunk_size;
            let waste = (chunks.len() * chunk_size - size) as u64;
            for chunk in chunks {
                rt.chunk_pool.free_chunk(chunk.as_non_null(), false);
            }
            rt.stats.scatter_freed(size as u64, waste, is_metadata, is_small);
        }
    }
    rt.stats.struct_freed(abd.struct_bytes(chunk_count));
    trace!(size, "freed abd");
}

/// Placeholder only ever observed transiently between taking the real `kind` out of `Inner` and
/// dropping the handle inside `free`; never witnessed by any other code path.
fn placeholder_kind() -> Kind {
    Kind::Scattered {
        inner_offset: 0,
        chunk_size: 1,
        chunks: Vec::new(),
    }
}

/// Destroys a non-owning ABD without touching its backing storage.
///
/// # Panics
///
/// Panics if `abd` is an owner.
pub fn put(abd: Abd) {
    let rt = runtime();
    let (parent, size, chunk_count) = {
        let inner = abd.lock();
        assert!(!inner.flags.contains(AbdFlags::OWNER), "put: abd is an owner, use free()");
        let chunk_count = match &inner.kind {
            Kind::Scattered { chunks, .. } => chunks.len(),
            Kind::Linear { .. } => 0,
        };
        (inner.parent.clone(), abd.size(), chunk_count)
    };

    if let Some(parent) = parent {
        let mut parent_inner = parent.lock();
        parent_inner.children_refcount -= size;
        parent_inner.sync_nomove();
    }
    rt.stats.struct_freed(abd.struct_bytes(chunk_count));
    trace!(size, "released abd view");
}

/// Promotes a non-owning linear ABD to an owner.
///
/// # Panics
///
/// Panics if `abd` is not linear, or is already an owner.
pub fn take_ownership_of_buf(abd: &Abd, is_metadata: bool) {
    let rt = runtime();
    let mut inner = abd.lock();
    assert!(inner.kind.is_linear(), "take_ownership_of_buf: abd is not linear");
    assert!(
        !inner.flags.contains(AbdFlags::OWNER),
        "take_ownership_of_buf: abd is already an owner"
    );
    inner.flags.insert(AbdFlags::OWNER);
    if is_metadata {
        inner.flags.insert(AbdFlags::META);
    }
    rt.stats.linear_allocated(abd.size() as u64, is_metadata);
}

/// Demotes an owning linear ABD back to a non-owner. The caller now owns the backing storage and
/// is responsible for it; this function does not free anything.
///
/// # Panics
///
/// Panics if `abd` is not linear, or is not currently an owner.
pub fn release_ownership_of_buf(abd: &Abd) {
    let rt = runtime();
    let mut inner = abd.lock();
    assert!(inner.kind.is_linear(), "release_ownership_of_buf: abd is not linear");
    assert!(
        inner.flags.contains(AbdFlags::OWNER),
        "release_ownership_of_buf: abd is not an owner"
    );
    let was_metadata = inner.flags.contains(AbdFlags::META);
    inner.flags.remove(AbdFlags::OWNER | AbdFlags::META);
    rt.stats.linear_freed(abd.size() as u64, was_metadata);
}

/// Returns the start of a linear ABD's backing buffer, permanently forbidding compaction of this
/// handle (there is no way to track when the caller is done with the raw pointer).
///
/// # Panics
///
/// Panics if `abd` is not linear.
#[must_use]
pub fn to_buf(abd: &Abd) -> NonNull<u8> {
    let mut inner = abd.lock();
    let Kind::Linear { buf } = &inner.kind else {
        panic!("to_buf: abd is not linear");
    };
    let ptr = buf.as_non_null().cast();
    inner.pinned_no_move = true;
    inner.sync_nomove();
    ptr
}

/// Returns the start of a linear ABD's backing buffer without affecting its movability.
///
/// Callers must not retain the pointer past any operation that could relocate the ABD's storage
/// (e.g. [`crate::compact::try_move`]).
///
/// # Panics
///
/// Panics if `abd` is not linear.
#[must_use]
pub fn to_buf_ephemeral(abd: &Abd) -> NonNull<u8> {
    let inner = abd.lock();
    let Kind::Linear { buf } = &inner.kind else {
        panic!("to_buf_ephemeral: abd is not linear");
    };
    buf.as_non_null().cast()
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;
    use std::sync::Arc;

    use static_assertions::assert_impl_all;

    use super::{alloc, alloc_linear, free, get_offset, get_offset_size, put};
    use crate::config::{self, Config};
    use crate::test_pool::{TestBufPool, TestChunkPool};

    assert_impl_all!(super::Abd: Send, Sync);

    fn with_runtime<R>(chunk_size: usize, scatter_enabled: bool, f: impl FnOnce() -> R) -> R {
        config::fini();
        let config = Config {
            chunk_size,
            scatter_enabled,
            ..Config::default()
        };
        config::init(
            config,
            Arc::new(TestChunkPool::new(chunk_size)),
            Arc::new(TestBufPool::new()),
        )
        .expect("valid test config");
        let result = f();
        config::fini();
        result
    }

    #[test]
    fn alloc_linear_has_expected_size_and_no_children() {
        with_runtime(512, true, || {
            let abd = alloc_linear(1024, false);
            assert_eq!(abd.size(), 1024);
            assert!(abd.is_linear());
            free(abd);
        });
    }

    #[test]
    fn alloc_scattered_picks_scattered_when_enabled() {
        with_runtime(512, true, || {
            let abd = alloc(1500, false);
            assert_eq!(abd.size(), 1500);
            assert!(!abd.is_linear());
            free(abd);
        });
    }

    #[test]
    fn alloc_falls_back_to_linear_when_scatter_disabled() {
        with_runtime(512, false, || {
            let abd = alloc(1500, false);
            assert!(abd.is_linear());
            free(abd);
        });
    }

    #[test]
    fn view_alignment_matches_scatter_math() {
        with_runtime(512, true, || {
            let parent = alloc(2048, false);
            let view = get_offset(&parent, 700);
            assert_eq!(view.size(), 1348);
            {
                let inner = view.lock();
                match &inner.kind {
                    crate::kind::Kind::Scattered {
                        inner_offset,
                        chunks,
                        ..
                    } => {
                        assert_eq!(*inner_offset, 700 % 512);
                        assert_eq!(chunks.len(), 3);
                    }
                    crate::kind::Kind::Linear { .. } => panic!("expected scattered view"),
                }
            }
            put(view);
            free(parent);
        });
    }

    #[test]
    fn view_raises_and_lowers_parent_refcount() {
        with_runtime(512, true, || {
            let parent = alloc(4096, false);
            let view = get_offset_size(&parent, 0, 100);
            assert_eq!(parent.lock().children_refcount, 100);
            assert!(parent.lock().flags.contains(crate::flags::AbdFlags::NOMOVE));
            put(view);
            assert_eq!(parent.lock().children_refcount, 0);
            assert!(!parent.lock().flags.contains(crate::flags::AbdFlags::NOMOVE));
            free(parent);
        });
    }

    #[test]
    #[should_panic(expected = "is not an owner")]
    fn free_on_view_panics() {
        with_runtime(512, true, || {
            let parent = alloc(4096, false);
            let view = get_offset(&parent, 0);
            free(view);
        });
    }

    #[test]
    fn take_and_release_ownership_round_trips() {
        with_runtime(512, true, || {
            let abd = alloc_linear(64, false);
            super::release_ownership_of_buf(&abd);
            assert!(!abd.lock().flags.contains(crate::flags::AbdFlags::OWNER));
            super::take_ownership_of_buf(&abd, true);
            assert!(abd.lock().flags.contains(crate::flags::AbdFlags::OWNER));
            assert!(abd.lock().flags.contains(crate::flags::AbdFlags::META));
            free(abd);
        });
    }

    #[test]
    fn sized_view_carries_only_the_chunks_it_needs() {
        with_runtime(512, true, || {
            let parent = alloc(4096, false);
            // Only 100 bytes from the front of an 8-chunk parent: the view should see exactly
            // one chunk, not all 8 remaining ones.
            let view = get_offset_size(&parent, 0, 100);
            {
                let inner = view.lock();
                match &inner.kind {
                    crate::kind::Kind::Scattered { chunks, .. } => assert_eq!(chunks.len(), 1),
                    crate::kind::Kind::Linear { .. } => panic!("expected scattered view"),
                }
            }
            put(view);
            free(parent);
        });
    }

    #[test]
    fn struct_bytes_returns_to_baseline_after_view_is_put() {
        with_runtime(512, true, || {
            let parent = alloc(4096, false);
            let baseline = config::stats().struct_bytes;

            let view = get_offset_size(&parent, 0, 100);
            assert!(config::stats().struct_bytes > baseline);

            put(view);
            assert_eq!(config::stats().struct_bytes, baseline);
            free(parent);
        });
    }

    #[test]
    fn struct_bytes_returns_to_baseline_after_buf_alias_is_put() {
        with_runtime(512, true, || {
            let mut storage = [0u8; 64];
            let baseline = config::stats().struct_bytes;

            // SAFETY: `storage` outlives the aliasing abd below.
            let abd = unsafe { super::get_from_buf(NonNull::new(storage.as_mut_ptr()).unwrap(), 64) };
            assert!(config::stats().struct_bytes > baseline);

            put(abd);
            assert_eq!(config::stats().struct_bytes, baseline);
        });
    }
}
