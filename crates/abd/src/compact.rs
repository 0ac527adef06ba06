// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Compaction ("try-move").
//!
//! Invoked by a slab compactor walking long-lived owning ABDs, asking each whether its backing
//! storage can be relocated into freshly allocated storage so the old storage can be reclaimed.
//! The ABD's logical identity (handle address, size, flags, view relationships) never changes;
//! only the backing pointers/chunks do.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::chunk::RawPtr;
use crate::config::runtime;
use crate::flags::AbdFlags;
use crate::handle::Abd;
use crate::kind::Kind;
use crate::pool::BufKind;

/// An ABD that has been refused compaction for over this long is almost certainly stuck with a
/// leaked `NOMOVE` rather than genuinely busy; checked only in debug builds, the same diagnostic
/// role as a ZFS `abd_try_move_impl`'s `ASSERTV` staleness check.
const STALE_NOMOVE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Attempts to relocate `abd`'s backing storage into freshly allocated storage of the same kind.
///
/// Returns `false` without making any changes if `abd` is not an owner, has `NOMOVE` set, or has
/// outstanding children. Returns `true` after successfully copying the payload into new storage
/// and releasing the old storage back to the pool.
pub fn try_move(abd: &Abd) -> bool {
    let rt = runtime();
    let mut inner = abd.lock();

    if !inner.flags.contains(AbdFlags::OWNER) {
        debug!("try_move refused: abd is not an owner");
        return false;
    }

    if inner.flags.contains(AbdFlags::NOMOVE) {
        rt.stats.move_refused_nomove();
        debug_assert!(
            inner.create_time.elapsed() < STALE_NOMOVE_THRESHOLD,
            "abd has been unmovable for over 5 minutes; NOMOVE flag may be leaked"
        );
        debug!("try_move refused: NOMOVE is set");
        return false;
    }

    if inner.children_refcount != 0 {
        rt.stats.move_refused_refcount();
        debug!(children_refcount = inner.children_refcount, "try_move refused: children attached");
        return false;
    }

    let is_metadata = inner.flags.contains(AbdFlags::META);
    let is_linear = inner.kind.is_linear();

    match &mut inner.kind {
        Kind::Linear { buf } => {
            let size = abd.size();
            let kind_tag = if is_metadata {
                BufKind::Metadata
            } else {
                BufKind::FileData
            };
            let new_buf = rt.buf_pool.alloc_buf(size, kind_tag);
            // SAFETY: `new_buf` and the old `buf` each describe disjoint, exactly `size`-byte
            // allocations; copying the old contents into the new one is exactly the compaction
            // this function performs.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buf.as_non_null().as_ptr().cast::<u8>(),
                    new_buf.as_ptr().cast::<u8>(),
                    size,
                );
            }
            let old_buf = *buf;
            *buf = RawPtr::new(new_buf);
            rt.buf_pool.free_buf(old_buf.as_non_null(), size, kind_tag);
        }
        Kind::Scattered {
            chunk_size, chunks, ..
        } => {
            let mut new_chunks = Vec::with_capacity(chunks.len());
            for old_chunk in chunks.iter() {
                let new_chunk = rt.chunk_pool.alloc_chunk();
                // SAFETY: `new_chunk` and `old_chunk` each describe disjoint, exactly
                // `chunk_size`-byte allocations.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        old_chunk.as_non_null().as_ptr().cast::<u8>(),
                        new_chunk.as_ptr().cast::<u8>(),
                        *chunk_size,
                    );
                }
                new_chunks.push(RawPtr::new(new_chunk));
            }
            // Route the old chunks back to the slab rather than a per-CPU cache so the space
            // freed by this move can actually be reclaimed by whatever triggered compaction.
            for old_chunk in chunks.drain(..) {
                rt.chunk_pool.free_chunk(old_chunk.as_non_null(), true);
            }
            *chunks = new_chunks;
        }
    }

    inner.create_time = Instant::now();
    rt.stats.moved(is_linear);
    debug!(size = abd.size(), is_linear, "abd compacted");
    true
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::try_move;
    use crate::bufops::{cmp_buf, copy_from_buf};
    use crate::config::{self, Config};
    use crate::handle::{alloc, alloc_linear, free, get_offset, put};
    use crate::test_pool::{TestBufPool, TestChunkPool};

    fn with_runtime<R>(chunk_size: usize, f: impl FnOnce() -> R) -> R {
        config::fini();
        config::init(
            Config {
                chunk_size,
                ..Config::default()
            },
            Arc::new(TestChunkPool::new(chunk_size)),
            Arc::new(TestBufPool::new()),
        )
        .expect("valid test config");
        let result = f();
        config::fini();
        result
    }

    #[test]
    fn compaction_preserves_scattered_contents() {
        with_runtime(512, || {
            let abd = alloc(4096, false);
            let pattern = vec![0xABu8; 4096];
            copy_from_buf(&abd, &pattern);

            assert!(try_move(&abd));
            assert_eq!(cmp_buf(&abd, &pattern), std::cmp::Ordering::Equal);
            assert_eq!(abd.size(), 4096);
            free(abd);
        });
    }

    #[test]
    fn compaction_preserves_linear_contents() {
        with_runtime(512, || {
            let abd = alloc_linear(256, false);
            let pattern: Vec<u8> = (0..256).map(|i| i as u8).collect();
            copy_from_buf(&abd, &pattern);

            assert!(try_move(&abd));
            assert_eq!(cmp_buf(&abd, &pattern), std::cmp::Ordering::Equal);
            free(abd);
        });
    }

    #[test]
    fn compaction_blocked_by_live_view_until_put() {
        with_runtime(512, || {
            let abd = alloc(4096, false);
            let view = get_offset(&abd, 0);

            assert!(!try_move(&abd));
            put(view);
            assert!(try_move(&abd));
            free(abd);
        });
    }

    #[test]
    fn compaction_refused_on_non_owner() {
        with_runtime(512, || {
            let abd = alloc(4096, false);
            let view = get_offset(&abd, 0);

            assert!(!try_move(&view));
            put(view);
            free(abd);
        });
    }
}
