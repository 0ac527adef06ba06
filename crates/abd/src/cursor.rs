// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The dual iterator. Single- and paired-ABD walks that translate logical offsets into physical
//! `(address, mappable length)` pairs, holding the relevant lock(s) for the duration of the walk.

use crate::config::runtime;
use crate::handle::{Abd, Inner};
use crate::kind::Kind;

fn map_at(inner: &Inner, pos: usize, remaining: usize) -> (*mut u8, usize) {
    match &inner.kind {
        Kind::Linear { buf } => {
            // SAFETY: `pos` is always kept `<= size` by the caller, i.e. within the buffer.
            let addr = unsafe { buf.byte_add(pos) };
            (addr.as_ptr(), remaining)
        }
        Kind::Scattered {
            inner_offset,
            chunk_size,
            chunks,
        } => {
            let rt = runtime();
            assert_eq!(
                *chunk_size,
                rt.chunk_pool.chunk_size(),
                "chunk pool's chunk size changed after this abd was allocated"
            );
            let absolute = inner_offset + pos;
            let idx = absolute / chunk_size;
            let chunk_off = absolute % chunk_size;
            // SAFETY: `idx` stays within `chunks` because `pos < size` and the scatter table was
            // sized to cover `[0, inner_offset + size)`.
            let addr = unsafe { chunks[idx].byte_add(chunk_off) };
            (addr.as_ptr(), (chunk_size - chunk_off).min(remaining))
        }
    }
}

/// Walks `[off, off + size)` of `abd`, invoking `step` on each maximally-long contiguous mapped
/// region. `step` returns `0` to continue or any nonzero value to stop early; that value becomes
/// this function's return value (`0` on full completion).
///
/// # Panics
///
/// Panics if `off + size` exceeds `abd.size()`.
pub fn iterate_func(
    abd: &Abd,
    off: usize,
    size: usize,
    mut step: impl FnMut(*mut u8, usize) -> i32,
) -> i32 {
    assert!(
        off.checked_add(size).is_some_and(|end| end <= abd.size()),
        "iterate_func: [{off}, {off}+{size}) is out of bounds for abd of size {}",
        abd.size()
    );

    let inner = abd.lock();
    let mut pos = off;
    let end = off + size;
    while pos < end {
        let (addr, mapped_len) = map_at(&inner, pos, end - pos);
        let n = mapped_len.min(end - pos);
        let rc = step(addr, n);
        if rc != 0 {
            return rc;
        }
        pos += n;
    }
    0
}

/// Like [`iterate_func`] but walks `dst` and `src` in lock step, so `step` always receives a pair
/// of equal-length mapped regions.
///
/// Locks `dst` first, then `src`, matching the crate-wide dual-ABD lock ordering.
///
/// # Panics
///
/// Panics if `dst` and `src` are the same handle, or if either offset/size pair is out of bounds.
pub fn iterate_func2(
    dst: &Abd,
    src: &Abd,
    doff: usize,
    soff: usize,
    size: usize,
    mut step: impl FnMut(*mut u8, *mut u8, usize) -> i32,
) -> i32 {
    assert!(!Abd::ptr_eq(dst, src), "iterate_func2: dst and src must not be the same abd");
    assert!(
        doff.checked_add(size).is_some_and(|end| end <= dst.size()),
        "iterate_func2: dst range out of bounds"
    );
    assert!(
        soff.checked_add(size).is_some_and(|end| end <= src.size()),
        "iterate_func2: src range out of bounds"
    );

    let dst_inner = dst.lock();
    let src_inner = src.lock();

    let mut dpos = doff;
    let mut spos = soff;
    let dend = doff + size;
    let mut remaining = size;

    while remaining > 0 {
        let (daddr, dlen) = map_at(&dst_inner, dpos, dend - dpos);
        let (saddr, slen) = map_at(&src_inner, spos, remaining);
        let n = dlen.min(slen).min(remaining);
        let rc = step(daddr, saddr, n);
        if rc != 0 {
            return rc;
        }
        dpos += n;
        spos += n;
        remaining -= n;
    }
    0
}
