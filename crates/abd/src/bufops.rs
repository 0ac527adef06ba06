// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Buffer operations built on top of the single- and dual-iterator: `copy_to_buf`,
//! `copy_from_buf`, `cmp_buf`, `zero`, `copy`, `cmp`, and their `_off` variants.

use std::cmp::Ordering;

use crate::cursor::{iterate_func, iterate_func2};
use crate::handle::Abd;

/// Copies `buf.len()` bytes starting at `off` of `abd` into `buf`.
pub fn copy_to_buf_off(abd: &Abd, buf: &mut [u8], off: usize) {
    let mut cursor = 0usize;
    iterate_func(abd, off, buf.len(), |addr, len| {
        // SAFETY: `addr` is valid for `len` bytes per the iterator's contract; `buf[cursor..]`
        // has at least `len` bytes remaining because the iterator never yields past `buf.len()`.
        unsafe {
            std::ptr::copy_nonoverlapping(addr, buf.as_mut_ptr().add(cursor), len);
        }
        cursor += len;
        0
    });
}

/// Copies the entirety of `abd` into `buf`.
///
/// # Panics
///
/// Panics if `buf.len() != abd.size()`.
pub fn copy_to_buf(abd: &Abd, buf: &mut [u8]) {
    assert_eq!(buf.len(), abd.size(), "copy_to_buf: buffer size must match abd size");
    copy_to_buf_off(abd, buf, 0);
}

/// Copies `buf` into `abd` starting at `off`.
pub fn copy_from_buf_off(abd: &Abd, buf: &[u8], off: usize) {
    let mut cursor = 0usize;
    iterate_func(abd, off, buf.len(), |addr, len| {
        // SAFETY: symmetric with `copy_to_buf_off`.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr().add(cursor), addr, len);
        }
        cursor += len;
        0
    });
}

/// Overwrites the entirety of `abd` with `buf`.
///
/// # Panics
///
/// Panics if `buf.len() != abd.size()`.
pub fn copy_from_buf(abd: &Abd, buf: &[u8]) {
    assert_eq!(buf.len(), abd.size(), "copy_from_buf: buffer size must match abd size");
    copy_from_buf_off(abd, buf, 0);
}

/// Compares `buf.len()` bytes starting at `off` of `abd` against `buf`, memcmp-style: `Equal`
/// when identical, otherwise the ordering of the first differing byte.
pub fn cmp_buf_off(abd: &Abd, buf: &[u8], off: usize) -> Ordering {
    let mut cursor = 0usize;
    let mut result = Ordering::Equal;
    iterate_func(abd, off, buf.len(), |addr, len| {
        // SAFETY: `addr` is valid for `len` bytes per the iterator's contract.
        let mapped = unsafe { std::slice::from_raw_parts(addr.cast_const(), len) };
        let rhs = &buf[cursor..cursor + len];
        match mapped.cmp(rhs) {
            Ordering::Equal => {
                cursor += len;
                0
            }
            other => {
                result = other;
                1
            }
        }
    });
    result
}

/// Compares the entirety of `abd` against `buf`.
///
/// # Panics
///
/// Panics if `buf.len() != abd.size()`.
pub fn cmp_buf(abd: &Abd, buf: &[u8]) -> Ordering {
    assert_eq!(buf.len(), abd.size(), "cmp_buf: buffer size must match abd size");
    cmp_buf_off(abd, buf, 0)
}

/// Zero-fills `size` bytes starting at `off` of `abd`.
pub fn zero_off(abd: &Abd, off: usize, size: usize) {
    iterate_func(abd, off, size, |addr, len| {
        // SAFETY: `addr` is valid for `len` bytes per the iterator's contract.
        unsafe {
            std::ptr::write_bytes(addr, 0, len);
        }
        0
    });
}

/// Zero-fills the entirety of `abd`.
pub fn zero(abd: &Abd) {
    zero_off(abd, 0, abd.size());
}

/// Copies `size` bytes from `src` (at `soff`) into `dst` (at `doff`).
pub fn copy_off(dst: &Abd, src: &Abd, doff: usize, soff: usize, size: usize) {
    iterate_func2(dst, src, doff, soff, size, |daddr, saddr, len| {
        // SAFETY: the dual iterator guarantees `daddr`/`saddr` are each valid for `len` bytes and
        // that they never overlap, since they belong to distinct ABDs.
        unsafe {
            std::ptr::copy_nonoverlapping(saddr.cast_const(), daddr, len);
        }
        0
    });
}

/// Copies the entirety of `src` into `dst`.
///
/// # Panics
///
/// Panics if `dst.size() != src.size()`.
pub fn copy(dst: &Abd, src: &Abd) {
    assert_eq!(dst.size(), src.size(), "copy: dst and src must have equal size");
    copy_off(dst, src, 0, 0, dst.size());
}

/// Compares `a` and `b` byte-for-byte, memcmp-style.
///
/// # Panics
///
/// Panics if `a.size() != b.size()`.
pub fn cmp(a: &Abd, b: &Abd) -> Ordering {
    assert_eq!(a.size(), b.size(), "cmp: operands must have equal size");
    let mut result = Ordering::Equal;
    iterate_func2(a, b, 0, 0, a.size(), |aaddr, baddr, len| {
        // SAFETY: the dual iterator guarantees both addresses are valid for `len` bytes.
        let (lhs, rhs) = unsafe {
            (
                std::slice::from_raw_parts(aaddr.cast_const(), len),
                std::slice::from_raw_parts(baddr.cast_const(), len),
            )
        };
        match lhs.cmp(rhs) {
            Ordering::Equal => 0,
            other => {
                result = other;
                1
            }
        }
    });
    result
}
