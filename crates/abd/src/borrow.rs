// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transient raw-buffer loans on top of an ABD, with integrity checks on return.

use std::mem::MaybeUninit;
use std::ptr::NonNull;

use crate::bufops::{copy_from_buf_off, copy_to_buf_off};
use crate::config::runtime;
use crate::flags::AbdFlags;
use crate::handle::Abd;
use crate::kind::Kind;
use crate::pool::BufKind;

/// A raw buffer on loan from an [`Abd`]. Must be handed back through [`return_buf`] or
/// [`return_buf_copy`] (or one of their `_off` variants); dropping it without returning is a
/// caller bug and is caught in debug builds.
#[derive(Debug)]
#[must_use = "a borrowed buffer must be returned with return_buf/return_buf_copy"]
pub struct BorrowedBuf {
    abd: Abd,
    ptr: NonNull<u8>,
    len: usize,
    /// `true` when this loan allocated fresh scratch memory (scattered case) that must be freed
    /// on return, rather than aliasing the ABD's own linear buffer directly.
    owns_alloc: bool,
    returned: bool,
}

impl BorrowedBuf {
    /// Raw pointer to the loaned region, valid for `len()` bytes until returned.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the loaned region in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the loan is empty. Borrowing zero bytes is not a supported call shape, so this is
    /// always `false`, but is provided for API symmetry with other length-bearing types.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Views the loaned region as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must not have handed out another live reference into this region, and must not
    /// read past the bytes it has itself initialized (the scattered-case scratch buffer starts
    /// uninitialized unless obtained via [`borrow_buf_copy`]).
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: forwarded to the caller's obligations; `ptr` is valid for `len` bytes for the
        // lifetime of this loan.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Views the loaned region as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must not have handed out another live reference into this region.
    #[must_use]
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: forwarded to the caller's obligations.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for BorrowedBuf {
    fn drop(&mut self) {
        debug_assert!(
            self.returned,
            "borrowed buffer of {} bytes was dropped without being returned",
            self.len
        );
    }
}

fn raise_refcount(abd: &Abd, n: usize) {
    let mut inner = abd.lock();
    inner.children_refcount += n;
    if inner.children_refcount > 0 {
        inner.flags.insert(AbdFlags::NOMOVE);
    }
}

fn lower_refcount(abd: &Abd, n: usize) {
    let mut inner = abd.lock();
    inner.children_refcount -= n;
    if inner.children_refcount == 0 && !inner.pinned_no_move {
        inner.flags.remove(AbdFlags::NOMOVE);
    }
}

/// Lends a raw, possibly-uninitialized buffer covering the first `n` bytes of `abd`.
///
/// For a linear ABD this is the ABD's own buffer; for a scattered ABD it is freshly allocated
/// scratch memory with unspecified contents. Either way `abd.children_refcount` is raised by `n`
/// until the loan is returned.
pub fn borrow_buf(abd: &Abd, n: usize) -> BorrowedBuf {
    assert!(n <= abd.size(), "borrow_buf: n exceeds abd size");
    let rt = runtime();

    let (ptr, owns_alloc) = {
        let inner = abd.lock();
        match &inner.kind {
            Kind::Linear { buf } => (buf.as_non_null().cast(), false),
            Kind::Scattered { .. } => {
                let is_metadata = inner.flags.contains(AbdFlags::META);
                let kind_tag = if is_metadata {
                    BufKind::Metadata
                } else {
                    BufKind::FileData
                };
                let raw = rt.buf_pool.alloc_buf(n, kind_tag);
                (raw.cast(), true)
            }
        }
    };

    raise_refcount(abd, n);
    rt.stats.borrowed();
    BorrowedBuf {
        abd: abd.clone(),
        ptr,
        len: n,
        owns_alloc,
        returned: false,
    }
}

/// Like [`borrow_buf`] but the loaned buffer's contents are initialized by copying from `abd`.
///
/// For a linear ABD, `borrow_buf` already returns the ABD's own buffer, so there is nothing to
/// copy; only a scattered loan's freshly allocated scratch memory needs populating.
pub fn borrow_buf_copy(abd: &Abd, n: usize) -> BorrowedBuf {
    let mut borrowed = borrow_buf(abd, n);
    if borrowed.owns_alloc {
        copy_to_buf_off(abd, unsafe { borrowed.as_mut_slice() }, 0);
    }
    borrowed
}

/// Returns a loan obtained from [`borrow_buf`] or [`borrow_buf_copy`], covering its full length.
///
/// # Panics
///
/// For a scattered loan: panics if the buffer's contents no longer match the ABD's own contents
/// over `[0, len)` (catching accidental mutation of a buffer the caller was not meant to write
/// to). For a linear loan: panics if the pointer does not match the ABD's own buffer.
pub fn return_buf(borrowed: BorrowedBuf) {
    let len = borrowed.len;
    return_buf_off(borrowed, 0, len);
}

/// Like [`return_buf`] but writes the loaned buffer's contents back into the ABD first (a no-op
/// for a linear loan, which already aliased the ABD's own storage).
pub fn return_buf_copy(borrowed: BorrowedBuf) {
    let len = borrowed.len;
    return_buf_copy_off(borrowed, 0, len);
}

/// Returns a loan, checking/limiting the integrity check to `[off, off + len)`.
///
/// # Panics
///
/// See [`return_buf`].
pub fn return_buf_off(borrowed: BorrowedBuf, off: usize, len: usize) {
    if borrowed.owns_alloc {
        // SAFETY: the loan is still live for its full `borrowed.len`, and `off + len` is the
        // caller's sub-range of it.
        let region = unsafe { std::slice::from_raw_parts(borrowed.ptr.as_ptr().add(off), len) };
        let mut expected = vec![0u8; len];
        copy_to_buf_off(&borrowed.abd, &mut expected, off);
        assert_eq!(
            region, expected,
            "return_buf: scattered loan was mutated before being returned"
        );
    }
    release_loan(borrowed);
}

/// Like [`return_buf_off`] but writes `[off, off + len)` of the loaned buffer back into the ABD
/// before releasing it.
pub fn return_buf_copy_off(borrowed: BorrowedBuf, off: usize, len: usize) {
    if borrowed.owns_alloc {
        // SAFETY: the loan is still live for its full `borrowed.len`, and `off + len` is the
        // caller's sub-range of it.
        let region = unsafe { std::slice::from_raw_parts(borrowed.ptr.as_ptr().add(off), len) };
        copy_from_buf_off(&borrowed.abd, region, off);
    }
    release_loan(borrowed);
}

/// Frees scattered scratch storage (if any), drops the child refcount, and marks the loan
/// consumed. Shared tail of every `return_buf*` variant once its own integrity check/write-back
/// has run.
fn release_loan(mut borrowed: BorrowedBuf) {
    let rt = runtime();
    if borrowed.owns_alloc {
        let kind_tag = if borrowed.abd.lock().flags.contains(AbdFlags::META) {
            BufKind::Metadata
        } else {
            BufKind::FileData
        };
        rt.buf_pool
            .free_buf(borrowed.ptr.cast::<MaybeUninit<u8>>(), borrowed.len, kind_tag);
    }
    lower_refcount(&borrowed.abd, borrowed.len);
    rt.stats.returned();
    borrowed.returned = true;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{borrow_buf, borrow_buf_copy, return_buf, return_buf_copy};
    use crate::bufops::copy_from_buf;
    use crate::config::{self, Config};
    use crate::handle::{alloc, alloc_linear, free};
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
    fn borrow_then_return_unmodified_succeeds() {
        with_runtime(512, || {
            let abd = alloc(1024, false);
            let pattern: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
            copy_from_buf(&abd, &pattern);

            let borrowed = borrow_buf_copy(&abd, 1024);
            return_buf(borrowed);
            free(abd);
        });
    }

    #[test]
    fn borrow_buf_copy_on_linear_abd_aliases_without_self_copy() {
        with_runtime(512, || {
            let abd = alloc_linear(256, false);
            let pattern: Vec<u8> = (0..256).map(|i| i as u8).collect();
            copy_from_buf(&abd, &pattern);

            // A linear loan aliases the abd's own buffer; borrow_buf_copy must not attempt to
            // copy that buffer onto itself (UB for std::ptr::copy_nonoverlapping).
            let borrowed = borrow_buf_copy(&abd, 256);
            assert!(!borrowed.owns_alloc);
            // SAFETY: the loan is still live and exclusively held here.
            assert_eq!(unsafe { borrowed.as_slice() }, pattern.as_slice());
            return_buf(borrowed);
            free(abd);
        });
    }

    #[test]
    #[should_panic(expected = "was mutated before being returned")]
    fn return_buf_rejects_mutated_scattered_loan() {
        with_runtime(512, || {
            let abd = alloc(1024, false);
            let mut borrowed = borrow_buf_copy(&abd, 1024);
            // SAFETY: this loan is still live and owned exclusively by this test.
            unsafe {
                borrowed.as_mut_slice()[0] ^= 0xFF;
            }
            return_buf(borrowed);
            free(abd);
        });
    }

    #[test]
    fn return_buf_copy_writes_scattered_mutations_back() {
        with_runtime(512, || {
            let abd = alloc(1024, false);
            let mut borrowed = borrow_buf(&abd, 1024);
            // SAFETY: fresh scratch buffer, exclusively owned by this loan.
            unsafe {
                borrowed.as_mut_slice().fill(0xAB);
            }
            return_buf_copy(borrowed);

            let mut out = vec![0u8; 1024];
            crate::bufops::copy_to_buf(&abd, &mut out);
            assert!(out.iter().all(|&b| b == 0xAB));
            free(abd);
        });
    }

    #[test]
    fn borrowing_raises_and_returning_lowers_refcount() {
        with_runtime(512, || {
            let abd = alloc(256, false);
            let borrowed = borrow_buf(&abd, 256);
            assert_eq!(abd.lock().children_refcount, 256);
            return_buf(borrowed);
            assert_eq!(abd.lock().children_refcount, 0);
            free(abd);
        });
    }
}
