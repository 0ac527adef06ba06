// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Abstract Buffer Data: a uniform handle for linear and scattered block payloads.
//!
//! An [`Abd`] is either backed by one contiguous buffer (*linear*) or an ordered list of
//! fixed-size chunks drawn from a slab allocator (*scattered*). Consumers read, write, compare,
//! zero, and iterate over the payload without caring which representation is in use. Zero-copy
//! sub-views onto an existing ABD (`get_offset`) are themselves first-class ABDs that alias their
//! parent's storage.
//!
//! ```
//! use std::sync::Arc;
//!
//! use abd::test_pool::{TestBufPool, TestChunkPool};
//! use abd::{Config, bufops, config, handle};
//!
//! config::init(
//!     Config::default(),
//!     Arc::new(TestChunkPool::new(4096)),
//!     Arc::new(TestBufPool::new()),
//! )
//! .expect("valid config");
//!
//! let abd = handle::alloc(1200, false);
//! bufops::copy_from_buf(&abd, &vec![7u8; 1200]);
//!
//! let view = handle::get_offset(&abd, 600);
//! assert_eq!(view.size(), 600);
//! let mut out = vec![0u8; 600];
//! bufops::copy_to_buf(&view, &mut out);
//! assert!(out.iter().all(|&b| b == 7));
//!
//! handle::put(view);
//! handle::free(abd);
//! config::fini();
//! ```
//!
//! # Invariants
//!
//! 1. `0 < size <= max_block_size`.
//! 2. Flags are drawn only from [`flags::AbdFlags`].
//! 3. A view (`parent.is_some()`) is never an owner.
//! 4. The metadata bit implies ownership.
//! 5. A scattered handle's inner offset stays within `[0, chunk_size)`, and its chunk table is
//!    sized to exactly cover `[0, inner_offset + size)`.
//! 6. A linear handle's buffer pointer is always valid for `size` bytes.
//! 7. A nonzero child refcount always implies `NOMOVE`.
//! 8. A view's parent must remain allocated (not `free`d) for as long as the view exists.
//! 9. A handle never changes representation (linear never becomes scattered or vice versa).
//!
//! # Error model
//!
//! Almost everything in this crate treats a broken invariant as a programming error: it panics
//! with context rather than returning a `Result`. The one exception is [`config::init`], which
//! validates caller-supplied tunables and reports a typed [`error::InitError`] instead, because
//! those values originate outside this crate's own logic. [`compact::try_move`] is not an error
//! surface at all: refusing to move is an expected, frequent outcome signalled by its `bool`
//! return.
//!
//! # Concurrency
//!
//! Every `Abd` carries its own lock; there is no process-global lock. Operations spanning two
//! ABDs (`bufops::copy`, `bufops::cmp`, `cursor::iterate_func2`) always lock the first (`dst`)
//! argument before the second (`src`); callers must never invoke the pair in the opposite order
//! from two threads concurrently. A child raising its parent's refcount (`handle::get_offset`)
//! and a child lowering it (`handle::put`) are the only places two locks are held at once, always
//! in the same child-then-parent order, so deadlock between these two operations cannot occur.

mod borrow;
pub mod bufops;
mod chunk;
mod compact;
pub mod config;
mod cursor;
mod error;
mod flags;
pub mod handle;
mod kind;
mod pool;
mod stats;

#[cfg(any(test, feature = "test-util"))]
pub mod test_pool;

pub use borrow::{
    BorrowedBuf, borrow_buf, borrow_buf_copy, return_buf, return_buf_copy, return_buf_copy_off,
    return_buf_off,
};
pub use bufops::{
    cmp, cmp_buf, cmp_buf_off, copy, copy_from_buf, copy_from_buf_off, copy_off, copy_to_buf,
    copy_to_buf_off, zero, zero_off,
};
pub use compact::try_move;
pub use config::{Config, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_BLOCK_SIZE, fini, init, stats};
pub use cursor::{iterate_func, iterate_func2};
pub use error::InitError;
pub use flags::AbdFlags;
pub use handle::{
    Abd, alloc, alloc_for_io, alloc_linear, alloc_sametype, free, get_offset, get_offset_size,
    get_from_buf, put, release_ownership_of_buf, take_ownership_of_buf, to_buf, to_buf_ephemeral,
};
pub use pool::{BufKind, BufPool, ChunkPool};
pub use stats::StatsSnapshot;
