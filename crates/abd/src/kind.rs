// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::chunk::RawPtr;

/// The closed sum of backing-storage representations an [`Abd`](crate::Abd) can have.
///
/// Callers never see this directly; `Abd::is_linear` is the only externally visible trace of the
/// tag. An ABD never transitions between variants after construction (invariant 9).
#[derive(Debug)]
pub(crate) enum Kind {
    /// One contiguous region of exactly `size` bytes.
    Linear {
        /// Start of the backing region.
        buf: RawPtr,
    },
    /// An ordered list of fixed-size chunks drawn from the chunk pool.
    Scattered {
        /// Byte offset into `chunks[0]` where this ABD's logical data begins. `0 <= inner_offset
        /// < chunk_size`.
        inner_offset: usize,
        /// The chunk size this ABD was built against. Compared against the live pool's chunk
        /// size on every map; a mismatch means the pool's tunable changed after first use, which
        /// is a fatal configuration error.
        chunk_size: usize,
        /// Chunk pointers in logical order. Never reallocated after construction: `try_move`
        /// mutates entries in place, it never grows or shrinks this vector.
        chunks: Vec<RawPtr>,
    },
}

impl Kind {
    pub(crate) const fn is_linear(&self) -> bool {
        matches!(self, Self::Linear { .. })
    }
}
