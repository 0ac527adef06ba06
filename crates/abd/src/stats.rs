// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The statistics registry.
//!
//! A fixed set of named atomic counters, updated with relaxed atomic adds. No ordering is
//! promised between a counter bump and the handle state change it accompanies; callers observing
//! these counters concurrently with allocator activity should treat them as eventually
//! consistent, the same way `kstat`-style exports are.

use std::sync::atomic::{AtomicU64, Ordering};

/// Read-only snapshot of the counters in [`Stats`], suitable for logging or export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct StatsSnapshot {
    /// Total bytes consumed by handle structures currently live.
    pub struct_bytes: u64,
    /// Number of live linear owner ABDs.
    pub linear_cnt: u64,
    /// Total payload bytes held by live linear owner ABDs.
    pub linear_data_size: u64,
    /// Number of live scattered owner ABDs.
    pub scatter_cnt: u64,
    /// Total payload bytes held by live scattered owner ABDs.
    pub scatter_data_size: u64,
    /// Bytes allocated into chunks but not used by any scattered ABD's logical payload.
    pub scatter_chunk_waste: u64,
    /// Live linear owners carrying the metadata bit.
    pub linear_meta_cnt: u64,
    /// Live scattered owners carrying the metadata bit.
    pub scatter_meta_cnt: u64,
    /// Live linear owners without the metadata bit.
    pub linear_filedata_cnt: u64,
    /// Live scattered owners without the metadata bit.
    pub scatter_filedata_cnt: u64,
    /// Live scattered owners whose logical size is smaller than one chunk.
    pub scatter_small_cnt: u64,
    /// Outstanding borrowed buffers that have not yet been returned.
    pub borrowed_cnt: u64,
    /// Successful compactions of linear ABDs.
    pub moved_linear: u64,
    /// Successful compactions of scattered ABDs.
    pub moved_scatter: u64,
    /// `try_move` calls refused because children were still attached.
    pub move_refcount_nonzero: u64,
    /// `try_move` calls refused because `NOMOVE` was already set.
    pub move_to_buf_flag_fail: u64,
}

/// Process-wide counters. One instance lives inside the installed [`crate::config::Runtime`].
#[derive(Debug, Default)]
pub struct Stats {
    struct_bytes: AtomicU64,
    linear_cnt: AtomicU64,
    linear_data_size: AtomicU64,
    scatter_cnt: AtomicU64,
    scatter_data_size: AtomicU64,
    scatter_chunk_waste: AtomicU64,
    linear_meta_cnt: AtomicU64,
    scatter_meta_cnt: AtomicU64,
    linear_filedata_cnt: AtomicU64,
    scatter_filedata_cnt: AtomicU64,
    scatter_small_cnt: AtomicU64,
    borrowed_cnt: AtomicU64,
    moved_linear: AtomicU64,
    moved_scatter: AtomicU64,
    move_refcount_nonzero: AtomicU64,
    move_to_buf_flag_fail: AtomicU64,
}

fn add(counter: &AtomicU64, delta: u64) {
    counter.fetch_add(delta, Ordering::Relaxed);
}

fn sub(counter: &AtomicU64, delta: u64) {
    counter.fetch_sub(delta, Ordering::Relaxed);
}

impl Stats {
    pub(crate) fn struct_allocated(&self, bytes: u64) {
        add(&self.struct_bytes, bytes);
    }

    pub(crate) fn struct_freed(&self, bytes: u64) {
        sub(&self.struct_bytes, bytes);
    }

    pub(crate) fn linear_allocated(&self, size: u64, is_metadata: bool) {
        add(&self.linear_cnt, 1);
        add(&self.linear_data_size, size);
        if is_metadata {
            add(&self.linear_meta_cnt, 1);
        } else {
            add(&self.linear_filedata_cnt, 1);
        }
    }

    pub(crate) fn linear_freed(&self, size: u64, is_metadata: bool) {
        sub(&self.linear_cnt, 1);
        sub(&self.linear_data_size, size);
        if is_metadata {
            sub(&self.linear_meta_cnt, 1);
        } else {
            sub(&self.linear_filedata_cnt, 1);
        }
    }

    pub(crate) fn scatter_allocated(&self, size: u64, waste: u64, is_metadata: bool, is_small: bool) {
        add(&self.scatter_cnt, 1);
        add(&self.scatter_data_size, size);
        add(&self.scatter_chunk_waste, waste);
        if is_metadata {
            add(&self.scatter_meta_cnt, 1);
        } else {
            add(&self.scatter_filedata_cnt, 1);
        }
        if is_small {
            add(&self.scatter_small_cnt, 1);
        }
    }

    pub(crate) fn scatter_freed(&self, size: u64, waste: u64, is_metadata: bool, is_small: bool) {
        sub(&self.scatter_cnt, 1);
        sub(&self.scatter_data_size, size);
        sub(&self.scatter_chunk_waste, waste);
        if is_metadata {
            sub(&self.scatter_meta_cnt, 1);
        } else {
            sub(&self.scatter_filedata_cnt, 1);
        }
        if is_small {
            sub(&self.scatter_small_cnt, 1);
        }
    }

    pub(crate) fn borrowed(&self) {
        add(&self.borrowed_cnt, 1);
    }

    pub(crate) fn returned(&self) {
        sub(&self.borrowed_cnt, 1);
    }

    pub(crate) fn moved(&self, is_linear: bool) {
        if is_linear {
            add(&self.moved_linear, 1);
        } else {
            add(&self.moved_scatter, 1);
        }
    }

    pub(crate) fn move_refused_refcount(&self) {
        add(&self.move_refcount_nonzero, 1);
    }

    pub(crate) fn move_refused_nomove(&self) {
        add(&self.move_to_buf_flag_fail, 1);
    }

    /// Takes a consistent-enough point-in-time snapshot of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            struct_bytes: self.struct_bytes.load(Ordering::Relaxed),
            linear_cnt: self.linear_cnt.load(Ordering::Relaxed),
            linear_data_size: self.linear_data_size.load(Ordering::Relaxed),
            scatter_cnt: self.scatter_cnt.load(Ordering::Relaxed),
            scatter_data_size: self.scatter_data_size.load(Ordering::Relaxed),
            scatter_chunk_waste: self.scatter_chunk_waste.load(Ordering::Relaxed),
            linear_meta_cnt: self.linear_meta_cnt.load(Ordering::Relaxed),
            scatter_meta_cnt: self.scatter_meta_cnt.load(Ordering::Relaxed),
            linear_filedata_cnt: self.linear_filedata_cnt.load(Ordering::Relaxed),
            scatter_filedata_cnt: self.scatter_filedata_cnt.load(Ordering::Relaxed),
            scatter_small_cnt: self.scatter_small_cnt.load(Ordering::Relaxed),
            borrowed_cnt: self.borrowed_cnt.load(Ordering::Relaxed),
            moved_linear: self.moved_linear.load(Ordering::Relaxed),
            moved_scatter: self.moved_scatter.load(Ordering::Relaxed),
            move_refcount_nonzero: self.move_refcount_nonzero.load(Ordering::Relaxed),
            move_to_buf_flag_fail: self.move_to_buf_flag_fail.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Stats;

    #[test]
    fn linear_allocated_then_freed_nets_to_zero() {
        let stats = Stats::default();
        stats.linear_allocated(128, false);
        let mid = stats.snapshot();
        assert_eq!(mid.linear_cnt, 1);
        assert_eq!(mid.linear_data_size, 128);
        assert_eq!(mid.linear_filedata_cnt, 1);

        stats.linear_freed(128, false);
        let end = stats.snapshot();
        assert_eq!(end.linear_cnt, 0);
        assert_eq!(end.linear_data_size, 0);
        assert_eq!(end.linear_filedata_cnt, 0);
    }

    #[test]
    fn scatter_waste_is_tracked_independently_of_data_size() {
        let stats = Stats::default();
        stats.scatter_allocated(1500, 548, false, false);
        let snap = stats.snapshot();
        assert_eq!(snap.scatter_data_size, 1500);
        assert_eq!(snap.scatter_chunk_waste, 548);
    }
}
