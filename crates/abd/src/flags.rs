// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bitflags::bitflags;

bitflags! {
    /// State bits carried by every [`Abd`](crate::Abd).
    ///
    /// See the invariants listed on [`crate::Abd`] for how these bits interact.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AbdFlags: u8 {
        /// Payload is one contiguous region. Absent means scattered. Immutable after construction.
        const LINEAR = 0b0000_0001;
        /// This handle owns (will free) its backing storage.
        const OWNER  = 0b0000_0010;
        /// Payload is filesystem metadata rather than file data. Only meaningful with `OWNER`.
        const META   = 0b0000_0100;
        /// Scattered allocation whose logical size is smaller than one chunk. Statistics-only.
        const SMALL  = 0b0000_1000;
        /// Compaction is currently forbidden: in use, borrowed, or has live children.
        const NOMOVE = 0b0001_0000;
    }
}

#[cfg(test)]
mod tests {
    use super::AbdFlags;

    #[test]
    fn owner_and_linear_are_independent_bits() {
        let flags = AbdFlags::OWNER | AbdFlags::LINEAR;
        assert!(flags.contains(AbdFlags::OWNER));
        assert!(flags.contains(AbdFlags::LINEAR));
        assert!(!flags.contains(AbdFlags::META));
    }

    #[test]
    fn empty_flags_has_no_bits_set() {
        assert_eq!(AbdFlags::empty().bits(), 0);
    }
}
