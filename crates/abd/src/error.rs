// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// Errors reported while bringing up the process-wide ABD runtime.
///
/// This is the one error surface in the crate that is a real [`Result`] rather than a panic:
/// `chunk_size` is operator/caller supplied, not an invariant of this crate's own logic, so a
/// malformed value is reported rather than trapped. Everything past `init` assumes the runtime
/// was installed successfully and aborts on violation instead (see the crate-level docs).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InitError {
    /// `chunk_size` must be a nonzero power of two.
    #[error("chunk size must be a nonzero power of two, got {0}")]
    ChunkSizeNotPowerOfTwo(usize),

    /// `max_block_size` must be at least one chunk.
    #[error("max block size {max_block_size} is smaller than chunk size {chunk_size}")]
    MaxBlockSizeTooSmall {
        /// The configured maximum block size.
        max_block_size: usize,
        /// The configured chunk size.
        chunk_size: usize,
    },

    /// `init` was called while a runtime was already installed.
    #[error("abd runtime is already initialized; call fini() first")]
    AlreadyInitialized,
}

#[cfg(test)]
mod tests {
    use super::InitError;

    #[test]
    fn messages_are_non_empty() {
        let err = InitError::ChunkSizeNotPowerOfTwo(3);
        assert!(!err.to_string().is_empty());
    }
}
