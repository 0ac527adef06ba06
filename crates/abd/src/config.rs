// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process-wide lifecycle: the tunables, the installed runtime, and `init`/`fini`.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::InitError;
use crate::pool::{BufPool, ChunkPool};
use crate::stats::Stats;

/// Default fixed chunk size used by scattered ABDs when no explicit [`Config`] is supplied.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default ceiling on an individual ABD's logical size.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// Process-wide tunables, validated once at [`init`].
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Fixed size of every chunk vended by the chunk pool. Must be a nonzero power of two.
    /// Read once at first allocation; changing the underlying pool's chunk size afterward is a
    /// fatal configuration error, caught lazily the first time the iterator maps a scattered ABD.
    pub chunk_size: usize,
    /// Ceiling on `Abd::size` for any single handle.
    pub max_block_size: usize,
    /// When `true`, `alloc` prefers scattered storage. When `false`, `alloc` always behaves like
    /// `alloc_linear`.
    pub scatter_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            scatter_enabled: true,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), InitError> {
        if self.chunk_size == 0 || !self.chunk_size.is_power_of_two() {
            return Err(InitError::ChunkSizeNotPowerOfTwo(self.chunk_size));
        }
        if self.max_block_size < self.chunk_size {
            return Err(InitError::MaxBlockSizeTooSmall {
                max_block_size: self.max_block_size,
                chunk_size: self.chunk_size,
            });
        }
        Ok(())
    }
}

/// The installed process-wide state: the validated config plus the two pools handed to `init`.
#[derive(Debug)]
pub(crate) struct Runtime {
    pub(crate) config: Config,
    pub(crate) chunk_pool: Arc<dyn ChunkPool>,
    pub(crate) buf_pool: Arc<dyn BufPool>,
    pub(crate) stats: Stats,
}

static RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

/// Installs the process-wide ABD runtime.
///
/// Must be called exactly once before any other entry point in this crate. Returns
/// [`InitError::AlreadyInitialized`] if a runtime is already installed; call [`fini`] first to
/// replace it.
///
/// # Errors
///
/// Returns an error if `config.chunk_size` is not a nonzero power of two, if
/// `config.max_block_size` is smaller than `config.chunk_size`, or if a runtime is already
/// installed.
pub fn init(
    config: Config,
    chunk_pool: Arc<dyn ChunkPool>,
    buf_pool: Arc<dyn BufPool>,
) -> Result<(), InitError> {
    config.validate()?;

    let mut slot = RUNTIME.write();
    if slot.is_some() {
        return Err(InitError::AlreadyInitialized);
    }

    info!(
        chunk_size = config.chunk_size,
        scatter_enabled = config.scatter_enabled,
        max_block_size = config.max_block_size,
        "abd runtime initialized"
    );

    *slot = Some(Arc::new(Runtime {
        config,
        chunk_pool,
        buf_pool,
        stats: Stats::default(),
    }));
    Ok(())
}

/// Tears down the process-wide ABD runtime.
///
/// Idempotent: calling this when no runtime is installed is a no-op. Any `Abd` handles still
/// live at this point retain their in-process storage (nothing is freed on their behalf); callers
/// are expected to have freed everything they allocated first.
pub fn fini() {
    let mut slot = RUNTIME.write();
    if slot.take().is_some() {
        info!("abd runtime shut down");
    }
}

/// Returns the installed runtime, or panics if [`init`] has not been called.
///
/// Every data-plane entry point in this crate calls this first; an uninitialized runtime is a
/// programming error in the caller, not a recoverable condition.
pub(crate) fn runtime() -> Arc<Runtime> {
    RUNTIME
        .read()
        .clone()
        .expect("abd::init must be called before using any Abd operation")
}

/// Returns the live statistics registry, or panics if [`init`] has not been called.
#[must_use]
pub fn stats() -> crate::stats::StatsSnapshot {
    runtime().stats.snapshot()
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_power_of_two_chunk_size_is_rejected() {
        let config = Config {
            chunk_size: 3000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_block_size_below_chunk_size_is_rejected() {
        let config = Config {
            chunk_size: 8192,
            max_block_size: 4096,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
