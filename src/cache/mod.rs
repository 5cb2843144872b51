//! Cache strategies for buffering a slow source ahead of playback.
//!
//! This module defines the [`CacheStrategy`] contract shared by all cache
//! backends and the three concrete strategies: an on-disk spool, an
//! in-memory dual-window ring, and an age-switched composite pair. The
//! producer task feeds bytes in with [`CacheStrategy::write_to_cache`]; the
//! consumer drains them with [`CacheStrategy::read_from_cache`], blocking
//! only in [`CacheStrategy::wait_for_data`] and always under a caller
//! supplied deadline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use self::circular::CircularCache;
pub use self::double::DoubleCache;
pub use self::file_spool::FileSpoolCache;

mod circular;
mod double;
mod file_spool;

/// Errors that can occur during cache operations.
///
/// `WouldBlock` and `Timeout` are transient: they invite the caller to
/// retry and are never fatal. Everything else indicates the backing store
/// was lost or the requested position cannot be served from cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No cached data is available yet; retry after the producer catches up.
    #[error("no cached data available yet")]
    WouldBlock,

    /// The wait deadline passed before enough data arrived.
    #[error("timed out after {timeout_ms}ms waiting for cached data")]
    Timeout {
        /// The deadline that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// The strategy has no backing storage; `open` was not called or failed.
    #[error("cache is not open")]
    Closed,

    /// Seek target lies before the start of the cached region.
    #[error("seek to {position} is before the start of cached data at {begin}")]
    SeekBeforeStart {
        /// Requested file position.
        position: i64,
        /// First cached file position.
        begin: i64,
    },

    /// Seek target is not in any cached region and waiting did not cover it.
    #[error("position {position} is not reachable from cached data")]
    SeekOutOfRange {
        /// Requested file position.
        position: i64,
    },

    /// Every candidate spool file name already exists.
    #[error("no free spool file name under {dir:?} after {attempts} attempts")]
    SpoolExhausted {
        /// Directory that was probed for a free name.
        dir: PathBuf,
        /// Number of candidate names tried.
        attempts: u32,
    },

    /// An I/O operation on the backing storage failed.
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Whether the caller should simply retry after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::WouldBlock | CacheError::Timeout { .. }
        )
    }
}

/// Contract shared by every cache backend.
///
/// Exactly two long-lived actors drive an instance: one producer calling
/// [`write_to_cache`](CacheStrategy::write_to_cache) and
/// [`end_of_input`](CacheStrategy::end_of_input), and one consumer calling
/// the read, wait and position operations. Position queries may come from
/// either side. All file positions are absolute byte offsets into the
/// logical source stream; buffer offsets never leak through this interface.
#[async_trait::async_trait]
pub trait CacheStrategy: Send + Sync {
    /// Allocates backing storage. A failed open leaves the strategy closed.
    ///
    /// # Errors
    ///
    /// - `CacheError::SpoolExhausted` - No free spool file name (disk spool)
    /// - `CacheError::Io` - Backing storage could not be created
    async fn open(&mut self) -> Result<(), CacheError>;

    /// Releases backing storage. Idempotent and never fails observably;
    /// cleanup problems are logged and teardown continues.
    async fn close(&mut self);

    /// Upper bound (at most `requested`) that a following
    /// [`write_to_cache`](CacheStrategy::write_to_cache) could accept
    /// without blocking or overwriting still-needed data.
    async fn max_write_size(&self, requested: usize) -> usize;

    /// Stores producer bytes, returning how many were actually kept.
    ///
    /// The count may be short of `data.len()`; the producer retries with
    /// the remainder once space frees up. Never blocks.
    ///
    /// # Errors
    ///
    /// - `CacheError::Closed` - No backing storage
    /// - `CacheError::Io` - The backing store rejected the write
    async fn write_to_cache(&self, data: &[u8]) -> Result<usize, CacheError>;

    /// Copies cached bytes at the read cursor into `dest`.
    ///
    /// Returns a positive count on progress and `0` only when end of input
    /// has been signalled and the region is drained.
    ///
    /// # Errors
    ///
    /// - `CacheError::WouldBlock` - Nothing buffered ahead of the cursor yet
    /// - `CacheError::Closed` - No backing storage
    /// - `CacheError::Io` - The backing store failed
    async fn read_from_cache(&self, dest: &mut [u8]) -> Result<usize, CacheError>;

    /// Waits until at least `minimum` bytes are readable, end of input is
    /// signalled, or `timeout` passes. A zero timeout never blocks and
    /// reports current availability.
    ///
    /// # Errors
    ///
    /// - `CacheError::Timeout` - The deadline passed first
    async fn wait_for_data(&self, minimum: usize, timeout: Duration) -> Result<u64, CacheError>;

    /// Moves the read cursor to an absolute file position.
    ///
    /// Succeeds immediately inside a cached region; waits briefly for
    /// positions a short distance past the cached end; fails otherwise so
    /// the caller can refill from the source.
    ///
    /// # Errors
    ///
    /// - `CacheError::SeekBeforeStart` - Target precedes the cached region
    /// - `CacheError::SeekOutOfRange` - Target unreachable without a source read
    /// - `CacheError::Closed` - No backing storage
    /// - `CacheError::Io` - Repositioning the backing store failed
    async fn seek(&self, file_position: i64) -> Result<i64, CacheError>;

    /// Re-anchors the cache at `file_position`, returning whether resident
    /// data was actually discarded.
    ///
    /// With `clear_anyway` false and the position already cached, only the
    /// read cursor moves and `false` is returned.
    async fn reset(&self, file_position: i64, clear_anyway: bool) -> bool;

    /// Marks that the producer will deliver no more bytes, waking any
    /// blocked waiter.
    async fn end_of_input(&self);

    /// Clears the end-of-input mark (stream reinitialization).
    async fn clear_end_of_input(&self);

    /// Whether the producer has signalled end of input.
    async fn is_end_of_input(&self) -> bool;

    /// First file position of the active cached region.
    async fn cached_data_begin_pos(&self) -> i64;

    /// One past the last file position of the active cached region.
    async fn cached_data_end_pos(&self) -> i64;

    /// The furthest end position reachable without re-reading the source if
    /// the cursor moved to `file_position`; the position itself when it is
    /// not cached.
    async fn cached_data_end_pos_if_seek_to(&self, file_position: i64) -> i64;

    /// Whether `file_position` lies in any resident region.
    async fn is_cached_position(&self, file_position: i64) -> bool;

    /// A peer instance with the same configuration and empty state.
    fn create_new(&self) -> Box<dyn CacheStrategy>;
}
