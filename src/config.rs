//! Centralized configuration for the cache layer.
//!
//! All tunable parameters live here to avoid hard-coded values scattered
//! throughout the strategies. Age thresholds and wait durations are plain
//! [`Duration`]s so the time-based policies are testable without real
//! multi-second sleeps.

use std::path::PathBuf;
use std::time::Duration;

/// Tunable parameters shared by all cache strategies.
///
/// A single config is handed to every strategy; each uses the fields that
/// apply to it. Cloning is cheap and `create_new` peers inherit the parent
/// configuration unchanged.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Forward window of the circular cache, ahead of the play cursor
    pub front_size: usize,
    /// Guaranteed rewind window of the circular cache, behind the cursor
    pub back_size: usize,
    /// Whether the circular cache keeps a second history window; allocates
    /// an extra `back_size` bytes of ring so the window has room of its own
    pub double_cache: bool,
    /// Age after which the circular cache's inactive window may be displaced
    pub region_max_age: Duration,
    /// Age after which a double-cache peer may be reset and adopted
    pub peer_max_age: Duration,
    /// Bytes past the cached end for which a seek waits instead of failing
    pub seek_wait_window: i64,
    /// How long a seek waits for the producer to cover the gap
    pub seek_wait: Duration,
    /// Directory receiving spool files (`filecacheNNN.cache`)
    pub spool_dir: PathBuf,
    /// Optional upper bound on spool file size (`None` = unbounded)
    pub spool_capacity: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            front_size: 4 * 1024 * 1024, // 4 MiB
            back_size: 4 * 1024 * 1024,  // 4 MiB
            double_cache: true,
            region_max_age: Duration::from_secs(10),
            peer_max_age: Duration::from_secs(15),
            seek_wait_window: 100_000,
            seek_wait: Duration::from_secs(5),
            spool_dir: std::env::temp_dir(),
            spool_capacity: None,
        }
    }
}

impl CacheConfig {
    /// Creates configuration sized for memory-constrained playback.
    pub fn low_memory() -> Self {
        Self {
            front_size: 1024 * 1024, // 1 MiB
            back_size: 1024 * 1024,  // 1 MiB
            ..Default::default()
        }
    }

    /// Creates configuration with spool files capped at `capacity` bytes.
    ///
    /// Bounded spools are what make the double-cache switching policy
    /// observable: a full spool forces the composite to adopt its peer.
    pub fn bounded_spool(capacity: u64) -> Self {
        Self {
            spool_capacity: Some(capacity),
            ..Default::default()
        }
    }
}
