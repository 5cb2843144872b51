//! Age-switched composite cache pair.
//!
//! Two peer caches stacked end to end in file coordinates. The producer
//! fills one; when it runs out of room and the other peer has not served a
//! read recently, the stale peer is re-anchored to continue the stream and
//! writing resumes there. The consumer follows: whenever one peer is
//! drained and the other begins exactly where it ends, reading switches
//! over. Together the pair keeps a longer reach of history than either
//! peer alone.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::{CacheError, CacheStrategy};
use crate::config::CacheConfig;

struct DoubleState {
    read_index: usize,
    write_index: usize,
    /// Timestamp of the last successful read per peer; `None` = never read.
    last_use: [Option<Instant>; 2],
}

/// Composite strategy routing between two owned peer caches.
///
/// Construction takes the first peer and derives the second from
/// [`create_new`](CacheStrategy::create_new), so both share one
/// configuration. Initially both the read and write sides point at the
/// first peer.
pub struct DoubleCache {
    config: CacheConfig,
    caches: [Box<dyn CacheStrategy>; 2],
    state: Mutex<DoubleState>,
}

impl DoubleCache {
    /// Wraps `primary` and a freshly derived peer of the same kind.
    pub fn new(primary: Box<dyn CacheStrategy>, config: CacheConfig) -> Self {
        let secondary = primary.create_new();
        Self {
            config,
            caches: [primary, secondary],
            state: Mutex::new(DoubleState {
                read_index: 0,
                write_index: 0,
                last_use: [None, None],
            }),
        }
    }

    /// A peer is fair game for re-anchoring once it has not served a read
    /// within the configured age, or has never served one.
    async fn peer_is_stale(&self, index: usize) -> bool {
        let state = self.state.lock().await;
        state.last_use[index]
            .is_none_or(|used| used.elapsed() >= self.config.peer_max_age)
    }
}

#[async_trait::async_trait]
impl CacheStrategy for DoubleCache {
    async fn open(&mut self) -> Result<(), CacheError> {
        self.caches[0].open().await?;
        if let Err(error) = self.caches[1].open().await {
            self.caches[0].close().await;
            return Err(error);
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.caches[0].close().await;
        self.caches[1].close().await;
    }

    async fn max_write_size(&self, requested: usize) -> usize {
        let write_index = self.state.lock().await.write_index;
        let free = self.caches[write_index].max_write_size(requested).await;

        let peer = 1 - write_index;
        if self.peer_is_stale(peer).await {
            (free + self.caches[peer].max_write_size(requested).await).min(requested)
        } else {
            free
        }
    }

    async fn write_to_cache(&self, data: &[u8]) -> Result<usize, CacheError> {
        let write_index = self.state.lock().await.write_index;
        let mut written = self.caches[write_index].write_to_cache(data).await?;

        if written < data.len() {
            let peer = 1 - write_index;
            if self.peer_is_stale(peer).await {
                // Re-anchor the stale peer to continue the stream where the
                // full cache ends.
                let origin = self.caches[write_index].cached_data_end_pos().await;
                debug!("write cache full, adopting stale peer at {origin}");
                self.caches[peer].reset(origin, true).await;
                self.state.lock().await.write_index = peer;

                match self.caches[peer].write_to_cache(&data[written..]).await {
                    Ok(more) => written += more,
                    // Progress already made stands; the fault resurfaces on
                    // the next write.
                    Err(error) => debug!("adopted peer rejected continuation: {error}"),
                }
            }
        }

        Ok(written)
    }

    async fn read_from_cache(&self, dest: &mut [u8]) -> Result<usize, CacheError> {
        let read_index = self.state.lock().await.read_index;

        // Drain the read cache first. A short count alone does not mean it
        // is empty (a ring peer stops at its wrap point), so keep going
        // until it reports end of input or would block.
        let mut read = 0;
        let mut blocked = false;
        while read < dest.len() {
            match self.caches[read_index].read_from_cache(&mut dest[read..]).await {
                Ok(0) => break,
                Ok(count) => read += count,
                Err(CacheError::WouldBlock) => {
                    blocked = true;
                    break;
                }
                Err(error) if read == 0 => return Err(error),
                Err(_) => break,
            }
        }
        if read > 0 {
            self.state.lock().await.last_use[read_index] = Some(Instant::now());
        }

        if read < dest.len() {
            // Continue into the peer only when it takes over exactly where
            // this cache ends.
            let peer = 1 - read_index;
            let end = self.caches[read_index].cached_data_end_pos().await;
            let peer_begin = self.caches[peer].cached_data_begin_pos().await;
            if peer_begin == end
                && let Ok(count) = self.caches[peer].read_from_cache(&mut dest[read..]).await
                && count > 0
            {
                debug!("read switched to peer cache at {peer_begin}");
                let mut state = self.state.lock().await;
                state.read_index = peer;
                state.last_use[peer] = Some(Instant::now());
                read += count;
            }
        }

        if read == 0 && blocked {
            return Err(CacheError::WouldBlock);
        }
        Ok(read)
    }

    async fn wait_for_data(&self, minimum: usize, timeout: Duration) -> Result<u64, CacheError> {
        if timeout.is_zero() {
            // Availability query: report the total across both peers.
            let first = self.caches[0]
                .wait_for_data(minimum, Duration::ZERO)
                .await
                .unwrap_or(0);
            let second = self.caches[1]
                .wait_for_data(minimum, Duration::ZERO)
                .await
                .unwrap_or(0);
            return Ok(first + second);
        }

        let read_index = self.state.lock().await.read_index;
        self.caches[read_index].wait_for_data(minimum, timeout).await
    }

    async fn seek(&self, file_position: i64) -> Result<i64, CacheError> {
        let contains = [
            self.caches[0].is_cached_position(file_position).await,
            self.caches[1].is_cached_position(file_position).await,
        ];
        let order = if contains[1] && !contains[0] {
            [1, 0]
        } else {
            [0, 1]
        };

        for index in order {
            if self.caches[index].seek(file_position).await.is_ok() {
                self.state.lock().await.read_index = index;
                return Ok(file_position);
            }
        }

        Err(CacheError::SeekOutOfRange {
            position: file_position,
        })
    }

    async fn reset(&self, file_position: i64, clear_anyway: bool) -> bool {
        let contains = [
            self.caches[0].is_cached_position(file_position).await,
            self.caches[1].is_cached_position(file_position).await,
        ];

        let target = if !clear_anyway
            && contains[0]
            && (!contains[1]
                || self.caches[0].cached_data_end_pos().await
                    >= self.caches[1].cached_data_end_pos().await)
        {
            0
        } else if !clear_anyway && contains[1] {
            1
        } else {
            // Repurpose the peer that has gone longest without a read.
            let state = self.state.lock().await;
            match (state.last_use[0], state.last_use[1]) {
                (None, _) => 0,
                (Some(_), None) => 1,
                (Some(first), Some(second)) => {
                    if first <= second {
                        0
                    } else {
                        1
                    }
                }
            }
        };

        self.state.lock().await.write_index = target;
        self.caches[target].reset(file_position, clear_anyway).await
    }

    async fn end_of_input(&self) {
        let write_index = self.state.lock().await.write_index;
        self.caches[write_index].end_of_input().await;
    }

    async fn clear_end_of_input(&self) {
        let write_index = self.state.lock().await.write_index;
        self.caches[write_index].clear_end_of_input().await;
    }

    async fn is_end_of_input(&self) -> bool {
        let read_index = self.state.lock().await.read_index;
        self.caches[read_index].is_end_of_input().await
    }

    async fn cached_data_begin_pos(&self) -> i64 {
        let write_index = self.state.lock().await.write_index;
        self.caches[write_index].cached_data_begin_pos().await
    }

    async fn cached_data_end_pos(&self) -> i64 {
        let write_index = self.state.lock().await.write_index;
        self.caches[write_index].cached_data_end_pos().await
    }

    async fn cached_data_end_pos_if_seek_to(&self, file_position: i64) -> i64 {
        let first = self.caches[0]
            .cached_data_end_pos_if_seek_to(file_position)
            .await;
        let second = self.caches[1]
            .cached_data_end_pos_if_seek_to(file_position)
            .await;
        first.max(second)
    }

    async fn is_cached_position(&self, file_position: i64) -> bool {
        self.caches[0].is_cached_position(file_position).await
            || self.caches[1].is_cached_position(file_position).await
    }

    fn create_new(&self) -> Box<dyn CacheStrategy> {
        Box::new(DoubleCache::new(
            self.caches[0].create_new(),
            self.config.clone(),
        ))
    }
}
