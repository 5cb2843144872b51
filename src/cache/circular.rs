//! In-memory dual-window ring cache.
//!
//! One fixed-size buffer holds up to two resident windows of the source,
//! each covering a contiguous file-offset interval. The window containing
//! the read cursor is *active*: writes append at its end and reads advance
//! the cursor through it. The other window is history from before the last
//! seek or reset, kept so the consumer can jump back to previously-played
//! material without touching the source again.
//!
//! Space is arbitrated by age. The active window always keeps its rewind
//! guarantee. The inactive window is untouchable while it has been read
//! recently; once stale it is displaced byte by byte from its oldest end
//! until it disappears. So that a fresh recall window never starves the
//! stream, dual mode allocates `back_size` extra bytes for it and a
//! discarding reset trims the kept window down to that guarantee.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::cache::{CacheError, CacheStrategy};
use crate::config::CacheConfig;

/// A resident window of the source stream.
///
/// `start` is the physical buffer index of `beg`; file offset `f` inside
/// the window lives at `(start + (f - beg)) % size`. Windows never overlap
/// in buffer space. `last_use` is `None` until the first read.
struct Region {
    beg: i64,
    end: i64,
    start: usize,
    last_use: Option<Instant>,
}

impl Region {
    fn len(&self) -> usize {
        (self.end - self.beg) as usize
    }

    /// Membership includes the end position: the next byte the producer
    /// will deliver, where the cursor may legally rest.
    fn contains(&self, file_position: i64) -> bool {
        file_position >= self.beg && file_position <= self.end
    }
}

struct RingState {
    buf: Vec<u8>,
    regions: [Option<Region>; 2],
    /// Index of the window containing the cursor.
    active: usize,
    /// Read position in file coordinates.
    cursor: i64,
}

/// Fixed-size in-memory cache holding up to two windows of the source.
///
/// The buffer spans `front_size + back_size` bytes, plus `back_size` more
/// in dual mode so the recall window has room of its own. Writes never
/// block: they store at most
/// [`max_write_size`](CacheStrategy::max_write_size) bytes and report the
/// short count, leaving the producer to retry once the consumer frees
/// space.
pub struct CircularCache {
    config: CacheConfig,
    dual_region: bool,
    state: Mutex<RingState>,
    eof: AtomicBool,
    data_written: Notify,
}

impl CircularCache {
    /// Creates a closed cache; `open` allocates the ring buffer.
    pub fn new(config: CacheConfig) -> Self {
        let dual_region = config.double_cache;
        Self::with_mode(config, dual_region)
    }

    fn with_mode(config: CacheConfig, dual_region: bool) -> Self {
        Self {
            config,
            dual_region,
            state: Mutex::new(RingState {
                buf: Vec::new(),
                regions: [None, None],
                active: 0,
                cursor: 0,
            }),
            eof: AtomicBool::new(false),
            data_written: Notify::new(),
        }
    }

    fn is_stale(&self, region: &Region, now: Instant) -> bool {
        region
            .last_use
            .is_none_or(|used| now.duration_since(used) >= self.config.region_max_age)
    }

    /// How many bytes a write may currently store.
    ///
    /// While the inactive window is fresh it may not be displaced at all:
    /// the budget is exactly the physical run from the write point up to
    /// that window's oldest byte, which is genuinely free space. Once the
    /// inactive window is stale or gone, everything except the active
    /// window's own rewind guarantee and unread front is writable.
    fn write_budget(&self, state: &RingState, now: Instant) -> usize {
        let size = state.buf.len();
        let Some(active) = &state.regions[state.active] else {
            return 0;
        };

        let back = (state.cursor - active.beg) as usize;
        let front = (active.end - state.cursor) as usize;
        let protected = back.min(self.config.back_size);
        let end_phys = (active.start + active.len()) % size;

        match state.regions[1 - state.active].as_ref() {
            Some(other) if !self.is_stale(other, now) => {
                (other.start + size - end_phys) % size
            }
            _ => size - protected - front,
        }
    }

    fn region_containing(state: &RingState, file_position: i64) -> Option<usize> {
        [state.active, 1 - state.active].into_iter().find(|&index| {
            state.regions[index]
                .as_ref()
                .is_some_and(|region| region.contains(file_position))
        })
    }

    async fn front_available(&self) -> u64 {
        let state = self.state.lock().await;
        match &state.regions[state.active] {
            Some(active) => (active.end - state.cursor).max(0) as u64,
            None => 0,
        }
    }
}

#[async_trait::async_trait]
impl CacheStrategy for CircularCache {
    async fn open(&mut self) -> Result<(), CacheError> {
        let mut size = self.config.front_size + self.config.back_size;
        if self.dual_region {
            // Room for the recall window alongside the active working set,
            // so keeping one never starves the stream.
            size += self.config.back_size;
        }
        let mut state = self.state.lock().await;
        state.buf = vec![0u8; size];
        state.regions = [
            Some(Region {
                beg: 0,
                end: 0,
                start: 0,
                last_use: None,
            }),
            None,
        ];
        state.active = 0;
        state.cursor = 0;
        drop(state);
        self.eof.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().await;
        state.buf = Vec::new();
        state.regions = [None, None];
        state.active = 0;
        state.cursor = 0;
    }

    async fn max_write_size(&self, requested: usize) -> usize {
        let state = self.state.lock().await;
        requested.min(self.write_budget(&state, Instant::now()))
    }

    /// Stores bytes at the end of the active window.
    ///
    /// A single call never wraps the physical buffer, so filling the cache
    /// can take several calls. Bytes taken from the inactive window are
    /// dropped from its oldest end; a window displaced to zero length is
    /// forgotten entirely.
    async fn write_to_cache(&self, data: &[u8]) -> Result<usize, CacheError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.buf.is_empty() {
            return Err(CacheError::Closed);
        }

        let now = Instant::now();
        let budget = self.write_budget(state, now);
        let size = state.buf.len();
        let end_phys = match &state.regions[state.active] {
            Some(active) => (active.start + active.len()) % size,
            None => return Err(CacheError::Closed),
        };
        let wrap = size - end_phys;
        let count = data.len().min(budget).min(wrap);
        if count == 0 {
            return Ok(0);
        }

        state.buf[end_phys..end_phys + count].copy_from_slice(&data[..count]);

        // The write may have run into a stale inactive window; drop what it
        // overwrote from that window's oldest end. A fresh window is never
        // touched: the budget stops short of it.
        let other_index = 1 - state.active;
        let other_is_stale = state.regions[other_index]
            .as_ref()
            .is_some_and(|other| self.is_stale(other, now));
        if other_is_stale && let Some(other) = &mut state.regions[other_index] {
            let gap = (other.start + size - end_phys) % size;
            if gap < count {
                let eaten = (count - gap).min(other.len());
                other.beg += eaten as i64;
                other.start = (other.start + eaten) % size;
                debug!("displaced {eaten} bytes of stale window history");
                if other.len() == 0 {
                    state.regions[other_index] = None;
                }
            }
        }

        if let Some(active) = &mut state.regions[state.active] {
            active.end += count as i64;
            if active.len() > size {
                // Own history beyond the buffer footprint is gone.
                let dropped = active.len() - size;
                active.beg += dropped as i64;
                active.start = (active.start + dropped) % size;
            }
        }

        debug_assert!(
            state.regions.iter().flatten().map(Region::len).sum::<usize>() <= size,
            "resident windows exceed the buffer"
        );

        drop(guard);
        self.data_written.notify_one();
        Ok(count)
    }

    /// Copies bytes at the cursor out of the active window.
    ///
    /// Only reads up to the physical wrap point, so draining the cache can
    /// take several calls.
    async fn read_from_cache(&self, dest: &mut [u8]) -> Result<usize, CacheError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.buf.is_empty() {
            return Err(CacheError::Closed);
        }

        let size = state.buf.len();
        let Some(active) = &mut state.regions[state.active] else {
            return Err(CacheError::Closed);
        };

        let front = (active.end - state.cursor) as usize;
        if front == 0 {
            return if self.eof.load(Ordering::SeqCst) {
                Ok(0)
            } else {
                Err(CacheError::WouldBlock)
            };
        }

        let pos = (active.start + (state.cursor - active.beg) as usize) % size;
        let count = dest.len().min(front).min(size - pos);
        if count == 0 {
            return Ok(0);
        }

        dest[..count].copy_from_slice(&state.buf[pos..pos + count]);
        state.cursor += count as i64;
        active.last_use = Some(Instant::now());
        Ok(count)
    }

    async fn wait_for_data(&self, minimum: usize, timeout: Duration) -> Result<u64, CacheError> {
        // Never demand more than half the forward window; with a recall
        // window resident the full front may not materialize at once.
        let minimum = minimum.min(self.config.front_size / 2) as u64;

        let deadline = Instant::now() + timeout;
        loop {
            let available = self.front_available().await;
            if available >= minimum || timeout.is_zero() || self.eof.load(Ordering::SeqCst) {
                return Ok(available);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CacheError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let _ = tokio::time::timeout(remaining, self.data_written.notified()).await;
        }
    }

    async fn seek(&self, file_position: i64) -> Result<i64, CacheError> {
        let wait_from = {
            let mut state = self.state.lock().await;
            if state.buf.is_empty() {
                return Err(CacheError::Closed);
            }

            if let Some(index) = Self::region_containing(&state, file_position) {
                state.active = index;
                state.cursor = file_position;
                return Ok(file_position);
            }

            // A seek slightly past what we have is worth a short wait; a
            // (heavy) seek on the source is avoided if the producer catches
            // up in time.
            let mut target = None;
            for index in [state.active, 1 - state.active] {
                if let Some(region) = &state.regions[index]
                    && file_position >= region.end
                    && file_position < region.end + self.config.seek_wait_window
                {
                    target = Some((index, region.end));
                    break;
                }
            }
            let Some((index, end)) = target else {
                debug!("seek to {file_position} is outside both cached windows");
                return Err(CacheError::SeekOutOfRange {
                    position: file_position,
                });
            };

            // Everything cached becomes back buffer, guaranteeing forward
            // space for the gap.
            state.active = index;
            state.cursor = end;
            end
        };

        let gap = (file_position - wait_from) as usize;
        let _ = self.wait_for_data(gap, self.config.seek_wait).await;

        let mut state = self.state.lock().await;
        if let Some(index) = Self::region_containing(&state, file_position) {
            state.active = index;
            state.cursor = file_position;
            return Ok(file_position);
        }
        debug!("seek to {file_position}: producer did not cover the gap");
        Err(CacheError::SeekOutOfRange {
            position: file_position,
        })
    }

    async fn reset(&self, file_position: i64, clear_anyway: bool) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.buf.is_empty() {
            return false;
        }

        if !clear_anyway
            && let Some(index) = Self::region_containing(state, file_position)
        {
            state.active = index;
            state.cursor = file_position;
            return false;
        }

        // Seed a fresh window at the new origin. The window the cursor was
        // not in is preferred when it is stale or unused; a fresh one is
        // kept as recall history and the active window is collapsed instead.
        let other_index = 1 - state.active;
        let other_reusable = state.regions[other_index]
            .as_ref()
            .is_none_or(|other| self.is_stale(other, Instant::now()));
        let seed_index = if self.dual_region && other_reusable {
            other_index
        } else {
            state.active
        };

        let retained_index = 1 - seed_index;
        if !self.dual_region
            || state.regions[retained_index]
                .as_ref()
                .is_some_and(|region| region.len() == 0)
        {
            // An empty window offers no recall; drop it.
            state.regions[retained_index] = None;
        }
        if let Some(retained) = &mut state.regions[retained_index]
            && retained.len() > self.config.back_size
        {
            // The kept window only owes its recall guarantee; releasing
            // the rest makes room for the new working set.
            let trimmed = retained.len() - self.config.back_size;
            retained.beg += trimmed as i64;
            retained.start = (retained.start + trimmed) % state.buf.len();
        }
        let start = match &state.regions[retained_index] {
            Some(retained) => (retained.start + retained.len()) % state.buf.len(),
            None => 0,
        };

        state.regions[seed_index] = Some(Region {
            beg: file_position,
            end: file_position,
            start,
            last_use: None,
        });
        state.active = seed_index;
        state.cursor = file_position;
        drop(guard);

        self.eof.store(false, Ordering::SeqCst);
        true
    }

    async fn end_of_input(&self) {
        self.eof.store(true, Ordering::SeqCst);
        self.data_written.notify_one();
    }

    async fn clear_end_of_input(&self) {
        self.eof.store(false, Ordering::SeqCst);
    }

    async fn is_end_of_input(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }

    async fn cached_data_begin_pos(&self) -> i64 {
        let state = self.state.lock().await;
        state.regions[state.active]
            .as_ref()
            .map_or(0, |region| region.beg)
    }

    async fn cached_data_end_pos(&self) -> i64 {
        let state = self.state.lock().await;
        state.regions[state.active]
            .as_ref()
            .map_or(0, |region| region.end)
    }

    async fn cached_data_end_pos_if_seek_to(&self, file_position: i64) -> i64 {
        let state = self.state.lock().await;
        match Self::region_containing(&state, file_position) {
            Some(index) => state.regions[index]
                .as_ref()
                .map_or(file_position, |region| region.end),
            None => file_position,
        }
    }

    async fn is_cached_position(&self, file_position: i64) -> bool {
        let state = self.state.lock().await;
        Self::region_containing(&state, file_position).is_some()
    }

    fn create_new(&self) -> Box<dyn CacheStrategy> {
        // Peers keep a single window each; pairing them in a composite is
        // what provides the second window.
        Box::new(CircularCache::with_mode(self.config.clone(), false))
    }
}
