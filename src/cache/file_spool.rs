//! On-disk spool cache.
//!
//! A monotonically growing temporary file with independent write and read
//! handles. The producer appends, the consumer reads behind it, and the
//! whole history since the last reset stays seekable. Effectively unbounded
//! unless a spool capacity is configured.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::cache::{CacheError, CacheStrategy};
use crate::config::CacheConfig;

/// Spool file names are probed as `filecache000.cache` .. `filecache999.cache`.
const SPOOL_NAME_ATTEMPTS: u32 = 1000;

/// Seeks further than this past the written data fail without waiting.
const FAR_SEEK_LIMIT: i64 = 500_000;

struct SpoolFiles {
    path: PathBuf,
    writer: Mutex<File>,
    reader: Mutex<File>,
}

/// Cache strategy spooling the source stream to a temporary file.
///
/// The spool is created by [`open`](CacheStrategy::open), truncated by a
/// discarding [`reset`](CacheStrategy::reset) and deleted by
/// [`close`](CacheStrategy::close). Write and read positions are byte
/// counts into the spool; `start_position` maps spool offset zero to a
/// file position in source coordinates.
pub struct FileSpoolCache {
    config: CacheConfig,
    files: Option<SpoolFiles>,
    start_position: AtomicI64,
    write_position: AtomicI64,
    read_position: AtomicI64,
    eof: AtomicBool,
    data_written: Notify,
}

impl FileSpoolCache {
    /// Creates a closed spool cache; `open` allocates the backing file.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            files: None,
            start_position: AtomicI64::new(0),
            write_position: AtomicI64::new(0),
            read_position: AtomicI64::new(0),
            eof: AtomicBool::new(false),
            data_written: Notify::new(),
        }
    }

    fn available_read(&self) -> i64 {
        self.write_position.load(Ordering::SeqCst) - self.read_position.load(Ordering::SeqCst)
    }

    fn contains(&self, file_position: i64) -> bool {
        let start = self.start_position.load(Ordering::SeqCst);
        file_position >= start && file_position <= start + self.write_position.load(Ordering::SeqCst)
    }

    /// Probes candidate spool names until one can be created exclusively.
    async fn claim_spool_file(&self) -> Result<(PathBuf, File), CacheError> {
        for index in 0..SPOOL_NAME_ATTEMPTS {
            let path = self.config.spool_dir.join(format!("filecache{index:03}.cache"));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(error) => return Err(error.into()),
            }
        }

        Err(CacheError::SpoolExhausted {
            dir: self.config.spool_dir.clone(),
            attempts: SPOOL_NAME_ATTEMPTS,
        })
    }
}

#[async_trait::async_trait]
impl CacheStrategy for FileSpoolCache {
    async fn open(&mut self) -> Result<(), CacheError> {
        self.close().await;

        let (path, writer) = self.claim_spool_file().await?;
        let reader = match File::open(&path).await {
            Ok(file) => file,
            Err(error) => {
                // Leave the strategy closed; the claimed name must not leak.
                if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                    warn!("failed to remove spool file {}: {cleanup}", path.display());
                }
                return Err(error.into());
            }
        };

        debug!("opened spool file {}", path.display());
        self.files = Some(SpoolFiles {
            path,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        });
        self.start_position.store(0, Ordering::SeqCst);
        self.write_position.store(0, Ordering::SeqCst);
        self.read_position.store(0, Ordering::SeqCst);
        self.eof.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(files) = self.files.take() {
            if let Err(error) = tokio::fs::remove_file(&files.path).await {
                warn!(
                    "failed to delete spool file {}: {error}",
                    files.path.display()
                );
            }
        }
    }

    async fn max_write_size(&self, requested: usize) -> usize {
        match self.config.spool_capacity {
            // Can always write since it's on disk
            None => requested,
            Some(capacity) => {
                let written = self.write_position.load(Ordering::SeqCst).max(0) as u64;
                requested.min(capacity.saturating_sub(written) as usize)
            }
        }
    }

    async fn write_to_cache(&self, data: &[u8]) -> Result<usize, CacheError> {
        let Some(files) = &self.files else {
            return Err(CacheError::Closed);
        };

        let limit = self.max_write_size(data.len()).await;
        if limit == 0 {
            return Ok(0);
        }

        let mut file = files.writer.lock().await;
        let mut written = 0;
        while written < limit {
            let count = file.write(&data[written..limit]).await?;
            if count == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "spool write made no progress",
                )
                .into());
            }
            written += count;
        }
        // Make the bytes visible to the independent read handle before the
        // waiter is woken.
        file.flush().await?;
        drop(file);

        self.write_position
            .fetch_add(written as i64, Ordering::SeqCst);
        self.data_written.notify_one();
        Ok(written)
    }

    async fn read_from_cache(&self, dest: &mut [u8]) -> Result<usize, CacheError> {
        let Some(files) = &self.files else {
            return Err(CacheError::Closed);
        };

        let available = self.available_read();
        if available <= 0 {
            return if self.eof.load(Ordering::SeqCst) {
                Ok(0)
            } else {
                Err(CacheError::WouldBlock)
            };
        }

        let to_read = dest.len().min(available as usize);
        let mut file = files.reader.lock().await;
        let mut done = 0;
        while done < to_read {
            let count = file.read(&mut dest[done..to_read]).await?;
            if count == 0 {
                break;
            }
            self.read_position.fetch_add(count as i64, Ordering::SeqCst);
            done += count;
        }

        Ok(done)
    }

    async fn wait_for_data(&self, minimum: usize, timeout: Duration) -> Result<u64, CacheError> {
        if timeout.is_zero() || self.eof.load(Ordering::SeqCst) {
            return Ok(self.available_read().max(0) as u64);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let available = self.available_read().max(0) as u64;
            if available >= minimum as u64 || self.eof.load(Ordering::SeqCst) {
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
        let Some(files) = &self.files else {
            return Err(CacheError::Closed);
        };

        let start = self.start_position.load(Ordering::SeqCst);
        let target = file_position - start;
        if target < 0 {
            debug!("seek to {file_position} precedes spool start {start}");
            return Err(CacheError::SeekBeforeStart {
                position: file_position,
                begin: start,
            });
        }

        let overshoot = target - self.write_position.load(Ordering::SeqCst);
        if overshoot > FAR_SEEK_LIMIT {
            debug!("seek to {file_position} is {overshoot} bytes past written data");
            return Err(CacheError::SeekOutOfRange {
                position: file_position,
            });
        }
        if overshoot > 0 {
            let needed = (target - self.read_position.load(Ordering::SeqCst)).max(0) as usize;
            if self.wait_for_data(needed, self.config.seek_wait).await.is_err() {
                debug!("seek to {file_position}: producer did not cover the gap");
                return Err(CacheError::SeekOutOfRange {
                    position: file_position,
                });
            }
        }

        let mut file = files.reader.lock().await;
        file.seek(SeekFrom::Start(target as u64)).await?;
        drop(file);
        self.read_position.store(target, Ordering::SeqCst);

        Ok(file_position)
    }

    async fn reset(&self, file_position: i64, clear_anyway: bool) -> bool {
        let Some(files) = &self.files else {
            return false;
        };

        if !clear_anyway && self.contains(file_position) {
            let target = file_position - self.start_position.load(Ordering::SeqCst);
            let mut file = files.reader.lock().await;
            match file.seek(SeekFrom::Start(target as u64)).await {
                Ok(_) => self.read_position.store(target, Ordering::SeqCst),
                Err(error) => warn!("reset failed to reposition spool read handle: {error}"),
            }
            return false;
        }

        {
            let mut file = files.writer.lock().await;
            if let Err(error) = file.seek(SeekFrom::Start(0)).await {
                warn!("reset failed to rewind spool write handle: {error}");
            }
            if let Err(error) = file.set_len(0).await {
                warn!("reset failed to truncate spool: {error}");
            }
        }
        {
            let mut file = files.reader.lock().await;
            if let Err(error) = file.seek(SeekFrom::Start(0)).await {
                warn!("reset failed to rewind spool read handle: {error}");
            }
        }

        self.start_position.store(file_position, Ordering::SeqCst);
        self.write_position.store(0, Ordering::SeqCst);
        self.read_position.store(0, Ordering::SeqCst);
        self.eof.store(false, Ordering::SeqCst);
        true
    }

    async fn end_of_input(&self) {
        self.eof.store(true, Ordering::SeqCst);
        // When the reader waits for data it will wait on this notification.
        self.data_written.notify_one();
    }

    async fn clear_end_of_input(&self) {
        self.eof.store(false, Ordering::SeqCst);
    }

    async fn is_end_of_input(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }

    async fn cached_data_begin_pos(&self) -> i64 {
        self.start_position.load(Ordering::SeqCst)
    }

    async fn cached_data_end_pos(&self) -> i64 {
        self.start_position.load(Ordering::SeqCst) + self.write_position.load(Ordering::SeqCst)
    }

    async fn cached_data_end_pos_if_seek_to(&self, file_position: i64) -> i64 {
        if self.contains(file_position) {
            self.cached_data_end_pos().await
        } else {
            file_position
        }
    }

    async fn is_cached_position(&self, file_position: i64) -> bool {
        self.contains(file_position)
    }

    fn create_new(&self) -> Box<dyn CacheStrategy> {
        Box::new(FileSpoolCache::new(self.config.clone()))
    }
}

impl Drop for FileSpoolCache {
    fn drop(&mut self) {
        // Async close could not run; remove the spool synchronously so a
        // dropped cache does not leave temporary files behind.
        if let Some(files) = self.files.take()
            && let Err(error) = std::fs::remove_file(&files.path)
        {
            warn!(
                "failed to delete spool file {}: {error}",
                files.path.display()
            );
        }
    }
}
