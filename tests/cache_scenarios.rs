//! End-to-end cache scenarios.
//!
//! Drives each strategy the way the playback stack does: a producer task
//! pulling from a source and pushing into the cache, a consumer task
//! draining it, with seeks and resets thrown in between.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backwash::{CacheConfig, CacheError, CacheStrategy, CircularCache, DoubleCache, FileSpoolCache};

/// Deterministic test payload: a byte pattern that exposes ordering and
/// offset mistakes.
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Runs the producer pull loop from the playback stack against `cache`.
async fn produce(cache: Arc<dyn CacheStrategy>, data: Vec<u8>) {
    let mut offset = 0;
    while offset < data.len() {
        let chunk = (data.len() - offset).min(4096);
        let room = cache.max_write_size(chunk).await;
        if room == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            continue;
        }
        let written = cache
            .write_to_cache(&data[offset..offset + room.min(chunk)])
            .await
            .expect("producer write failed");
        offset += written;
    }
    cache.end_of_input().await;
}

/// Drains `cache` to end of input, collecting every byte in order.
async fn consume(cache: Arc<dyn CacheStrategy>) -> Vec<u8> {
    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match cache.read_from_cache(&mut chunk).await {
            Ok(0) => break,
            Ok(count) => received.extend_from_slice(&chunk[..count]),
            Err(CacheError::WouldBlock) => {
                let _ = cache.wait_for_data(1, Duration::from_millis(50)).await;
            }
            Err(error) => panic!("consumer read failed: {error}"),
        }
    }
    received
}

async fn stream_through(cache: Box<dyn CacheStrategy>, len: usize) {
    let _ = tracing_subscriber::fmt::try_init();

    let mut cache = cache;
    cache.open().await.expect("open failed");
    let cache: Arc<dyn CacheStrategy> = Arc::from(cache);

    let data = payload(len);
    let producer = tokio::spawn(produce(Arc::clone(&cache), data.clone()));
    let consumer = tokio::spawn(consume(Arc::clone(&cache)));

    producer.await.unwrap();
    let received = consumer.await.unwrap();
    assert_eq!(received.len(), data.len());
    assert_eq!(received, data);
}

fn spool_config(dir: &tempfile::TempDir) -> CacheConfig {
    CacheConfig {
        spool_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_stream_through_file_spool() {
    let dir = tempfile::tempdir().unwrap();
    stream_through(Box::new(FileSpoolCache::new(spool_config(&dir))), 256 * 1024).await;
}

#[tokio::test]
async fn test_stream_through_circular_cache() {
    let config = CacheConfig {
        front_size: 16 * 1024,
        back_size: 16 * 1024,
        ..Default::default()
    };
    stream_through(Box::new(CircularCache::new(config)), 256 * 1024).await;
}

#[tokio::test]
async fn test_stream_through_double_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        spool_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let primary = Box::new(FileSpoolCache::new(config.clone()));
    stream_through(Box::new(DoubleCache::new(primary, config)), 256 * 1024).await;
}

/// A consumer that seeks back into recently-played material must be served
/// from cache, with the producer already gone.
#[tokio::test]
async fn test_rewind_is_served_without_producer() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = CacheConfig {
        front_size: 16 * 1024,
        back_size: 16 * 1024,
        ..Default::default()
    };
    let mut cache = CircularCache::new(config);
    cache.open().await.unwrap();
    let cache: Arc<dyn CacheStrategy> = Arc::new(cache);

    let data = payload(64 * 1024);
    let producer = tokio::spawn(produce(Arc::clone(&cache), data.clone()));
    let received = consume(Arc::clone(&cache)).await;
    producer.await.unwrap();
    assert_eq!(received, data);

    // Rewind one full back buffer from the end of the stream.
    let rewind_to = data.len() as i64 - 16 * 1024;
    assert_eq!(cache.seek(rewind_to).await.unwrap(), rewind_to);

    let mut replay = vec![0u8; 16 * 1024];
    let mut done = 0;
    while done < replay.len() {
        let count = cache.read_from_cache(&mut replay[done..]).await.unwrap();
        assert!(count > 0, "rewind starved at {done}");
        done += count;
    }
    assert_eq!(replay, data[data.len() - 16 * 1024..]);
}

/// A seek slightly past the written data succeeds once the producer
/// resumes within the wait budget.
#[tokio::test]
async fn test_short_forward_seek_waits_for_resumed_producer() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        spool_dir: dir.path().to_path_buf(),
        seek_wait: Duration::from_millis(500),
        ..Default::default()
    };
    let mut cache = FileSpoolCache::new(config);
    cache.open().await.unwrap();
    let cache = Arc::new(cache);

    // Writer paused after 100 bytes.
    cache.write_to_cache(&payload(100)).await.unwrap();

    let producer = Arc::clone(&cache);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        producer.write_to_cache(&payload(60_000)).await.unwrap();
    });

    assert_eq!(cache.seek(50_000).await.unwrap(), 50_000);
}

/// The same seek fails after the wait budget when the producer never
/// catches up.
#[tokio::test]
async fn test_short_forward_seek_times_out_with_paused_producer() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        spool_dir: dir.path().to_path_buf(),
        seek_wait: Duration::from_millis(200),
        ..Default::default()
    };
    let mut cache = FileSpoolCache::new(config);
    cache.open().await.unwrap();

    cache.write_to_cache(&payload(100)).await.unwrap();

    let started = Instant::now();
    assert!(matches!(
        cache.seek(50_000).await,
        Err(CacheError::SeekOutOfRange { .. })
    ));
    assert!(started.elapsed() >= Duration::from_millis(200));

    cache.close().await;
}

/// Streams through a bounded double cache whose peers fill up, age out and
/// get re-anchored, without losing or reordering a byte.
///
/// Producer and consumer run in lockstep here: a peer that has never been
/// read counts as stale, so a free-running producer could re-anchor it
/// before a lagging consumer drains it. Playback consumers follow the
/// producer closely; the lockstep loop models that.
#[tokio::test]
async fn test_double_cache_survives_peer_cycling() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        spool_dir: dir.path().to_path_buf(),
        spool_capacity: Some(16),
        peer_max_age: Duration::from_millis(50),
        ..Default::default()
    };
    let primary = Box::new(FileSpoolCache::new(config.clone()));
    let mut cache = DoubleCache::new(primary, config);
    cache.open().await.unwrap();

    let data = payload(48);
    let mut received = Vec::new();
    let mut offset = 0;
    let mut chunk = [0u8; 64];
    while received.len() < data.len() {
        let mut progressed = false;
        if offset < data.len() {
            let written = cache.write_to_cache(&data[offset..]).await.unwrap();
            offset += written;
            progressed |= written > 0;
            if offset == data.len() {
                cache.end_of_input().await;
            }
        }
        loop {
            match cache.read_from_cache(&mut chunk).await {
                Ok(0) => break,
                Ok(count) => {
                    received.extend_from_slice(&chunk[..count]);
                    progressed = true;
                }
                Err(CacheError::WouldBlock) => break,
                Err(error) => panic!("read failed: {error}"),
            }
        }
        if !progressed {
            // Both peers full and fresh: wait for the write cache's peer
            // to age out so the next write can re-anchor it.
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
    }

    assert_eq!(received, data);
    cache.close().await;
}

/// A playback jump away from played material and back again is served
/// from memory: the pre-jump window survives the whole post-jump stream.
#[tokio::test]
async fn test_dual_window_recall_after_stream_jump() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = CacheConfig {
        front_size: 8,
        back_size: 8,
        ..Default::default()
    };
    let mut cache = CircularCache::new(config);
    cache.open().await.unwrap();

    // Play the opening of the stream.
    let opening: Vec<u8> = (0x00u8..0x10).collect();
    let mut written = 0;
    while written < opening.len() {
        let count = cache.write_to_cache(&opening[written..]).await.unwrap();
        assert!(count > 0, "writer stalled after {written} bytes");
        written += count;
    }
    let mut played = vec![0u8; 16];
    let mut done = 0;
    while done < played.len() {
        done += cache.read_from_cache(&mut played[done..]).await.unwrap();
    }
    assert_eq!(played, opening);

    // Jump far ahead and play sixteen more bytes there.
    assert!(cache.reset(100, true).await);
    let jumped: Vec<u8> = (0x80u8..0x90).collect();
    let mut written = 0;
    while written < jumped.len() {
        let count = cache.write_to_cache(&jumped[written..]).await.unwrap();
        assert!(count > 0, "writer stalled after {written} bytes");
        written += count;
    }
    let mut done = 0;
    while done < played.len() {
        done += cache.read_from_cache(&mut played[done..]).await.unwrap();
    }
    assert_eq!(played, jumped);

    // Jump back into the opening: still resident, no producer involved.
    assert_eq!(cache.seek(8).await.unwrap(), 8);
    let mut replay = [0u8; 4];
    assert_eq!(cache.read_from_cache(&mut replay).await.unwrap(), 4);
    assert_eq!(&replay, &opening[8..12]);

    cache.close().await;
}

/// Reset back into the cached window repositions without discarding;
/// reset elsewhere discards and re-anchors. Holds for every strategy.
#[tokio::test]
async fn test_reset_contract_across_strategies() {
    let dir = tempfile::tempdir().unwrap();
    let config = spool_config(&dir);

    let spool = Box::new(FileSpoolCache::new(config.clone())) as Box<dyn CacheStrategy>;
    let ring = Box::new(CircularCache::new(config.clone())) as Box<dyn CacheStrategy>;
    let pair = Box::new(DoubleCache::new(
        Box::new(FileSpoolCache::new(config.clone())),
        config,
    )) as Box<dyn CacheStrategy>;

    for mut cache in [spool, ring, pair] {
        cache.open().await.unwrap();

        cache.write_to_cache(b"ABCDEFGH").await.unwrap();
        let mut dest = [0u8; 4];
        cache.read_from_cache(&mut dest).await.unwrap();

        // Cached position: cursor moves, contents stay.
        assert!(!cache.reset(2, false).await);
        cache.read_from_cache(&mut dest).await.unwrap();
        assert_eq!(&dest, b"CDEF");

        // Uncached position: state is discarded and re-anchored.
        assert!(cache.reset(1_000_000, true).await);
        assert_eq!(cache.cached_data_begin_pos().await, 1_000_000);

        cache.close().await;
    }
}
