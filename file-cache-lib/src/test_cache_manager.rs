use crate::config::{CacheConfig, MIB};
use crate::manager::CacheManager;
use crate::read_log::MemorySink;
use crate::CacheError;
use remote_store_lib::{MemRemoteStore, ObjectAttributes};
use std::sync::Arc;
use std::sync::Once;
use tempfile::TempDir;

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Debug)
            .try_init();
    });
}

fn test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn attrs(size: u64, generation: u64) -> ObjectAttributes {
    ObjectAttributes {
        size,
        generation,
        mtime: 0,
        content_type: None,
    }
}

async fn create_mgr<F>(
    tweak: F,
) -> (
    TempDir,
    Arc<CacheManager>,
    Arc<MemRemoteStore>,
    Arc<MemorySink>,
)
where
    F: FnOnce(&mut CacheConfig),
{
    init_logging();
    let dir = TempDir::new().unwrap();
    let mut config = CacheConfig::new(dir.path().join("cache"));
    config.file_cache.download_chunk_size_mb = 1;
    tweak(&mut config);
    let store = Arc::new(MemRemoteStore::new());
    let sink = Arc::new(MemorySink::new());
    let mgr = CacheManager::new(config, store.clone(), sink.clone())
        .await
        .unwrap();
    (dir, mgr, store, sink)
}

#[tokio::test]
async fn test_range_read_policy_off_then_sequential() {
    let (_dir, mgr, store, sink) = create_mgr(|_| {}).await;
    let data = test_data(2 * MIB as usize);
    let generation = store.put_object("b", "f", data.clone());
    let a = attrs(2 * MIB, generation);

    let handle = mgr.open();

    // First read on a fresh handle is random; with the range-read policy
    // off it bypasses the cache entirely.
    let r1 = mgr.read(handle, "b", "f", &a, 0, MIB).await.unwrap();
    assert!(!r1.is_sequential);
    assert!(!r1.cache_hit);
    assert_eq!(r1.data, data[..MIB as usize]);
    assert_eq!(store.fetch_count(), 1);
    assert_eq!(mgr.cached_byte_count("b", "f"), 0);
    assert_eq!(mgr.job_count().await, 0);

    // The follow-up read is sequential and triggers a full download.
    let r2 = mgr.read(handle, "b", "f", &a, MIB, MIB).await.unwrap();
    assert!(r2.is_sequential);
    assert!(!r2.cache_hit);
    assert_eq!(r2.data, data[MIB as usize..]);
    assert_eq!(mgr.cached_byte_count("b", "f"), 2 * MIB);
    // One direct fetch plus two 1 MiB chunks.
    assert_eq!(store.fetch_count(), 3);

    // Everything is on disk now, so even a random re-read is a hit.
    let r3 = mgr.read(handle, "b", "f", &a, 0, 2 * MIB).await.unwrap();
    assert!(!r3.is_sequential);
    assert!(r3.cache_hit);
    assert_eq!(r3.data, data);
    assert_eq!(store.fetch_count(), 3);

    // Reads past the end come back empty without touching the store.
    let r4 = mgr.read(handle, "b", "f", &a, 2 * MIB, MIB).await.unwrap();
    assert!(r4.data.is_empty());
    assert_eq!(store.fetch_count(), 3);

    let records = sink.records();
    assert_eq!(records.len(), 4);
    assert!(!records[0].is_sequential && !records[0].cache_hit);
    assert!(records[1].is_sequential && !records[1].cache_hit);
    assert!(!records[2].is_sequential && records[2].cache_hit);
    assert_eq!(records[1].offset, MIB);
    assert_eq!(records[1].length, MIB);

    mgr.close(handle).await;
}

#[tokio::test]
async fn test_lru_eviction_under_byte_budget() {
    let (_dir, mgr, store, _sink) = create_mgr(|config| {
        config.file_cache.max_size_mb = 2;
        config.file_cache.cache_file_for_range_read = true;
    })
    .await;
    let data1 = test_data(2 * MIB as usize);
    let data2 = test_data(2 * MIB as usize);
    let gen1 = store.put_object("b", "f1", data1.clone());
    let gen2 = store.put_object("b", "f2", data2.clone());

    let h1 = mgr.open();
    let r = mgr
        .read(h1, "b", "f1", &attrs(2 * MIB, gen1), 0, 2 * MIB)
        .await
        .unwrap();
    assert_eq!(r.data, data1);
    assert_eq!(mgr.cached_byte_count("b", "f1"), 2 * MIB);
    mgr.close(h1).await;

    // Caching the second file pushes the total past the budget; the first,
    // now unpinned and least recently used, is evicted.
    let h2 = mgr.open();
    let r = mgr
        .read(h2, "b", "f2", &attrs(2 * MIB, gen2), 0, 2 * MIB)
        .await
        .unwrap();
    assert_eq!(r.data, data2);
    assert_eq!(mgr.cached_byte_count("b", "f1"), 0);
    assert_eq!(mgr.cached_byte_count("b", "f2"), 2 * MIB);
    assert!(mgr.total_cached_bytes() <= 2 * MIB);

    // A hit on the survivor, a fresh download for the evictee.
    let fetches = store.fetch_count();
    let r = mgr
        .read(h2, "b", "f2", &attrs(2 * MIB, gen2), 0, MIB)
        .await
        .unwrap();
    assert!(r.cache_hit);
    assert_eq!(store.fetch_count(), fetches);

    let h3 = mgr.open();
    let r = mgr
        .read(h3, "b", "f1", &attrs(2 * MIB, gen1), 0, MIB)
        .await
        .unwrap();
    assert!(!r.cache_hit);
    assert_eq!(r.data, data1[..MIB as usize]);
    assert!(store.fetch_count() > fetches);

    mgr.close(h2).await;
    mgr.close(h3).await;
}

#[tokio::test]
async fn test_pinned_entries_skip_eviction_until_close() {
    let (_dir, mgr, store, _sink) = create_mgr(|config| {
        config.file_cache.max_size_mb = 1;
        config.file_cache.cache_file_for_range_read = true;
    })
    .await;
    let gen1 = store.put_object("b", "f1", test_data(MIB as usize));
    let gen2 = store.put_object("b", "f2", test_data(MIB as usize));

    // Both entries stay pinned by their handles, so the cache runs over
    // budget rather than evict bytes someone is reading.
    let h1 = mgr.open();
    mgr.read(h1, "b", "f1", &attrs(MIB, gen1), 0, MIB)
        .await
        .unwrap();
    let h2 = mgr.open();
    mgr.read(h2, "b", "f2", &attrs(MIB, gen2), 0, MIB)
        .await
        .unwrap();
    assert_eq!(mgr.cached_byte_count("b", "f1"), MIB);
    assert_eq!(mgr.cached_byte_count("b", "f2"), MIB);
    assert_eq!(mgr.total_cached_bytes(), 2 * MIB);

    // Closing the first handle unpins its entry; the deferred eviction
    // fires and brings the total back under budget.
    mgr.close(h1).await;
    assert_eq!(mgr.cached_byte_count("b", "f1"), 0);
    assert_eq!(mgr.cached_byte_count("b", "f2"), MIB);
    assert!(mgr.total_cached_bytes() <= MIB);
    mgr.close(h2).await;
}

#[tokio::test]
async fn test_new_generation_invalidates_cached_content() {
    let (_dir, mgr, store, _sink) = create_mgr(|config| {
        config.file_cache.cache_file_for_range_read = true;
    })
    .await;
    let old_data = test_data(MIB as usize);
    let gen1 = store.put_object("b", "f", old_data.clone());

    let h1 = mgr.open();
    let r = mgr
        .read(h1, "b", "f", &attrs(MIB, gen1), 0, MIB)
        .await
        .unwrap();
    assert_eq!(r.data, old_data);
    mgr.close(h1).await;

    // Overwrite bumps the generation; the cached copy is dead on arrival.
    let mut new_data = test_data(MIB as usize);
    new_data.reverse();
    let gen2 = store.put_object("b", "f", new_data.clone());
    assert_eq!(gen2, gen1 + 1);

    let h2 = mgr.open();
    let r = mgr
        .read(h2, "b", "f", &attrs(MIB, gen2), 0, MIB)
        .await
        .unwrap();
    assert!(!r.cache_hit);
    assert_eq!(r.data, new_data);
    assert_eq!(mgr.total_cached_bytes(), MIB);

    // A straggler still asking for the old generation is told it is stale.
    let h3 = mgr.open();
    let err = mgr
        .read(h3, "b", "f", &attrs(MIB, gen1), 0, MIB)
        .await
        .unwrap_err();
    assert!(err.is_stale());

    mgr.close(h2).await;
    mgr.close(h3).await;
}

#[tokio::test]
async fn test_checksum_mismatch_discards_and_redownloads() {
    let (_dir, mgr, store, _sink) = create_mgr(|config| {
        config.file_cache.cache_file_for_range_read = true;
        config.file_cache.enable_crc = true;
    })
    .await;
    let data = test_data(MIB as usize);
    let generation = store.put_object("b", "f", data.clone());
    let a = attrs(MIB, generation);

    store.set_corrupt_digests(true);
    let handle = mgr.open();
    let err = mgr.read(handle, "b", "f", &a, 0, MIB).await.unwrap_err();
    assert!(matches!(err, CacheError::ChecksumMismatch(_)));
    assert_eq!(mgr.cached_byte_count("b", "f"), 0);
    assert_eq!(mgr.total_cached_bytes(), 0);

    // Once the store behaves, the same handle reads clean bytes again.
    store.set_corrupt_digests(false);
    let before = store.fetch_count();
    let r = mgr.read(handle, "b", "f", &a, MIB / 2, MIB / 2).await.unwrap();
    assert_eq!(r.data, data[MIB as usize / 2..]);
    assert!(store.fetch_count() > before);

    mgr.close(handle).await;
}

#[tokio::test]
async fn test_zero_budget_disables_content_cache() {
    let (_dir, mgr, store, sink) = create_mgr(|config| {
        config.file_cache.max_size_mb = 0;
        config.file_cache.cache_file_for_range_read = true;
    })
    .await;
    let data = test_data(MIB as usize);
    let generation = store.put_object("b", "f", data.clone());
    let a = attrs(MIB, generation);

    let handle = mgr.open();
    for _ in 0..2 {
        let r = mgr.read(handle, "b", "f", &a, 0, MIB).await.unwrap();
        assert!(!r.cache_hit);
        assert_eq!(r.data, data);
    }
    assert_eq!(store.fetch_count(), 2);
    assert_eq!(mgr.total_cached_bytes(), 0);
    assert_eq!(mgr.job_count().await, 0);
    assert_eq!(sink.records().len(), 2);
    mgr.close(handle).await;
}

#[tokio::test]
async fn test_parallel_downloads_complete_whole_object() {
    let (_dir, mgr, store, _sink) = create_mgr(|config| {
        config.file_cache.cache_file_for_range_read = true;
        config.file_cache.enable_parallel_downloads = true;
        config.file_cache.parallel_downloads_per_file = 4;
    })
    .await;
    let data = test_data(5 * MIB as usize);
    let generation = store.put_object("b", "big", data.clone());
    let a = attrs(5 * MIB, generation);

    let handle = mgr.open();
    let r = mgr.read(handle, "b", "big", &a, 0, 5 * MIB).await.unwrap();
    assert_eq!(r.data, data);
    assert_eq!(mgr.cached_byte_count("b", "big"), 5 * MIB);

    // Every byte landed at its right offset despite out-of-order commits.
    let r = mgr
        .read(handle, "b", "big", &a, 3 * MIB + 17, 1000)
        .await
        .unwrap();
    assert!(r.cache_hit);
    assert_eq!(
        r.data,
        data[(3 * MIB + 17) as usize..(3 * MIB + 17 + 1000) as usize]
    );
    mgr.close(handle).await;
}

#[tokio::test]
async fn test_concurrent_readers_share_one_download() {
    let (_dir, mgr, store, _sink) = create_mgr(|config| {
        config.file_cache.cache_file_for_range_read = true;
    })
    .await;
    let data = test_data(4 * MIB as usize);
    let generation = store.put_object("b", "f", data.clone());
    let a = attrs(4 * MIB, generation);

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let mgr = mgr.clone();
        let a = a.clone();
        tasks.push(tokio::spawn(async move {
            let handle = mgr.open();
            let r = mgr.read(handle, "b", "f", &a, 0, 4 * MIB).await.unwrap();
            mgr.close(handle).await;
            r.data
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), data);
    }

    // The object is four chunks and each was fetched once no matter how
    // many readers were waiting on the same job.
    assert_eq!(store.fetch_count(), 4);
    assert_eq!(mgr.job_count().await, 0);
    assert_eq!(mgr.cached_byte_count("b", "f"), 4 * MIB);
}

#[tokio::test]
async fn test_concurrent_two_file_reads_settle_under_budget() {
    let (_dir, mgr, store, _sink) = create_mgr(|config| {
        config.file_cache.max_size_mb = 2;
        config.file_cache.cache_file_for_range_read = true;
    })
    .await;
    let data1 = test_data(2 * MIB as usize);
    let mut data2 = test_data(2 * MIB as usize);
    data2.reverse();
    let gen1 = store.put_object("b", "f1", data1.clone());
    let gen2 = store.put_object("b", "f2", data2.clone());

    let spawn_reader = |name: &'static str, generation, expected: Vec<u8>| {
        let mgr = mgr.clone();
        tokio::spawn(async move {
            let handle = mgr.open();
            let r = mgr
                .read(handle, "b", name, &attrs(2 * MIB, generation), 0, 2 * MIB)
                .await
                .unwrap();
            mgr.close(handle).await;
            assert_eq!(r.data, expected);
        })
    };
    let t1 = spawn_reader("f1", gen1, data1.clone());
    let t2 = spawn_reader("f2", gen2, data2.clone());
    t1.await.unwrap();
    t2.await.unwrap();

    // Both handles are closed, so deferred eviction has settled the total
    // back to the budget: exactly one file survives, intact.
    assert_eq!(mgr.total_cached_bytes(), 2 * MIB);
    let cached1 = mgr.cached_byte_count("b", "f1");
    let cached2 = mgr.cached_byte_count("b", "f2");
    assert_eq!(cached1 + cached2, 2 * MIB);
    assert!(cached1 == 0 || cached2 == 0);

    let (survivor, generation, expected) = if cached1 == 2 * MIB {
        ("f1", gen1, data1)
    } else {
        ("f2", gen2, data2)
    };
    let fetches = store.fetch_count();
    let handle = mgr.open();
    let r = mgr
        .read(handle, "b", survivor, &attrs(2 * MIB, generation), 0, 2 * MIB)
        .await
        .unwrap();
    assert!(r.cache_hit);
    assert_eq!(r.data, expected);
    assert_eq!(store.fetch_count(), fetches);
    mgr.close(handle).await;
}

#[tokio::test]
async fn test_chunked_reads_log_one_record_each() {
    let (_dir, mgr, store, sink) = create_mgr(|config| {
        config.file_cache.cache_file_for_range_read = true;
    })
    .await;
    let chunks = 3u64;
    let data = test_data((chunks * MIB) as usize);
    let generation = store.put_object("b", "f", data.clone());
    let a = attrs(chunks * MIB, generation);

    // First pass against an empty cache: chunk-sized reads, one record per
    // read, the first of them a non-sequential miss.
    let handle = mgr.open();
    for i in 0..chunks {
        let r = mgr.read(handle, "b", "f", &a, i * MIB, MIB).await.unwrap();
        assert_eq!(r.data, data[(i * MIB) as usize..((i + 1) * MIB) as usize]);
    }
    let records = sink.records();
    assert_eq!(records.len(), chunks as usize);
    assert!(!records[0].is_sequential && !records[0].cache_hit);

    // Second pass over fully cached content: all hits, and everything
    // after the rewinding first read is sequential.
    for i in 0..chunks {
        mgr.read(handle, "b", "f", &a, i * MIB, MIB).await.unwrap();
    }
    let records = sink.records();
    assert_eq!(records.len(), 2 * chunks as usize);
    for record in &records[chunks as usize..] {
        assert!(record.cache_hit);
    }
    assert!(records.last().unwrap().is_sequential);
    mgr.close(handle).await;
}

#[tokio::test]
async fn test_invalidate_drops_content_and_metadata() {
    let (_dir, mgr, store, _sink) = create_mgr(|config| {
        config.file_cache.cache_file_for_range_read = true;
    })
    .await;
    let data = test_data(MIB as usize);
    let generation = store.put_object("b", "f", data.clone());
    let a = attrs(MIB, generation);

    mgr.stat("b", "f").await.unwrap();
    let handle = mgr.open();
    mgr.read(handle, "b", "f", &a, 0, MIB).await.unwrap();
    mgr.close(handle).await;
    assert_eq!(mgr.cached_byte_count("b", "f"), MIB);
    assert!(mgr.metadata().get_stat("b", "f").is_some());

    mgr.invalidate("b", "f").await;
    assert_eq!(mgr.cached_byte_count("b", "f"), 0);
    assert_eq!(mgr.total_cached_bytes(), 0);
    assert!(mgr.metadata().get_stat("b", "f").is_none());

    // The next read repopulates from the store.
    let before = store.fetch_count();
    let handle = mgr.open();
    let r = mgr.read(handle, "b", "f", &a, 0, MIB).await.unwrap();
    assert!(!r.cache_hit);
    assert_eq!(r.data, data);
    assert!(store.fetch_count() > before);
    mgr.close(handle).await;
}

#[tokio::test]
async fn test_stat_uses_metadata_cache() {
    let (_dir, mgr, store, _sink) = create_mgr(|_| {}).await;
    let gen1 = store.put_object("b", "f", test_data(100));

    let first = mgr.stat("b", "f").await.unwrap();
    assert_eq!(first.generation, gen1);

    // Within the TTL the overwrite stays invisible.
    let gen2 = store.put_object("b", "f", test_data(200));
    let second = mgr.stat("b", "f").await.unwrap();
    assert_eq!(second.generation, gen1);
    assert_eq!(second.size, 100);

    // Until the cached attributes are erased.
    mgr.metadata().erase("b", "f");
    let third = mgr.stat("b", "f").await.unwrap();
    assert_eq!(third.generation, gen2);
    assert_eq!(third.size, 200);
}

#[tokio::test]
async fn test_stat_with_ttl_zero_always_goes_remote() {
    let (_dir, mgr, store, _sink) = create_mgr(|config| {
        config.metadata_cache.ttl_secs = 0;
    })
    .await;
    let gen1 = store.put_object("b", "f", test_data(100));
    assert_eq!(mgr.stat("b", "f").await.unwrap().generation, gen1);

    let gen2 = store.put_object("b", "f", test_data(100));
    assert_eq!(mgr.stat("b", "f").await.unwrap().generation, gen2);
}

#[tokio::test]
async fn test_stat_missing_object_caches_negative_type() {
    let (_dir, mgr, _store, _sink) = create_mgr(|_| {}).await;
    let err = mgr.stat("b", "nope").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(
        mgr.metadata().get_type("b", "nope"),
        Some(crate::metadata_cache::DirentType::NonExistent)
    );
}
