use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::TimeDelta;
use fieldcache::{EntityRef, FieldHandler, FieldTag};
use fieldcache_test::{
    Anime, AnimeField, CountingFetcher, DecodedImage, Picture, ReleaseCounter, anime,
};

use crate::{disk_cache, disk_cache_at, key, start};

/// Every field except the memory-only image.
const PERSISTED: &[AnimeField] = &[
    AnimeField::Title,
    AnimeField::Score,
    AnimeField::Synopsis,
    AnimeField::Episodes,
    AnimeField::Genres,
    AnimeField::Picture,
];

#[tokio::test]
async fn test_snapshot_roundtrip() {
    let cache_dir = fieldcache_test::tempdir();
    let counter = ReleaseCounter::default();

    {
        let (cache, _clock) = disk_cache(cache_dir.path(), CountingFetcher::empty()).await;
        let mut frieren = anime("Frieren");
        frieren.image = Some(DecodedImage::new(1, &counter));
        cache
            .update(&key("frieren"), &frieren, AnimeField::ALL)
            .unwrap();

        assert_eq!(cache.stats().dirty_keys, 1);
        assert_eq!(cache.flush().await.unwrap(), 1);
        assert_eq!(cache.stats().dirty_keys, 0);
    }

    let envelope = fs::read_to_string(cache_dir.path().join("ZnJpZXJlbg==.json")).unwrap();
    insta::assert_snapshot!(envelope, @r#"{"key":"frieren","entry":{"data":{"Episodes":28,"Genres":["Adventure","Fantasy"],"Picture":"file://ZnJpZXJlbg==_Picture.bin","Score":9.5,"Synopsis":"The story of Frieren.","Title":"Frieren"},"fieldExpirations":{"Episodes":"2024-01-01T01:00:00Z","Genres":"2024-01-01T01:00:00Z","Picture":"2024-01-01T01:00:00Z","Score":"2024-01-01T01:00:00Z","Synopsis":"2024-01-01T01:00:00Z","Title":"2024-01-01T01:00:00Z"},"fetchedFields":["Episodes","Genres","Picture","Score","Synopsis","Title"]}}"#);
    assert_eq!(
        fs::read(cache_dir.path().join("ZnJpZXJlbg==_Picture.bin")).unwrap(),
        b"Frieren"
    );

    let fetcher = CountingFetcher::empty();
    let now = start() + TimeDelta::minutes(10);
    let (cache, _clock) = disk_cache_at(cache_dir.path(), fetcher.clone(), now).await;

    let entity = cache
        .get_or_fetch_fields(&key("frieren"), PERSISTED, false)
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), 0);

    let restored = entity.snapshot();
    assert_eq!(restored.title.as_deref(), Some("Frieren"));
    assert_eq!(restored.score, Some(9.5));
    assert_eq!(restored.genres, Some(vec!["Adventure".into(), "Fantasy".into()]));
    assert_eq!(restored.picture, Some(Picture(b"Frieren".to_vec())));
    assert!(restored.image.is_none());

    let cached = cache.cached_entity(&key("frieren")).unwrap();
    assert_eq!(
        cached.field_expiration(AnimeField::Picture),
        Some(start() + TimeDelta::hours(1))
    );
    assert!(!cached.is_field_fetched(AnimeField::Image));
    // restored entries have nothing new to write
    assert_eq!(cache.stats().dirty_keys, 0);
}

#[tokio::test]
async fn test_expired_fields_are_not_restored() {
    let cache_dir = fieldcache_test::tempdir();
    {
        let (cache, clock) = disk_cache(cache_dir.path(), CountingFetcher::empty()).await;
        cache
            .update(&key("frieren"), &anime("Frieren"), &[AnimeField::Title])
            .unwrap();
        cache
            .update(&key("himmel"), &anime("Himmel"), &[AnimeField::Title])
            .unwrap();
        clock.advance(Duration::from_secs(30 * 60));
        cache
            .update(&key("frieren"), &anime("Frieren"), &[AnimeField::Score])
            .unwrap();
        cache.flush().await.unwrap();
    }

    let fetcher = CountingFetcher::returning(anime("Frieren"));
    let now = start() + TimeDelta::minutes(75);
    let (cache, _clock) = disk_cache_at(cache_dir.path(), fetcher.clone(), now).await;

    // himmel has no fresh fields left
    assert_eq!(cache.stats().entries, 1);
    assert!(cache.get_without_fetching(&key("himmel")).is_none());

    let cached = cache.cached_entity(&key("frieren")).unwrap();
    assert!(cached.is_field_fetched(AnimeField::Score));
    assert!(!cached.is_field_fetched(AnimeField::Title));
    assert_eq!(cached.entity().read().title, None);

    cache
        .get_or_fetch_fields(&key("frieren"), &[AnimeField::Title, AnimeField::Score], false)
        .await
        .unwrap();
    assert_eq!(fetcher.requests(), vec![vec![AnimeField::Title]]);
}

#[tokio::test]
async fn test_corrupt_snapshots_are_skipped() {
    let cache_dir = fieldcache_test::tempdir();
    {
        let (cache, _clock) = disk_cache(cache_dir.path(), CountingFetcher::empty()).await;
        cache
            .update(&key("frieren"), &anime("Frieren"), &[AnimeField::Title])
            .unwrap();
        cache.flush().await.unwrap();
    }
    fs::write(cache_dir.path().join("aGltbWVs.json"), "{not json").unwrap();
    fs::write(
        cache_dir.path().join("ZWlzZW4=.json"),
        r#"{"key":"eisen","entry":{"data":{"Episodes":"many"},"fieldExpirations":{"Episodes":"2024-01-01T01:00:00Z"},"fetchedFields":["Episodes"]}}"#,
    )
    .unwrap();

    let (cache, _clock) = disk_cache(cache_dir.path(), CountingFetcher::empty()).await;

    assert_eq!(cache.stats().entries, 1);
    let entity = cache.get_without_fetching(&key("frieren")).unwrap();
    assert_eq!(entity.read().title.as_deref(), Some("Frieren"));
}

#[tokio::test]
async fn test_negative_results_are_persisted() {
    let cache_dir = fieldcache_test::tempdir();
    {
        let (cache, _clock) = disk_cache(cache_dir.path(), CountingFetcher::empty()).await;
        cache
            .get_or_fetch_fields(&key("himmel"), &[AnimeField::Synopsis], false)
            .await
            .unwrap();
        assert_eq!(cache.flush().await.unwrap(), 1);
    }

    let fetcher = CountingFetcher::returning(anime("Himmel"));
    let (cache, _clock) = disk_cache(cache_dir.path(), fetcher.clone()).await;
    let entity = cache
        .get_or_fetch_fields(&key("himmel"), &[AnimeField::Synopsis], false)
        .await
        .unwrap();

    assert_eq!(fetcher.calls(), 0);
    assert_eq!(entity.read().synopsis, None);
}

#[tokio::test]
async fn test_failed_writes_stay_dirty() {
    let cache_dir = fieldcache_test::tempdir();
    let snapshots = cache_dir.path().join("snapshots");
    let (cache, _clock) = disk_cache(&snapshots, CountingFetcher::empty()).await;
    cache
        .update(&key("frieren"), &anime("Frieren"), &[AnimeField::Title])
        .unwrap();

    fs::remove_dir_all(&snapshots).unwrap();
    fs::write(&snapshots, "in the way").unwrap();

    assert!(cache.flush().await.is_err());
    assert_eq!(cache.stats().dirty_keys, 1);

    fs::remove_file(&snapshots).unwrap();
    fs::create_dir(&snapshots).unwrap();

    assert_eq!(cache.flush().await.unwrap(), 1);
    assert_eq!(cache.stats().dirty_keys, 0);
    assert!(snapshots.join("ZnJpZXJlbg==.json").is_file());
}

#[tokio::test]
async fn test_clear_all() {
    let cache_dir = fieldcache_test::tempdir();
    let (cache, _clock) = disk_cache(cache_dir.path(), CountingFetcher::empty()).await;
    cache
        .update(&key("frieren"), &anime("Frieren"), PERSISTED)
        .unwrap();
    cache.flush().await.unwrap();
    assert!(fs::read_dir(cache_dir.path()).unwrap().count() > 0);

    cache.clear_all().await.unwrap();

    assert_eq!(cache.stats().entries, 0);
    assert!(cache_dir.path().is_dir());
    assert_eq!(fs::read_dir(cache_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_periodic_sync() {
    let cache_dir = fieldcache_test::tempdir();
    let options = fieldcache::CacheOptions {
        disk_sync_interval: Duration::from_millis(20),
        ..fieldcache_test::options(cache_dir.path())
    };
    let (cache, _clock) = crate::cache_with(options, CountingFetcher::empty());
    cache.ready().await;
    cache
        .update(&key("frieren"), &anime("Frieren"), &[AnimeField::Title])
        .unwrap();

    let envelope = cache_dir.path().join("ZnJpZXJlbg==.json");
    for _ in 0..250 {
        if envelope.is_file() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(envelope.is_file());
    assert_eq!(cache.stats().dirty_keys, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disk_load_does_not_overwrite_updates() {
    let cache_dir = fieldcache_test::tempdir();
    {
        let earlier = start() - TimeDelta::minutes(30);
        let (cache, _clock) =
            disk_cache_at(cache_dir.path(), CountingFetcher::empty(), earlier).await;
        let old = Anime {
            title: Some("Old".into()),
            ..Anime::default()
        };
        cache
            .update(&key("frieren"), &old, &[AnimeField::Title])
            .unwrap();
        cache.flush().await.unwrap();
    }
    // unreadable snapshots keep the load busy while the update runs
    for i in 0..1000 {
        fs::write(cache_dir.path().join(format!("junk{i}.json")), "{not json").unwrap();
    }

    let (cache, _clock) = crate::cache_with(
        fieldcache_test::options(cache_dir.path()),
        CountingFetcher::empty(),
    );
    let first_call = Arc::new(AtomicBool::new(true));
    let handler: FieldHandler<String, Anime> = {
        let first_call = Arc::clone(&first_call);
        Arc::new(move |_: &String, _: &EntityRef<Anime>| {
            if first_call.swap(false, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
        })
    };
    cache.subscribe_to_field_change(&key("frieren"), &handler, &[AnimeField::Title]);

    let new = Anime {
        title: Some("New".into()),
        ..Anime::default()
    };
    cache
        .update(&key("frieren"), &new, &[AnimeField::Title])
        .unwrap();
    cache.ready().await;

    let cached = cache.cached_entity(&key("frieren")).unwrap();
    assert_eq!(cached.entity().read().title.as_deref(), Some("New"));
    assert_eq!(
        cached.field_expiration(AnimeField::Title),
        Some(start() + TimeDelta::hours(1))
    );
}
