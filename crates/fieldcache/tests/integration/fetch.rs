use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fieldcache::{CacheError, CacheOptions, FieldCache};
use fieldcache_test::{Anime, AnimeField, CountingFetcher, DecodedImage, ReleaseCounter, anime};
use tokio::sync::Barrier;

use crate::{cache_with, key, memory_cache};

#[tokio::test]
async fn test_fetches_only_missing_fields() {
    let fetcher = CountingFetcher::returning(anime("Frieren"));
    let (cache, _clock) = memory_cache(fetcher.clone());

    let entity = cache
        .get_or_fetch_fields(&key("frieren"), &[AnimeField::Title, AnimeField::Score], false)
        .await
        .unwrap();
    assert_eq!(entity.read().title.as_deref(), Some("Frieren"));
    assert_eq!(entity.read().score, Some(9.5));
    // not requested, so not merged
    assert_eq!(entity.read().synopsis, None);

    let again = cache
        .get_or_fetch_fields(
            &key("frieren"),
            &[AnimeField::Score, AnimeField::Synopsis, AnimeField::Title],
            false,
        )
        .await
        .unwrap();
    assert!(again.ptr_eq(&entity));
    assert_eq!(entity.read().synopsis.as_deref(), Some("The story of Frieren."));

    assert_eq!(
        fetcher.requests(),
        vec![
            vec![AnimeField::Title, AnimeField::Score],
            vec![AnimeField::Synopsis],
        ]
    );
}

#[tokio::test]
async fn test_duplicate_requested_fields() {
    let fetcher = CountingFetcher::returning(anime("Frieren"));
    let (cache, _clock) = memory_cache(fetcher.clone());

    cache
        .get_or_fetch_fields(
            &key("frieren"),
            &[AnimeField::Title, AnimeField::Title, AnimeField::Episodes],
            true,
        )
        .await
        .unwrap();

    assert_eq!(
        fetcher.requests(),
        vec![vec![AnimeField::Title, AnimeField::Episodes]]
    );
}

#[tokio::test]
async fn test_ttl_and_force_fetch() {
    let fetcher = CountingFetcher::returning(anime("Frieren"));
    let (cache, clock) = memory_cache(fetcher.clone());
    let fields = [AnimeField::Title];

    cache.get_or_fetch_fields(&key("frieren"), &fields, false).await.unwrap();
    assert_eq!(fetcher.calls(), 1);

    clock.advance(Duration::from_secs(59 * 60));
    cache.get_or_fetch_fields(&key("frieren"), &fields, false).await.unwrap();
    assert_eq!(fetcher.calls(), 1);

    // forcing refreshes the field and restarts its TTL
    cache.get_or_fetch_fields(&key("frieren"), &fields, true).await.unwrap();
    assert_eq!(fetcher.calls(), 2);

    clock.advance(Duration::from_secs(2 * 60));
    cache.get_or_fetch_fields(&key("frieren"), &fields, false).await.unwrap();
    assert_eq!(fetcher.calls(), 2);

    clock.advance(Duration::from_secs(60 * 60));
    let cached = cache.cached_entity(&key("frieren")).unwrap();
    assert!(cached.is_field_expired(AnimeField::Title));
    assert!(cached.is_field_fetched(AnimeField::Title));

    cache.get_or_fetch_fields(&key("frieren"), &fields, false).await.unwrap();
    assert_eq!(fetcher.calls(), 3);
    assert!(!cached.is_field_expired(AnimeField::Title));
}

#[tokio::test]
async fn test_negative_results_are_cached() {
    let fetcher = CountingFetcher::empty();
    let (cache, clock) = memory_cache(fetcher.clone());
    let fields = [AnimeField::Synopsis, AnimeField::Picture];

    let entity = cache
        .get_or_fetch_fields(&key("unknown"), &fields, false)
        .await
        .unwrap();
    assert_eq!(entity.read().synopsis, None);

    cache.get_or_fetch_fields(&key("unknown"), &fields, false).await.unwrap();
    assert_eq!(fetcher.calls(), 1);

    let cached = cache.cached_entity(&key("unknown")).unwrap();
    assert!(cached.is_field_fetched(AnimeField::Synopsis));
    assert!(cached.is_field_fetched(AnimeField::Picture));
    assert!(!cached.is_field_fetched(AnimeField::Title));

    clock.advance(Duration::from_secs(2 * 60 * 60));
    cache.get_or_fetch_fields(&key("unknown"), &fields, false).await.unwrap();
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_fetch_errors_are_not_cached() {
    fieldcache_test::setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let failing = FieldCache::<String, Anime>::new(fieldcache_test::memory_options(), {
        let calls = Arc::clone(&calls);
        move |_key: String, _fields: Vec<AnimeField>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<Option<Anime>, _>(anyhow::anyhow!("provider is down")) }
        }
    });

    let err = failing
        .get_or_fetch_fields(&key("frieren"), &[AnimeField::Title], false)
        .await
        .unwrap_err();
    assert!(matches!(&err, CacheError::Fetch(source) if source.to_string() == "provider is down"));

    let cached = failing.cached_entity(&key("frieren")).unwrap();
    assert!(!cached.is_field_fetched(AnimeField::Title));
    assert_eq!(failing.stats().dirty_keys, 0);

    // the next request tries again
    let result = failing
        .get_or_fetch_fields(&key("frieren"), &[AnimeField::Title], false)
        .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_fetches_overlap_by_default() {
    let barrier = Arc::new(Barrier::new(2));
    let fetcher = CountingFetcher::returning(anime("Frieren")).with_barrier(barrier);
    let (cache, _clock) = memory_cache(fetcher.clone());
    let fields = [AnimeField::Title, AnimeField::Score];

    // both requests see the fields missing before either fetch completes
    let frieren = key("frieren");
    let (first, second) = tokio::join!(
        cache.get_or_fetch_fields(&frieren, &fields, false),
        cache.get_or_fetch_fields(&frieren, &fields, false),
    );

    assert!(first.unwrap().ptr_eq(&second.unwrap()));
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_coalesced_fetches() {
    let fetcher =
        CountingFetcher::returning(anime("Frieren")).with_delay(Duration::from_millis(100));
    let options = CacheOptions {
        coalesce_fetches: true,
        ..fieldcache_test::memory_options()
    };
    let (cache, _clock) = cache_with(options, fetcher.clone());
    let fields = [AnimeField::Title, AnimeField::Score];

    let frieren = key("frieren");
    let (first, second) = tokio::join!(
        cache.get_or_fetch_fields(&frieren, &fields, false),
        cache.get_or_fetch_fields(&frieren, &fields, false),
    );

    assert_eq!(first.unwrap().read().title.as_deref(), Some("Frieren"));
    assert_eq!(second.unwrap().read().score, Some(9.5));
    assert_eq!(fetcher.calls(), 1);

    // other keys are not serialized behind this one
    cache
        .get_or_fetch_fields(&key("dungeon meshi"), &fields, false)
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_unrequested_fetched_values_are_released() {
    let counter = ReleaseCounter::default();
    let fetcher = CountingFetcher::new({
        let counter = counter.clone();
        move |name: &str, _: &[AnimeField]| {
            Some(Anime {
                image: Some(DecodedImage::new(1, &counter)),
                ..anime(name)
            })
        }
    });
    let (cache, _clock) = memory_cache(fetcher);

    let entity = cache
        .get_or_fetch_fields(&key("frieren"), &[AnimeField::Title], false)
        .await
        .unwrap();
    assert!(entity.read().image.is_none());
    assert_eq!(counter.count(), 1);

    // a merged value is owned by the cache and stays alive
    let entity = cache
        .get_or_fetch_fields(&key("himmel"), &[AnimeField::Image], false)
        .await
        .unwrap();
    assert!(entity.read().image.is_some());
    assert_eq!(counter.count(), 1);
}
