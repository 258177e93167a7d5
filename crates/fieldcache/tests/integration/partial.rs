use std::time::Duration;

use fieldcache::Clock;
use fieldcache_test::{AnimeField, CountingFetcher, Picture, ScrapedListing, SearchResult, anime};

use crate::{key, memory_cache, start};

#[tokio::test]
async fn test_partial_update_leaves_other_fields() {
    let (cache, clock) = memory_cache(CountingFetcher::returning(anime("Frieren")));
    let entity = cache
        .get_or_fetch_fields(
            &key("frieren"),
            &[AnimeField::Title, AnimeField::Synopsis],
            false,
        )
        .await
        .unwrap();

    clock.advance(Duration::from_secs(10 * 60));
    let hit = SearchResult {
        title: Some("Sousou no Frieren".into()),
        picture: Some(Picture(vec![1, 2, 3])),
        score: Some(9.25),
    };
    cache
        .update_partial(
            &key("frieren"),
            &hit,
            &[
                AnimeField::Title,
                AnimeField::Picture,
                AnimeField::Score,
                AnimeField::Synopsis,
            ],
        )
        .unwrap();

    let anime = entity.snapshot();
    assert_eq!(anime.title.as_deref(), Some("Sousou no Frieren"));
    assert_eq!(anime.picture, Some(Picture(vec![1, 2, 3])));
    assert_eq!(anime.score, Some(9.25));
    assert_eq!(anime.synopsis.as_deref(), Some("The story of Frieren."));

    let cached = cache.cached_entity(&key("frieren")).unwrap();
    let hour = chrono::TimeDelta::hours(1);
    assert_eq!(cached.field_expiration(AnimeField::Synopsis), Some(start() + hour));
    assert_eq!(cached.field_expiration(AnimeField::Title), Some(clock.now() + hour));
    assert!(cached.is_field_fetched(AnimeField::Score));
}

#[tokio::test]
async fn test_partial_update_skips_mismatched_types() {
    let (cache, _clock) = memory_cache(CountingFetcher::empty());

    let listing = ScrapedListing {
        title: Some("Frieren".into()),
        score: Some("9.3 / 10".into()),
    };
    cache
        .update_partial(&key("frieren"), &listing, &[AnimeField::Title, AnimeField::Score])
        .unwrap();

    let cached = cache.cached_entity(&key("frieren")).unwrap();
    let anime = cached.entity().snapshot();
    assert_eq!(anime.title.as_deref(), Some("Frieren"));
    assert_eq!(anime.score, None);
    assert!(cached.is_field_fetched(AnimeField::Title));
    assert!(!cached.is_field_fetched(AnimeField::Score));
}

#[tokio::test]
async fn test_update_with_empty_value() {
    let fetcher = CountingFetcher::returning(anime("Frieren"));
    let (cache, _clock) = memory_cache(fetcher.clone());
    let entity = cache
        .get_or_fetch_fields(&key("frieren"), &[AnimeField::Episodes], false)
        .await
        .unwrap();
    assert_eq!(entity.read().episodes, Some(28));

    let mut update = anime("Frieren");
    update.episodes = None;
    cache
        .update(&key("frieren"), &update, &[AnimeField::Episodes])
        .unwrap();

    assert_eq!(entity.read().episodes, None);
    let cached = cache.cached_entity(&key("frieren")).unwrap();
    assert!(cached.is_field_fetched(AnimeField::Episodes));

    // the empty value is fresh, so nothing is fetched
    cache
        .get_or_fetch_fields(&key("frieren"), &[AnimeField::Episodes], false)
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), 1);
}
