use std::sync::{Arc, Mutex};

use fieldcache::{EntityRef, FieldHandler};
use fieldcache_test::{Anime, AnimeField, CountingFetcher, anime};

use crate::{cache_with, disk_cache, key, memory_cache};

type Seen = Arc<Mutex<Vec<(String, Option<String>)>>>;

/// A handler recording the key and the title it observed.
fn recording_handler() -> (FieldHandler<String, Anime>, Seen) {
    let seen = Seen::default();
    let handler: FieldHandler<String, Anime> = {
        let seen = Arc::clone(&seen);
        Arc::new(move |key: &String, entity: &EntityRef<Anime>| {
            let title = entity.read().title.clone();
            seen.lock().unwrap().push((key.clone(), title));
        })
    };
    (handler, seen)
}

#[tokio::test]
async fn test_notified_on_fetch() {
    let (cache, _clock) = memory_cache(CountingFetcher::returning(anime("Frieren")));
    let (handler, seen) = recording_handler();
    cache.subscribe_to_field_change(&key("frieren"), &handler, &[AnimeField::Title]);

    cache
        .get_or_fetch_fields(&key("frieren"), &[AnimeField::Score], false)
        .await
        .unwrap();
    assert!(seen.lock().unwrap().is_empty());

    cache
        .get_or_fetch_fields(&key("frieren"), &[AnimeField::Title], false)
        .await
        .unwrap();
    cache
        .get_or_fetch_fields(&key("himmel"), &[AnimeField::Title], false)
        .await
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("frieren".to_owned(), Some("Frieren".to_owned()))]
    );
}

#[tokio::test]
async fn test_unsubscribe() {
    let (cache, _clock) = memory_cache(CountingFetcher::empty());
    let (handler, seen) = recording_handler();
    let fields = [AnimeField::Title, AnimeField::Score];

    cache.subscribe_to_field_change(&key("frieren"), &handler, &fields);
    cache.update(&key("frieren"), &anime("Frieren"), &fields).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);

    cache.unsubscribe_from_field_change(&key("frieren"), &handler, &[AnimeField::Title]);
    cache.update(&key("frieren"), &anime("Frieren"), &fields).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 3);

    cache.unsubscribe_from_field_change(&key("frieren"), &handler, &[AnimeField::Score]);
    cache.update(&key("frieren"), &anime("Frieren"), &fields).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert_eq!(cache.stats().subscriptions, 0);
}

#[tokio::test]
async fn test_notified_on_disk_load() {
    let cache_dir = fieldcache_test::tempdir();
    {
        let (cache, _clock) = disk_cache(cache_dir.path(), CountingFetcher::empty()).await;
        cache
            .update(&key("frieren"), &anime("Frieren"), &[AnimeField::Title])
            .unwrap();
        cache.flush().await.unwrap();
    }

    let (cache, _clock) = cache_with(
        fieldcache_test::options(cache_dir.path()),
        CountingFetcher::empty(),
    );
    let (handler, seen) = recording_handler();
    // the load runs in the background and has not started yet
    cache.subscribe_to_field_change(&key("frieren"), &handler, &[AnimeField::Title]);
    cache.ready().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("frieren".to_owned(), Some("Frieren".to_owned()))]
    );
}
