use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use fieldcache::{CacheOptions, FieldCache, ManualClock};
use fieldcache_test::{Anime, CountingFetcher};

pub type AnimeCache = FieldCache<String, Anime>;

/// The instant all tests start at.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// A cache without disk persistence, driven by a manual clock.
pub fn memory_cache(fetcher: CountingFetcher) -> (AnimeCache, ManualClock) {
    cache_with(fieldcache_test::memory_options(), fetcher)
}

/// A cache persisting to `dir`, driven by a manual clock set to `now`.
///
/// The returned cache has finished loading existing snapshots.
pub async fn disk_cache_at(
    dir: &Path,
    fetcher: CountingFetcher,
    now: DateTime<Utc>,
) -> (AnimeCache, ManualClock) {
    let (cache, clock) = cache_at(fieldcache_test::options(dir), fetcher, now);
    cache.ready().await;
    (cache, clock)
}

pub async fn disk_cache(dir: &Path, fetcher: CountingFetcher) -> (AnimeCache, ManualClock) {
    disk_cache_at(dir, fetcher, start()).await
}

pub fn cache_with(options: CacheOptions, fetcher: CountingFetcher) -> (AnimeCache, ManualClock) {
    cache_at(options, fetcher, start())
}

pub fn cache_at(
    options: CacheOptions,
    fetcher: CountingFetcher,
    now: DateTime<Utc>,
) -> (AnimeCache, ManualClock) {
    fieldcache_test::setup();
    let clock = ManualClock::new(now);
    let cache = FieldCache::builder(options)
        .fetcher(fetcher)
        .clock(clock.clone())
        .build();
    (cache, clock)
}

pub fn key(name: &str) -> String {
    name.to_owned()
}
