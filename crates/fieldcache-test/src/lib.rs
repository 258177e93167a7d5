//! Helpers for testing the field cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is deleted while the
//!    cache still syncs to it. Assign it to a variable in the test function (e.g.
//!    `let cache_dir = fieldcache_test::tempdir()`).
//!
//!  - The sample domain in this crate models anime entries as returned by several providers,
//!    each of which only knows some of the fields.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use fieldcache::{
    BinaryCodec, CacheOptions, Fetcher, FieldMap, FieldSource, FieldValue, Release,
};
use futures::future::BoxFuture;
use tokio::sync::Barrier;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `fieldcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("fieldcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Cache options for tests: a one hour TTL, snapshots in `dir` and a binary handler for
/// [`Picture`].
pub fn options(dir: &Path) -> CacheOptions {
    CacheOptions {
        default_ttl: Duration::from_secs(3600),
        disk_cache_path: Some(dir.to_owned()),
        ..CacheOptions::new("test")
    }
    .with_type_handler::<Picture, _>(PictureCodec)
}

/// Cache options for tests that do not touch the disk.
pub fn memory_options() -> CacheOptions {
    CacheOptions {
        default_ttl: Duration::from_secs(3600),
        enable_disk_cache: false,
        ..CacheOptions::new("memory")
    }
}

fieldcache::field_tags! {
    /// Fields of an [`Anime`].
    pub enum AnimeField {
        Title,
        Score,
        Synopsis,
        Episodes,
        Genres,
        /// Raw cover image bytes, persisted through [`PictureCodec`].
        Picture,
        /// Decoded cover image, memory only.
        Image,
    }
}

/// Encoded cover image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture(pub Vec<u8>);

impl FieldValue for Picture {}

/// Writes [`Picture`]s as raw bytes.
pub struct PictureCodec;

impl BinaryCodec<Picture> for PictureCodec {
    fn serialize(&self, value: &Picture, writer: &mut dyn Write) -> io::Result<()> {
        writer.write_all(&value.0)
    }

    fn deserialize(&self, reader: &mut dyn Read) -> io::Result<Picture> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(Picture(bytes))
    }
}

/// Counts how often [`DecodedImage`]s have been released.
#[derive(Debug, Clone, Default)]
pub struct ReleaseCounter(Arc<AtomicUsize>);

impl ReleaseCounter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A decoded image standing in for a native resource.
#[derive(Debug)]
pub struct DecodedImage {
    pub id: u32,
    released: ReleaseCounter,
}

impl DecodedImage {
    pub fn new(id: u32, counter: &ReleaseCounter) -> Arc<Self> {
        Arc::new(Self {
            id,
            released: counter.clone(),
        })
    }
}

impl Release for DecodedImage {
    fn release(&self) {
        self.released.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// The canonical anime entity.
#[derive(Debug, Clone, Default)]
pub struct Anime {
    pub title: Option<String>,
    pub score: Option<f32>,
    pub synopsis: Option<String>,
    pub episodes: Option<u32>,
    pub genres: Option<Vec<String>>,
    pub picture: Option<Picture>,
    pub image: Option<Arc<DecodedImage>>,
}

impl FieldSource for Anime {
    type Field = AnimeField;

    fn field_map() -> &'static FieldMap<Self, AnimeField> {
        static MAP: OnceLock<FieldMap<Anime, AnimeField>> = OnceLock::new();
        MAP.get_or_init(|| {
            FieldMap::<Anime, AnimeField>::builder()
                .field(AnimeField::Title, |a: &Anime| &a.title, |a| &mut a.title)
                .field(AnimeField::Score, |a: &Anime| &a.score, |a| &mut a.score)
                .field(AnimeField::Synopsis, |a: &Anime| &a.synopsis, |a| &mut a.synopsis)
                .field(AnimeField::Episodes, |a: &Anime| &a.episodes, |a| &mut a.episodes)
                .field(AnimeField::Genres, |a: &Anime| &a.genres, |a| &mut a.genres)
                .opaque(AnimeField::Picture, |a: &Anime| &a.picture, |a| &mut a.picture)
                .memory_only(AnimeField::Image, |a: &Anime| &a.image, |a| &mut a.image)
                .build()
        })
    }
}

/// A fully populated anime, except for the decoded image.
pub fn anime(title: &str) -> Anime {
    Anime {
        title: Some(title.to_owned()),
        score: Some(9.5),
        synopsis: Some(format!("The story of {title}.")),
        episodes: Some(28),
        genres: Some(vec!["Adventure".into(), "Fantasy".into()]),
        picture: Some(Picture(title.as_bytes().to_vec())),
        image: None,
    }
}

/// A search hit from a listing provider, which only knows a few fields.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub title: Option<String>,
    pub picture: Option<Picture>,
    pub score: Option<f32>,
}

impl FieldSource for SearchResult {
    type Field = AnimeField;

    fn field_map() -> &'static FieldMap<Self, AnimeField> {
        static MAP: OnceLock<FieldMap<SearchResult, AnimeField>> = OnceLock::new();
        MAP.get_or_init(|| {
            FieldMap::<SearchResult, AnimeField>::builder()
                .field(AnimeField::Title, |s: &SearchResult| &s.title, |s| &mut s.title)
                .opaque(AnimeField::Picture, |s: &SearchResult| &s.picture, |s| &mut s.picture)
                .field(AnimeField::Score, |s: &SearchResult| &s.score, |s| &mut s.score)
                .build()
        })
    }
}

/// A scraped listing that reports the score as display text.
#[derive(Debug, Clone, Default)]
pub struct ScrapedListing {
    pub title: Option<String>,
    pub score: Option<String>,
}

impl FieldSource for ScrapedListing {
    type Field = AnimeField;

    fn field_map() -> &'static FieldMap<Self, AnimeField> {
        static MAP: OnceLock<FieldMap<ScrapedListing, AnimeField>> = OnceLock::new();
        MAP.get_or_init(|| {
            FieldMap::<ScrapedListing, AnimeField>::builder()
                .field(AnimeField::Title, |s: &ScrapedListing| &s.title, |s| &mut s.title)
                .field(AnimeField::Score, |s: &ScrapedListing| &s.score, |s| &mut s.score)
                .build()
        })
    }
}

type Respond = dyn Fn(&str, &[AnimeField]) -> Option<Anime> + Send + Sync;

struct FetcherState {
    respond: Box<Respond>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<AnimeField>>>,
    delay: Option<Duration>,
    barrier: Option<Arc<Barrier>>,
}

/// A scripted [`Fetcher`] that records every call.
///
/// Clones share the recorded calls.
#[derive(Clone)]
pub struct CountingFetcher {
    state: Arc<FetcherState>,
}

impl CountingFetcher {
    /// Answers every fetch with the result of `respond`.
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&str, &[AnimeField]) -> Option<Anime> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(FetcherState {
                respond: Box::new(respond),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                delay: None,
                barrier: None,
            }),
        }
    }

    /// Answers every fetch with a clone of `anime`.
    pub fn returning(anime: Anime) -> Self {
        Self::new(move |_, _| Some(anime.clone()))
    }

    /// Answers every fetch with "no data".
    pub fn empty() -> Self {
        Self::new(|_, _| None)
    }

    /// Sleeps for `delay` before answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.modify(|state| state.delay = Some(delay))
    }

    /// Waits on `barrier` before answering, so concurrent fetches can be forced to overlap.
    pub fn with_barrier(self, barrier: Arc<Barrier>) -> Self {
        self.modify(|state| state.barrier = Some(barrier))
    }

    fn modify(self, f: impl FnOnce(&mut FetcherState)) -> Self {
        let mut state = Arc::try_unwrap(self.state)
            .unwrap_or_else(|_| panic!("configure the fetcher before cloning it"));
        f(&mut state);
        Self {
            state: Arc::new(state),
        }
    }

    /// The number of fetches so far.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// The requested fields of every fetch so far.
    pub fn requests(&self) -> Vec<Vec<AnimeField>> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Fetcher<String, Anime> for CountingFetcher {
    fn fetch<'a>(
        &'a self,
        key: &'a String,
        fields: &'a [AnimeField],
    ) -> BoxFuture<'a, anyhow::Result<Option<Anime>>> {
        Box::pin(async move {
            self.state.calls.fetch_add(1, Ordering::SeqCst);
            self.state.requests.lock().unwrap().push(fields.to_vec());

            if let Some(barrier) = &self.state.barrier {
                barrier.wait().await;
            }
            if let Some(delay) = self.state.delay {
                tokio::time::sleep(delay).await;
            }

            Ok((self.state.respond)(key, fields))
        })
    }
}
