use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::disk::{BinaryCodec, TypeHandlers};
use crate::value::FieldValue;

/// The smallest accepted interval between two disk syncs.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(10);

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "fieldcache".into(),
        }
    }
}

/// Options of a single [`FieldCache`](crate::FieldCache).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Name of the cache, used for the default disk path and as metrics tag.
    pub name: String,

    /// How long fetched fields stay fresh.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Directory for snapshot files.
    ///
    /// Defaults to `fieldcache/{name}` in the user cache directory.
    pub disk_cache_path: Option<PathBuf>,

    /// Interval of the background disk sync.
    #[serde(with = "humantime_serde")]
    pub disk_sync_interval: Duration,

    /// Whether entries are persisted and restored at all.
    pub enable_disk_cache: bool,

    /// Serialize fetches per key, so concurrent requests for overlapping fields result in a
    /// single fetch.
    pub coalesce_fetches: bool,

    /// Binary codecs for field value types. Registered in code only.
    #[serde(skip)]
    pub type_handlers: TypeHandlers,
}

impl CacheOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Registers a binary codec for field values of type `T`.
    pub fn with_type_handler<T, C>(mut self, codec: C) -> Self
    where
        T: FieldValue,
        C: BinaryCodec<T>,
    {
        self.type_handlers.register::<T, C>(codec);
        self
    }

    /// The snapshot directory, resolving the default location if none is configured.
    pub fn resolved_disk_path(&self) -> PathBuf {
        match &self.disk_cache_path {
            Some(path) => path.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(env::temp_dir)
                .join("fieldcache")
                .join(&self.name),
        }
    }

    /// The disk sync interval, but never shorter than [`MIN_SYNC_INTERVAL`].
    pub fn sync_interval(&self) -> Duration {
        self.disk_sync_interval.max(MIN_SYNC_INTERVAL)
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            name: "default".into(),
            default_ttl: Duration::from_secs(24 * 60 * 60),
            disk_cache_path: None,
            disk_sync_interval: Duration::from_secs(30),
            enable_disk_cache: true,
            coalesce_fetches: false,
            type_handlers: TypeHandlers::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// Options of the cache.
    pub cache: CacheOptions,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
