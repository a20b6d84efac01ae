use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Control the metrics.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "memocache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

impl Metrics {
    /// Starts reporting metrics to the configured statsd server, if any.
    pub fn configure(&self) -> Result<()> {
        if let Some(statsd) = &self.statsd {
            crate::metrics::configure_statsd(&self.prefix, statsd, self.custom_tags.clone())
                .context("failed to configure statsd")?;
        }
        Ok(())
    }
}

/// Defaults for all functions registered with a controller.
///
/// Each registration can override these with its
/// [`RegisterOptions`](crate::caching::RegisterOptions).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// The namespace all keys are stored in, as `prefix:function_id:args_id`.
    ///
    /// Set to `null` to store keys without a prefix.
    pub prefix: Option<String>,
    /// How long a computed result stays in the storage.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Refresh entries in the background once they reach this age.
    ///
    /// Defaults to `None`, which means entries are only recomputed once they expired.
    #[serde(with = "humantime_serde")]
    pub precache: Option<Duration>,
    /// Give up on storage lookups after this long and treat them as a miss.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: Some("cache".into()),
            ttl: Duration::from_secs(3600),
            precache: None,
            timeout: None,
        }
    }
}

/// Where cached results are stored.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Keep entries in the memory of this process.
    Memory,
    /// Keep entries in a redis server.
    Redis(RedisStorageConfig),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RedisStorageConfig {
    /// The connection URL, for example `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// The number of keys to ask for with each `SCAN` when deleting entries.
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
}

fn default_scan_count() -> usize {
    100
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// The storage backend. Without it, no controller can be created from this config.
    pub storage: Option<StorageConfig>,

    /// Defaults for registered functions.
    pub cache: CacheConfig,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
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

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
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
