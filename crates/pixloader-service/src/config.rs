use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::drawable::BitmapTracking;
use crate::types::{CachePolicy, LoadOptions};

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
    /// The log level for pixloader.
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
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "pixloader".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of the in-memory drawable cache.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Capacity (in bytes of decoded pixels) of the in-memory cache.
    ///
    /// The in-memory size limit is a best-effort approximation, and not an exact limit.
    ///
    /// Defaults to `64 MiB (= 67_108_864)`.
    pub capacity: u64,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024 * 1024,
        }
    }
}

/// Fine-tuning of the disk cache.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// How long a downloaded image is served from disk before it is fetched again.
    ///
    /// This is the default for requests that do not specify their own validity.
    #[serde(with = "humantime_serde")]
    pub validity: Duration,

    /// Maximum duration since the last modification of a cache file, after which
    /// `cleanup` removes it.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            validity: Duration::from_secs(3600 * 24),
            max_unused_for: Some(Duration::from_secs(3600 * 24 * 7)),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configuration of the in-memory cache.
    pub in_memory: InMemoryCacheConfig,
    /// Configuration of the disk cache.
    pub disk: DiskCacheConfig,
}

/// See the README for more information on config values.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the disk cache. Default is not to cache on disk.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune the caches.
    pub caches: CacheConfigs,

    /// How decoded bitmaps are tracked once they are wrapped for display.
    pub bitmap_tracking: BitmapTracking,

    /// Allow reserved IP addresses for image requests.
    pub connect_to_reserved_ips: bool,

    /// The maximum timeout for one fetch, including retries.
    ///
    /// A fetch that takes longer than this is abandoned, which releases everyone waiting
    /// on the same request key.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The timeout for establishing a connection in a download.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for receiving the response headers in a download.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,

    /// The `User-Agent` header sent with every HTTP request.
    pub user_agent: String,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no caching should happen
    /// and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }

    /// The [`LoadOptions`] used for requests that don't bring their own.
    pub fn default_options(&self) -> LoadOptions {
        LoadOptions {
            cache: CachePolicy {
                cache_in_memory: true,
                cache_in_disk: self.cache_dir.is_some(),
                disk_cache_validity: self.caches.disk.validity,
            },
            processor: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            bitmap_tracking: BitmapTracking::default(),
            connect_to_reserved_ips: false,
            max_download_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            head_timeout: Duration::from_secs(5),
            user_agent: concat!("pixloader/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_cache_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.caches.disk, DiskCacheConfig::default());
        assert_eq!(cfg.cache_dir, None);

        let yaml = r#"
            cache_dir: /tmp/pixloader
            caches:
              disk:
                validity: 2h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.disk.validity, Duration::from_secs(7200));
        assert_eq!(
            cfg.caches.disk.max_unused_for,
            DiskCacheConfig::default().max_unused_for
        );
        assert_eq!(cfg.caches.in_memory, InMemoryCacheConfig::default());
        assert_eq!(
            cfg.cache_dir("tmp"),
            Some(PathBuf::from("/tmp/pixloader/tmp"))
        );
    }

    #[test]
    fn test_default_options() {
        let cfg = Config::default();
        let options = cfg.default_options();
        assert!(options.cache.cache_in_memory);
        assert!(!options.cache.cache_in_disk);

        let cfg = Config {
            cache_dir: Some(PathBuf::from("/tmp/pixloader")),
            ..Default::default()
        };
        let options = cfg.default_options();
        assert!(options.cache.cache_in_disk);
        assert_eq!(options.cache.disk_cache_validity, cfg.caches.disk.validity);
    }

    #[test]
    fn test_disabling_cleanup() {
        let yaml = r#"
            caches:
              disk:
                max_unused_for: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.disk.max_unused_for, None);
        assert_eq!(
            cfg.caches.disk.validity,
            DiskCacheConfig::default().validity
        );
    }

    #[test]
    fn test_bitmap_tracking() {
        let cfg = Config::default();
        assert_eq!(cfg.bitmap_tracking, BitmapTracking::Standard);

        let yaml = r#"
            bitmap_tracking: recycling_aware
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.bitmap_tracking, BitmapTracking::RecyclingAware);
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_zero_second_dl_timeouts() {
        let yaml = r#"
            max_download_timeout: 0s
            connect_timeout: 0s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.max_download_timeout, Duration::from_secs(0));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(0));
        assert_eq!(cfg.head_timeout, Config::default().head_timeout);
    }

    #[test]
    fn test_unknown_fields() {
        let yaml = r#"
            caches:
              not_a_cache:
                validity: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
