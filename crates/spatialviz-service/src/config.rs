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
    /// The log level for spatialviz.
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
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "spatialviz".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Bounds and cadence of the rendered image cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RendersCacheConfig {
    /// Upper bound of the total size of all cached images, in bytes.
    pub max_cache_size: u64,

    /// Maximum duration since creation of a cached image.
    ///
    /// Expired images are never served, a request for one renders it again. They are only
    /// deleted by an eviction pass though. `None` keeps images until they are evicted for space.
    #[serde(with = "humantime_serde")]
    pub max_entry_age: Option<Duration>,

    /// Number of decimal digits numeric parameters are rounded to when computing cache keys.
    pub key_precision: u32,

    /// Whether limits are enforced right after each new image is stored.
    pub evict_on_write: bool,

    /// Interval of the periodic eviction sweep.
    ///
    /// `None` disables the periodic sweep. Limits are then only enforced after new renders, if
    /// [`evict_on_write`](Self::evict_on_write) is set.
    #[serde(with = "humantime_serde")]
    pub eviction_interval: Option<Duration>,
}

impl Default for RendersCacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 10 * 1024 * 1024 * 1024,
            max_entry_age: None,
            key_precision: 6,
            evict_on_write: true,
            eviction_interval: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configure how rendered images are cached.
    pub renders: RendersCacheConfig,
}

/// Where datasets live, and the plotting defaults applied to requests.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Directory containing the `.h5ad` dataset files.
    pub data_dir: PathBuf,

    /// Dataset used when a request does not name one.
    ///
    /// Defaults to the first `.h5ad` file in [`data_dir`](Self::data_dir), sorted by name.
    pub default_dataset: Option<String>,

    /// Expression layer used when a request does not name one.
    pub default_layer: String,

    /// Spatial basis used when a request does not name one.
    pub default_basis: String,

    /// Resolution of the PNG previews.
    pub plot_png_dpi: u32,

    /// Resolutions a TIFF export may be requested in.
    pub allowed_export_dpi: Vec<u32>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            default_dataset: None,
            default_layer: "lognorm".into(),
            default_basis: "spatial".into(),
            plot_png_dpi: 300,
            allowed_export_dpi: vec![150, 300, 600, 1200],
        }
    }
}

/// Controls the external plotting backend.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct PlottingConfig {
    /// The command line to run for every render, as a list of program and arguments.
    pub command: Vec<String>,
}

/// The contents of the YAML configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the image cache and its temporary files.
    pub cache_dir: PathBuf,

    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune cache bounds.
    pub caches: CacheConfigs,

    /// Dataset location and plotting defaults.
    pub datasets: DatasetConfig,

    /// The plotting backend.
    pub plotting: PlottingConfig,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    pub fn cache_dir<P>(&self, dir: P) -> PathBuf
    where
        P: AsRef<Path>,
    {
        self.cache_dir.join(dir)
    }
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:3021".to_owned()
    } else {
        "127.0.0.1:3021".to_owned()
    }
}

/// Default value for the "cache_dir" configuration.
fn default_cache_dir() -> PathBuf {
    if is_docker() {
        // Docker image already defines `/data` as a persistent volume
        PathBuf::from("/data/cache")
    } else {
        PathBuf::from("cache")
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            datasets: DatasetConfig::default(),
            plotting: PlottingConfig::default(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renders_cache_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.caches.renders, RendersCacheConfig::default());
        assert_eq!(cfg.caches.renders.max_cache_size, 10 * 1024 * 1024 * 1024);

        let yaml = r#"
            caches:
              renders:
                max_cache_size: 1048576
                max_entry_age: 7d
                eviction_interval: 10m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let renders = cfg.caches.renders;
        assert_eq!(renders.max_cache_size, 1024 * 1024);
        assert_eq!(
            renders.max_entry_age,
            Some(Duration::from_secs(7 * 24 * 3600))
        );
        assert_eq!(renders.eviction_interval, Some(Duration::from_secs(600)));
        // untouched fields keep their defaults
        assert_eq!(renders.key_precision, 6);
        assert!(renders.evict_on_write);
    }

    #[test]
    fn test_disabling_age_limit() {
        let yaml = r#"
            caches:
              renders:
                max_entry_age: null
                evict_on_write: false
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.renders.max_entry_age, None);
        assert!(!cfg.caches.renders.evict_on_write);
    }

    #[test]
    fn test_dataset_defaults() {
        let yaml = r#"
            datasets:
              data_dir: /srv/data/bin100
              default_dataset: sham.h5ad
            plotting:
              command: [python3, -m, spatialviz_plot]
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.datasets.data_dir, PathBuf::from("/srv/data/bin100"));
        assert_eq!(cfg.datasets.default_dataset.as_deref(), Some("sham.h5ad"));
        assert_eq!(cfg.datasets.default_layer, "lognorm");
        assert_eq!(cfg.datasets.default_basis, "spatial");
        assert_eq!(cfg.datasets.plot_png_dpi, 300);
        assert_eq!(cfg.datasets.allowed_export_dpi, vec![150, 300, 600, 1200]);
        assert_eq!(cfg.plotting.command, ["python3", "-m", "spatialviz_plot"]);
    }

    #[test]
    fn test_logging() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_cache:
                max_entry_age: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
