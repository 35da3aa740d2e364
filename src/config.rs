//! Index configuration: defaults, optional TOML file, `UGNOS_INDEX_*` environment overrides.

use crate::error::IndexError;
use crate::measurement::DEFAULT_PARALLEL_GROUPING_THRESHOLD;
use crate::telemetry::{noop_event_listener, IndexEventListener};
use ::config::{Config, Environment, File};
use std::path::Path;
use std::sync::Arc;

/// Environment variable prefix; `UGNOS_INDEX_MAX_SERIES=1000` sets `max_series`.
pub const ENV_PREFIX: &str = "UGNOS_INDEX";

/// Configuration options for the [`Index`](crate::Index).
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Database name recorded on every measurement.
    pub database: String,
    /// Optional hard limit on live series across all measurements (None = no limit).
    pub max_series: Option<u64>,
    /// Optional hard limit on live series within one measurement (None = no limit).
    pub max_series_per_measurement: Option<u64>,
    /// `tag_sets` groups on the rayon pool once this many series match.
    pub parallel_grouping_threshold: usize,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn IndexEventListener>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            database: "default".to_string(),
            max_series: None,
            max_series_per_measurement: None,
            parallel_grouping_threshold: DEFAULT_PARALLEL_GROUPING_THRESHOLD,
            event_listener: noop_event_listener(),
        }
    }
}

/// Index config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct IndexFileConfig {
    pub database: Option<String>,
    pub max_series: Option<u64>,
    pub max_series_per_measurement: Option<u64>,
    pub parallel_grouping_threshold: Option<usize>,
}

impl IndexConfig {
    /// Loads defaults, then `path` (TOML) if given, then `UGNOS_INDEX_*` environment variables.
    ///
    /// An explicit `path` that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<IndexConfig, IndexError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(IndexError::ConfigError(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );

        let partial: IndexFileConfig = builder.build()?.try_deserialize()?;
        let mut config = IndexConfig::default();
        config.merge(&partial)?;
        Ok(config)
    }

    /// Merge a partial config. Only overwrites fields that are `Some`.
    pub fn merge(&mut self, partial: &IndexFileConfig) -> Result<(), IndexError> {
        if let Some(db) = &partial.database {
            if db.is_empty() {
                return Err(IndexError::ConfigError("database must not be empty".into()));
            }
            self.database = db.clone();
        }
        if let Some(n) = partial.max_series {
            self.max_series = Some(n);
        }
        if let Some(n) = partial.max_series_per_measurement {
            self.max_series_per_measurement = Some(n);
        }
        if let Some(n) = partial.parallel_grouping_threshold {
            self.parallel_grouping_threshold = n;
        }
        Ok(())
    }

    pub fn with_event_listener(mut self, listener: Arc<dyn IndexEventListener>) -> Self {
        self.event_listener = listener;
        self
    }
}
