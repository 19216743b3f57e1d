//! # Time Series Storage Plugins
//!
//! Abstraction over the on-disk time series backends used by the writer
//! path that runs alongside the forwarding core. Every backend implements
//! [`TimeSeriesDatabase`]; the forwarding core itself never touches disk
//! and only ever sees this interface.
//!
//! ## Plugin Registration
//!
//! Plugins are registered explicitly at program start under a unique
//! name and selected by configuration:
//!
//! ```rust
//! use carbon_relay::config::Settings;
//! use carbon_relay::storage;
//!
//! storage::register_builtin_plugins();
//! let settings = Settings::default();
//! let database = storage::create_database("whisper", &settings).unwrap();
//! assert_eq!(database.plugin_name(), "whisper");
//! ```
//!
//! ## Error Policy
//!
//! Unsupported metadata keys and rejected archive configurations are
//! surfaced to the caller as typed [`StorageError`]s. Tag indexing is
//! fire-and-forget: failures are logged and never propagated. Write and
//! create failures are the writer path's to log; nothing here aborts the
//! process over a single datapoint.

use crate::config::Settings;
use crate::metric::Datapoint;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

pub mod ceres;
mod tagging;
pub mod whisper;

pub use ceres::CeresDatabase;
pub use whisper::WhisperDatabase;

/// Errors surfaced by storage plugins.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Metadata key not recognized by this plugin.
    #[error("unsupported metadata key \"{0}\"")]
    UnsupportedMetadata(String),

    /// Retention or creation options the plugin cannot honor.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No plugin registered under the requested name.
    #[error("unknown database plugin \"{0}\"")]
    UnknownPlugin(String),

    /// The metric has no storage yet; the writer must create it first.
    #[error("metric not found: {0}")]
    MetricNotFound(String),

    /// On-disk data that could not be decoded.
    #[error("corrupt database entry: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One archive of a retention schedule: `points` slots of
/// `seconds_per_point` resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    pub seconds_per_point: u32,
    pub points: u32,
}

impl Retention {
    pub fn new(seconds_per_point: u32, points: u32) -> Self {
        Self {
            seconds_per_point,
            points,
        }
    }

    /// Total time span covered by this archive.
    pub fn duration_secs(&self) -> u64 {
        u64::from(self.seconds_per_point) * u64::from(self.points)
    }
}

/// Capability set every storage backend provides.
///
/// Implementations are `Send + Sync` so the writer can share one instance
/// across its worker tasks.
#[async_trait]
pub trait TimeSeriesDatabase: Send + Sync {
    /// Unique registry name for this plugin.
    fn plugin_name(&self) -> &'static str;

    /// Aggregation methods this backend can be configured with.
    fn aggregation_methods(&self) -> &'static [&'static str];

    /// Base URL of the graphite web app, used for tag indexing.
    fn graphite_url(&self) -> &str;

    /// Append or update datapoints for a metric.
    async fn write(&self, metric: &str, datapoints: &[Datapoint]) -> Result<(), StorageError>;

    /// Whether storage for the metric already exists.
    async fn exists(&self, metric: &str) -> bool;

    /// Create storage for a metric.
    ///
    /// `retentions` is ordered highest precision first; `x_files_factor`
    /// must lie in `[0, 1]`; `aggregation_method` must be one of
    /// [`aggregation_methods`](Self::aggregation_methods).
    async fn create(
        &self,
        metric: &str,
        retentions: &[Retention],
        x_files_factor: f64,
        aggregation_method: &str,
    ) -> Result<(), StorageError>;

    /// Look up one metadata value. Keys are plugin-specific; unsupported
    /// keys fail with [`StorageError::UnsupportedMetadata`].
    async fn get_metadata(&self, metric: &str, key: &str)
        -> Result<serde_json::Value, StorageError>;

    /// Modify one metadata value, same key rules as
    /// [`get_metadata`](Self::get_metadata).
    async fn set_metadata(
        &self,
        metric: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StorageError>;

    /// Filesystem path backing the metric, for path-backed plugins only.
    fn get_filesystem_path(&self, _metric: &str) -> Option<PathBuf> {
        None
    }

    /// Reject retention schedules this backend cannot handle.
    fn validate_archive_list(&self, _archives: &[Retention]) -> Result<(), StorageError> {
        Ok(())
    }

    /// Notify the tag index about a (possibly tagged) series.
    ///
    /// Fire and forget: failures are logged, never returned.
    async fn tag(&self, metric: &str) {
        tagging::tag_series(self.graphite_url(), metric).await;
    }
}

/// Constructor signature plugins register under their name.
pub type PluginConstructor = fn(&Settings) -> Result<Box<dyn TimeSeriesDatabase>, StorageError>;

static PLUGIN_REGISTRY: Lazy<Mutex<HashMap<&'static str, PluginConstructor>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Register a plugin constructor under a unique name. Re-registering a
/// name replaces the previous constructor.
pub fn register_plugin(name: &'static str, constructor: PluginConstructor) {
    PLUGIN_REGISTRY.lock().unwrap().insert(name, constructor);
}

/// Names currently registered.
pub fn registered_plugins() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = PLUGIN_REGISTRY.lock().unwrap().keys().copied().collect();
    names.sort_unstable();
    names
}

/// Instantiate the plugin selected by configuration.
pub fn create_database(
    name: &str,
    settings: &Settings,
) -> Result<Box<dyn TimeSeriesDatabase>, StorageError> {
    let constructor = PLUGIN_REGISTRY
        .lock()
        .unwrap()
        .get(name)
        .copied()
        .ok_or_else(|| StorageError::UnknownPlugin(name.to_string()))?;
    constructor(settings)
}

/// Register the plugins shipped with this crate. Call once at program
/// start; calling again is harmless.
pub fn register_builtin_plugins() {
    register_plugin(whisper::PLUGIN_NAME, whisper::construct);
    register_plugin(ceres::PLUGIN_NAME, ceres::construct);
}
