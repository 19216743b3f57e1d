//! Runtime settings consumed by the forwarding core and the storage
//! plugins.
//!
//! Parsing a configuration file into this structure is the enclosing
//! daemon's job; everything here has a sensible default so the core can
//! also be embedded with `Settings::default()`. Storage feature toggles
//! are requests, not guarantees: each plugin probes for the capability at
//! init and logs an error (then continues with the feature disabled) when
//! a toggle is enabled on a platform that cannot honor it.

use crate::client::ReconnectPolicy;
use crate::defaults;
use serde::Deserialize;
use std::path::PathBuf;

/// Settings recognized by the relay core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Hard cap on each destination's send queue.
    pub max_queue_size: usize,
    /// Largest batch serialized into a single frame.
    pub max_datapoints_per_message: usize,
    /// Pause and resume the ingest layer on queue pressure.
    pub use_flow_control: bool,
    /// Base URL of the graphite web app, used by the tag indexer.
    pub graphite_url: String,
    /// Root directory for on-disk time series databases.
    pub local_data_dir: PathBuf,

    /// Create whisper files as sparse files instead of zero-filling.
    pub whisper_sparse_create: bool,
    /// Preallocate whisper files with fallocate where available.
    pub whisper_fallocate_create: bool,
    /// Flush whisper files to disk after every write.
    pub whisper_autoflush: bool,
    /// Hold an exclusive file lock across whisper writes.
    pub whisper_lock_writes: bool,
    /// Advise the kernel that whisper access is random.
    pub whisper_fadvise_random: bool,

    /// Ceres node metadata caching: `all` or `none`.
    pub ceres_node_caching_behavior: String,
    /// Ceres slice handle caching: only `none` is supported.
    pub ceres_slice_caching_behavior: String,
    /// Largest gap, in slots, bridged by padding before a new slice is cut.
    pub ceres_max_slice_gap: u64,
    /// Hold an exclusive file lock across ceres slice writes.
    pub ceres_lock_writes: bool,

    /// Client reconnect tuning.
    pub reconnect: ReconnectPolicy,
}

impl Settings {
    /// Queue level below which paused receivers are resumed.
    pub fn low_watermark(&self) -> usize {
        (self.max_queue_size as f64 * defaults::QUEUE_LOW_WATERMARK_RATIO) as usize
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_queue_size: defaults::MAX_QUEUE_SIZE,
            max_datapoints_per_message: defaults::MAX_DATAPOINTS_PER_MESSAGE,
            use_flow_control: true,
            graphite_url: defaults::GRAPHITE_URL.to_string(),
            local_data_dir: PathBuf::from(defaults::LOCAL_DATA_DIR),
            whisper_sparse_create: false,
            whisper_fallocate_create: false,
            whisper_autoflush: false,
            whisper_lock_writes: false,
            whisper_fadvise_random: false,
            ceres_node_caching_behavior: "all".to_string(),
            ceres_slice_caching_behavior: "none".to_string(),
            ceres_max_slice_gap: defaults::CERES_MAX_SLICE_GAP,
            ceres_lock_writes: false,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.max_queue_size, 10_000);
        assert_eq!(settings.max_datapoints_per_message, 500);
        assert!(settings.use_flow_control);
        assert_eq!(settings.low_watermark(), 8_000);
    }

    #[test]
    fn low_watermark_truncates() {
        let settings = Settings {
            max_queue_size: 4,
            ..Settings::default()
        };
        assert_eq!(settings.low_watermark(), 3);
    }

    #[test]
    fn partial_config_deserializes_over_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"max_queue_size": 42, "use_flow_control": false}"#).unwrap();
        assert_eq!(settings.max_queue_size, 42);
        assert!(!settings.use_flow_control);
        assert_eq!(settings.max_datapoints_per_message, 500);
    }
}
