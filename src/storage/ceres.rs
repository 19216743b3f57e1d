//! Ceres-style storage plugin: a directory tree of metric nodes, each
//! holding JSON metadata and append-friendly slice files.
//!
//! A node lives at `<data_dir>/<metric path with dots as separators>` and
//! contains a `.ceres-node` metadata file plus zero or more
//! `<start>@<step>.slice` files of consecutive big-endian f64 slots.
//! Writing a point past the end of the latest slice pads the gap with NaN
//! up to `ceres_max_slice_gap` slots; anything further starts a new slice.

use super::{StorageError, Retention, TimeSeriesDatabase};
use crate::config::Settings;
use crate::metric::{tag_encode, Datapoint};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, error, info};

pub const PLUGIN_NAME: &str = "ceres";

pub const AGGREGATION_METHODS: &[&str] = &["average", "sum", "last", "max", "min"];

/// Whether this platform can take advisory file locks.
pub const CAN_LOCK: bool = cfg!(unix);

const NODE_METADATA_FILE: &str = ".ceres-node";
const SLICE_EXTENSION: &str = "slice";
const SLOT_BYTES: u64 = 8;

pub struct CeresDatabase {
    data_dir: PathBuf,
    graphite_url: String,
    max_slice_gap: u64,
    lock_writes: bool,
    node_cache: Option<Mutex<HashMap<String, Map<String, Value>>>>,
}

pub(super) fn construct(settings: &Settings) -> Result<Box<dyn TimeSeriesDatabase>, StorageError> {
    Ok(Box::new(CeresDatabase::new(settings)))
}

impl CeresDatabase {
    pub fn new(settings: &Settings) -> Self {
        let node_cache = match settings.ceres_node_caching_behavior.as_str() {
            "all" => Some(Mutex::new(HashMap::new())),
            "none" => None,
            other => {
                error!(
                    "ceres_node_caching_behavior \"{}\" is not supported, caching disabled",
                    other
                );
                None
            }
        };
        if settings.ceres_slice_caching_behavior != "none" {
            error!(
                "ceres_slice_caching_behavior \"{}\" is not supported, continuing without slice caching",
                settings.ceres_slice_caching_behavior
            );
        }
        let lock_writes = if settings.ceres_lock_writes {
            if CAN_LOCK {
                info!("enabling ceres file locking");
                true
            } else {
                error!("ceres_lock_writes is enabled but unsupported on this platform");
                false
            }
        } else {
            false
        };

        Self {
            data_dir: settings.local_data_dir.clone(),
            graphite_url: settings.graphite_url.clone(),
            max_slice_gap: settings.ceres_max_slice_gap,
            lock_writes,
            node_cache,
        }
    }

    fn node_path(&self, metric: &str) -> PathBuf {
        let mut path = self.data_dir.clone();
        for part in tag_encode(metric, ".").split('.') {
            path.push(part);
        }
        path
    }

    fn read_metadata(&self, metric: &str) -> Result<Map<String, Value>, StorageError> {
        if let Some(cache) = &self.node_cache {
            if let Some(metadata) = cache.lock().unwrap().get(metric) {
                return Ok(metadata.clone());
            }
        }
        let path = self.node_path(metric).join(NODE_METADATA_FILE);
        let raw = fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StorageError::MetricNotFound(metric.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;
        let metadata: Map<String, Value> = serde_json::from_slice(&raw)
            .map_err(|err| StorageError::Corrupt(err.to_string()))?;
        self.cache_metadata(metric, &metadata);
        Ok(metadata)
    }

    fn write_metadata(
        &self,
        metric: &str,
        metadata: &Map<String, Value>,
    ) -> Result<(), StorageError> {
        let path = self.node_path(metric).join(NODE_METADATA_FILE);
        fs::write(&path, serde_json::to_vec(metadata).map_err(|err| {
            StorageError::Corrupt(err.to_string())
        })?)?;
        self.cache_metadata(metric, metadata);
        Ok(())
    }

    fn cache_metadata(&self, metric: &str, metadata: &Map<String, Value>) {
        if let Some(cache) = &self.node_cache {
            cache
                .lock()
                .unwrap()
                .insert(metric.to_string(), metadata.clone());
        }
    }

    /// Latest slice of matching step in a node directory, if any.
    fn latest_slice(&self, node: &PathBuf, step: u64) -> Result<Option<SliceFile>, StorageError> {
        let mut latest: Option<SliceFile> = None;
        for entry in fs::read_dir(node)? {
            let entry = entry?;
            let Some(slice) = SliceFile::parse(entry.path()) else {
                continue;
            };
            if slice.step != step {
                continue;
            }
            if latest.as_ref().map_or(true, |best| slice.start > best.start) {
                latest = Some(slice);
            }
        }
        Ok(latest)
    }

    fn write_point(&self, node: &PathBuf, step: u64, datapoint: &Datapoint) -> Result<(), StorageError> {
        let aligned = datapoint.timestamp - datapoint.timestamp % step;
        let slice = self.latest_slice(node, step)?;

        let target = match slice {
            Some(slice) if aligned >= slice.start => slice,
            Some(slice) => {
                debug!(
                    "dropping datapoint at {} before slice start {} in {}",
                    aligned,
                    slice.start,
                    node.display()
                );
                return Ok(());
            }
            None => SliceFile::create(node, aligned, step)?,
        };

        let mut file = OpenOptions::new().write(true).open(&target.path)?;
        if self.lock_writes {
            lock_exclusive(&file)?;
        }
        let slot = (aligned - target.start) / step;
        let end_slot = file.metadata()?.len() / SLOT_BYTES;
        if slot >= end_slot + self.max_slice_gap {
            // Too far past the end of this slice; start a fresh one.
            let fresh = SliceFile::create(node, aligned, step)?;
            let mut file = OpenOptions::new().write(true).open(&fresh.path)?;
            file.write_all(&datapoint.value.to_bits().to_be_bytes())?;
            return Ok(());
        }
        if slot > end_slot {
            // Pad the gap with NaN so slot arithmetic stays valid.
            file.seek(SeekFrom::End(0))?;
            let nan = f64::NAN.to_bits().to_be_bytes();
            for _ in end_slot..slot {
                file.write_all(&nan)?;
            }
        } else {
            file.seek(SeekFrom::Start(slot * SLOT_BYTES))?;
        }
        file.write_all(&datapoint.value.to_bits().to_be_bytes())?;
        Ok(())
    }
}

#[async_trait]
impl TimeSeriesDatabase for CeresDatabase {
    fn plugin_name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn aggregation_methods(&self) -> &'static [&'static str] {
        AGGREGATION_METHODS
    }

    fn graphite_url(&self) -> &str {
        &self.graphite_url
    }

    async fn write(&self, metric: &str, datapoints: &[Datapoint]) -> Result<(), StorageError> {
        let metadata = self.read_metadata(metric)?;
        let step = metadata
            .get("timeStep")
            .and_then(Value::as_u64)
            .ok_or_else(|| StorageError::Corrupt(format!("{metric} has no timeStep")))?;
        if step == 0 {
            return Err(StorageError::Corrupt(format!("{metric} has a zero timeStep")));
        }
        let node = self.node_path(metric);
        for datapoint in datapoints {
            self.write_point(&node, step, datapoint)?;
        }
        Ok(())
    }

    async fn exists(&self, metric: &str) -> bool {
        self.node_path(metric).join(NODE_METADATA_FILE).exists()
    }

    async fn create(
        &self,
        metric: &str,
        retentions: &[Retention],
        x_files_factor: f64,
        aggregation_method: &str,
    ) -> Result<(), StorageError> {
        if retentions.is_empty() {
            return Err(StorageError::InvalidConfiguration(
                "at least one retention is required".to_string(),
            ));
        }
        if retentions[0].seconds_per_point == 0 {
            return Err(StorageError::InvalidConfiguration(
                "timeStep must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&x_files_factor) {
            return Err(StorageError::InvalidConfiguration(format!(
                "xFilesFactor {x_files_factor} is outside [0, 1]"
            )));
        }
        if !AGGREGATION_METHODS.contains(&aggregation_method) {
            return Err(StorageError::InvalidConfiguration(format!(
                "unknown aggregation method \"{aggregation_method}\""
            )));
        }

        let node = self.node_path(metric);
        if node.join(NODE_METADATA_FILE).exists() {
            return Err(StorageError::InvalidConfiguration(format!(
                "{} already exists",
                node.display()
            )));
        }
        fs::create_dir_all(&node)?;

        let mut metadata = Map::new();
        metadata.insert(
            "timeStep".to_string(),
            Value::from(retentions[0].seconds_per_point),
        );
        metadata.insert(
            "retentions".to_string(),
            serde_json::to_value(retentions).map_err(|err| StorageError::Corrupt(err.to_string()))?,
        );
        metadata.insert("xFilesFactor".to_string(), Value::from(x_files_factor));
        metadata.insert(
            "aggregationMethod".to_string(),
            Value::from(aggregation_method),
        );
        self.write_metadata(metric, &metadata)?;
        debug!("created ceres node {}", node.display());
        Ok(())
    }

    async fn get_metadata(
        &self,
        metric: &str,
        key: &str,
    ) -> Result<Value, StorageError> {
        let metadata = self.read_metadata(metric)?;
        metadata
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::UnsupportedMetadata(key.to_string()))
    }

    async fn set_metadata(
        &self,
        metric: &str,
        key: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        let mut metadata = self.read_metadata(metric)?;
        metadata.insert(key.to_string(), value);
        self.write_metadata(metric, &metadata)
    }

    fn get_filesystem_path(&self, metric: &str) -> Option<PathBuf> {
        Some(self.node_path(metric))
    }
}

struct SliceFile {
    path: PathBuf,
    start: u64,
    step: u64,
}

impl SliceFile {
    fn parse(path: PathBuf) -> Option<Self> {
        if path.extension()?.to_str()? != SLICE_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let (start, step) = stem.split_once('@')?;
        Some(Self {
            start: start.parse().ok()?,
            step: step.parse().ok()?,
            path,
        })
    }

    fn create(node: &PathBuf, start: u64, step: u64) -> Result<Self, StorageError> {
        let path = node.join(format!("{start}@{step}.{SLICE_EXTENSION}"));
        File::create(&path)?;
        Ok(Self { path, start, step })
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> Result<(), StorageError> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if rc != 0 {
        return Err(StorageError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> Result<(), StorageError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn database(dir: &TempDir) -> CeresDatabase {
        CeresDatabase::new(&Settings {
            local_data_dir: dir.path().to_path_buf(),
            ceres_max_slice_gap: 4,
            ..Settings::default()
        })
    }

    fn slice_values(path: &PathBuf) -> Vec<f64> {
        fs::read(path)
            .unwrap()
            .chunks(8)
            .map(|chunk| f64::from_bits(u64::from_be_bytes(chunk.try_into().unwrap())))
            .collect()
    }

    #[tokio::test]
    async fn create_builds_a_node_directory() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);
        db.create("a.b.c", &[Retention::new(60, 10)], 0.5, "sum")
            .await
            .unwrap();

        assert!(db.exists("a.b.c").await);
        let node = db.get_filesystem_path("a.b.c").unwrap();
        assert!(node.ends_with("a/b/c"), "{}", node.display());
        assert!(node.join(".ceres-node").exists());
        assert!(db
            .create("a.b.c", &[Retention::new(60, 10)], 0.5, "sum")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn metadata_supports_arbitrary_keys() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);
        db.create("m", &[Retention::new(60, 10)], 0.5, "average")
            .await
            .unwrap();

        assert_eq!(
            db.get_metadata("m", "aggregationMethod").await.unwrap(),
            serde_json::json!("average")
        );
        assert_eq!(
            db.get_metadata("m", "timeStep").await.unwrap(),
            serde_json::json!(60)
        );
        db.set_metadata("m", "owner", serde_json::json!("team-metrics"))
            .await
            .unwrap();
        assert_eq!(
            db.get_metadata("m", "owner").await.unwrap(),
            serde_json::json!("team-metrics")
        );
        assert!(matches!(
            db.get_metadata("m", "nonsense").await,
            Err(StorageError::UnsupportedMetadata(_))
        ));
    }

    #[tokio::test]
    async fn consecutive_writes_fill_one_slice() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);
        db.create("m", &[Retention::new(60, 100)], 0.5, "average")
            .await
            .unwrap();

        db.write(
            "m",
            &[
                Datapoint::new(6000, 1.0),
                Datapoint::new(6060, 2.0),
                Datapoint::new(6120, 3.0),
            ],
        )
        .await
        .unwrap();

        let node = db.get_filesystem_path("m").unwrap();
        let slice = node.join("6000@60.slice");
        assert!(slice.exists());
        assert_eq!(slice_values(&slice), vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn small_gaps_are_padded_with_nan() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);
        db.create("m", &[Retention::new(60, 100)], 0.5, "average")
            .await
            .unwrap();

        db.write("m", &[Datapoint::new(6000, 1.0), Datapoint::new(6180, 4.0)])
            .await
            .unwrap();

        let slice = db.get_filesystem_path("m").unwrap().join("6000@60.slice");
        let values = slice_values(&slice);
        assert_eq!(values.len(), 4);
        assert_eq!(values[0], 1.0);
        assert!(values[1].is_nan());
        assert!(values[2].is_nan());
        assert_eq!(values[3], 4.0);
    }

    #[tokio::test]
    async fn large_gaps_start_a_new_slice() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);
        db.create("m", &[Retention::new(60, 100)], 0.5, "average")
            .await
            .unwrap();

        // Gap of 10 slots with max_slice_gap 4.
        db.write("m", &[Datapoint::new(6000, 1.0), Datapoint::new(6600, 9.0)])
            .await
            .unwrap();

        let node = db.get_filesystem_path("m").unwrap();
        assert!(node.join("6000@60.slice").exists());
        assert!(node.join("6600@60.slice").exists());
        assert_eq!(slice_values(&node.join("6600@60.slice")), vec![9.0]);
    }

    #[tokio::test]
    async fn write_to_unknown_metric_is_not_found() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir);
        let err = db.write("nope", &[Datapoint::new(1, 1.0)]).await.unwrap_err();
        assert!(matches!(err, StorageError::MetricNotFound(_)));
    }
}
