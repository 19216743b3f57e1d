//! Whisper-style storage plugin: one fixed-size round-robin file per
//! metric under the data directory.
//!
//! File layout is a bincode header (aggregation method, xFilesFactor,
//! archive table) followed by one slot array per archive; each slot is a
//! big-endian `(timestamp, value)` pair. Datapoints land in the highest
//! precision archive whose retention still covers their age.
//!
//! The sparse/fallocate/lock/fadvise toggles are requests checked against
//! a capability probe at init; enabled-but-unsupported logs an error and
//! the plugin continues with the feature disabled.

use super::{StorageError, Retention, TimeSeriesDatabase};
use crate::config::Settings;
use crate::metric::{tag_encode, Datapoint};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

pub const PLUGIN_NAME: &str = "whisper";

pub const AGGREGATION_METHODS: &[&str] = &[
    "average", "sum", "last", "max", "min", "avg_zero", "absmax", "absmin",
];

/// Whether this platform can preallocate with fallocate.
pub const CAN_FALLOCATE: bool = cfg!(target_os = "linux");
/// Whether this platform can take advisory file locks.
pub const CAN_LOCK: bool = cfg!(unix);
/// Whether this platform can issue fadvise hints.
pub const CAN_FADVISE: bool = cfg!(target_os = "linux");

const MAGIC: [u8; 4] = *b"cwsp";
const SLOT_BYTES: u64 = 16;
const ZERO_CHUNK: usize = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum AggregationMethod {
    Average,
    Sum,
    Last,
    Max,
    Min,
    AvgZero,
    AbsMax,
    AbsMin,
}

impl AggregationMethod {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "average" => Some(Self::Average),
            "sum" => Some(Self::Sum),
            "last" => Some(Self::Last),
            "max" => Some(Self::Max),
            "min" => Some(Self::Min),
            "avg_zero" => Some(Self::AvgZero),
            "absmax" => Some(Self::AbsMax),
            "absmin" => Some(Self::AbsMin),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Sum => "sum",
            Self::Last => "last",
            Self::Max => "max",
            Self::Min => "min",
            Self::AvgZero => "avg_zero",
            Self::AbsMax => "absmax",
            Self::AbsMin => "absmin",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    magic: [u8; 4],
    aggregation: AggregationMethod,
    x_files_factor: f64,
    archives: Vec<ArchiveInfo>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ArchiveInfo {
    seconds_per_point: u32,
    points: u32,
    offset: u64,
}

impl ArchiveInfo {
    fn retention_secs(&self) -> u64 {
        u64::from(self.seconds_per_point) * u64::from(self.points)
    }
}

pub struct WhisperDatabase {
    data_dir: PathBuf,
    graphite_url: String,
    sparse_create: bool,
    fallocate_create: bool,
    autoflush: bool,
    lock_writes: bool,
    fadvise_random: bool,
}

pub(super) fn construct(settings: &Settings) -> Result<Box<dyn TimeSeriesDatabase>, StorageError> {
    Ok(Box::new(WhisperDatabase::new(settings)))
}

impl WhisperDatabase {
    pub fn new(settings: &Settings) -> Self {
        if settings.whisper_autoflush {
            info!("enabling whisper autoflush");
        }

        let fallocate_create = if settings.whisper_fallocate_create {
            if CAN_FALLOCATE {
                info!("enabling whisper fallocate support");
                true
            } else {
                error!("whisper_fallocate_create is enabled but unsupported on this platform");
                false
            }
        } else {
            false
        };

        let lock_writes = if settings.whisper_lock_writes {
            if CAN_LOCK {
                info!("enabling whisper file locking");
                true
            } else {
                error!("whisper_lock_writes is enabled but unsupported on this platform");
                false
            }
        } else {
            false
        };

        let fadvise_random = if settings.whisper_fadvise_random {
            if CAN_FADVISE {
                info!("enabling whisper fadvise_random support");
                true
            } else {
                error!("whisper_fadvise_random is enabled but unsupported on this platform");
                false
            }
        } else {
            false
        };

        Self {
            data_dir: settings.local_data_dir.clone(),
            graphite_url: settings.graphite_url.clone(),
            sparse_create: settings.whisper_sparse_create,
            fallocate_create,
            autoflush: settings.whisper_autoflush,
            lock_writes,
            fadvise_random,
        }
    }

    fn filesystem_path(&self, metric: &str) -> PathBuf {
        self.data_dir.join(format!(
            "{}.wsp",
            tag_encode(metric, std::path::MAIN_SEPARATOR_STR)
        ))
    }

    fn open_existing(&self, metric: &str) -> Result<File, StorageError> {
        let path = self.filesystem_path(metric);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    StorageError::MetricNotFound(metric.to_string())
                } else {
                    StorageError::Io(err)
                }
            })?;
        if self.fadvise_random {
            advise_random_access(&file);
        }
        if self.lock_writes {
            lock_exclusive(&file)?;
        }
        Ok(file)
    }

    fn read_header(file: &mut File) -> Result<Header, StorageError> {
        let header: Header = bincode::deserialize_from(&mut *file).map_err(corrupt)?;
        if header.magic != MAGIC {
            return Err(StorageError::Corrupt("bad whisper magic".to_string()));
        }
        Ok(header)
    }

    fn preallocate(&self, file: &mut File, written: u64, total: u64) -> Result<(), StorageError> {
        if self.sparse_create {
            file.set_len(total)?;
            return Ok(());
        }
        if self.fallocate_create {
            return fallocate(file, total);
        }
        let mut remaining = (total - written) as usize;
        let zeros = [0u8; ZERO_CHUNK];
        while remaining > 0 {
            let chunk = remaining.min(ZERO_CHUNK);
            file.write_all(&zeros[..chunk])?;
            remaining -= chunk;
        }
        Ok(())
    }
}

#[async_trait]
impl TimeSeriesDatabase for WhisperDatabase {
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
        let mut file = self.open_existing(metric)?;
        let header = Self::read_header(&mut file)?;
        let now = epoch_now();

        for datapoint in datapoints {
            let age = now.saturating_sub(datapoint.timestamp);
            let Some(archive) = header
                .archives
                .iter()
                .find(|archive| age <= archive.retention_secs())
            else {
                debug!(
                    "datapoint for {} at {} is older than every archive, skipping",
                    metric, datapoint.timestamp
                );
                continue;
            };
            let slot = (datapoint.timestamp / u64::from(archive.seconds_per_point))
                % u64::from(archive.points);
            file.seek(SeekFrom::Start(archive.offset + slot * SLOT_BYTES))?;
            file.write_all(&datapoint.timestamp.to_be_bytes())?;
            file.write_all(&datapoint.value.to_bits().to_be_bytes())?;
        }

        if self.autoflush {
            file.sync_data()?;
        }
        Ok(())
    }

    async fn exists(&self, metric: &str) -> bool {
        self.filesystem_path(metric).exists()
    }

    async fn create(
        &self,
        metric: &str,
        retentions: &[Retention],
        x_files_factor: f64,
        aggregation_method: &str,
    ) -> Result<(), StorageError> {
        self.validate_archive_list(retentions)?;
        if !(0.0..=1.0).contains(&x_files_factor) {
            return Err(StorageError::InvalidConfiguration(format!(
                "xFilesFactor {x_files_factor} is outside [0, 1]"
            )));
        }
        let aggregation = AggregationMethod::from_name(aggregation_method).ok_or_else(|| {
            StorageError::InvalidConfiguration(format!(
                "unknown aggregation method \"{aggregation_method}\""
            ))
        })?;

        let path = self.filesystem_path(metric);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut header = Header {
            magic: MAGIC,
            aggregation,
            x_files_factor,
            archives: retentions
                .iter()
                .map(|retention| ArchiveInfo {
                    seconds_per_point: retention.seconds_per_point,
                    points: retention.points,
                    offset: 0,
                })
                .collect(),
        };
        let header_size = bincode::serialized_size(&header).map_err(corrupt)?;
        let mut offset = header_size;
        for archive in &mut header.archives {
            archive.offset = offset;
            offset += u64::from(archive.points) * SLOT_BYTES;
        }
        let total_size = offset;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    StorageError::InvalidConfiguration(format!("{} already exists", path.display()))
                } else {
                    StorageError::Io(err)
                }
            })?;
        file.write_all(&bincode::serialize(&header).map_err(corrupt)?)?;
        self.preallocate(&mut file, header_size, total_size)?;
        if self.autoflush {
            file.sync_data()?;
        }
        debug!("created whisper file {}", path.display());
        Ok(())
    }

    async fn get_metadata(
        &self,
        metric: &str,
        key: &str,
    ) -> Result<serde_json::Value, StorageError> {
        if key != "aggregationMethod" {
            return Err(StorageError::UnsupportedMetadata(key.to_string()));
        }
        let mut file = self.open_existing(metric)?;
        let header = Self::read_header(&mut file)?;
        Ok(serde_json::Value::String(header.aggregation.name().to_string()))
    }

    async fn set_metadata(
        &self,
        metric: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StorageError> {
        if key != "aggregationMethod" {
            return Err(StorageError::UnsupportedMetadata(key.to_string()));
        }
        let name = value.as_str().ok_or_else(|| {
            StorageError::InvalidConfiguration("aggregationMethod must be a string".to_string())
        })?;
        let aggregation = AggregationMethod::from_name(name).ok_or_else(|| {
            StorageError::InvalidConfiguration(format!("unknown aggregation method \"{name}\""))
        })?;

        let mut file = self.open_existing(metric)?;
        let mut header = Self::read_header(&mut file)?;
        header.aggregation = aggregation;
        // The header is fixed-size for a given archive count, so it can be
        // rewritten in place.
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bincode::serialize(&header).map_err(corrupt)?)?;
        Ok(())
    }

    fn get_filesystem_path(&self, metric: &str) -> Option<PathBuf> {
        Some(self.filesystem_path(metric))
    }

    fn validate_archive_list(&self, archives: &[Retention]) -> Result<(), StorageError> {
        if archives.is_empty() {
            return Err(StorageError::InvalidConfiguration(
                "at least one archive is required".to_string(),
            ));
        }
        if let Some(bad) = archives
            .iter()
            .find(|archive| archive.seconds_per_point == 0 || archive.points == 0)
        {
            return Err(StorageError::InvalidConfiguration(format!(
                "archive ({}s, {} points) must have positive precision and size",
                bad.seconds_per_point, bad.points
            )));
        }
        let mut sorted = archives.to_vec();
        sorted.sort_by_key(|archive| archive.seconds_per_point);
        for pair in sorted.windows(2) {
            let (fine, coarse) = (pair[0], pair[1]);
            if fine.seconds_per_point == coarse.seconds_per_point {
                return Err(StorageError::InvalidConfiguration(format!(
                    "two archives share the same precision of {}s",
                    fine.seconds_per_point
                )));
            }
            if coarse.seconds_per_point % fine.seconds_per_point != 0 {
                return Err(StorageError::InvalidConfiguration(format!(
                    "the {}s archive precision must evenly divide the {}s archive",
                    fine.seconds_per_point, coarse.seconds_per_point
                )));
            }
            if coarse.duration_secs() <= fine.duration_secs() {
                return Err(StorageError::InvalidConfiguration(format!(
                    "the {}s archive must cover a longer span than the {}s archive",
                    coarse.seconds_per_point, fine.seconds_per_point
                )));
            }
            let points_per_consolidation = coarse.seconds_per_point / fine.seconds_per_point;
            if fine.points < points_per_consolidation {
                return Err(StorageError::InvalidConfiguration(format!(
                    "the {}s archive has too few points to consolidate into the {}s archive",
                    fine.seconds_per_point, coarse.seconds_per_point
                )));
            }
        }
        Ok(())
    }
}

fn corrupt(err: impl Display) -> StorageError {
    StorageError::Corrupt(err.to_string())
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
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

#[cfg(target_os = "linux")]
fn fallocate(file: &File, length: u64) -> Result<(), StorageError> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, length as libc::off_t) };
    if rc != 0 {
        return Err(StorageError::Io(std::io::Error::from_raw_os_error(rc)));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn fallocate(file: &File, length: u64) -> Result<(), StorageError> {
    file.set_len(length)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn advise_random_access(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_RANDOM);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_random_access(_file: &File) {}
