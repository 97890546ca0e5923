use crate::config::{ServiceConfig, StorageConfig};
use crate::error::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Files modified more recently than this are never removed by cleanup
const MIN_CLEANUP_AGE: Duration = Duration::from_secs(60);

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Upper bound on `max_age_days` (one hundred years)
pub const MAX_RETENTION_DAYS: u64 = 36_500;

/// Which managed directory a file lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Recordings,
    Snapshots,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Recordings => "recordings",
            FileKind::Snapshots => "snapshots",
        }
    }

    /// URL under which the HTTP server exposes this kind of file
    pub fn download_url(&self, filename: &str) -> String {
        format!("/files/{}/{}", self.as_str(), filename)
    }
}

/// Listing entry for a stored file
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub filename: String,
    pub file_size: u64,
    pub modified_time: DateTime<Utc>,
    pub download_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileListing {
    pub files: Vec<FileEntry>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Detailed view of one stored file
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub filename: String,
    pub file_size: u64,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: DateTime<Utc>,
    pub download_url: String,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicyType {
    Age,
    Size,
    Manual,
}

impl RetentionPolicyType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "age" => Some(Self::Age),
            "size" => Some(Self::Size),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub policy_type: RetentionPolicyType,
    pub max_age_days: u64,
    pub max_size_gb: f64,
    pub enabled: bool,
}

impl RetentionPolicy {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            policy_type: RetentionPolicyType::parse(&config.retention_policy)
                .unwrap_or(RetentionPolicyType::Age),
            max_age_days: config.max_age_days,
            max_size_gb: config.max_size_gb,
            enabled: config.cleanup_enabled,
        }
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.max_age_days > MAX_RETENTION_DAYS {
            return Err(StorageError::InvalidPolicy {
                details: format!("max_age_days must not exceed {}", MAX_RETENTION_DAYS),
            });
        }
        match self.policy_type {
            RetentionPolicyType::Age if self.max_age_days == 0 => Err(StorageError::InvalidPolicy {
                details: "max_age_days must be greater than 0".to_string(),
            }),
            RetentionPolicyType::Size if !self.max_size_gb.is_finite() || self.max_size_gb <= 0.0 => {
                Err(StorageError::InvalidPolicy {
                    details: "max_size_gb must be greater than 0".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Oldest modification time an age policy keeps
    fn age_cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, StorageError> {
        let invalid = || StorageError::InvalidPolicy {
            details: format!("max_age_days {} is out of range", self.max_age_days),
        };
        let days = i64::try_from(self.max_age_days).map_err(|_| invalid())?;
        let age = chrono::Duration::try_days(days).ok_or_else(invalid)?;
        now.checked_sub_signed(age).ok_or_else(invalid)
    }
}

/// Clears the cleanup-in-progress flag when a run ends, even by unwinding
struct CleanupFlag(Arc<AtomicBool>);

impl Drop for CleanupFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub total_space: u64,
    pub used_space: u64,
    pub available_space: u64,
    pub usage_percentage: f64,
    pub recordings_size: u64,
    pub snapshots_size: u64,
    pub recordings_count: usize,
    pub snapshots_count: usize,
    pub low_space_warning: bool,
}

/// Cleanup operation result
#[derive(Debug, Clone, Serialize)]
pub struct CleanupResult {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
    pub policy: RetentionPolicyType,
}

/// Manages the recordings and snapshots directories
#[derive(Clone)]
pub struct FileStore {
    recordings_dir: PathBuf,
    snapshots_dir: PathBuf,
    config: StorageConfig,
    policy: Arc<parking_lot::RwLock<RetentionPolicy>>,
    cleanup_running: Arc<AtomicBool>,
    last_cleanup: Arc<parking_lot::RwLock<Option<DateTime<Utc>>>>,
    cancel: CancellationToken,
}

impl FileStore {
    pub fn new(recordings_dir: PathBuf, snapshots_dir: PathBuf, config: StorageConfig) -> Self {
        Self {
            recordings_dir,
            snapshots_dir,
            policy: Arc::new(parking_lot::RwLock::new(RetentionPolicy::from_config(
                &config,
            ))),
            config,
            cleanup_running: Arc::new(AtomicBool::new(false)),
            last_cleanup: Arc::new(parking_lot::RwLock::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    /// Relative directories are anchored at the working directory, since the
    /// media server resolves record paths against its own
    pub fn from_config(config: &ServiceConfig) -> Self {
        let absolute = |dir: PathBuf| {
            if dir.is_absolute() {
                dir
            } else {
                std::env::current_dir().map(|cwd| cwd.join(&dir)).unwrap_or(dir)
            }
        };
        Self::new(
            absolute(config.recordings_dir()),
            absolute(config.snapshots_dir()),
            config.storage.clone(),
        )
    }

    /// Create the managed directories and launch the cleanup scheduler
    pub async fn start(&self) -> Result<(), StorageError> {
        for dir in [&self.recordings_dir, &self.snapshots_dir] {
            if !dir.exists() {
                fs::create_dir_all(dir).await.map_err(|e| io_error(dir, e))?;
                info!("Created storage directory: {}", dir.display());
            }
        }

        if self.config.cleanup_enabled {
            self.start_cleanup_scheduler();
        }

        info!(
            "File store ready (recordings: {}, snapshots: {})",
            self.recordings_dir.display(),
            self.snapshots_dir.display()
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        debug!("File store stopped");
    }

    pub fn dir(&self, kind: FileKind) -> &Path {
        match kind {
            FileKind::Recordings => &self.recordings_dir,
            FileKind::Snapshots => &self.snapshots_dir,
        }
    }

    /// Resolve a client-supplied filename inside a managed directory
    pub fn resolve(&self, kind: FileKind, filename: &str) -> Result<PathBuf, StorageError> {
        validate_filename(filename)?;
        Ok(self.dir(kind).join(filename))
    }

    /// List files newest first
    pub async fn list_files(
        &self,
        kind: FileKind,
        limit: usize,
        offset: usize,
    ) -> Result<FileListing, StorageError> {
        let mut entries = self.scan(kind).await?;
        entries.sort_by(|a, b| {
            b.modified_time
                .cmp(&a.modified_time)
                .then_with(|| a.filename.cmp(&b.filename))
        });

        let total = entries.len();
        let files = entries.into_iter().skip(offset).take(limit).collect();

        Ok(FileListing {
            files,
            total,
            limit,
            offset,
        })
    }

    pub async fn file_info(&self, kind: FileKind, filename: &str) -> Result<FileInfo, StorageError> {
        let path = self.resolve(kind, filename)?;
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                return Err(StorageError::FileNotFound {
                    filename: filename.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound {
                    filename: filename.to_string(),
                })
            }
            Err(e) => return Err(io_error(&path, e)),
        };

        Ok(FileInfo {
            filename: filename.to_string(),
            file_size: metadata.len(),
            created_time: metadata.created().ok().map(DateTime::<Utc>::from),
            modified_time: modified_time(&metadata),
            download_url: kind.download_url(filename),
            path,
        })
    }

    /// Delete a file, returning the number of bytes freed
    pub async fn delete_file(&self, kind: FileKind, filename: &str) -> Result<u64, StorageError> {
        let info = self.file_info(kind, filename).await?;
        fs::remove_file(&info.path)
            .await
            .map_err(|e| io_error(&info.path, e))?;

        info!("Deleted {} file {} ({} bytes)", kind.as_str(), filename, info.file_size);
        Ok(info.file_size)
    }

    /// Settle the on-disk name of a finished recording.
    ///
    /// The media server appends a timestamp to each segment it writes; a
    /// single segment is renamed to `<stem>.<extension>`, later segments
    /// keep their own names.
    pub async fn finalize_recording(
        &self,
        stem: &str,
        extension: &str,
    ) -> Result<Option<FileInfo>, StorageError> {
        let filename = format!("{}.{}", stem, extension);
        match self.file_info(FileKind::Recordings, &filename).await {
            Ok(info) => return Ok(Some(info)),
            Err(StorageError::FileNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let prefix = format!("{}_", stem);
        let suffix = format!(".{}", extension);
        let mut segments: Vec<String> = self
            .scan(FileKind::Recordings)
            .await?
            .into_iter()
            .map(|entry| entry.filename)
            .filter(|name| name.starts_with(&prefix) && name.ends_with(&suffix))
            .collect();
        segments.sort();

        let first = match segments.first() {
            Some(first) => first,
            None => {
                debug!("No segments found for recording {}", stem);
                return Ok(None);
            }
        };

        let from = self.recordings_dir.join(first);
        let to = self.recordings_dir.join(&filename);
        fs::rename(&from, &to).await.map_err(|e| io_error(&from, e))?;
        debug!("Renamed segment {} to {}", first, filename);

        self.file_info(FileKind::Recordings, &filename).await.map(Some)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        self.policy.read().clone()
    }

    pub fn set_retention_policy(&self, policy: RetentionPolicy) -> Result<(), StorageError> {
        policy.validate()?;
        info!(
            "Retention policy set to {:?} (enabled: {}, max_age_days: {}, max_size_gb: {})",
            policy.policy_type, policy.enabled, policy.max_age_days, policy.max_size_gb
        );
        *self.policy.write() = policy;
        Ok(())
    }

    pub fn last_cleanup(&self) -> Option<DateTime<Utc>> {
        *self.last_cleanup.read()
    }

    /// Apply the current retention policy
    pub async fn cleanup_old_files(&self) -> Result<CleanupResult, StorageError> {
        let policy = self.retention_policy();

        if self.cleanup_running.swap(true, Ordering::SeqCst) {
            debug!("Cleanup already running, skipping");
            return Ok(CleanupResult {
                files_deleted: 0,
                bytes_freed: 0,
                errors: vec!["Cleanup already running".to_string()],
                policy: policy.policy_type,
            });
        }

        let flag = CleanupFlag(Arc::clone(&self.cleanup_running));
        let result = self.perform_cleanup(&policy).await;
        drop(flag);
        *self.last_cleanup.write() = Some(Utc::now());

        match &result {
            Ok(cleanup) => info!(
                "Cleanup completed: {} files deleted, {} bytes freed, {} errors",
                cleanup.files_deleted,
                cleanup.bytes_freed,
                cleanup.errors.len()
            ),
            Err(e) => error!("Cleanup failed: {}", e),
        }

        result
    }

    async fn perform_cleanup(&self, policy: &RetentionPolicy) -> Result<CleanupResult, StorageError> {
        let mut result = CleanupResult {
            files_deleted: 0,
            bytes_freed: 0,
            errors: Vec::new(),
            policy: policy.policy_type,
        };

        if !policy.enabled || policy.policy_type == RetentionPolicyType::Manual {
            debug!("Retention policy is manual or disabled, nothing to clean");
            return Ok(result);
        }

        let mut candidates = Vec::new();
        for kind in [FileKind::Recordings, FileKind::Snapshots] {
            for entry in self.scan(kind).await? {
                candidates.push((kind, entry));
            }
        }
        // Oldest first
        candidates.sort_by(|a, b| a.1.modified_time.cmp(&b.1.modified_time));

        let now = Utc::now();
        let safety_cutoff = now - chrono::Duration::from_std(MIN_CLEANUP_AGE).unwrap_or_default();

        let victims: Vec<(FileKind, FileEntry)> = match policy.policy_type {
            RetentionPolicyType::Age => {
                let cutoff = policy.age_cutoff(now)?;
                candidates
                    .into_iter()
                    .filter(|(_, entry)| entry.modified_time < cutoff)
                    .collect()
            }
            RetentionPolicyType::Size => {
                let limit = (policy.max_size_gb * BYTES_PER_GB) as u64;
                let mut total: u64 = candidates.iter().map(|(_, e)| e.file_size).sum();
                let mut selected = Vec::new();
                for candidate in candidates {
                    if total <= limit {
                        break;
                    }
                    total = total.saturating_sub(candidate.1.file_size);
                    selected.push(candidate);
                }
                selected
            }
            RetentionPolicyType::Manual => Vec::new(),
        };

        for (kind, entry) in victims {
            if entry.modified_time >= safety_cutoff {
                warn!("Refusing to delete recent file {}", entry.filename);
                continue;
            }
            match self.delete_file(kind, &entry.filename).await {
                Ok(bytes) => {
                    result.files_deleted += 1;
                    result.bytes_freed += bytes;
                }
                Err(e) => {
                    let message = format!("Failed to delete {}: {}", entry.filename, e);
                    error!("{}", message);
                    result.errors.push(message);
                }
            }
        }

        Ok(result)
    }

    pub async fn get_storage_info(&self) -> Result<StorageInfo, StorageError> {
        let (total_space, available_space) = filesystem_space(&self.recordings_dir)
            .await
            .map_err(|e| io_error(&self.recordings_dir, e))?;

        let recordings = self.scan(FileKind::Recordings).await?;
        let snapshots = self.scan(FileKind::Snapshots).await?;

        let used_space = total_space.saturating_sub(available_space);
        let usage_percentage = if total_space == 0 {
            0.0
        } else {
            used_space as f64 / total_space as f64 * 100.0
        };

        Ok(StorageInfo {
            total_space,
            used_space,
            available_space,
            usage_percentage,
            recordings_size: recordings.iter().map(|e| e.file_size).sum(),
            snapshots_size: snapshots.iter().map(|e| e.file_size).sum(),
            recordings_count: recordings.len(),
            snapshots_count: snapshots.len(),
            low_space_warning: usage_percentage >= self.config.low_space_threshold_percent,
        })
    }

    /// Fail with `InsufficientSpace` when the filesystem holding `kind` is short
    pub async fn ensure_free_space(
        &self,
        kind: FileKind,
        required_bytes: u64,
    ) -> Result<(), StorageError> {
        let dir = self.dir(kind);
        match filesystem_space(dir).await {
            Ok((_, available_bytes)) if available_bytes < required_bytes => {
                warn!(
                    "Insufficient space in {}: {} bytes available, {} required",
                    dir.display(),
                    available_bytes,
                    required_bytes
                );
                Err(StorageError::InsufficientSpace {
                    available_bytes,
                    required_bytes,
                })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // Unknown free space does not block capture
                warn!("Could not query free space for {}: {}", dir.display(), e);
                Ok(())
            }
        }
    }

    async fn scan(&self, kind: FileKind) -> Result<Vec<FileEntry>, StorageError> {
        let dir = self.dir(kind);
        let mut reader = match fs::read_dir(dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(dir, e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| io_error(dir, e))? {
            let filename = match entry.file_name().into_string() {
                Ok(name) if !name.starts_with('.') => name,
                _ => continue,
            };
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };

            entries.push(FileEntry {
                download_url: kind.download_url(&filename),
                file_size: metadata.len(),
                modified_time: modified_time(&metadata),
                filename,
            });
        }

        Ok(entries)
    }

    fn start_cleanup_scheduler(&self) {
        let store = self.clone();
        let base_interval = Duration::from_secs(self.config.cleanup_interval_seconds.max(1));
        let max_interval = Duration::from_secs(24 * 3600).max(base_interval);

        info!("Starting cleanup scheduler (every {:?})", base_interval);

        tokio::spawn(async move {
            let mut current_interval = base_interval;
            let mut consecutive_failures = 0u32;

            loop {
                tokio::select! {
                    _ = store.cancel.cancelled() => {
                        debug!("Cleanup scheduler stopped");
                        break;
                    }
                    _ = tokio::time::sleep(current_interval) => {}
                }

                match store.cleanup_old_files().await {
                    Ok(result) => {
                        current_interval = base_interval;
                        consecutive_failures = 0;
                        if !result.errors.is_empty() {
                            warn!("Cleanup completed with {} errors", result.errors.len());
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        error!("Scheduled cleanup failed (attempt {}): {}", consecutive_failures, e);

                        current_interval = std::cmp::min(current_interval * 2, max_interval);
                        warn!("Increasing cleanup interval to {:?}", current_interval);
                    }
                }
            }
        });
    }
}

/// Accept bare file names only
pub fn validate_filename(filename: &str) -> Result<(), StorageError> {
    let invalid = filename.is_empty()
        || filename.starts_with('.')
        || filename.contains(['/', '\\', '\0'])
        || filename.len() > 255;

    if invalid {
        return Err(StorageError::InvalidFilename {
            filename: filename.to_string(),
        });
    }
    Ok(())
}

fn modified_time(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .into()
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Total and available bytes of the filesystem holding `path`
async fn filesystem_space(path: &Path) -> std::io::Result<(u64, u64)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || statvfs_space(&path))
        .await
        .map_err(std::io::Error::other)?
}

#[cfg(unix)]
fn statvfs_space(path: &Path) -> std::io::Result<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // SAFETY: c_path is NUL terminated and stat is a plain C struct
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        #[allow(clippy::unnecessary_cast)]
        let (block, blocks, available) = (
            stat.f_frsize as u64,
            stat.f_blocks as u64,
            stat.f_bavail as u64,
        );
        Ok((blocks * block, available * block))
    }
}

#[cfg(not(unix))]
fn statvfs_space(_path: &Path) -> std::io::Result<(u64, u64)> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "free space query unsupported on this platform",
    ))
}
