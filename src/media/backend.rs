use crate::error::MediaError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Container used for recordings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingFormat {
    Fmp4,
    Mpegts,
}

impl RecordingFormat {
    /// Accepts the backend names plus the common file extension aliases
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fmp4" | "mp4" => Some(Self::Fmp4),
            "mpegts" | "ts" => Some(Self::Mpegts),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fmp4 => "fmp4",
            Self::Mpegts => "mpegts",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Fmp4 => "mp4",
            Self::Mpegts => "ts",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    Jpg,
    Png,
}

impl SnapshotFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpg => "jpg",
            Self::Png => "png",
        }
    }
}

/// Runtime state of one media server path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub name: String,
    /// A publisher is connected and tracks are available
    pub ready: bool,
    pub source: Option<String>,
    pub readers: u32,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealth {
    pub status: HealthState,
    pub response_time_ms: u64,
    pub consecutive_failures: u32,
    pub details: String,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendMetrics {
    pub active_streams: usize,
    pub ready_streams: usize,
    pub total_readers: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub requests_total: u64,
    pub request_errors: u64,
    pub average_response_ms: f64,
}

/// Control surface of the media server.
///
/// Every call is bounded by the implementation's timeout; transient
/// transport failures are retried at most once before surfacing.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Publish a V4L2 device under the path `name`
    async fn create_stream(&self, name: &str, device_path: &str) -> Result<(), MediaError>;

    /// Remove a path; unknown paths are not an error
    async fn delete_stream(&self, name: &str) -> Result<(), MediaError>;

    /// Begin recording `name` into `directory`, with files named after `stem`
    async fn start_recording(
        &self,
        name: &str,
        directory: &Path,
        stem: &str,
        format: RecordingFormat,
    ) -> Result<(), MediaError>;

    async fn stop_recording(&self, name: &str) -> Result<(), MediaError>;

    async fn get_stream_status(&self, name: &str) -> Result<StreamStatus, MediaError>;

    async fn list_streams(&self) -> Result<Vec<StreamStatus>, MediaError>;

    /// Never fails; an unreachable backend reports `Unhealthy`
    async fn get_health(&self) -> BackendHealth;

    async fn get_system_metrics(&self) -> Result<BackendMetrics, MediaError>;

    /// Grab a single frame of `name` into `output`, returning the file size
    async fn capture_snapshot(
        &self,
        name: &str,
        output: &Path,
        format: SnapshotFormat,
        quality: u8,
    ) -> Result<u64, MediaError>;
}
