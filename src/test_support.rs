//! Hardware and media server stand-ins shared by unit tests

use crate::camera::{CameraCapabilities, DeviceProber, ProbeResult};
use crate::config::ServiceConfig;
use crate::error::{CameraError, MediaError};
use crate::media::{
    BackendHealth, BackendMetrics, HealthState, MediaBackend, RecordingFormat, SnapshotFormat,
    StreamStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const TEST_JWT_SECRET: &str = "unit-test-secret-that-is-long-enough-for-hs256";

/// Configuration rooted in a temporary directory
pub fn test_config(root: &TempDir) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.security.jwt_secret = TEST_JWT_SECRET.to_string();
    config.camera.device_dir = root.path().join("dev").to_string_lossy().into_owned();
    config.camera.enable_hotplug = false;
    config.camera.poll_interval_seconds = 1;
    config.recording.recordings_path = root.path().join("recordings").to_string_lossy().into_owned();
    config.recording.backend_timeout_seconds = 2;
    config.recording.min_free_space_mb = 0;
    config.snapshots.snapshots_path = root.path().join("snapshots").to_string_lossy().into_owned();
    config.storage.cleanup_enabled = false;
    config
}

/// Prober that reports a fixed 1080p30 camera
#[derive(Default)]
pub struct FakeProber {
    failing: HashSet<String>,
    delay: Option<Duration>,
}

impl FakeProber {
    pub fn failing_on(mut self, device_path: &str) -> Self {
        self.failing.insert(device_path.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl DeviceProber for FakeProber {
    async fn probe(&self, device_path: &str) -> Result<ProbeResult, CameraError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(device_path) {
            return Err(CameraError::ProbeFailed {
                device: device_path.to_string(),
                details: "no capture formats".to_string(),
            });
        }
        Ok(ProbeResult {
            name: "Fake Camera".to_string(),
            capabilities: CameraCapabilities {
                formats: vec!["MJPG".to_string(), "YUYV".to_string()],
                resolutions: vec!["1920x1080".to_string(), "1280x720".to_string()],
                frame_rates: vec![30, 15],
                probed: true,
            },
        })
    }
}

/// Media backend that writes real files instead of talking to a server
#[derive(Default)]
pub struct FakeBackend {
    streams: Mutex<HashMap<String, String>>,
    recording: Mutex<HashSet<String>>,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_snapshot: AtomicBool,
    pub unreachable: AtomicBool,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl FakeBackend {
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn has_stream(&self, name: &str) -> bool {
        self.streams.lock().contains_key(name)
    }

    pub fn is_recording(&self, name: &str) -> bool {
        self.recording.lock().contains(name)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_reachable(&self) -> Result<(), MediaError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(MediaError::Unavailable {
                details: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MediaBackend for FakeBackend {
    async fn create_stream(&self, name: &str, device_path: &str) -> Result<(), MediaError> {
        self.check_reachable()?;
        self.streams
            .lock()
            .insert(name.to_string(), device_path.to_string());
        Ok(())
    }

    async fn delete_stream(&self, name: &str) -> Result<(), MediaError> {
        self.check_reachable()?;
        self.streams.lock().remove(name);
        self.recording.lock().remove(name);
        Ok(())
    }

    async fn start_recording(
        &self,
        name: &str,
        directory: &Path,
        stem: &str,
        format: RecordingFormat,
    ) -> Result<(), MediaError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_reachable()?;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(MediaError::Http {
                status: 500,
                details: "recording failed".to_string(),
            });
        }
        if !self.has_stream(name) {
            return Err(MediaError::StreamNotFound {
                name: name.to_string(),
            });
        }

        // Segment naming as the media server does it
        let segment: PathBuf = directory.join(format!(
            "{}_{}.{}",
            stem,
            Utc::now().format("%Y-%m-%d_%H-%M-%S-%6f"),
            format.extension()
        ));
        std::fs::write(&segment, vec![0u8; 4096]).map_err(|e| MediaError::Unavailable {
            details: e.to_string(),
        })?;
        self.recording.lock().insert(name.to_string());
        Ok(())
    }

    async fn stop_recording(&self, name: &str) -> Result<(), MediaError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_reachable()?;
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(MediaError::Http {
                status: 500,
                details: "stop failed".to_string(),
            });
        }
        self.recording.lock().remove(name);
        Ok(())
    }

    async fn get_stream_status(&self, name: &str) -> Result<StreamStatus, MediaError> {
        self.check_reachable()?;
        if !self.has_stream(name) {
            return Err(MediaError::StreamNotFound {
                name: name.to_string(),
            });
        }
        Ok(StreamStatus {
            name: name.to_string(),
            ready: true,
            source: Some("publisher".to_string()),
            ..StreamStatus::default()
        })
    }

    async fn list_streams(&self) -> Result<Vec<StreamStatus>, MediaError> {
        self.check_reachable()?;
        let mut names: Vec<String> = self.streams.lock().keys().cloned().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| StreamStatus {
                name,
                ready: true,
                ..StreamStatus::default()
            })
            .collect())
    }

    async fn get_health(&self) -> BackendHealth {
        let reachable = self.check_reachable().is_ok();
        BackendHealth {
            status: if reachable {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            },
            response_time_ms: 1,
            consecutive_failures: if reachable { 0 } else { 1 },
            details: if reachable { "ok" } else { "connection refused" }.to_string(),
            checked_at: Utc::now(),
        }
    }

    async fn get_system_metrics(&self) -> Result<BackendMetrics, MediaError> {
        self.check_reachable()?;
        let streams = self.streams.lock().len();
        Ok(BackendMetrics {
            active_streams: streams,
            ready_streams: streams,
            ..BackendMetrics::default()
        })
    }

    async fn capture_snapshot(
        &self,
        _name: &str,
        output: &Path,
        _format: SnapshotFormat,
        quality: u8,
    ) -> Result<u64, MediaError> {
        self.pause().await;
        self.check_reachable()?;
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(MediaError::Snapshot {
                details: "no frame received".to_string(),
            });
        }
        let bytes = vec![0xFFu8; 512 + quality as usize * 10];
        std::fs::write(output, &bytes).map_err(|e| MediaError::Snapshot {
            details: e.to_string(),
        })?;
        Ok(bytes.len() as u64)
    }
}
