use super::session::{RecordingSession, SessionStatus, SnapshotResult, StopReason};
use crate::camera::{CameraDevice, CameraMonitor};
use crate::config::{RecordingConfig, SnapshotConfig};
use crate::error::{CameraError, MediaError, RecordingError, Result, ServiceError};
use crate::events::{EventBus, ServiceEvent};
use crate::media::{MediaBackend, RecordingFormat, SnapshotFormat};
use crate::storage::{validate_filename, FileKind, FileStore};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Per-device writer state; the surrounding async mutex serialises every
/// transition of the device's recording
#[derive(Default)]
struct DeviceSlot {
    active: Option<ActiveRecording>,
}

struct ActiveRecording {
    session: RecordingSession,
    timer: Option<CancellationToken>,
}

/// Status view of a session; terminal sessions carry the time they ended
struct TrackedSession {
    session: RecordingSession,
    retired_at: Option<Instant>,
}

/// Owns recording sessions and snapshot capture for every camera
#[derive(Clone)]
pub struct RecordingManager {
    config: RecordingConfig,
    snapshot_config: SnapshotConfig,
    cameras: CameraMonitor,
    backend: Arc<dyn MediaBackend>,
    store: FileStore,
    event_bus: Arc<EventBus>,
    slots: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<DeviceSlot>>>>>,
    sessions: Arc<Mutex<HashMap<String, TrackedSession>>>,
}

impl RecordingManager {
    pub fn new(
        config: RecordingConfig,
        snapshot_config: SnapshotConfig,
        cameras: CameraMonitor,
        backend: Arc<dyn MediaBackend>,
        store: FileStore,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            snapshot_config,
            cameras,
            backend,
            store,
            event_bus,
            slots: Arc::new(Mutex::new(HashMap::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.config.backend_timeout_seconds)
    }

    fn slot(&self, device_path: &str) -> Arc<tokio::sync::Mutex<DeviceSlot>> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(device_path.to_string()).or_default())
    }

    /// Start recording a connected camera.
    ///
    /// Fails without side effects when the device already has an active
    /// session. The session is only registered once the backend confirms.
    pub async fn start_recording(
        &self,
        device: &str,
        duration_seconds: Option<u64>,
        format: Option<&str>,
    ) -> Result<RecordingSession> {
        let camera = self.cameras.require_camera(device)?;

        if duration_seconds == Some(0) {
            return Err(RecordingError::InvalidParameter {
                details: "duration must be greater than 0 seconds".to_string(),
            }
            .into());
        }

        let format = match format {
            Some(value) => RecordingFormat::parse(value).ok_or_else(|| {
                CameraError::UnsupportedCapability {
                    device: camera.camera_id.clone(),
                    details: format!("recording format '{}' is not supported", value),
                }
            })?,
            None => RecordingFormat::parse(&self.config.default_format)
                .unwrap_or(RecordingFormat::Fmp4),
        };

        self.store
            .ensure_free_space(
                FileKind::Recordings,
                self.config.min_free_space_mb.saturating_mul(BYTES_PER_MB),
            )
            .await?;

        let slot = self.slot(&camera.device_path);
        let mut guard = slot.lock().await;

        if let Some(active) = &guard.active {
            return Err(RecordingError::AlreadyRecording {
                device: camera.camera_id.clone(),
                session_id: active.session.session_id.clone(),
            }
            .into());
        }

        let now = Utc::now();
        let mut session = RecordingSession {
            session_id: Uuid::new_v4().to_string(),
            device_path: camera.device_path.clone(),
            camera_id: camera.camera_id.clone(),
            filename: recording_filename(&camera, now, format),
            status: SessionStatus::Started,
            format,
            start_time: now,
            end_time: None,
            duration_seconds,
            file_size: 0,
            error: None,
            stop_reason: None,
        };

        let outcome = tokio::time::timeout(self.backend_timeout(), self.begin_backend_recording(&session))
            .await
            .unwrap_or_else(|_| {
                Err(MediaError::Timeout {
                    operation: format!("start recording {}", session.camera_id),
                })
            });

        if let Err(e) = outcome {
            error!("Backend refused recording on {}: {}", session.camera_id, e);
            session.status = SessionStatus::Failed;
            session.error = Some(e.to_string());
            session.end_time = Some(Utc::now());
            self.retire(&session);
            self.publish(ServiceEvent::RecordingFailed {
                session,
                error: e.to_string(),
            })
            .await;
            return Err(e.into());
        }

        if self.stream_ready(&session.camera_id).await {
            session.status = SessionStatus::Recording;
        }

        let timer = duration_seconds.map(|seconds| self.spawn_duration_timer(&session, seconds));

        self.sessions.lock().insert(
            session.session_id.clone(),
            TrackedSession {
                session: session.clone(),
                retired_at: None,
            },
        );
        guard.active = Some(ActiveRecording {
            session: session.clone(),
            timer,
        });
        drop(guard);

        info!(
            "Recording {} started on {} ({}, {})",
            session.session_id,
            session.camera_id,
            session.filename,
            match duration_seconds {
                Some(seconds) => format!("{}s", seconds),
                None => "unlimited".to_string(),
            }
        );

        self.publish(ServiceEvent::RecordingStarted {
            session: session.clone(),
        })
        .await;

        Ok(session)
    }

    async fn begin_backend_recording(
        &self,
        session: &RecordingSession,
    ) -> std::result::Result<(), MediaError> {
        let directory = self.store.dir(FileKind::Recordings);
        let result = self
            .backend
            .start_recording(&session.camera_id, directory, session.stem(), session.format)
            .await;

        match result {
            // Stream setup at connect time may have failed; publish it now
            Err(MediaError::StreamNotFound { .. }) => {
                debug!("Stream {} missing, creating before recording", session.camera_id);
                self.backend
                    .create_stream(&session.camera_id, &session.device_path)
                    .await?;
                self.backend
                    .start_recording(&session.camera_id, directory, session.stem(), session.format)
                    .await
            }
            other => other,
        }
    }

    async fn stream_ready(&self, stream: &str) -> bool {
        match tokio::time::timeout(self.backend_timeout(), self.backend.get_stream_status(stream)).await {
            Ok(Ok(status)) => status.ready,
            Ok(Err(e)) => {
                debug!("Could not read stream status of {}: {}", stream, e);
                false
            }
            Err(_) => false,
        }
    }

    fn spawn_duration_timer(&self, session: &RecordingSession, seconds: u64) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let manager = self.clone();
        let device_path = session.device_path.clone();
        let session_id = session.session_id.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!("Duration timer for {} cancelled", session_id);
                }
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                    info!("Recording {} reached its {}s duration", session_id, seconds);
                    if let Err(e) = manager
                        .finish(&device_path, Some(&session_id), StopReason::DurationElapsed)
                        .await
                    {
                        warn!("Automatic stop of {} failed: {}", session_id, e);
                    }
                }
            }
        });

        token
    }

    /// Stop a recording addressed by session id, camera id or device path
    pub async fn stop_recording(&self, target: &str) -> Result<RecordingSession> {
        let tracked = self.tracked_session(target);

        if let Some(session) = tracked {
            if !session.status.is_terminal() {
                if let Some(stopped) = self
                    .finish(&session.device_path, Some(&session.session_id), StopReason::Requested)
                    .await?
                {
                    return Ok(stopped);
                }
            }
            // The duration timer won the race; report its result
            if let Some(session) = self.tracked_session(target).filter(stopped_by_timer) {
                return Ok(session);
            }
            return Err(RecordingError::NoActiveSession {
                target: target.to_string(),
            }
            .into());
        }

        if let Some(device_path) = self.cameras.device_path_for(target) {
            if let Some(stopped) = self.finish(&device_path, None, StopReason::Requested).await? {
                return Ok(stopped);
            }
            if let Some(session) = self.latest_retired_for(&device_path).filter(stopped_by_timer) {
                return Ok(session);
            }
        }

        Err(RecordingError::NoActiveSession {
            target: target.to_string(),
        }
        .into())
    }

    /// Drive the active session of `device_path` to STOPPED (or FAILED).
    ///
    /// Returns `Ok(None)` when there is nothing to stop, including when
    /// `expected_session` has already been replaced or stopped.
    async fn finish(
        &self,
        device_path: &str,
        expected_session: Option<&str>,
        reason: StopReason,
    ) -> Result<Option<RecordingSession>> {
        let slot = self.slot(device_path);
        let mut guard = slot.lock().await;

        let matches = match (&guard.active, expected_session) {
            (Some(active), Some(expected)) => active.session.session_id == expected,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return Ok(None);
        }
        let Some(active) = guard.active.take() else {
            return Ok(None);
        };

        if let Some(timer) = &active.timer {
            timer.cancel();
        }

        let mut session = active.session;
        session.status = SessionStatus::Stopping;
        self.update_tracked(&session);

        let outcome = tokio::time::timeout(
            self.backend_timeout(),
            self.backend.stop_recording(&session.camera_id),
        )
        .await
        .unwrap_or_else(|_| {
            Err(MediaError::Timeout {
                operation: format!("stop recording {}", session.camera_id),
            })
        });

        session.end_time = Some(Utc::now());

        if let Err(e) = outcome {
            error!("Backend failed to stop {}: {}", session.session_id, e);
            session.status = SessionStatus::Failed;
            session.error = Some(e.to_string());
            session.stop_reason = Some(reason);
            self.retire(&session);
            drop(guard);
            self.publish(ServiceEvent::RecordingFailed {
                session,
                error: e.to_string(),
            })
            .await;
            return Err(e.into());
        }

        match self
            .store
            .finalize_recording(session.stem(), session.format.extension())
            .await
        {
            Ok(Some(file)) => {
                session.filename = file.filename;
                session.file_size = file.file_size;
            }
            Ok(None) => warn!("No file found for recording {}", session.session_id),
            Err(e) => warn!("Could not finalize recording {}: {}", session.session_id, e),
        }

        session.status = SessionStatus::Stopped;
        session.stop_reason = Some(reason);
        self.retire(&session);
        drop(guard);

        info!(
            "Recording {} stopped ({}, {} bytes)",
            session.session_id,
            reason.as_str(),
            session.file_size
        );

        self.publish(ServiceEvent::RecordingStopped {
            session: session.clone(),
            reason,
        })
        .await;

        Ok(Some(session))
    }

    /// Stop whatever is recording on a device that went away
    pub async fn handle_device_disconnected(&self, device_path: &str) {
        match self
            .finish(device_path, None, StopReason::DeviceDisconnected)
            .await
        {
            Ok(Some(session)) => {
                info!("Stopped recording {} after disconnect", session.session_id)
            }
            Ok(None) => {}
            Err(e) => warn!("Stopping recording on {} failed: {}", device_path, e),
        }
    }

    /// Stop every active recording, returning how many were stopped
    pub async fn stop_all(&self, reason: StopReason) -> usize {
        let devices: Vec<String> = self.slots.lock().keys().cloned().collect();
        let mut stopped = 0;

        for device_path in devices {
            match self.finish(&device_path, None, reason).await {
                Ok(Some(_)) => stopped += 1,
                Ok(None) => {}
                Err(e) => warn!("Stopping recording on {} failed: {}", device_path, e),
            }
        }

        if stopped > 0 {
            info!("Stopped {} active recordings ({})", stopped, reason.as_str());
        }
        stopped
    }

    /// Current or recently finished session
    pub fn get_recording_status(&self, session_id: &str) -> Result<RecordingSession> {
        self.tracked_session(session_id).ok_or_else(|| {
            RecordingError::NoActiveSession {
                target: session_id.to_string(),
            }
            .into()
        })
    }

    pub fn active_sessions(&self) -> Vec<RecordingSession> {
        let mut sessions: Vec<RecordingSession> = self
            .sessions
            .lock()
            .values()
            .filter(|tracked| tracked.retired_at.is_none())
            .map(|tracked| tracked.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|tracked| tracked.retired_at.is_none())
            .count()
    }

    /// Active session of a device, if any
    pub fn active_session_for(&self, device_path: &str) -> Option<RecordingSession> {
        self.sessions
            .lock()
            .values()
            .find(|tracked| {
                tracked.retired_at.is_none() && tracked.session.device_path == device_path
            })
            .map(|tracked| tracked.session.clone())
    }

    fn tracked_session(&self, session_id: &str) -> Option<RecordingSession> {
        let retention = Duration::from_secs(self.config.retained_session_seconds);
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, tracked| {
            tracked
                .retired_at
                .map_or(true, |retired| retired.elapsed() < retention)
        });
        sessions.get(session_id).map(|tracked| tracked.session.clone())
    }

    /// Most recently finished session of a device still inside the retention window
    fn latest_retired_for(&self, device_path: &str) -> Option<RecordingSession> {
        let retention = Duration::from_secs(self.config.retained_session_seconds);
        self.sessions
            .lock()
            .values()
            .filter(|tracked| tracked.session.device_path == device_path)
            .filter_map(|tracked| tracked.retired_at.map(|at| (at, &tracked.session)))
            .filter(|(at, _)| at.elapsed() < retention)
            .max_by_key(|(at, _)| *at)
            .map(|(_, session)| session.clone())
    }

    fn update_tracked(&self, session: &RecordingSession) {
        if let Some(tracked) = self.sessions.lock().get_mut(&session.session_id) {
            tracked.session = session.clone();
        }
    }

    /// Keep a terminal session visible for the retention window
    fn retire(&self, session: &RecordingSession) {
        self.sessions.lock().insert(
            session.session_id.clone(),
            TrackedSession {
                session: session.clone(),
                retired_at: Some(Instant::now()),
            },
        );
    }

    /// Capture one frame, independent of any recording on the device
    pub async fn take_snapshot(
        &self,
        device: &str,
        filename: Option<&str>,
        quality: Option<u64>,
        format: Option<&str>,
    ) -> Result<SnapshotResult> {
        let camera = self.cameras.require_camera(device)?;

        let quality = match quality {
            Some(q) if (1..=100).contains(&q) => q as u8,
            Some(q) => {
                return Err(RecordingError::InvalidParameter {
                    details: format!("quality must be between 1 and 100, got {}", q),
                }
                .into())
            }
            None => self.snapshot_config.default_quality,
        };

        let format = match format {
            Some(value) => SnapshotFormat::parse(value).ok_or_else(|| {
                CameraError::UnsupportedCapability {
                    device: camera.camera_id.clone(),
                    details: format!("snapshot format '{}' is not supported", value),
                }
            })?,
            None => SnapshotFormat::parse(&self.snapshot_config.default_format)
                .unwrap_or(SnapshotFormat::Jpg),
        };

        let timestamp = Utc::now();
        let filename = match filename {
            Some(name) => {
                validate_filename(name)?;
                let suffix = format!(".{}", format.extension());
                if name.ends_with(&suffix) {
                    name.to_string()
                } else {
                    format!("{}{}", name, suffix)
                }
            }
            None => format!(
                "{}_snapshot_{}_{}.{}",
                camera.camera_id,
                timestamp.format("%Y-%m-%d_%H-%M-%S"),
                short_id(),
                format.extension()
            ),
        };

        self.store
            .ensure_free_space(
                FileKind::Snapshots,
                self.config.min_free_space_mb.saturating_mul(BYTES_PER_MB),
            )
            .await?;
        let output = self.store.resolve(FileKind::Snapshots, &filename)?;

        let file_size = tokio::time::timeout(
            self.backend_timeout(),
            self.backend
                .capture_snapshot(&camera.camera_id, &output, format, quality),
        )
        .await
        .unwrap_or_else(|_| {
            Err(MediaError::Timeout {
                operation: format!("snapshot {}", camera.camera_id),
            })
        })
        .map_err(|e| {
            warn!("Snapshot of {} failed: {}", camera.camera_id, e);
            ServiceError::from(e)
        })?;

        let snapshot = SnapshotResult {
            device: camera.camera_id.clone(),
            filename,
            status: "completed".to_string(),
            timestamp,
            file_size,
            format,
            quality,
            file_path: output.display().to_string(),
        };

        info!(
            "Snapshot {} taken on {} ({} bytes)",
            snapshot.filename, snapshot.device, snapshot.file_size
        );
        self.publish(ServiceEvent::SnapshotTaken {
            snapshot: snapshot.clone(),
        })
        .await;

        Ok(snapshot)
    }

    async fn publish(&self, event: ServiceEvent) {
        if let Err(e) = self.event_bus.publish(event).await {
            warn!("Failed to publish recording event: {}", e);
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// `<camera>_<YYYY-MM-DD_HH-MM-SS>_<suffix>.<ext>`
fn recording_filename(
    camera: &CameraDevice,
    start: chrono::DateTime<Utc>,
    format: RecordingFormat,
) -> String {
    format!(
        "{}_{}_{}.{}",
        camera.camera_id,
        start.format("%Y-%m-%d_%H-%M-%S"),
        short_id(),
        format.extension()
    )
}

fn stopped_by_timer(session: &RecordingSession) -> bool {
    session.status == SessionStatus::Stopped
        && session.stop_reason == Some(StopReason::DurationElapsed)
}
