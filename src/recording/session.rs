use crate::media::{RecordingFormat, SnapshotFormat};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

/// Lifecycle of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Started,
    Recording,
    Stopping,
    Stopped,
    Failed,
}

impl SessionStatus {
    /// Counts toward the one-recording-per-device limit
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Started | SessionStatus::Recording)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Started => "STARTED",
            SessionStatus::Recording => "RECORDING",
            SessionStatus::Stopping => "STOPPING",
            SessionStatus::Stopped => "STOPPED",
            SessionStatus::Failed => "FAILED",
        }
    }
}

/// Why a recording ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    DurationElapsed,
    DeviceDisconnected,
    Shutdown,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Requested => "requested",
            StopReason::DurationElapsed => "duration_elapsed",
            StopReason::DeviceDisconnected => "device_disconnected",
            StopReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingSession {
    pub session_id: String,
    pub device_path: String,
    pub camera_id: String,
    pub filename: String,
    pub status: SessionStatus,
    pub format: RecordingFormat,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// `None` records until stopped explicitly
    pub duration_seconds: Option<u64>,
    pub file_size: u64,
    pub error: Option<String>,
    pub stop_reason: Option<StopReason>,
}

impl RecordingSession {
    /// File name without extension; the media server derives segment names from it
    pub fn stem(&self) -> &str {
        self.filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.filename)
    }

    /// Seconds recorded so far, or in total once finished
    pub fn elapsed_seconds(&self) -> i64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_seconds().max(0)
    }

    /// Wire representation used by RPC results and notifications
    pub fn to_json(&self) -> Value {
        let mut value = json!({
            "session_id": self.session_id,
            "device": self.camera_id,
            "device_path": self.device_path,
            "filename": self.filename,
            "status": self.status.as_str(),
            "format": self.format.as_str(),
            "start_time": self.start_time.to_rfc3339(),
            "duration": self.elapsed_seconds(),
            "duration_seconds": self.duration_seconds,
            "file_size": self.file_size,
        });

        if let Some(end_time) = self.end_time {
            value["end_time"] = json!(end_time.to_rfc3339());
        }
        if let Some(reason) = self.stop_reason {
            value["stop_reason"] = json!(reason.as_str());
        }
        if let Some(error) = &self.error {
            value["error"] = json!(error);
        }
        value
    }
}

/// Outcome of a single frame capture
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResult {
    /// Camera identifier, e.g. `camera0`
    pub device: String,
    pub filename: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub file_size: u64,
    pub format: SnapshotFormat,
    pub quality: u8,
    pub file_path: String,
}
