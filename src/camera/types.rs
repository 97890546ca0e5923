use crate::config::MediaMtxConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CameraStatus {
    Connected,
    Disconnected,
}

/// Client-facing URLs of the media server path serving a camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamUrls {
    pub rtsp: String,
    pub webrtc: String,
    pub hls: String,
}

impl StreamUrls {
    pub fn for_camera(mediamtx: &MediaMtxConfig, camera_id: &str) -> Self {
        Self {
            rtsp: format!(
                "rtsp://{}:{}/{}",
                mediamtx.host, mediamtx.rtsp_port, camera_id
            ),
            webrtc: format!(
                "http://{}:{}/{}",
                mediamtx.host, mediamtx.webrtc_port, camera_id
            ),
            hls: format!("http://{}:{}/{}", mediamtx.host, mediamtx.hls_port, camera_id),
        }
    }
}

/// What a device reported when probed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraCapabilities {
    /// Pixel formats as fourcc codes (MJPG, YUYV, ...)
    pub formats: Vec<String>,
    /// Resolutions as WIDTHxHEIGHT, largest first
    pub resolutions: Vec<String>,
    /// Frame rates, highest first
    pub frame_rates: Vec<u32>,
    /// False when values are configured fallbacks rather than probed
    pub probed: bool,
}

impl CameraCapabilities {
    pub fn fallback(resolution: &str, fps: u32) -> Self {
        Self {
            formats: Vec::new(),
            resolutions: vec![resolution.to_string()],
            frame_rates: vec![fps],
            probed: false,
        }
    }

    pub fn best_resolution(&self) -> Option<&str> {
        self.resolutions.first().map(String::as_str)
    }

    pub fn max_fps(&self) -> Option<u32> {
        self.frame_rates.first().copied()
    }

    pub fn supports_resolution(&self, resolution: &str) -> bool {
        self.resolutions.iter().any(|r| r == resolution)
    }
}

/// A camera known to the discovery monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraDevice {
    pub device_path: String,
    pub camera_id: String,
    pub status: CameraStatus,
    pub name: String,
    pub resolution: String,
    pub fps: u32,
    pub stream_urls: StreamUrls,
    pub capabilities: CameraCapabilities,
    pub connected_at: DateTime<Utc>,
}

/// Index N of a `videoN` node name
pub fn video_index(file_name: &str) -> Option<u32> {
    let digits = file_name.strip_prefix("video")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// `/dev/video3` -> `camera3`
pub fn camera_id_for_path(device_path: &str) -> String {
    let file_name = Path::new(device_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(device_path);

    match video_index(file_name) {
        Some(index) => format!("camera{}", index),
        None => file_name.to_string(),
    }
}

/// Normalise `camera3`, `video3` or a full path into a device path under `device_dir`
pub fn resolve_device_path(identifier: &str, device_dir: &str) -> Option<String> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return None;
    }

    if identifier.starts_with('/') {
        return Some(identifier.to_string());
    }

    let index = match identifier.strip_prefix("camera") {
        Some(digits) if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) => {
            digits.parse::<u32>().ok()?
        }
        _ => video_index(identifier)?,
    };

    Some(
        Path::new(device_dir)
            .join(format!("video{}", index))
            .to_string_lossy()
            .into_owned(),
    )
}
