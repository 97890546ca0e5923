use super::types::{video_index, CameraCapabilities};
use crate::config::CameraConfig;
use crate::error::CameraError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Result of probing a single device node
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub name: String,
    pub capabilities: CameraCapabilities,
}

/// Capability probing seam, so discovery can run without real hardware
#[async_trait]
pub trait DeviceProber: Send + Sync {
    async fn probe(&self, device_path: &str) -> Result<ProbeResult, CameraError>;
}

/// Probes V4L2 devices with sysfs and `v4l2-ctl`
pub struct V4l2Prober {
    v4l2_ctl_path: String,
    sysfs_root: PathBuf,
    timeout: Duration,
    default_resolution: String,
    default_fps: u32,
}

impl V4l2Prober {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            v4l2_ctl_path: config.v4l2_ctl_path.clone(),
            sysfs_root: PathBuf::from("/sys/class/video4linux"),
            timeout: Duration::from_millis(config.probe_timeout_ms),
            default_resolution: config.default_resolution.clone(),
            default_fps: config.default_fps,
        }
    }

    async fn read_device_name(&self, device_path: &str) -> String {
        let node = Path::new(device_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        match tokio::fs::read_to_string(self.sysfs_root.join(node).join("name")).await {
            Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => match video_index(node) {
                Some(index) => format!("Camera {}", index),
                None => node.to_string(),
            },
        }
    }

    /// Runs `v4l2-ctl --list-formats-ext`; `Ok(None)` when the tool is unavailable
    async fn list_formats(&self, device_path: &str) -> Result<Option<String>, CameraError> {
        let child = match Command::new(&self.v4l2_ctl_path)
            .args(["--device", device_path, "--list-formats-ext"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                debug!("{} unavailable ({}), using configured defaults", self.v4l2_ctl_path, e);
                return Ok(None);
            }
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {
                Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
            }
            Ok(Ok(output)) => Err(CameraError::ProbeFailed {
                device: device_path.to_string(),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Ok(Err(e)) => Err(CameraError::ProbeFailed {
                device: device_path.to_string(),
                details: e.to_string(),
            }),
            Err(_) => Err(CameraError::ProbeFailed {
                device: device_path.to_string(),
                details: format!("probe timed out after {:?}", self.timeout),
            }),
        }
    }
}

#[async_trait]
impl DeviceProber for V4l2Prober {
    async fn probe(&self, device_path: &str) -> Result<ProbeResult, CameraError> {
        let name = self.read_device_name(device_path).await;

        let capabilities = match self.list_formats(device_path).await? {
            Some(output) => {
                let capabilities = parse_formats_ext(&output);
                if capabilities.formats.is_empty() {
                    // Metadata nodes enumerate no capture formats
                    return Err(CameraError::ProbeFailed {
                        device: device_path.to_string(),
                        details: "device exposes no capture formats".to_string(),
                    });
                }
                capabilities
            }
            None => {
                warn!(
                    "Could not probe {}, reporting {}@{}fps",
                    device_path, self.default_resolution, self.default_fps
                );
                CameraCapabilities::fallback(&self.default_resolution, self.default_fps)
            }
        };

        Ok(ProbeResult { name, capabilities })
    }
}

/// Parse `v4l2-ctl --list-formats-ext` output
pub fn parse_formats_ext(output: &str) -> CameraCapabilities {
    let mut formats: Vec<String> = Vec::new();
    let mut resolutions: Vec<(u32, u32)> = Vec::new();
    let mut frame_rates: Vec<u32> = Vec::new();

    for line in output.lines().map(str::trim) {
        if line.starts_with('[') {
            // [0]: 'MJPG' (Motion-JPEG, compressed)
            if let Some(fourcc) = line.split('\'').nth(1) {
                if !fourcc.is_empty() && !formats.iter().any(|f| f == fourcc) {
                    formats.push(fourcc.to_string());
                }
            }
        } else if let Some(size) = line.strip_prefix("Size:") {
            // Size: Discrete 1920x1080
            if let Some((w, h)) = size.split_whitespace().last().and_then(parse_dimensions) {
                if !resolutions.contains(&(w, h)) {
                    resolutions.push((w, h));
                }
            }
        } else if line.starts_with("Interval:") {
            // Interval: Discrete 0.033s (30.000 fps)
            let fps = line
                .rsplit('(')
                .next()
                .and_then(|tail| tail.strip_suffix("fps)"))
                .and_then(|value| value.trim().parse::<f64>().ok());
            if let Some(fps) = fps {
                let fps = fps.round() as u32;
                if fps > 0 && !frame_rates.contains(&fps) {
                    frame_rates.push(fps);
                }
            }
        }
    }

    resolutions.sort_by(|a, b| (b.0 * b.1).cmp(&(a.0 * a.1)));
    frame_rates.sort_unstable_by(|a, b| b.cmp(a));

    CameraCapabilities {
        formats,
        resolutions: resolutions
            .into_iter()
            .map(|(w, h)| format!("{}x{}", w, h))
            .collect(),
        frame_rates,
        probed: true,
    }
}

fn parse_dimensions(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}
