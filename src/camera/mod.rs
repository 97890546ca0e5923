mod monitor;
mod probe;
mod types;
#[cfg(test)]
mod tests;

pub use monitor::{CameraMonitor, MonitorMode};
pub use probe::{parse_formats_ext, DeviceProber, ProbeResult, V4l2Prober};
pub use types::{
    camera_id_for_path, resolve_device_path, video_index, CameraCapabilities, CameraDevice,
    CameraStatus, StreamUrls,
};
