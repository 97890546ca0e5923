use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Minimum accepted length of the HS256 signing secret, in bytes
pub const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub mediamtx: MediaMtxConfig,
    pub camera: CameraConfig,
    pub recording: RecordingConfig,
    pub snapshots: SnapshotConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Address to bind the WebSocket/HTTP listener to
    #[serde(default = "default_server_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Path of the JSON-RPC WebSocket endpoint
    #[serde(default = "default_websocket_path")]
    pub websocket_path: String,

    /// Maximum concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Largest accepted inbound frame
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SecurityConfig {
    /// HS256 signing secret shared with token issuers
    #[serde(default)]
    pub jwt_secret: String,

    /// Lifetime of tokens minted by this service
    #[serde(default = "default_token_expiry_hours")]
    pub token_expiry_hours: u64,

    /// Requests allowed per client within one window
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: u32,

    /// Rate limit window length
    #[serde(default = "default_rate_limit_window_seconds")]
    pub rate_limit_window_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MediaMtxConfig {
    #[serde(default = "default_mediamtx_host")]
    pub host: String,

    /// REST control API port
    #[serde(default = "default_mediamtx_api_port")]
    pub api_port: u16,

    #[serde(default = "default_mediamtx_rtsp_port")]
    pub rtsp_port: u16,

    #[serde(default = "default_mediamtx_webrtc_port")]
    pub webrtc_port: u16,

    #[serde(default = "default_mediamtx_hls_port")]
    pub hls_port: u16,

    /// Per-request timeout for REST calls
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Pause before the single retry of a transient failure
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Response time above which the backend is reported degraded
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,

    /// ffmpeg binary used for stream publishing and snapshots
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    #[serde(default = "default_snapshot_timeout_seconds")]
    pub snapshot_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Directory holding the V4L2 device nodes
    #[serde(default = "default_device_dir")]
    pub device_dir: String,

    /// Highest /dev/videoN index considered
    #[serde(default = "default_max_device_index")]
    pub max_device_index: u32,

    /// Use filesystem notifications for hot-plug instead of polling
    #[serde(default = "default_enable_hotplug")]
    pub enable_hotplug: bool,

    /// Rescan interval when running in polling mode
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// v4l2-ctl binary used for capability probing
    #[serde(default = "default_v4l2_ctl_path")]
    pub v4l2_ctl_path: String,

    /// Reported when a device cannot be probed
    #[serde(default = "default_camera_resolution")]
    pub default_resolution: String,

    #[serde(default = "default_camera_fps")]
    pub default_fps: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecordingConfig {
    #[serde(default = "default_recordings_path")]
    pub recordings_path: String,

    /// Container format used when a request omits one (fmp4 or mpegts)
    #[serde(default = "default_recording_format")]
    pub default_format: String,

    /// Upper bound on a single backend start/stop call
    #[serde(default = "default_backend_timeout_seconds")]
    pub backend_timeout_seconds: u64,

    /// How long STOPPED/FAILED sessions stay queryable
    #[serde(default = "default_retained_session_seconds")]
    pub retained_session_seconds: u64,

    /// Refuse new recordings and snapshots below this much free space
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshots_path")]
    pub snapshots_path: String,

    #[serde(default = "default_snapshot_quality")]
    pub default_quality: u8,

    #[serde(default = "default_snapshot_format")]
    pub default_format: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Retention policy type: age, size or manual
    #[serde(default = "default_retention_policy")]
    pub retention_policy: String,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,

    #[serde(default = "default_max_size_gb")]
    pub max_size_gb: f64,

    /// Run the retention policy on a schedule
    #[serde(default = "default_cleanup_enabled")]
    pub cleanup_enabled: bool,

    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,

    /// Usage percentage that raises the low space warning
    #[serde(default = "default_low_space_threshold_percent")]
    pub low_space_threshold_percent: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// json, pretty or compact
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Daily-rotated log file, in addition to stdout
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Interval between media backend health checks
    #[serde(default = "default_health_check_interval_seconds")]
    pub health_check_interval_seconds: u64,

    /// Per-component shutdown deadline
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
}

impl ServiceConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("camera-service.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("server.host", default_server_host())?
            .set_default("server.port", default_server_port())?
            .set_default("server.websocket_path", default_websocket_path())?
            .set_default("server.max_connections", default_max_connections() as i64)?
            .set_default(
                "server.max_message_bytes",
                default_max_message_bytes() as i64,
            )?
            .set_default("security.jwt_secret", "")?
            .set_default("security.token_expiry_hours", default_token_expiry_hours())?
            .set_default("security.rate_limit_requests", default_rate_limit_requests())?
            .set_default(
                "security.rate_limit_window_seconds",
                default_rate_limit_window_seconds(),
            )?
            .set_default("mediamtx.host", default_mediamtx_host())?
            .set_default("mediamtx.api_port", default_mediamtx_api_port())?
            .set_default("mediamtx.rtsp_port", default_mediamtx_rtsp_port())?
            .set_default("mediamtx.webrtc_port", default_mediamtx_webrtc_port())?
            .set_default("mediamtx.hls_port", default_mediamtx_hls_port())?
            .set_default("mediamtx.request_timeout_ms", default_request_timeout_ms())?
            .set_default("mediamtx.retry_delay_ms", default_retry_delay_ms())?
            .set_default("mediamtx.degraded_latency_ms", default_degraded_latency_ms())?
            .set_default("mediamtx.ffmpeg_path", default_ffmpeg_path())?
            .set_default(
                "mediamtx.snapshot_timeout_seconds",
                default_snapshot_timeout_seconds(),
            )?
            .set_default("camera.device_dir", default_device_dir())?
            .set_default("camera.max_device_index", default_max_device_index())?
            .set_default("camera.enable_hotplug", default_enable_hotplug())?
            .set_default("camera.poll_interval_seconds", default_poll_interval_seconds())?
            .set_default("camera.probe_timeout_ms", default_probe_timeout_ms())?
            .set_default("camera.v4l2_ctl_path", default_v4l2_ctl_path())?
            .set_default("camera.default_resolution", default_camera_resolution())?
            .set_default("camera.default_fps", default_camera_fps())?
            .set_default("recording.recordings_path", default_recordings_path())?
            .set_default("recording.default_format", default_recording_format())?
            .set_default(
                "recording.backend_timeout_seconds",
                default_backend_timeout_seconds(),
            )?
            .set_default(
                "recording.retained_session_seconds",
                default_retained_session_seconds(),
            )?
            .set_default("recording.min_free_space_mb", default_min_free_space_mb())?
            .set_default("snapshots.snapshots_path", default_snapshots_path())?
            .set_default("snapshots.default_quality", default_snapshot_quality() as i64)?
            .set_default("snapshots.default_format", default_snapshot_format())?
            .set_default("storage.retention_policy", default_retention_policy())?
            .set_default("storage.max_age_days", default_max_age_days())?
            .set_default("storage.max_size_gb", default_max_size_gb())?
            .set_default("storage.cleanup_enabled", default_cleanup_enabled())?
            .set_default(
                "storage.cleanup_interval_seconds",
                default_cleanup_interval_seconds(),
            )?
            .set_default(
                "storage.low_space_threshold_percent",
                default_low_space_threshold_percent(),
            )?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.format", default_log_format())?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .set_default(
                "system.health_check_interval_seconds",
                default_health_check_interval_seconds(),
            )?
            .set_default(
                "system.shutdown_timeout_seconds",
                default_shutdown_timeout_seconds(),
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // CAMSVC_SECURITY__JWT_SECRET style overrides
            .add_source(
                Environment::with_prefix("CAMSVC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ServiceConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!(
            "Final configuration: server={:?} mediamtx={:?} camera={:?}",
            config.server, config.mediamtx, config.camera
        );

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Message(
                "Server port must be greater than 0".to_string(),
            ));
        }

        if !self.server.websocket_path.starts_with('/') {
            return Err(ConfigError::Message(
                "WebSocket path must start with '/'".to_string(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(ConfigError::Message(
                "Max connections must be greater than 0".to_string(),
            ));
        }

        if self.security.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Message(format!(
                "JWT secret must be at least {} bytes (set security.jwt_secret or CAMSVC_SECURITY__JWT_SECRET)",
                MIN_JWT_SECRET_LEN
            )));
        }

        if self.security.rate_limit_requests == 0 || self.security.rate_limit_window_seconds == 0 {
            return Err(ConfigError::Message(
                "Rate limit requests and window must be greater than 0".to_string(),
            ));
        }

        for (name, port) in [
            ("api_port", self.mediamtx.api_port),
            ("rtsp_port", self.mediamtx.rtsp_port),
            ("webrtc_port", self.mediamtx.webrtc_port),
            ("hls_port", self.mediamtx.hls_port),
        ] {
            if port == 0 {
                return Err(ConfigError::Message(format!(
                    "MediaMTX {} must be greater than 0",
                    name
                )));
            }
        }

        if self.mediamtx.request_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "MediaMTX request timeout must be greater than 0".to_string(),
            ));
        }

        if self.camera.poll_interval_seconds == 0 {
            return Err(ConfigError::Message(
                "Camera poll interval must be greater than 0".to_string(),
            ));
        }

        if self.camera.default_fps == 0 {
            return Err(ConfigError::Message(
                "Camera default fps must be greater than 0".to_string(),
            ));
        }

        if !matches!(self.recording.default_format.as_str(), "fmp4" | "mpegts") {
            return Err(ConfigError::Message(format!(
                "Unsupported recording format: {}",
                self.recording.default_format
            )));
        }

        if !(1..=100).contains(&self.snapshots.default_quality) {
            return Err(ConfigError::Message(
                "Snapshot quality must be between 1 and 100".to_string(),
            ));
        }

        if !matches!(self.snapshots.default_format.as_str(), "jpg" | "png") {
            return Err(ConfigError::Message(format!(
                "Unsupported snapshot format: {}",
                self.snapshots.default_format
            )));
        }

        if !matches!(
            self.storage.retention_policy.as_str(),
            "age" | "size" | "manual"
        ) {
            return Err(ConfigError::Message(format!(
                "Unknown retention policy: {}",
                self.storage.retention_policy
            )));
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn recordings_dir(&self) -> PathBuf {
        PathBuf::from(&self.recording.recordings_path)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        PathBuf::from(&self.snapshots.snapshots_path)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_server_host(),
                port: default_server_port(),
                websocket_path: default_websocket_path(),
                max_connections: default_max_connections(),
                max_message_bytes: default_max_message_bytes(),
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                token_expiry_hours: default_token_expiry_hours(),
                rate_limit_requests: default_rate_limit_requests(),
                rate_limit_window_seconds: default_rate_limit_window_seconds(),
            },
            mediamtx: MediaMtxConfig {
                host: default_mediamtx_host(),
                api_port: default_mediamtx_api_port(),
                rtsp_port: default_mediamtx_rtsp_port(),
                webrtc_port: default_mediamtx_webrtc_port(),
                hls_port: default_mediamtx_hls_port(),
                request_timeout_ms: default_request_timeout_ms(),
                retry_delay_ms: default_retry_delay_ms(),
                degraded_latency_ms: default_degraded_latency_ms(),
                ffmpeg_path: default_ffmpeg_path(),
                snapshot_timeout_seconds: default_snapshot_timeout_seconds(),
            },
            camera: CameraConfig {
                device_dir: default_device_dir(),
                max_device_index: default_max_device_index(),
                enable_hotplug: default_enable_hotplug(),
                poll_interval_seconds: default_poll_interval_seconds(),
                probe_timeout_ms: default_probe_timeout_ms(),
                v4l2_ctl_path: default_v4l2_ctl_path(),
                default_resolution: default_camera_resolution(),
                default_fps: default_camera_fps(),
            },
            recording: RecordingConfig {
                recordings_path: default_recordings_path(),
                default_format: default_recording_format(),
                backend_timeout_seconds: default_backend_timeout_seconds(),
                retained_session_seconds: default_retained_session_seconds(),
                min_free_space_mb: default_min_free_space_mb(),
            },
            snapshots: SnapshotConfig {
                snapshots_path: default_snapshots_path(),
                default_quality: default_snapshot_quality(),
                default_format: default_snapshot_format(),
            },
            storage: StorageConfig {
                retention_policy: default_retention_policy(),
                max_age_days: default_max_age_days(),
                max_size_gb: default_max_size_gb(),
                cleanup_enabled: default_cleanup_enabled(),
                cleanup_interval_seconds: default_cleanup_interval_seconds(),
                low_space_threshold_percent: default_low_space_threshold_percent(),
            },
            logging: LoggingConfig {
                level: default_log_level(),
                format: default_log_format(),
                file_path: None,
            },
            system: SystemConfig {
                event_bus_capacity: default_event_bus_capacity(),
                health_check_interval_seconds: default_health_check_interval_seconds(),
                shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            },
        }
    }
}

impl Default for MediaMtxConfig {
    fn default() -> Self {
        ServiceConfig::default().mediamtx
    }
}

// Default value functions
fn default_server_host() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    8002
}
fn default_websocket_path() -> String {
    "/ws".to_string()
}
fn default_max_connections() -> usize {
    100
}
fn default_max_message_bytes() -> usize {
    1024 * 1024
}

fn default_token_expiry_hours() -> u64 {
    24
}
fn default_rate_limit_requests() -> u32 {
    50
}
fn default_rate_limit_window_seconds() -> u64 {
    120
}

fn default_mediamtx_host() -> String {
    "127.0.0.1".to_string()
}
fn default_mediamtx_api_port() -> u16 {
    9997
}
fn default_mediamtx_rtsp_port() -> u16 {
    8554
}
fn default_mediamtx_webrtc_port() -> u16 {
    8889
}
fn default_mediamtx_hls_port() -> u16 {
    8888
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_retry_delay_ms() -> u64 {
    250
}
fn default_degraded_latency_ms() -> u64 {
    1000
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_snapshot_timeout_seconds() -> u64 {
    10
}

fn default_device_dir() -> String {
    "/dev".to_string()
}
fn default_max_device_index() -> u32 {
    9
}
fn default_enable_hotplug() -> bool {
    true
}
fn default_poll_interval_seconds() -> u64 {
    2
}
fn default_probe_timeout_ms() -> u64 {
    3000
}
fn default_v4l2_ctl_path() -> String {
    "v4l2-ctl".to_string()
}
fn default_camera_resolution() -> String {
    "1920x1080".to_string()
}
fn default_camera_fps() -> u32 {
    30
}

fn default_recordings_path() -> String {
    "./recordings".to_string()
}
fn default_recording_format() -> String {
    "fmp4".to_string()
}
fn default_backend_timeout_seconds() -> u64 {
    10
}
fn default_retained_session_seconds() -> u64 {
    300
}
fn default_min_free_space_mb() -> u64 {
    100
}

fn default_snapshots_path() -> String {
    "./snapshots".to_string()
}
fn default_snapshot_quality() -> u8 {
    85
}
fn default_snapshot_format() -> String {
    "jpg".to_string()
}

fn default_retention_policy() -> String {
    "age".to_string()
}
fn default_max_age_days() -> u64 {
    30
}
fn default_max_size_gb() -> f64 {
    10.0
}
fn default_cleanup_enabled() -> bool {
    true
}
fn default_cleanup_interval_seconds() -> u64 {
    3600
}
fn default_low_space_threshold_percent() -> f64 {
    90.0
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_event_bus_capacity() -> usize {
    256
}
fn default_health_check_interval_seconds() -> u64 {
    30
}
fn default_shutdown_timeout_seconds() -> u64 {
    10
}
