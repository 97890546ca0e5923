use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Media backend error: {0}")]
    Media(#[from] MediaError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

/// Authentication, authorization and admission failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SecurityError {
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("Authentication token expired")]
    TokenExpired,

    #[error("Insufficient permissions: {method} requires role {required}")]
    InsufficientPermissions { method: String, required: String },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Connection limit reached ({max} connections)")]
    ConnectionLimit { max: usize },

    #[error("Token generation failed: {details}")]
    TokenGeneration { details: String },
}

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Camera not found: {device}")]
    NotFound { device: String },

    #[error("Unsupported capability on {device}: {details}")]
    UnsupportedCapability { device: String, details: String },

    #[error("Capability probe failed for {device}: {details}")]
    ProbeFailed { device: String, details: String },

    #[error("Device watcher failed: {details}")]
    WatcherFailed { details: String },
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Media backend unavailable: {details}")]
    Unavailable { details: String },

    #[error("Media backend timed out during {operation}")]
    Timeout { operation: String },

    #[error("Stream not found: {name}")]
    StreamNotFound { name: String },

    #[error("Media backend rejected request: {details}")]
    InvalidRequest { details: String },

    #[error("Media backend returned HTTP {status}: {details}")]
    Http { status: u16, details: String },

    #[error("Snapshot capture failed: {details}")]
    Snapshot { details: String },
}

impl MediaError {
    /// Errors worth one more attempt: the backend was unreachable or briefly overloaded
    pub fn is_transient(&self) -> bool {
        match self {
            MediaError::Unavailable { .. } | MediaError::Timeout { .. } => true,
            MediaError::Http { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Camera {device} is already recording (session {session_id})")]
    AlreadyRecording { device: String, session_id: String },

    #[error("No active recording session for {target}")]
    NoActiveSession { target: String },

    #[error("Invalid parameter: {details}")]
    InvalidParameter { details: String },

    #[error("Recording session {session_id} failed: {details}")]
    BackendFailure { session_id: String, details: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File not found: {filename}")]
    FileNotFound { filename: String },

    #[error("Invalid filename: {filename}")]
    InvalidFilename { filename: String },

    #[error("Insufficient storage: {available_bytes} bytes available, {required_bytes} required")]
    InsufficientSpace {
        available_bytes: u64,
        required_bytes: u64,
    },

    #[error("Invalid retention policy: {details}")]
    InvalidPolicy { details: String },

    #[error("Storage I/O failed on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },

    #[error("Event channel closed")]
    ChannelClosed,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server startup failed: {details}")]
    StartupFailed { details: String },
}

impl ServiceError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
