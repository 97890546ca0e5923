pub mod app;
pub mod camera;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod recording;
pub mod rpc;
pub mod security;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use app::{ComponentState, ServiceManager, ShutdownReason};
pub use camera::{CameraDevice, CameraMonitor, DeviceProber, MonitorMode, V4l2Prober};
pub use config::ServiceConfig;
pub use error::{Result, ServiceError};
pub use events::{EventBus, EventFilter, EventReceiver, ServiceEvent};
pub use media::{MediaBackend, MediaMtxController};
pub use recording::{RecordingManager, RecordingSession, SessionStatus, SnapshotResult};
pub use rpc::{RpcContext, RpcServer};
pub use security::{JwtHandler, Role, SecurityMiddleware};
pub use storage::FileStore;
