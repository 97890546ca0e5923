//! Media server control: the backend trait and the MediaMTX REST client

mod backend;
mod mediamtx;


pub use backend::{
    BackendHealth, BackendMetrics, HealthState, MediaBackend, RecordingFormat, SnapshotFormat,
    StreamStatus,
};
pub use mediamtx::MediaMtxController;
