//! Recording sessions and snapshot capture

mod manager;
mod session;


pub use manager::RecordingManager;
pub use session::{RecordingSession, SessionStatus, SnapshotResult, StopReason};
