/// Component lifecycle states
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// System shutdown reason
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    Signal(String),
    /// Published on the event bus, by an operator or a failing component
    Requested(String),
}

pub const MEDIAMTX: &str = "mediamtx";
pub const STORAGE: &str = "storage";
pub const EVENT_ROUTER: &str = "event_router";
pub const CAMERA_MONITOR: &str = "camera_monitor";
pub const RECORDING_MANAGER: &str = "recording_manager";
pub const RPC_SERVER: &str = "rpc_server";

/// Managed components in start order; shutdown walks it backwards
pub const COMPONENTS: [&str; 6] = [
    MEDIAMTX,
    STORAGE,
    EVENT_ROUTER,
    CAMERA_MONITOR,
    RECORDING_MANAGER,
    RPC_SERVER,
];
