use super::types::{ComponentState, ShutdownReason};
use crate::camera::{CameraMonitor, DeviceProber, V4l2Prober};
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::media::{MediaBackend, MediaMtxController};
use crate::recording::RecordingManager;
use crate::rpc::{RpcContext, RpcMetrics, RpcServer, SubscriptionRegistry};
use crate::security::SecurityMiddleware;
use crate::storage::FileStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns every component of the service and drives their lifecycle.
///
/// Components are wired once at construction; `start` brings them up in
/// dependency order and `shutdown` tears them down in reverse.
pub struct ServiceManager {
    pub(super) config: ServiceConfig,
    pub(super) event_bus: Arc<EventBus>,

    // Components
    pub(super) backend: Arc<dyn MediaBackend>,
    pub(super) cameras: CameraMonitor,
    pub(super) store: FileStore,
    pub(super) recordings: RecordingManager,
    pub(super) server: Arc<RpcServer>,

    // Background work
    pub(super) server_task: Option<JoinHandle<Result<()>>>,
    pub(super) background_tasks: Vec<JoinHandle<()>>,
    pub(super) local_addr: Option<SocketAddr>,

    // Lifecycle management
    pub(super) component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
    pub(super) shutdown_sender: Option<oneshot::Sender<ShutdownReason>>,
    pub(super) shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
    pub(super) cancellation_token: CancellationToken,
}

impl ServiceManager {
    /// Create a manager talking to the configured MediaMTX instance and
    /// probing real V4L2 devices
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let backend: Arc<dyn MediaBackend> =
            Arc::new(MediaMtxController::new(config.mediamtx.clone())?);
        let prober: Arc<dyn DeviceProber> = Arc::new(V4l2Prober::new(&config.camera));
        Self::with_components(config, backend, prober)
    }

    /// Create a manager over an arbitrary media backend and device prober
    pub fn with_components(
        config: ServiceConfig,
        backend: Arc<dyn MediaBackend>,
        prober: Arc<dyn DeviceProber>,
    ) -> Result<Self> {
        let event_bus = Arc::new(EventBus::new(config.system.event_bus_capacity));
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        let cameras = CameraMonitor::new(
            config.camera.clone(),
            config.mediamtx.clone(),
            prober,
            Arc::clone(&event_bus),
        );

        let store = FileStore::from_config(&config);

        let recordings = RecordingManager::new(
            config.recording.clone(),
            config.snapshots.clone(),
            cameras.clone(),
            Arc::clone(&backend),
            store.clone(),
            Arc::clone(&event_bus),
        );

        let security = Arc::new(SecurityMiddleware::new(
            &config.security,
            config.server.max_connections,
        )?);

        let context = Arc::new(RpcContext {
            server: config.server.clone(),
            security,
            cameras: cameras.clone(),
            recordings: recordings.clone(),
            backend: Arc::clone(&backend),
            store: store.clone(),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            metrics: RpcMetrics::default(),
            started_at: Instant::now(),
        });
        let server = Arc::new(RpcServer::new(context, Arc::clone(&event_bus)));

        Ok(Self {
            config,
            event_bus,
            backend,
            cameras,
            store,
            recordings,
            server,
            server_task: None,
            background_tasks: Vec::new(),
            local_addr: None,
            component_states: Arc::new(Mutex::new(HashMap::new())),
            shutdown_sender: Some(shutdown_sender),
            shutdown_receiver: Some(shutdown_receiver),
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn cameras(&self) -> &CameraMonitor {
        &self.cameras
    }

    pub fn recordings(&self) -> &RecordingManager {
        &self.recordings
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn context(&self) -> &Arc<RpcContext> {
        self.server.context()
    }

    /// Address the JSON-RPC server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}
