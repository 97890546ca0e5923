use super::probe::DeviceProber;
use super::types::{
    camera_id_for_path, resolve_device_path, video_index, CameraDevice, CameraStatus, StreamUrls,
};
use crate::config::{CameraConfig, MediaMtxConfig};
use crate::error::{CameraError, Result};
use crate::events::{EventBus, ServiceEvent};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "hotplug")]
/// Delay between a node appearing and probing it, so udev can finish setting it up
const HOTPLUG_SETTLE: Duration = Duration::from_millis(200);

/// How the monitor learns about device changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    Stopped,
    /// Filesystem notifications on the device directory
    Hotplug,
    /// Degraded mode: periodic rescans
    Polling,
    /// Device directory missing; inventory stays empty
    Unavailable,
}

/// Watches V4L2 device nodes and keeps the live camera inventory
#[derive(Clone)]
pub struct CameraMonitor {
    config: CameraConfig,
    mediamtx: MediaMtxConfig,
    prober: Arc<dyn DeviceProber>,
    event_bus: Arc<EventBus>,
    cameras: Arc<RwLock<HashMap<String, CameraDevice>>>,
    // Device path -> generation of the probe in flight
    pending: Arc<Mutex<HashMap<String, u64>>>,
    // Nodes that failed probing (metadata nodes, broken devices)
    ignored: Arc<Mutex<HashSet<String>>>,
    next_generation: Arc<AtomicU64>,
    mode: Arc<RwLock<MonitorMode>>,
    cancel: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CameraMonitor {
    pub fn new(
        config: CameraConfig,
        mediamtx: MediaMtxConfig,
        prober: Arc<dyn DeviceProber>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            mediamtx,
            prober,
            event_bus,
            cameras: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            ignored: Arc::new(Mutex::new(HashSet::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
            mode: Arc::new(RwLock::new(MonitorMode::Stopped)),
            cancel: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Scan existing devices, then follow hot-plug changes
    pub async fn start(&self) -> Result<()> {
        info!(
            "Starting camera discovery monitor on {}",
            self.config.device_dir
        );

        let dir_available = Path::new(&self.config.device_dir).is_dir();
        if dir_available {
            for device_path in self.scan_devices().await {
                self.attach_device(&device_path).await;
            }
        } else {
            warn!(
                "Device directory {} is not available, camera inventory will be empty",
                self.config.device_dir
            );
        }

        let mode = if self.config.enable_hotplug {
            match self.start_watcher() {
                Ok(()) => MonitorMode::Hotplug,
                Err(e) => {
                    warn!("Hot-plug watcher unavailable ({}), falling back to polling", e);
                    self.start_polling();
                    MonitorMode::Polling
                }
            }
        } else {
            self.start_polling();
            MonitorMode::Polling
        };

        *self.mode.write() = if dir_available {
            mode
        } else {
            MonitorMode::Unavailable
        };

        info!(
            "Camera discovery monitor started ({:?}, {} cameras)",
            self.mode(),
            self.camera_count()
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping camera discovery monitor");
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Camera monitor task ended abnormally: {}", e);
                }
            }
        }

        *self.mode.write() = MonitorMode::Stopped;
        Ok(())
    }

    /// Snapshot of the live inventory keyed by device path
    pub fn get_connected_cameras(&self) -> HashMap<String, CameraDevice> {
        self.cameras.read().clone()
    }

    /// Look up a camera by id (`camera0`) or path (`/dev/video0`)
    pub fn get_camera(&self, identifier: &str) -> Option<CameraDevice> {
        let device_path = resolve_device_path(identifier, &self.config.device_dir)?;
        self.cameras.read().get(&device_path).cloned()
    }

    /// Normalise an identifier to a device path, connected or not
    pub fn device_path_for(&self, identifier: &str) -> Option<String> {
        resolve_device_path(identifier, &self.config.device_dir)
    }

    /// Resolve an identifier to the device path of a connected camera
    pub fn require_camera(&self, identifier: &str) -> std::result::Result<CameraDevice, CameraError> {
        self.get_camera(identifier).ok_or_else(|| CameraError::NotFound {
            device: identifier.to_string(),
        })
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.read().len()
    }

    pub fn mode(&self) -> MonitorMode {
        *self.mode.read()
    }

    /// Probe a newly seen node and publish CONNECTED once the probe completes.
    ///
    /// Returns `None` when the node is already known, fails probing, or was
    /// detached while the probe ran.
    pub async fn attach_device(&self, device_path: &str) -> Option<CameraDevice> {
        let generation = self.reserve(device_path)?;
        self.complete_attach(device_path, generation).await
    }

    /// Mark a node as pending so a removal seen before the probe finishes
    /// cancels the attach. `None` if it is already pending or known.
    fn reserve(&self, device_path: &str) -> Option<u64> {
        let mut pending = self.pending.lock();
        if pending.contains_key(device_path) || self.cameras.read().contains_key(device_path) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        pending.insert(device_path.to_string(), generation);
        Some(generation)
    }

    fn release(&self, device_path: &str, generation: u64) {
        let mut pending = self.pending.lock();
        if pending.get(device_path) == Some(&generation) {
            pending.remove(device_path);
        }
    }

    async fn complete_attach(&self, device_path: &str, generation: u64) -> Option<CameraDevice> {
        debug!("Probing {}", device_path);
        let probe = self.prober.probe(device_path).await;

        // Probing can succeed from configured defaults alone, so confirm the node
        if !tokio::fs::try_exists(device_path).await.unwrap_or(false) {
            debug!("{} vanished before it could be registered", device_path);
            self.release(device_path, generation);
            return None;
        }

        let camera = {
            let mut pending = self.pending.lock();
            if pending.get(device_path) != Some(&generation) {
                debug!("{} detached during probe, discarding result", device_path);
                return None;
            }
            pending.remove(device_path);

            match probe {
                Ok(result) => {
                    let camera_id = camera_id_for_path(device_path);
                    let camera = CameraDevice {
                        device_path: device_path.to_string(),
                        stream_urls: StreamUrls::for_camera(&self.mediamtx, &camera_id),
                        camera_id,
                        status: CameraStatus::Connected,
                        name: result.name,
                        resolution: result
                            .capabilities
                            .best_resolution()
                            .unwrap_or(&self.config.default_resolution)
                            .to_string(),
                        fps: result
                            .capabilities
                            .max_fps()
                            .unwrap_or(self.config.default_fps),
                        capabilities: result.capabilities,
                        connected_at: Utc::now(),
                    };
                    self.cameras
                        .write()
                        .insert(device_path.to_string(), camera.clone());
                    camera
                }
                Err(e) => {
                    debug!("Ignoring {}: {}", device_path, e);
                    self.ignored.lock().insert(device_path.to_string());
                    return None;
                }
            }
        };

        let _ = self
            .event_bus
            .publish(ServiceEvent::CameraConnected {
                camera: camera.clone(),
            })
            .await;

        Some(camera)
    }

    /// Drop a node from the inventory and publish DISCONNECTED right away
    pub async fn detach_device(&self, device_path: &str) -> bool {
        let removed = {
            let mut pending = self.pending.lock();
            pending.remove(device_path);
            self.ignored.lock().remove(device_path);
            self.cameras.write().remove(device_path)
        };

        match removed {
            Some(camera) => {
                let _ = self
                    .event_bus
                    .publish(ServiceEvent::CameraDisconnected {
                        device_path: camera.device_path,
                        camera_id: camera.camera_id,
                    })
                    .await;
                true
            }
            None => false,
        }
    }

    fn is_candidate(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(video_index)
            .map(|index| index <= self.config.max_device_index)
            .unwrap_or(false)
    }

    /// Candidate device nodes currently present, sorted
    async fn scan_devices(&self) -> Vec<String> {
        let mut found = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.config.device_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot read {}: {}", self.config.device_dir, e);
                return found;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if self.is_candidate(&path) {
                found.push(path.to_string_lossy().into_owned());
            }
        }

        found.sort();
        found
    }

    fn spawn_attach(&self, device_path: String, settle: Duration) {
        let generation = match self.reserve(&device_path) {
            Some(generation) => generation,
            None => return,
        };
        let monitor = self.clone();
        tokio::spawn(async move {
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            monitor.complete_attach(&device_path, generation).await;
        });
    }

    /// Diff the device directory against the inventory
    async fn reconcile(&self) {
        let dir_available = tokio::fs::metadata(&self.config.device_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        {
            let mut mode = self.mode.write();
            match (*mode, dir_available) {
                (MonitorMode::Unavailable, true) => {
                    info!("Device directory {} is now available", self.config.device_dir);
                    *mode = MonitorMode::Polling;
                }
                (MonitorMode::Polling, false) => {
                    warn!("Device directory {} disappeared", self.config.device_dir);
                    *mode = MonitorMode::Unavailable;
                }
                _ => {}
            }
        }

        let present: HashSet<String> = self.scan_devices().await.into_iter().collect();

        let known: Vec<String> = self.cameras.read().keys().cloned().collect();
        for device_path in known.iter().filter(|p| !present.contains(*p)) {
            self.detach_device(device_path).await;
        }

        self.ignored.lock().retain(|p| present.contains(p));

        for device_path in present {
            let known = self.cameras.read().contains_key(&device_path);
            let probing = self.pending.lock().contains_key(&device_path);
            let ignored = self.ignored.lock().contains(&device_path);
            if !(known || probing || ignored) {
                self.spawn_attach(device_path, Duration::ZERO);
            }
        }
    }

    fn start_polling(&self) {
        let interval_duration = Duration::from_secs(self.config.poll_interval_seconds.max(1));
        info!("Polling {} every {:?}", self.config.device_dir, interval_duration);

        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = interval.tick() => monitor.reconcile().await,
                }
            }
        });

        self.tasks.lock().push(handle);
    }

    #[cfg(feature = "hotplug")]
    fn start_watcher(&self) -> std::result::Result<(), CameraError> {
        use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};

        let (tx, mut rx) = tokio::sync::mpsc::channel::<Event>(100);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Err(e) = tx.blocking_send(event) {
                        debug!("Dropping device event: {}", e);
                    }
                }
                Err(e) => warn!("Device watcher error: {}", e),
            },
            NotifyConfig::default(),
        )
        .map_err(|e| CameraError::WatcherFailed {
            details: e.to_string(),
        })?;

        watcher
            .watch(Path::new(&self.config.device_dir), RecursiveMode::NonRecursive)
            .map_err(|e| CameraError::WatcherFailed {
                details: format!("cannot watch {}: {}", self.config.device_dir, e),
            })?;

        info!("Watching {} for camera hot-plug", self.config.device_dir);

        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => monitor.handle_fs_event(event).await,
                        None => break,
                    },
                }
            }
        });

        self.tasks.lock().push(handle);
        Ok(())
    }

    #[cfg(not(feature = "hotplug"))]
    fn start_watcher(&self) -> std::result::Result<(), CameraError> {
        Err(CameraError::WatcherFailed {
            details: "built without hot-plug support".to_string(),
        })
    }

    #[cfg(feature = "hotplug")]
    async fn handle_fs_event(&self, event: notify::Event) {
        use notify::EventKind;

        match event.kind {
            EventKind::Create(_) => {
                for path in event.paths.iter().filter(|p| self.is_candidate(p)) {
                    info!("Device node appeared: {}", path.display());
                    self.spawn_attach(path.to_string_lossy().into_owned(), HOTPLUG_SETTLE);
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths.iter().filter(|p| self.is_candidate(p)) {
                    info!("Device node removed: {}", path.display());
                    self.detach_device(&path.to_string_lossy()).await;
                }
            }
            _ => {}
        }
    }
}
