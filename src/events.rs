use crate::camera::CameraDevice;
use crate::error::EventBusError;
use crate::recording::{RecordingSession, SnapshotResult, StopReason};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub const TOPIC_CAMERA_CONNECTED: &str = "camera.connected";
pub const TOPIC_CAMERA_DISCONNECTED: &str = "camera.disconnected";
pub const TOPIC_RECORDING_START: &str = "recording.start";
pub const TOPIC_RECORDING_STOP: &str = "recording.stop";
pub const TOPIC_RECORDING_FAILED: &str = "recording.failed";
pub const TOPIC_SNAPSHOT_TAKEN: &str = "snapshot.taken";
pub const TOPIC_SYSTEM_HEALTH: &str = "system.health";

/// Every topic a client may subscribe to
pub const TOPICS: &[&str] = &[
    TOPIC_CAMERA_CONNECTED,
    TOPIC_CAMERA_DISCONNECTED,
    TOPIC_RECORDING_START,
    TOPIC_RECORDING_STOP,
    TOPIC_RECORDING_FAILED,
    TOPIC_SNAPSHOT_TAKEN,
    TOPIC_SYSTEM_HEALTH,
];

pub fn is_known_topic(topic: &str) -> bool {
    TOPICS.contains(&topic)
}

/// Events that can occur in the camera service
#[derive(Debug, Clone, Serialize)]
pub enum ServiceEvent {
    /// A camera finished probing and is ready for streaming
    CameraConnected { camera: CameraDevice },
    /// A camera node disappeared
    CameraDisconnected {
        device_path: String,
        camera_id: String,
    },
    /// The media backend confirmed a new recording
    RecordingStarted { session: RecordingSession },
    /// A recording was finalised
    RecordingStopped {
        session: RecordingSession,
        reason: StopReason,
    },
    /// A recording moved to FAILED
    RecordingFailed {
        session: RecordingSession,
        error: String,
    },
    SnapshotTaken { snapshot: SnapshotResult },
    /// A component's health changed
    HealthChanged {
        component: String,
        status: String,
        details: String,
    },
    /// A system error occurred in a component
    SystemError { component: String, error: String },
    /// System shutdown requested
    ShutdownRequested { reason: String },
}

impl ServiceEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            ServiceEvent::CameraConnected { camera } => {
                format!("Camera {} connected ({})", camera.camera_id, camera.name)
            }
            ServiceEvent::CameraDisconnected { device_path, .. } => {
                format!("Camera {} disconnected", device_path)
            }
            ServiceEvent::RecordingStarted { session } => {
                format!(
                    "Recording {} started on {}",
                    session.session_id, session.device_path
                )
            }
            ServiceEvent::RecordingStopped { session, reason } => {
                format!(
                    "Recording {} stopped ({})",
                    session.session_id,
                    reason.as_str()
                )
            }
            ServiceEvent::RecordingFailed { session, error } => {
                format!("Recording {} failed: {}", session.session_id, error)
            }
            ServiceEvent::SnapshotTaken { snapshot } => {
                format!("Snapshot {} taken on {}", snapshot.filename, snapshot.device)
            }
            ServiceEvent::HealthChanged {
                component, status, ..
            } => format!("{} is now {}", component, status),
            ServiceEvent::SystemError { component, error } => {
                format!("Error in {}: {}", component, error)
            }
            ServiceEvent::ShutdownRequested { reason } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            ServiceEvent::CameraConnected { .. } => "camera_connected",
            ServiceEvent::CameraDisconnected { .. } => "camera_disconnected",
            ServiceEvent::RecordingStarted { .. } => "recording_started",
            ServiceEvent::RecordingStopped { .. } => "recording_stopped",
            ServiceEvent::RecordingFailed { .. } => "recording_failed",
            ServiceEvent::SnapshotTaken { .. } => "snapshot_taken",
            ServiceEvent::HealthChanged { .. } => "health_changed",
            ServiceEvent::SystemError { .. } => "system_error",
            ServiceEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }

    /// Client notification topic, for events clients can subscribe to
    pub fn topic(&self) -> Option<&'static str> {
        match self {
            ServiceEvent::CameraConnected { .. } => Some(TOPIC_CAMERA_CONNECTED),
            ServiceEvent::CameraDisconnected { .. } => Some(TOPIC_CAMERA_DISCONNECTED),
            ServiceEvent::RecordingStarted { .. } => Some(TOPIC_RECORDING_START),
            ServiceEvent::RecordingStopped { .. } => Some(TOPIC_RECORDING_STOP),
            ServiceEvent::RecordingFailed { .. } => Some(TOPIC_RECORDING_FAILED),
            ServiceEvent::SnapshotTaken { .. } => Some(TOPIC_SNAPSHOT_TAKEN),
            ServiceEvent::HealthChanged { .. } => Some(TOPIC_SYSTEM_HEALTH),
            ServiceEvent::SystemError { .. } | ServiceEvent::ShutdownRequested { .. } => None,
        }
    }

    /// Camera identifier the event concerns, used by subscription filters
    pub fn camera_id(&self) -> Option<&str> {
        match self {
            ServiceEvent::CameraConnected { camera } => Some(&camera.camera_id),
            ServiceEvent::CameraDisconnected { camera_id, .. } => Some(camera_id),
            ServiceEvent::RecordingStarted { session }
            | ServiceEvent::RecordingStopped { session, .. }
            | ServiceEvent::RecordingFailed { session, .. } => Some(&session.camera_id),
            ServiceEvent::SnapshotTaken { snapshot } => Some(&snapshot.device),
            _ => None,
        }
    }

    /// Notification params sent to subscribed clients
    pub fn notification_params(&self) -> Value {
        match self {
            ServiceEvent::CameraConnected { camera } => json!({
                "device": camera.camera_id,
                "device_path": camera.device_path,
                "status": camera.status,
                "name": camera.name,
                "resolution": camera.resolution,
                "fps": camera.fps,
                "streams": camera.stream_urls,
            }),
            ServiceEvent::CameraDisconnected {
                device_path,
                camera_id,
            } => json!({
                "device": camera_id,
                "device_path": device_path,
                "status": "DISCONNECTED",
            }),
            ServiceEvent::RecordingStarted { session } => session.to_json(),
            ServiceEvent::RecordingStopped { session, reason } => {
                let mut params = session.to_json();
                params["reason"] = json!(reason.as_str());
                params
            }
            ServiceEvent::RecordingFailed { session, error } => {
                let mut params = session.to_json();
                params["error"] = json!(error);
                params
            }
            ServiceEvent::SnapshotTaken { snapshot } => {
                serde_json::to_value(snapshot).unwrap_or(Value::Null)
            }
            ServiceEvent::HealthChanged {
                component,
                status,
                details,
            } => json!({
                "component": component,
                "status": status,
                "details": details,
            }),
            ServiceEvent::SystemError { component, error } => json!({
                "component": component,
                "error": error,
            }),
            ServiceEvent::ShutdownRequested { reason } => json!({ "reason": reason }),
        }
    }
}

/// Async event bus for component coordination using broadcast channels
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers, returning how many received it
    pub async fn publish(&self, event: ServiceEvent) -> Result<usize, EventBusError> {
        match &event {
            ServiceEvent::CameraConnected { camera } => {
                info!("Camera connected: {} ({})", camera.device_path, camera.name);
            }
            ServiceEvent::CameraDisconnected { device_path, .. } => {
                warn!("Camera disconnected: {}", device_path);
            }
            ServiceEvent::RecordingFailed { session, error } => {
                error!("Recording {} failed: {}", session.session_id, error);
            }
            ServiceEvent::SystemError { component, error } => {
                error!("System error in {}: {}", component, error);
            }
            ServiceEvent::ShutdownRequested { reason } => {
                info!("Shutdown requested: {}", reason);
            }
            _ => debug!("Publishing event: {}", event.description()),
        }

        if self.sender.receiver_count() == 0 {
            return Ok(0);
        }

        self.sender
            .send(event)
            .map_err(|e| EventBusError::PublishFailed {
                details: e.to_string(),
            })
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Accept all events
    All,
    /// Accept only specific event types
    EventTypes(Vec<&'static str>),
    /// Accept only events that map to a client topic
    Notifiable,
}

impl EventFilter {
    /// Check if an event passes this filter
    pub fn matches(&self, event: &ServiceEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
            EventFilter::Notifiable => event.topic().is_some(),
        }
    }
}

/// Event receiver with filtering
pub struct EventReceiver {
    receiver: broadcast::Receiver<ServiceEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    pub fn new(receiver: broadcast::Receiver<ServiceEvent>, filter: EventFilter, name: &str) -> Self {
        Self {
            receiver,
            filter,
            name: name.to_string(),
        }
    }

    /// Receive the next filtered event.
    ///
    /// Lagging is logged and skipped; only a closed bus ends the stream.
    pub async fn recv(&mut self) -> Result<ServiceEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        debug!(
                            "Receiver '{}' received event: {}",
                            self.name,
                            event.description()
                        );
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraCapabilities, CameraStatus, StreamUrls};
    use chrono::Utc;
    use tokio::time::{timeout, Duration};

    fn camera() -> CameraDevice {
        CameraDevice {
            device_path: "/dev/video0".to_string(),
            camera_id: "camera0".to_string(),
            status: CameraStatus::Connected,
            name: "USB Camera".to_string(),
            resolution: "1280x720".to_string(),
            fps: 30,
            stream_urls: StreamUrls {
                rtsp: "rtsp://127.0.0.1:8554/camera0".to_string(),
                webrtc: "http://127.0.0.1:8889/camera0".to_string(),
                hls: "http://127.0.0.1:8888/camera0".to_string(),
            },
            capabilities: CameraCapabilities::default(),
            connected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_basic_operations() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let delivered = event_bus
            .publish(ServiceEvent::CameraConnected { camera: camera() })
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        match receiver.recv().await.unwrap() {
            ServiceEvent::CameraConnected { camera } => {
                assert_eq!(camera.device_path, "/dev/video0");
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_not_an_error() {
        let event_bus = EventBus::new(4);
        let delivered = event_bus
            .publish(ServiceEvent::ShutdownRequested {
                reason: "test".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_filtered_receiver_skips_internal_events() {
        let event_bus = EventBus::new(10);
        let mut receiver =
            EventReceiver::new(event_bus.subscribe(), EventFilter::Notifiable, "test");

        event_bus
            .publish(ServiceEvent::SystemError {
                component: "camera_monitor".to_string(),
                error: "boom".to_string(),
            })
            .await
            .unwrap();
        event_bus
            .publish(ServiceEvent::CameraDisconnected {
                device_path: "/dev/video0".to_string(),
                camera_id: "camera0".to_string(),
            })
            .await
            .unwrap();

        let received = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.topic(), Some(TOPIC_CAMERA_DISCONNECTED));
    }

    #[test]
    fn test_event_properties() {
        let event = ServiceEvent::CameraConnected { camera: camera() };

        assert_eq!(event.event_type(), "camera_connected");
        assert_eq!(event.topic(), Some("camera.connected"));
        assert_eq!(event.camera_id(), Some("camera0"));

        let params = event.notification_params();
        assert_eq!(params["device"], "camera0");
        assert_eq!(params["status"], "CONNECTED");
        assert_eq!(params["streams"]["rtsp"], "rtsp://127.0.0.1:8554/camera0");
    }

    #[test]
    fn test_topic_catalogue() {
        assert!(is_known_topic("recording.start"));
        assert!(!is_known_topic("recording.paused"));
        let health = ServiceEvent::HealthChanged {
            component: "mediamtx".to_string(),
            status: "degraded".to_string(),
            details: String::new(),
        };
        assert!(EventFilter::EventTypes(vec!["health_changed"]).matches(&health));
        assert!(!EventFilter::EventTypes(vec!["system_error"]).matches(&health));
    }
}
