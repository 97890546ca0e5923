//! Background tasks owned by the service manager: routing camera hot-plug
//! events to the media backend and the recording manager, and watching the
//! media server's health.

use crate::events::{EventBus, EventFilter, EventReceiver, ServiceEvent};
use crate::media::{HealthState, MediaBackend};
use crate::recording::RecordingManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Subscribe now, so events published right after this call are routed
pub(super) fn spawn_event_router(
    event_bus: Arc<EventBus>,
    backend: Arc<dyn MediaBackend>,
    recordings: RecordingManager,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut events = EventReceiver::new(
        event_bus.subscribe(),
        EventFilter::EventTypes(vec!["camera_connected", "camera_disconnected"]),
        "service-router",
    );

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(event) => route_event(&event_bus, backend.as_ref(), &recordings, event).await,
                Err(_) => break,
            }
        }
        debug!("Event router stopped");
    })
}

async fn route_event(
    event_bus: &EventBus,
    backend: &dyn MediaBackend,
    recordings: &RecordingManager,
    event: ServiceEvent,
) {
    match event {
        ServiceEvent::CameraConnected { camera } => {
            match backend
                .create_stream(&camera.camera_id, &camera.device_path)
                .await
            {
                Ok(()) => info!(
                    "Stream {} created for {}",
                    camera.camera_id, camera.device_path
                ),
                Err(e) => {
                    warn!(
                        "Failed to create stream {} for {}: {}",
                        camera.camera_id, camera.device_path, e
                    );
                    let _ = event_bus
                        .publish(ServiceEvent::SystemError {
                            component: "mediamtx".to_string(),
                            error: format!("create stream {}: {}", camera.camera_id, e),
                        })
                        .await;
                }
            }
        }
        ServiceEvent::CameraDisconnected {
            device_path,
            camera_id,
        } => {
            // Recording first: the backend path must still exist to finalize
            recordings.handle_device_disconnected(&device_path).await;

            if let Err(e) = backend.delete_stream(&camera_id).await {
                warn!("Failed to delete stream {}: {}", camera_id, e);
            } else {
                info!("Stream {} removed after {} disconnected", camera_id, device_path);
            }
        }
        _ => {}
    }
}

/// Poll backend health and publish a `HealthChanged` event on every transition
pub(super) fn spawn_health_monitor(
    event_bus: Arc<EventBus>,
    backend: Arc<dyn MediaBackend>,
    interval: Duration,
    initial: HealthState,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = initial;
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately and the caller already checked
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let health = backend.get_health().await;
            if health.status == last {
                continue;
            }

            if health.status == HealthState::Healthy {
                info!("Media server recovered ({})", health.details);
            } else {
                warn!(
                    "Media server is {}: {}",
                    health.status.as_str(),
                    health.details
                );
            }

            let _ = event_bus
                .publish(ServiceEvent::HealthChanged {
                    component: "mediamtx".to_string(),
                    status: health.status.as_str().to_string(),
                    details: health.details.clone(),
                })
                .await;
            last = health.status;
        }
        debug!("Health monitor stopped");
    })
}
