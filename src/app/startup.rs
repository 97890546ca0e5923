use super::routing::{spawn_event_router, spawn_health_monitor};
use super::types::{
    CAMERA_MONITOR, EVENT_ROUTER, MEDIAMTX, RECORDING_MANAGER, RPC_SERVER, STORAGE,
};
use super::{ComponentState, ServiceManager, COMPONENTS};
use crate::error::Result;
use crate::events::ServiceEvent;
use crate::media::HealthState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

impl ServiceManager {
    /// Register every component as stopped
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing camera service components");

        let mut states = self.component_states.lock().await;
        for component in COMPONENTS {
            states.insert(component.to_string(), ComponentState::Stopped);
        }
        drop(states);

        Ok(())
    }

    /// Start all components in dependency order.
    ///
    /// On error the components already started stay up; call `shutdown`
    /// to release them.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting camera service");

        // An unreachable media server is not fatal: the service keeps
        // answering queries and the health monitor reports recovery
        self.set_component_state(MEDIAMTX, ComponentState::Starting)
            .await;
        let health = self.backend.get_health().await;
        match health.status {
            HealthState::Healthy => info!(
                "Media server healthy ({} ms)",
                health.response_time_ms
            ),
            status => warn!(
                "Media server is {} ({}), continuing degraded",
                status.as_str(),
                health.details
            ),
        }
        self.set_component_state(MEDIAMTX, ComponentState::Running)
            .await;

        self.set_component_state(STORAGE, ComponentState::Starting)
            .await;
        if let Err(e) = self.store.start().await {
            error!("Failed to start storage: {}", e);
            self.set_component_state(STORAGE, ComponentState::Failed)
                .await;
            return Err(e.into());
        }
        self.set_component_state(STORAGE, ComponentState::Running)
            .await;

        // Routing must be subscribed before the monitor's initial scan
        // publishes its first CameraConnected events
        self.set_component_state(EVENT_ROUTER, ComponentState::Starting)
            .await;
        self.background_tasks.push(spawn_event_router(
            Arc::clone(&self.event_bus),
            Arc::clone(&self.backend),
            self.recordings.clone(),
            self.cancellation_token.child_token(),
        ));
        self.set_component_state(EVENT_ROUTER, ComponentState::Running)
            .await;

        self.set_component_state(CAMERA_MONITOR, ComponentState::Starting)
            .await;
        if let Err(e) = self.cameras.start().await {
            error!("Failed to start camera monitor: {}", e);
            self.set_component_state(CAMERA_MONITOR, ComponentState::Failed)
                .await;
            return Err(e);
        }
        self.set_component_state(CAMERA_MONITOR, ComponentState::Running)
            .await;
        info!(
            "Camera monitor running with {} cameras",
            self.cameras.camera_count()
        );

        // Sessions are created on demand; nothing to start
        self.set_component_state(RECORDING_MANAGER, ComponentState::Running)
            .await;

        self.set_component_state(RPC_SERVER, ComponentState::Starting)
            .await;
        let listener = match self.server.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to start JSON-RPC server: {}", e);
                self.set_component_state(RPC_SERVER, ComponentState::Failed)
                    .await;
                return Err(e);
            }
        };
        self.local_addr = listener.local_addr().ok();

        let server = Arc::clone(&self.server);
        let event_bus = Arc::clone(&self.event_bus);
        self.server_task = Some(tokio::spawn(async move {
            let result = server.serve(listener).await;
            if let Err(e) = &result {
                error!("JSON-RPC server error: {}", e);
                let _ = event_bus
                    .publish(ServiceEvent::ShutdownRequested {
                        reason: format!("JSON-RPC server failed: {}", e),
                    })
                    .await;
            }
            result
        }));
        self.set_component_state(RPC_SERVER, ComponentState::Running)
            .await;

        let interval = Duration::from_secs(self.config.system.health_check_interval_seconds.max(1));
        self.background_tasks.push(spawn_health_monitor(
            Arc::clone(&self.event_bus),
            Arc::clone(&self.backend),
            interval,
            health.status,
            self.cancellation_token.child_token(),
        ));

        info!("Camera service started successfully");
        Ok(())
    }
}
