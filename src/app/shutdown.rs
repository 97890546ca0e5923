use super::types::{
    CAMERA_MONITOR, EVENT_ROUTER, MEDIAMTX, RECORDING_MANAGER, RPC_SERVER, STORAGE,
};
use super::{ComponentState, ServiceManager};
use crate::error::{Result, ServiceError};
use crate::recording::StopReason;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

impl ServiceManager {
    /// Perform graceful shutdown of all components.
    ///
    /// Safe to call more than once; returns the process exit code.
    pub async fn shutdown(&mut self) -> Result<i32> {
        info!("Beginning graceful shutdown");
        let failed = self.failed_components().await;
        if !failed.is_empty() {
            warn!("Shutting down with failed components: {}", failed.join(", "));
        }

        let limit = Duration::from_secs(self.config.system.shutdown_timeout_seconds);
        let mut exit_code = 0;

        // Stop components in reverse dependency order
        self.server.shutdown();
        if let Some(task) = self.server_task.take() {
            let served = async move {
                task.await
                    .map_err(|e| ServiceError::system(format!("server task panicked: {}", e)))?
            };
            if let Err(e) = self.stop_component(RPC_SERVER, limit, served).await {
                error!("Error stopping {}: {}", RPC_SERVER, e);
                exit_code = 1;
            }
        } else {
            self.set_component_state(RPC_SERVER, ComponentState::Stopped)
                .await;
        }

        let recordings = self.recordings.clone();
        let stop_recordings = async move {
            recordings.stop_all(StopReason::Shutdown).await;
            Ok::<(), ServiceError>(())
        };
        if let Err(e) = self
            .stop_component(RECORDING_MANAGER, limit, stop_recordings)
            .await
        {
            error!("Error stopping {}: {}", RECORDING_MANAGER, e);
            exit_code = 1;
        }

        let cameras = self.cameras.clone();
        if let Err(e) = self
            .stop_component(CAMERA_MONITOR, limit, async move { cameras.stop().await })
            .await
        {
            error!("Error stopping {}: {}", CAMERA_MONITOR, e);
            exit_code = 1;
        }

        // Router and health monitor end on cancellation
        self.cancellation_token.cancel();
        let tasks: Vec<_> = self.background_tasks.drain(..).collect();
        let background = async move {
            for task in tasks {
                let _ = task.await;
            }
            Ok::<(), ServiceError>(())
        };
        if let Err(e) = self.stop_component(EVENT_ROUTER, limit, background).await {
            error!("Error stopping {}: {}", EVENT_ROUTER, e);
            exit_code = 1;
        }

        let store = self.store.clone();
        let stop_store = async move {
            store.stop().await;
            Ok::<(), ServiceError>(())
        };
        if let Err(e) = self.stop_component(STORAGE, limit, stop_store).await {
            error!("Error stopping {}: {}", STORAGE, e);
            exit_code = 1;
        }

        self.set_component_state(MEDIAMTX, ComponentState::Stopped)
            .await;

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    /// Run a component's stop future under a timeout, tracking its state
    async fn stop_component<F>(&self, component: &str, limit: Duration, stop: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        info!("Stopping {} component", component);
        self.set_component_state(component, ComponentState::Stopping)
            .await;

        match timeout(limit, stop).await {
            Ok(Ok(())) => {
                self.set_component_state(component, ComponentState::Stopped)
                    .await;
                info!("{} component stopped", component);
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_component_state(component, ComponentState::Failed)
                    .await;
                Err(e)
            }
            Err(_) => {
                self.set_component_state(component, ComponentState::Failed)
                    .await;
                Err(ServiceError::component(
                    component.to_string(),
                    format!("stop timed out after {}s", limit.as_secs()),
                ))
            }
        }
    }
}
