use super::{ServiceManager, ShutdownReason};
use crate::error::{Result, ServiceError};
use crate::events::{EventFilter, EventReceiver, ServiceEvent};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

type SharedSender = Arc<Mutex<Option<oneshot::Sender<ShutdownReason>>>>;

impl ServiceManager {
    /// Run until a signal or a shutdown request arrives, then shut down
    pub async fn run(&mut self) -> Result<i32> {
        info!("Camera service is running");

        let shutdown_sender = self
            .shutdown_sender
            .take()
            .ok_or_else(|| ServiceError::system("Shutdown sender already taken"))?;

        let shutdown_receiver = self
            .shutdown_receiver
            .take()
            .ok_or_else(|| ServiceError::system("Shutdown receiver already taken"))?;

        let shutdown_sender = Arc::new(Mutex::new(Some(shutdown_sender)));
        self.setup_signal_handlers(&shutdown_sender);
        self.watch_shutdown_requests(&shutdown_sender);

        let shutdown_reason = shutdown_receiver
            .await
            .map_err(|_| ServiceError::system("Shutdown channel closed unexpectedly"))?;

        info!("Shutdown initiated: {:?}", shutdown_reason);

        let exit_code = self.shutdown().await?;

        info!("Camera service shutdown complete");
        Ok(exit_code)
    }

    /// Set up signal handlers for graceful shutdown
    fn setup_signal_handlers(&self, shutdown_sender: &SharedSender) {
        // Handle SIGTERM (systemd stop) - Unix only
        #[cfg(unix)]
        {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    let sender = Arc::clone(shutdown_sender);
                    tokio::spawn(async move {
                        if sigterm.recv().await.is_some() {
                            info!("Received SIGTERM signal");
                            send_reason(&sender, ShutdownReason::Signal("SIGTERM".to_string()))
                                .await;
                        }
                    });
                }
                Err(e) => warn!("Failed to register SIGTERM handler: {}", e),
            }
        }

        // Handle SIGINT (Ctrl+C) - Cross-platform
        let sender = Arc::clone(shutdown_sender);
        tokio::spawn(async move {
            if let Ok(()) = signal::ctrl_c().await {
                info!("Received SIGINT signal (Ctrl+C)");
                send_reason(&sender, ShutdownReason::Signal("SIGINT".to_string())).await;
            }
        });
    }

    /// Turn a `ShutdownRequested` event into a shutdown
    fn watch_shutdown_requests(&self, shutdown_sender: &SharedSender) {
        let mut events = EventReceiver::new(
            self.event_bus.subscribe(),
            EventFilter::EventTypes(vec!["shutdown_requested"]),
            "shutdown-watcher",
        );
        let sender = Arc::clone(shutdown_sender);
        let cancel = self.cancellation_token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                event = events.recv() => {
                    if let Ok(ServiceEvent::ShutdownRequested { reason }) = event {
                        send_reason(&sender, ShutdownReason::Requested(reason)).await;
                    }
                }
            }
        });
    }
}

async fn send_reason(sender: &SharedSender, reason: ShutdownReason) {
    if let Some(sender) = sender.lock().await.take() {
        let _ = sender.send(reason);
    }
}
