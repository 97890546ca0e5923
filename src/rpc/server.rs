use super::handlers::{handle_request, RpcContext};
use super::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RpcError};
use crate::error::{Result, ServerError};
use crate::events::{EventBus, EventFilter, EventReceiver};
use crate::security::ConnectionGuard;
use crate::storage::FileKind;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Close code sent when the server is at its connection cap
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
const CLOSE_GOING_AWAY: u16 = 1001;

/// Shared state for the Axum server
#[derive(Clone)]
struct ServerState {
    ctx: Arc<RpcContext>,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
}

/// JSON-RPC over WebSocket, plus health and file download endpoints
pub struct RpcServer {
    state: ServerState,
}

impl RpcServer {
    pub fn new(ctx: Arc<RpcContext>, event_bus: Arc<EventBus>) -> Self {
        Self {
            state: ServerState {
                ctx,
                event_bus,
                cancel: CancellationToken::new(),
            },
        }
    }

    pub fn context(&self) -> &Arc<RpcContext> {
        &self.state.ctx
    }

    pub fn router(&self) -> Router {
        let ctx = &self.state.ctx;
        Router::new()
            .route(&ctx.server.websocket_path, get(ws_handler))
            .route("/health", get(health_handler))
            .nest_service(
                "/files/recordings",
                ServeDir::new(ctx.store.dir(FileKind::Recordings)),
            )
            .nest_service(
                "/files/snapshots",
                ServeDir::new(ctx.store.dir(FileKind::Snapshots)),
            )
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.state.clone())
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.state.ctx.server.host, self.state.ctx.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::BindFailed {
                address: addr.clone(),
                source: e,
            })?;
        info!("JSON-RPC server listening on {}", addr);
        Ok(listener)
    }

    /// Serve until `shutdown` is called
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let cancel = self.state.cancel.clone();
        let app = self.router();

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ServerError::StartupFailed {
            details: format!("Server error: {}", e),
        })?;

        info!("JSON-RPC server stopped");
        Ok(())
    }

    /// Stop accepting connections and close the open ones
    pub fn shutdown(&self) {
        self.state.cancel.cancel();
    }
}

async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.ctx.service_status().await))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    let client_id = Uuid::new_v4().to_string();

    // Fail fast before upgrading; the authoritative check happens on admit
    if !state.ctx.security.can_accept_connection(&client_id) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "connection limit reached" })),
        )
            .into_response();
    }

    ws.max_message_size(state.ctx.server.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

async fn handle_socket(mut socket: WebSocket, state: ServerState, client_id: String) {
    let guard = match state.ctx.security.admit(&client_id) {
        Ok(guard) => guard,
        Err(e) => {
            warn!("Closing connection {}: {}", client_id, e);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_TRY_AGAIN_LATER,
                    reason: "connection limit reached".into(),
                })))
                .await;
            return;
        }
    };

    info!("Client {} connected", client_id);
    run_connection(socket, &state, &client_id, guard).await;

    state.ctx.subscriptions.remove_client(&client_id);
    state.ctx.security.release(&client_id);
    info!("Client {} disconnected", client_id);
}

async fn run_connection(
    socket: WebSocket,
    state: &ServerState,
    client_id: &str,
    _guard: ConnectionGuard,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Subscribe before serving requests so no event published after a
    // subscribe_events response is missed
    let events = EventReceiver::new(
        state.event_bus.subscribe(),
        EventFilter::Notifiable,
        client_id,
    );
    let event_task = tokio::spawn(forward_events(
        Arc::clone(&state.ctx),
        client_id.to_string(),
        events,
        tx.clone(),
    ));

    loop {
        let frame = tokio::select! {
            _ = state.cancel.cancelled() => {
                let _ = tx.send(Message::Close(Some(CloseFrame {
                    code: CLOSE_GOING_AWAY,
                    reason: "server shutting down".into(),
                })));
                break;
            }
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                // Handled inline: responses keep request order, and a client
                // leaving mid-request does not cancel the work
                if let Some(reply) = process_text(&state.ctx, client_id, &text).await {
                    if tx.send(Message::Text(reply)).is_err() {
                        break;
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => {
                let reply = JsonRpcResponse::failure(
                    Value::Null,
                    RpcError::invalid_request("Binary frames are not supported"),
                );
                if send_json(&tx, &reply).is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("WebSocket error from {}: {}", client_id, e);
                break;
            }
        }
    }

    event_task.abort();
    drop(tx);
    let _ = send_task.await;
}

/// Handle one text frame: a single request or a batch
pub(crate) async fn process_text(ctx: &RpcContext, client_id: &str, text: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("Unparseable frame from {}: {}", client_id, e);
            let reply = JsonRpcResponse::failure(Value::Null, RpcError::parse_error());
            return serde_json::to_string(&reply).ok();
        }
    };

    match value {
        Value::Array(items) if items.is_empty() => {
            let reply = JsonRpcResponse::failure(
                Value::Null,
                RpcError::invalid_request("Empty batch"),
            );
            serde_json::to_string(&reply).ok()
        }
        Value::Array(items) => {
            let mut replies = Vec::with_capacity(items.len());
            for item in items {
                if let Some(reply) = process_value(ctx, client_id, item).await {
                    replies.push(reply);
                }
            }
            if replies.is_empty() {
                None
            } else {
                serde_json::to_string(&replies).ok()
            }
        }
        single => {
            let reply = process_value(ctx, client_id, single).await?;
            serde_json::to_string(&reply).ok()
        }
    }
}

async fn process_value(ctx: &RpcContext, client_id: &str, value: Value) -> Option<JsonRpcResponse> {
    match JsonRpcRequest::from_value(value) {
        Ok(request) => handle_request(ctx, client_id, request).await,
        Err((id, error)) => Some(JsonRpcResponse::failure(id, error)),
    }
}

async fn forward_events(
    ctx: Arc<RpcContext>,
    client_id: String,
    mut events: EventReceiver,
    tx: mpsc::UnboundedSender<Message>,
) {
    while let Ok(event) = events.recv().await {
        let topic = match event.topic() {
            Some(topic) => topic,
            None => continue,
        };
        let params = event.notification_params();
        if !ctx.subscriptions.wants(&client_id, topic, &params) {
            continue;
        }

        let notification = JsonRpcNotification::new(topic, params);
        if send_json(&tx, &notification).is_err() {
            break;
        }
    }
    debug!("Event forwarding for {} ended", client_id);
}

fn send_json<T: Serialize>(tx: &mpsc::UnboundedSender<Message>, payload: &T) -> std::result::Result<(), ()> {
    let text = serde_json::to_string(payload).map_err(|_| ())?;
    tx.send(Message::Text(text)).map_err(|_| ())
}
