use super::params::{
    self, AuthenticateParams, DeviceParams, FilenameParams, ListParams, RetentionPolicyParams,
    SessionParams, SnapshotParams, StartRecordingParams, StopRecordingParams, SubscribeParams,
    UnsubscribeParams,
};
use super::protocol::{JsonRpcRequest, JsonRpcResponse, RpcError, INTERNAL_ERROR};
use super::subscriptions::SubscriptionRegistry;
use crate::camera::{CameraDevice, CameraMonitor};
use crate::config::ServerConfig;
use crate::error::{RecordingError, SecurityError, ServiceError};
use crate::events::TOPICS;
use crate::media::{HealthState, MediaBackend};
use crate::recording::RecordingManager;
use crate::security::{known_methods, method_access, SecurityMiddleware};
use crate::storage::{FileKind, FileStore, RetentionPolicy, RetentionPolicyType};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

type HandlerResult = Result<Value, RpcError>;

/// Request counters kept by the dispatcher
#[derive(Debug, Default)]
pub struct RpcMetrics {
    inner: Mutex<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests_total: u64,
    errors_total: u64,
    total_latency_ms: f64,
    per_method: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub errors_total: u64,
    pub average_response_time_ms: f64,
    pub requests_by_method: BTreeMap<String, u64>,
}

impl RpcMetrics {
    fn record(&self, method: &str, elapsed_ms: f64, failed: bool) {
        let mut inner = self.inner.lock();
        inner.requests_total += 1;
        if failed {
            inner.errors_total += 1;
        }
        inner.total_latency_ms += elapsed_ms;
        *inner.per_method.entry(method.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        MetricsSnapshot {
            requests_total: inner.requests_total,
            errors_total: inner.errors_total,
            average_response_time_ms: if inner.requests_total == 0 {
                0.0
            } else {
                inner.total_latency_ms / inner.requests_total as f64
            },
            requests_by_method: inner.per_method.clone(),
        }
    }
}

/// Everything a method handler can reach
pub struct RpcContext {
    pub server: ServerConfig,
    pub security: Arc<SecurityMiddleware>,
    pub cameras: CameraMonitor,
    pub recordings: RecordingManager,
    pub backend: Arc<dyn MediaBackend>,
    pub store: FileStore,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub metrics: RpcMetrics,
    pub started_at: Instant,
}

impl RpcContext {
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Body of the HTTP health endpoint and the `get_status` result
    pub async fn service_status(&self) -> Value {
        let backend = self.backend.get_health().await;
        let status = match backend.status {
            HealthState::Healthy => "healthy",
            HealthState::Degraded | HealthState::Unhealthy => "degraded",
        };

        json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": self.uptime_seconds(),
            "components": {
                "websocket_server": {
                    "status": "running",
                    "connections": self.security.active_connections(),
                },
                "camera_monitor": {
                    "status": self.cameras.mode(),
                    "cameras": self.cameras.camera_count(),
                },
                "mediamtx": backend,
                "recording_manager": {
                    "status": "running",
                    "active_recordings": self.recordings.active_count(),
                },
            },
        })
    }
}

/// Run one request through rate limiting, authorization and dispatch.
///
/// Returns `None` for notifications.
pub async fn handle_request(
    ctx: &RpcContext,
    client_id: &str,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    let started = Instant::now();
    let JsonRpcRequest { method, params, id } = request;

    let result = match admit(ctx, client_id, &method) {
        Ok(()) => dispatch(ctx, client_id, &method, params).await,
        Err(e) => Err(e),
    };

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    ctx.metrics.record(&method, elapsed_ms, result.is_err());

    if let Err(e) = &result {
        if e.code == INTERNAL_ERROR {
            error!("{} from {} failed: {:?}", method, client_id, e.data);
        } else {
            debug!("{} from {} rejected with {}", method, client_id, e.code);
        }
    }

    let id = id?;
    Some(match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::failure(id, e),
    })
}

fn admit(ctx: &RpcContext, client_id: &str, method: &str) -> Result<(), RpcError> {
    ctx.security.check_rate_limit(client_id)?;
    if method_access(method).is_none() {
        return Err(RpcError::method_not_found(method));
    }
    ctx.security.authorize(client_id, method)?;
    Ok(())
}

async fn dispatch(
    ctx: &RpcContext,
    client_id: &str,
    method: &str,
    raw: Option<Value>,
) -> HandlerResult {
    match method {
        "ping" => Ok(json!("pong")),
        "authenticate" => authenticate(ctx, client_id, params::parse(raw)?),

        "get_camera_list" => Ok(get_camera_list(ctx)),
        "get_camera_status" => get_camera_status(ctx, params::parse::<DeviceParams>(raw)?),
        "get_camera_capabilities" => {
            get_camera_capabilities(ctx, params::parse::<DeviceParams>(raw)?)
        }
        "get_streams" => get_streams(ctx).await,
        "list_recordings" => list_files(ctx, FileKind::Recordings, params::parse(raw)?).await,
        "list_snapshots" => list_files(ctx, FileKind::Snapshots, params::parse(raw)?).await,
        "get_recording_info" => file_info(ctx, FileKind::Recordings, params::parse(raw)?).await,
        "get_snapshot_info" => file_info(ctx, FileKind::Snapshots, params::parse(raw)?).await,
        "get_recording_status" => {
            let params: SessionParams = params::parse(raw)?;
            Ok(ctx.recordings.get_recording_status(&params.session_id)?.to_json())
        }
        "get_metrics" => Ok(get_metrics(ctx).await),
        "get_status" => Ok(ctx.service_status().await),
        "get_server_info" => Ok(get_server_info(ctx)),

        "take_snapshot" => take_snapshot(ctx, params::parse::<SnapshotParams>(raw)?).await,
        "start_recording" => {
            start_recording(ctx, params::parse::<StartRecordingParams>(raw)?).await
        }
        "stop_recording" => {
            let target = params::parse::<StopRecordingParams>(raw)?.target()?;
            Ok(ctx.recordings.stop_recording(&target).await?.to_json())
        }
        "subscribe_events" => subscribe_events(ctx, client_id, params::parse(raw)?),
        "unsubscribe_events" => unsubscribe_events(ctx, client_id, params::parse(raw)?),

        "get_storage_info" => get_storage_info(ctx).await,
        "get_subscription_stats" => Ok(get_subscription_stats(ctx, client_id)),
        "delete_recording" => delete_file(ctx, FileKind::Recordings, params::parse(raw)?).await,
        "delete_snapshot" => delete_file(ctx, FileKind::Snapshots, params::parse(raw)?).await,
        "cleanup_old_files" => {
            let result = ctx.store.cleanup_old_files().await?;
            Ok(json!({
                "cleanup_executed": true,
                "files_deleted": result.files_deleted,
                "space_freed": result.bytes_freed,
                "policy": result.policy,
                "errors": result.errors,
            }))
        }
        "set_retention_policy" => set_retention_policy(ctx, params::parse(raw)?),

        // Listed in the access table but not dispatched here
        other => {
            warn!("No handler registered for {}", other);
            Err(RpcError::method_not_found(other))
        }
    }
}

fn authenticate(ctx: &RpcContext, client_id: &str, params: AuthenticateParams) -> HandlerResult {
    let token = params.auth_token.unwrap_or_default();
    let result = ctx.security.authenticate(client_id, &token);
    if !result.authenticated {
        let error = result.error.unwrap_or(SecurityError::AuthenticationFailed {
            reason: result
                .error_message
                .unwrap_or_else(|| "invalid token".to_string()),
        });
        return Err(error.into());
    }

    let session = ctx.security.session(client_id);
    Ok(json!({
        "authenticated": true,
        "role": result.role.map(|role| role.as_str()),
        "permissions": result.role.map(|role| role.permissions()).unwrap_or_default(),
        "expires_at": result.expires_at,
        "session_id": session.and_then(|s| s.session_id),
    }))
}

fn camera_json(camera: &CameraDevice) -> Value {
    json!({
        "device": camera.camera_id,
        "device_path": camera.device_path,
        "status": camera.status,
        "name": camera.name,
        "resolution": camera.resolution,
        "fps": camera.fps,
        "streams": camera.stream_urls,
    })
}

fn get_camera_list(ctx: &RpcContext) -> Value {
    let mut cameras: Vec<CameraDevice> = ctx.cameras.get_connected_cameras().into_values().collect();
    cameras.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));

    json!({
        "cameras": cameras.iter().map(camera_json).collect::<Vec<_>>(),
        "total": cameras.len(),
        "connected": cameras.len(),
    })
}

fn get_camera_status(ctx: &RpcContext, params: DeviceParams) -> HandlerResult {
    let params = params.validate()?;
    let camera = ctx
        .cameras
        .require_camera(&params.device)
        .map_err(ServiceError::from)?;
    let session = ctx.recordings.active_session_for(&camera.device_path);

    let mut value = camera_json(&camera);
    value["capabilities"] = json!(camera.capabilities);
    value["connected_at"] = json!(camera.connected_at.to_rfc3339());
    value["recording"] = json!(session.is_some());
    value["session_id"] = json!(session.map(|s| s.session_id));
    Ok(value)
}

fn get_camera_capabilities(ctx: &RpcContext, params: DeviceParams) -> HandlerResult {
    let params = params.validate()?;
    let camera = ctx
        .cameras
        .require_camera(&params.device)
        .map_err(ServiceError::from)?;

    Ok(json!({
        "device": camera.camera_id,
        "formats": camera.capabilities.formats,
        "resolutions": camera.capabilities.resolutions,
        "frame_rates": camera.capabilities.frame_rates,
        "probed": camera.capabilities.probed,
    }))
}

async fn get_streams(ctx: &RpcContext) -> HandlerResult {
    let streams = ctx
        .backend
        .list_streams()
        .await
        .map_err(ServiceError::from)?;
    Ok(json!(streams))
}

async fn list_files(ctx: &RpcContext, kind: FileKind, params: ListParams) -> HandlerResult {
    let (limit, offset) = params.window()?;
    let listing = ctx.store.list_files(kind, limit, offset).await?;
    Ok(json!(listing))
}

async fn file_info(ctx: &RpcContext, kind: FileKind, params: FilenameParams) -> HandlerResult {
    let params = params.validate()?;
    let info = ctx.store.file_info(kind, &params.filename).await?;
    Ok(json!(info))
}

async fn get_metrics(ctx: &RpcContext) -> Value {
    let rpc = ctx.metrics.snapshot();
    let backend = match ctx.backend.get_system_metrics().await {
        Ok(metrics) => json!(metrics),
        Err(e) => {
            debug!("Backend metrics unavailable: {}", e);
            Value::Null
        }
    };

    json!({
        "requests_total": rpc.requests_total,
        "errors_total": rpc.errors_total,
        "average_response_time_ms": rpc.average_response_time_ms,
        "requests_by_method": rpc.requests_by_method,
        "active_connections": ctx.security.active_connections(),
        "authenticated_clients": ctx.security.authenticated_clients(),
        "rejected_connections": ctx.security.rejected_connections(),
        "active_recordings": ctx.recordings.active_count(),
        "cameras_connected": ctx.cameras.camera_count(),
        "uptime": ctx.uptime_seconds(),
        "backend": backend,
    })
}

fn get_server_info(ctx: &RpcContext) -> Value {
    json!({
        "name": "Camera Service",
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": ["json_rpc", "websocket", "recording", "snapshots", "notifications"],
        "supported_formats": {
            "recording": ["fmp4", "mpegts"],
            "snapshot": ["jpg", "png"],
        },
        "max_connections": ctx.server.max_connections,
        "methods": known_methods().collect::<Vec<_>>(),
        "topics": TOPICS,
    })
}

async fn take_snapshot(ctx: &RpcContext, params: SnapshotParams) -> HandlerResult {
    let params = params.validate()?;
    let snapshot = ctx
        .recordings
        .take_snapshot(
            &params.device,
            params.filename.as_deref(),
            params.quality,
            params.format.as_deref(),
        )
        .await?;
    Ok(json!(snapshot))
}

async fn start_recording(ctx: &RpcContext, params: StartRecordingParams) -> HandlerResult {
    let params = params.validate()?;
    let session = ctx
        .recordings
        .start_recording(&params.device, params.duration, params.format.as_deref())
        .await?;
    Ok(session.to_json())
}

fn subscribe_events(ctx: &RpcContext, client_id: &str, params: SubscribeParams) -> HandlerResult {
    let params = params.validate()?;
    let topics = ctx
        .subscriptions
        .subscribe(client_id, &params.topics, params.filters);
    Ok(json!({ "subscribed": true, "topics": topics }))
}

fn unsubscribe_events(
    ctx: &RpcContext,
    client_id: &str,
    params: UnsubscribeParams,
) -> HandlerResult {
    let remaining = ctx
        .subscriptions
        .unsubscribe(client_id, params.topics.as_deref());
    Ok(json!({ "unsubscribed": true, "topics": remaining }))
}

async fn get_storage_info(ctx: &RpcContext) -> HandlerResult {
    let info = ctx.store.get_storage_info().await?;
    let mut value = json!(info);
    value["retention_policy"] = json!(ctx.store.retention_policy());
    value["last_cleanup"] = json!(ctx.store.last_cleanup().map(|t| t.to_rfc3339()));
    Ok(value)
}

fn get_subscription_stats(ctx: &RpcContext, client_id: &str) -> Value {
    json!({
        "global_stats": ctx.subscriptions.stats(),
        "client_topics": ctx.subscriptions.client_topics(client_id),
        "client_id": client_id,
    })
}

async fn delete_file(ctx: &RpcContext, kind: FileKind, params: FilenameParams) -> HandlerResult {
    let params = params.validate()?;

    if kind == FileKind::Recordings {
        let in_use = ctx
            .recordings
            .active_sessions()
            .into_iter()
            .any(|session| params.filename.starts_with(session.stem()));
        if in_use {
            return Err(ServiceError::from(RecordingError::InvalidParameter {
                details: format!("{} is still being recorded", params.filename),
            })
            .into());
        }
    }

    let bytes_freed = ctx.store.delete_file(kind, &params.filename).await?;
    Ok(json!({
        "filename": params.filename,
        "deleted": true,
        "bytes_freed": bytes_freed,
    }))
}

fn set_retention_policy(ctx: &RpcContext, params: RetentionPolicyParams) -> HandlerResult {
    let policy_type = RetentionPolicyType::parse(&params.policy_type).ok_or_else(|| {
        RpcError::invalid_params(format!(
            "policy_type must be age, size or manual, got {}",
            params.policy_type
        ))
    })?;

    let current = ctx.store.retention_policy();
    let policy = RetentionPolicy {
        policy_type,
        max_age_days: params.max_age_days.unwrap_or(current.max_age_days),
        max_size_gb: params.max_size_gb.unwrap_or(current.max_size_gb),
        enabled: params.enabled.unwrap_or(current.enabled),
    };
    ctx.store.set_retention_policy(policy.clone())?;

    Ok(json!({ "policy_set": true, "policy": policy }))
}
