use super::handlers::RpcContext;
use super::server::process_text;
use super::*;
use crate::camera::CameraMonitor;
use crate::config::ServiceConfig;
use crate::error::{CameraError, MediaError, RecordingError, SecurityError, ServiceError, StorageError};
use crate::events::{EventBus, ServiceEvent};
use crate::media::MediaBackend;
use crate::recording::RecordingManager;
use crate::security::{Role, SecurityMiddleware};
use crate::storage::FileStore;
use crate::test_support::{test_config, FakeBackend, FakeProber};
use serde_json::{json, Map, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

struct Harness {
    _root: TempDir,
    ctx: RpcContext,
    backend: Arc<FakeBackend>,
}

async fn harness_with(adjust: impl FnOnce(&mut ServiceConfig)) -> Harness {
    let root = TempDir::new().unwrap();
    let mut config = test_config(&root);
    adjust(&mut config);

    let dev = root.path().join("dev");
    std::fs::create_dir_all(&dev).unwrap();
    std::fs::write(dev.join("video0"), b"").unwrap();

    let event_bus = Arc::new(EventBus::new(64));
    let cameras = CameraMonitor::new(
        config.camera.clone(),
        config.mediamtx.clone(),
        Arc::new(FakeProber::default()),
        Arc::clone(&event_bus),
    );
    cameras
        .attach_device(&dev.join("video0").to_string_lossy())
        .await
        .unwrap();

    let backend = Arc::new(FakeBackend::default());
    backend.create_stream("camera0", "/dev/video0").await.unwrap();

    let store = FileStore::from_config(&config);
    store.start().await.unwrap();

    let recordings = RecordingManager::new(
        config.recording.clone(),
        config.snapshots.clone(),
        cameras.clone(),
        backend.clone(),
        store.clone(),
        Arc::clone(&event_bus),
    );

    let security = Arc::new(
        SecurityMiddleware::new(&config.security, config.server.max_connections).unwrap(),
    );

    let ctx = RpcContext {
        server: config.server.clone(),
        security,
        cameras,
        recordings,
        backend: backend.clone(),
        store,
        subscriptions: Arc::new(SubscriptionRegistry::new()),
        metrics: RpcMetrics::default(),
        started_at: Instant::now(),
    };

    Harness {
        _root: root,
        ctx,
        backend,
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

impl Harness {
    /// Authenticate a client with the given role
    fn login(&self, client_id: &str, role: Role) {
        let token = self
            .ctx
            .security
            .jwt()
            .generate_token(client_id, role, None)
            .unwrap();
        assert!(self.ctx.security.authenticate(client_id, &token).authenticated);
    }

    async fn raw(&self, client_id: &str, text: &str) -> Option<Value> {
        process_text(&self.ctx, client_id, text)
            .await
            .map(|reply| serde_json::from_str(&reply).unwrap())
    }

    async fn call(&self, client_id: &str, method: &str, params: Value) -> Value {
        let request = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 1 });
        self.raw(client_id, &request.to_string()).await.unwrap()
    }
}

fn error_code(reply: &Value) -> i64 {
    reply["error"]["code"]
        .as_i64()
        .unwrap_or_else(|| panic!("expected an error, got {}", reply))
}

#[test]
fn test_envelope_validation() {
    let request = JsonRpcRequest::from_value(json!({
        "jsonrpc": "2.0", "method": "ping", "id": "abc"
    }))
    .unwrap();
    assert_eq!(request.method, "ping");
    assert_eq!(request.id, Some(json!("abc")));
    assert!(!request.is_notification());

    let notification =
        JsonRpcRequest::from_value(json!({ "jsonrpc": "2.0", "method": "ping" })).unwrap();
    assert!(notification.is_notification());

    let (id, error) =
        JsonRpcRequest::from_value(json!({ "jsonrpc": "1.0", "method": "ping", "id": 7 }))
            .unwrap_err();
    assert_eq!(id, json!(7));
    assert_eq!(error.code, INVALID_REQUEST);

    let (_, error) =
        JsonRpcRequest::from_value(json!({ "jsonrpc": "2.0", "method": 5, "id": 1 })).unwrap_err();
    assert_eq!(error.code, INVALID_REQUEST);

    let (_, error) = JsonRpcRequest::from_value(json!({
        "jsonrpc": "2.0", "method": "ping", "params": "x", "id": 1
    }))
    .unwrap_err();
    assert_eq!(error.code, INVALID_REQUEST);

    let (id, error) = JsonRpcRequest::from_value(json!({
        "jsonrpc": "2.0", "method": "ping", "id": {"nested": true}
    }))
    .unwrap_err();
    assert_eq!(id, Value::Null);
    assert_eq!(error.code, INVALID_REQUEST);
}

#[test]
fn test_error_code_table() {
    let cases: Vec<(ServiceError, i64)> = vec![
        (SecurityError::AuthenticationRequired.into(), AUTH_REQUIRED),
        (SecurityError::TokenExpired.into(), AUTH_FAILED),
        (
            SecurityError::AuthenticationFailed {
                reason: "bad signature".to_string(),
            }
            .into(),
            AUTH_FAILED,
        ),
        (
            SecurityError::InsufficientPermissions {
                method: "start_recording".to_string(),
                required: "operator".to_string(),
            }
            .into(),
            INSUFFICIENT_PERMISSIONS,
        ),
        (
            SecurityError::RateLimited {
                retry_after_secs: 3,
            }
            .into(),
            RATE_LIMITED,
        ),
        (
            CameraError::NotFound {
                device: "camera9".to_string(),
            }
            .into(),
            CAMERA_NOT_FOUND,
        ),
        (
            CameraError::UnsupportedCapability {
                device: "camera0".to_string(),
                details: "avi".to_string(),
            }
            .into(),
            UNSUPPORTED_CAPABILITY,
        ),
        (
            MediaError::Timeout {
                operation: "start_recording".to_string(),
            }
            .into(),
            BACKEND_UNAVAILABLE,
        ),
        (
            RecordingError::AlreadyRecording {
                device: "camera0".to_string(),
                session_id: "s".to_string(),
            }
            .into(),
            ALREADY_RECORDING,
        ),
        (
            RecordingError::NoActiveSession {
                target: "camera0".to_string(),
            }
            .into(),
            NO_ACTIVE_SESSION,
        ),
        (
            RecordingError::InvalidParameter {
                details: "quality".to_string(),
            }
            .into(),
            INVALID_PARAMS,
        ),
        (
            StorageError::FileNotFound {
                filename: "a.mp4".to_string(),
            }
            .into(),
            FILE_NOT_FOUND,
        ),
        (
            StorageError::InsufficientSpace {
                available_bytes: 1,
                required_bytes: 2,
            }
            .into(),
            INSUFFICIENT_STORAGE,
        ),
        (ServiceError::system("boom"), INTERNAL_ERROR),
    ];

    for (error, code) in cases {
        assert_eq!(RpcError::from(&error).code, code, "{}", error);
    }

    // Auth-required carries no data
    let required = RpcError::from(&SecurityError::AuthenticationRequired);
    assert!(required.data.is_none());

    let already = RpcError::from(&ServiceError::from(RecordingError::AlreadyRecording {
        device: "camera0".to_string(),
        session_id: "abc".to_string(),
    }));
    let data = already.data.unwrap();
    assert_eq!(data["session_id"], "abc");
    assert!(data["suggestion"].is_string());
}

#[tokio::test]
async fn test_ping_is_public() {
    let h = harness().await;
    let reply = h.call("anon", "ping", json!({})).await;
    assert_eq!(reply["result"], "pong");
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["jsonrpc"], "2.0");
}

#[tokio::test]
async fn test_protocol_errors() {
    let h = harness().await;

    let reply = h.raw("anon", "{not json").await.unwrap();
    assert_eq!(error_code(&reply), PARSE_ERROR);
    assert_eq!(reply["id"], Value::Null);

    let reply = h.raw("anon", r#"{"method":"ping","id":4}"#).await.unwrap();
    assert_eq!(error_code(&reply), INVALID_REQUEST);
    assert_eq!(reply["id"], 4);

    let reply = h.call("anon", "format_disk", json!({})).await;
    assert_eq!(error_code(&reply), METHOD_NOT_FOUND);

    let reply = h.raw("anon", "[]").await.unwrap();
    assert_eq!(error_code(&reply), INVALID_REQUEST);
}

#[tokio::test]
async fn test_notifications_get_no_reply() {
    let h = harness().await;
    assert!(h
        .raw("anon", r#"{"jsonrpc":"2.0","method":"ping"}"#)
        .await
        .is_none());

    let batch = r#"[{"jsonrpc":"2.0","method":"ping"},{"jsonrpc":"2.0","method":"ping"}]"#;
    assert!(h.raw("anon", batch).await.is_none());
}

#[tokio::test]
async fn test_batch_replies_in_order() {
    let h = harness().await;
    let batch = json!([
        { "jsonrpc": "2.0", "method": "ping", "id": 1 },
        { "jsonrpc": "2.0", "method": "ping" },
        { "jsonrpc": "2.0", "method": "get_camera_list", "id": 2 },
        42,
        { "jsonrpc": "2.0", "method": "ping", "id": 3 },
    ]);

    let reply = h.raw("anon", &batch.to_string()).await.unwrap();
    let replies = reply.as_array().unwrap();
    assert_eq!(replies.len(), 4);
    assert_eq!(replies[0]["result"], "pong");
    assert_eq!(replies[1]["id"], 2);
    assert_eq!(error_code(&replies[1]), AUTH_REQUIRED);
    assert_eq!(error_code(&replies[2]), INVALID_REQUEST);
    assert_eq!(replies[3]["id"], 3);
}

#[tokio::test]
async fn test_unauthenticated_camera_list_is_rejected() {
    let h = harness().await;
    let _guard = h.ctx.security.admit("anon").unwrap();

    let reply = h.call("anon", "get_camera_list", json!({})).await;
    assert_eq!(error_code(&reply), AUTH_REQUIRED);
    assert!(reply["error"].get("data").is_none());
    assert!(reply.get("result").is_none());
}

#[tokio::test]
async fn test_authenticate() {
    let h = harness().await;

    let reply = h
        .call("c1", "authenticate", json!({ "auth_token": "garbage" }))
        .await;
    assert_eq!(error_code(&reply), AUTH_FAILED);

    let reply = h.call("c1", "authenticate", json!({})).await;
    assert_eq!(error_code(&reply), AUTH_REQUIRED);
    let reply = h
        .call("c1", "authenticate", json!({ "auth_token": "" }))
        .await;
    assert_eq!(error_code(&reply), AUTH_REQUIRED);
    let reply = h
        .call("c1", "authenticate", json!({ "auth_token": 42 }))
        .await;
    assert_eq!(error_code(&reply), INVALID_PARAMS);

    let token = h
        .ctx
        .security
        .jwt()
        .generate_token("alice", Role::Operator, None)
        .unwrap();
    let reply = h
        .call("c1", "authenticate", json!({ "auth_token": token }))
        .await;
    let result = &reply["result"];
    assert_eq!(result["authenticated"], true);
    assert_eq!(result["role"], "operator");
    assert_eq!(result["permissions"], json!(["view", "control"]));
    assert!(result["expires_at"].as_i64().unwrap() > 0);
    assert!(result["session_id"].is_string());

    let reply = h.call("c1", "get_camera_list", json!({})).await;
    assert_eq!(reply["result"]["total"], 1);
}

#[tokio::test]
async fn test_viewer_cannot_record() {
    let h = harness().await;
    h.login("viewer", Role::Viewer);

    let reply = h
        .call("viewer", "start_recording", json!({ "device": "camera0" }))
        .await;
    assert_eq!(error_code(&reply), INSUFFICIENT_PERMISSIONS);
    assert_eq!(h.backend.start_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.ctx.recordings.active_count(), 0);
}

#[tokio::test]
async fn test_camera_queries() {
    let h = harness().await;
    h.login("viewer", Role::Viewer);

    let list = h.call("viewer", "get_camera_list", json!({})).await;
    let camera = &list["result"]["cameras"][0];
    assert_eq!(camera["device"], "camera0");
    assert_eq!(camera["status"], "CONNECTED");
    assert_eq!(camera["streams"]["rtsp"], "rtsp://127.0.0.1:8554/camera0");

    let status = h
        .call("viewer", "get_camera_status", json!({ "device": "camera0" }))
        .await;
    assert_eq!(status["result"]["recording"], false);
    assert_eq!(status["result"]["resolution"], "1920x1080");

    let caps = h
        .call("viewer", "get_camera_capabilities", json!({ "device": "camera0" }))
        .await;
    assert_eq!(caps["result"]["frame_rates"], json!([30, 15]));

    let missing = h
        .call("viewer", "get_camera_status", json!({ "device": "camera7" }))
        .await;
    assert_eq!(error_code(&missing), CAMERA_NOT_FOUND);
}

#[tokio::test]
async fn test_recording_lifecycle_over_rpc() {
    let h = harness().await;
    h.login("op", Role::Operator);

    let started = h
        .call("op", "start_recording", json!({ "device": "camera0" }))
        .await;
    let session_id = started["result"]["session_id"].as_str().unwrap().to_string();
    assert_eq!(started["result"]["device"], "camera0");
    assert_eq!(started["result"]["format"], "fmp4");

    let again = h
        .call("op", "start_recording", json!({ "device": "camera0" }))
        .await;
    assert_eq!(error_code(&again), ALREADY_RECORDING);

    let status = h
        .call("op", "get_recording_status", json!({ "session_id": session_id }))
        .await;
    assert_eq!(status["result"]["status"], "RECORDING");

    let stopped = h
        .call("op", "stop_recording", json!({ "device": "camera0" }))
        .await;
    assert_eq!(stopped["result"]["status"], "STOPPED");
    assert!(stopped["result"]["file_size"].as_u64().unwrap() > 0);

    let twice = h
        .call("op", "stop_recording", json!({ "session_id": session_id }))
        .await;
    assert_eq!(error_code(&twice), NO_ACTIVE_SESSION);

    let listing = h.call("op", "list_recordings", json!({})).await;
    let files = listing["result"]["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0]["filename"].as_str().unwrap().starts_with("camera0_"));
    assert!(files[0]["download_url"]
        .as_str()
        .unwrap()
        .starts_with("/files/recordings/"));
}

#[tokio::test]
async fn test_recording_param_errors() {
    let h = harness().await;
    h.login("op", Role::Operator);

    let reply = h.call("op", "start_recording", json!({})).await;
    assert_eq!(error_code(&reply), INVALID_PARAMS);

    let reply = h
        .call("op", "start_recording", json!({ "device": "camera0", "duration": 0 }))
        .await;
    assert_eq!(error_code(&reply), INVALID_PARAMS);

    let reply = h
        .call("op", "start_recording", json!({ "device": "camera0", "duration": -5 }))
        .await;
    assert_eq!(error_code(&reply), INVALID_PARAMS);

    let reply = h
        .call("op", "start_recording", json!({ "device": "camera0", "format": "avi" }))
        .await;
    assert_eq!(error_code(&reply), UNSUPPORTED_CAPABILITY);

    let reply = h.call("op", "stop_recording", json!({})).await;
    assert_eq!(error_code(&reply), INVALID_PARAMS);
}

#[tokio::test]
async fn test_backend_outage_maps_to_unavailable() {
    let h = harness().await;
    h.login("op", Role::Operator);
    h.backend.unreachable.store(true, Ordering::SeqCst);

    let reply = h.call("op", "get_streams", json!({})).await;
    assert_eq!(error_code(&reply), BACKEND_UNAVAILABLE);

    let reply = h
        .call("op", "start_recording", json!({ "device": "camera0" }))
        .await;
    assert_eq!(error_code(&reply), BACKEND_UNAVAILABLE);

    let status = h.call("op", "get_status", json!({})).await;
    assert_eq!(status["result"]["status"], "degraded");
    assert_eq!(status["result"]["components"]["mediamtx"]["status"], "unhealthy");
}

#[tokio::test]
async fn test_snapshot_shows_up_in_listing() {
    let h = harness().await;
    h.login("op", Role::Operator);

    let snapshot = h
        .call("op", "take_snapshot", json!({ "device": "camera0", "quality": 50 }))
        .await;
    let filename = snapshot["result"]["filename"].as_str().unwrap().to_string();
    assert_eq!(snapshot["result"]["status"], "completed");
    assert_eq!(snapshot["result"]["quality"], 50);

    let listing = h.call("op", "list_snapshots", json!({ "limit": 10 })).await;
    let files = listing["result"]["files"].as_array().unwrap();
    let entry = files.iter().find(|f| f["filename"] == filename.as_str()).unwrap();
    assert!(entry["file_size"].as_u64().unwrap() > 0);
    assert!(entry["modified_time"].is_string());

    let info = h
        .call("op", "get_snapshot_info", json!({ "filename": filename }))
        .await;
    assert!(info["result"]["file_size"].as_u64().unwrap() > 0);

    let bad = h
        .call("op", "take_snapshot", json!({ "device": "camera0", "quality": 101 }))
        .await;
    assert_eq!(error_code(&bad), INVALID_PARAMS);

    let bad = h.call("op", "list_snapshots", json!({ "limit": 0 })).await;
    assert_eq!(error_code(&bad), INVALID_PARAMS);
}

#[tokio::test]
async fn test_admin_file_management() {
    let h = harness().await;
    h.login("op", Role::Operator);
    h.login("admin", Role::Admin);

    let snapshot = h
        .call("op", "take_snapshot", json!({ "device": "camera0", "filename": "door" }))
        .await;
    assert_eq!(snapshot["result"]["filename"], "door.jpg");

    let denied = h
        .call("op", "delete_snapshot", json!({ "filename": "door.jpg" }))
        .await;
    assert_eq!(error_code(&denied), INSUFFICIENT_PERMISSIONS);

    let deleted = h
        .call("admin", "delete_snapshot", json!({ "filename": "door.jpg" }))
        .await;
    assert_eq!(deleted["result"]["deleted"], true);

    let missing = h
        .call("admin", "delete_snapshot", json!({ "filename": "door.jpg" }))
        .await;
    assert_eq!(error_code(&missing), FILE_NOT_FOUND);

    let traversal = h
        .call("admin", "get_recording_info", json!({ "filename": "../etc/passwd" }))
        .await;
    assert_eq!(error_code(&traversal), INVALID_PARAMS);

    let storage = h.call("admin", "get_storage_info", json!({})).await;
    assert!(storage["result"]["total_space"].as_u64().unwrap() > 0);
    assert_eq!(storage["result"]["retention_policy"]["policy_type"], "age");

    let policy = h
        .call(
            "admin",
            "set_retention_policy",
            json!({ "policy_type": "size", "max_size_gb": 2.5, "enabled": true }),
        )
        .await;
    assert_eq!(policy["result"]["policy"]["policy_type"], "size");

    let invalid = h
        .call("admin", "set_retention_policy", json!({ "policy_type": "forever" }))
        .await;
    assert_eq!(error_code(&invalid), INVALID_PARAMS);

    let cleanup = h.call("admin", "cleanup_old_files", json!({})).await;
    assert_eq!(cleanup["result"]["cleanup_executed"], true);
    assert_eq!(cleanup["result"]["files_deleted"], 0);
}

#[tokio::test]
async fn test_recording_file_in_use_cannot_be_deleted() {
    let h = harness().await;
    h.login("admin", Role::Admin);

    let started = h
        .call("admin", "start_recording", json!({ "device": "camera0" }))
        .await;
    let filename = started["result"]["filename"].as_str().unwrap().to_string();

    let reply = h
        .call("admin", "delete_recording", json!({ "filename": filename }))
        .await;
    assert_eq!(error_code(&reply), INVALID_PARAMS);
}

#[tokio::test]
async fn test_subscription_stats() {
    let h = harness().await;
    h.login("op", Role::Operator);
    h.login("admin", Role::Admin);

    let reply = h
        .call(
            "op",
            "subscribe_events",
            json!({ "topics": ["camera.connected", "recording.start"] }),
        )
        .await;
    assert_eq!(reply["result"]["subscribed"], true);

    let stats = h.call("admin", "get_subscription_stats", json!({})).await;
    let result = &stats["result"];
    assert_eq!(result["global_stats"]["total_subscriptions"], 2);
    assert_eq!(result["global_stats"]["active_clients"], 1);
    assert_eq!(result["global_stats"]["topic_counts"]["camera.connected"], 1);
    assert_eq!(result["client_topics"], json!([]));
    assert_eq!(result["client_id"], "admin");

    let unknown = h
        .call("op", "subscribe_events", json!({ "topics": ["recording.paused"] }))
        .await;
    assert_eq!(error_code(&unknown), INVALID_PARAMS);

    let reply = h
        .call("op", "unsubscribe_events", json!({ "topics": ["recording.start"] }))
        .await;
    assert_eq!(reply["result"]["topics"], json!(["camera.connected"]));
}

#[tokio::test]
async fn test_rate_limit_over_rpc() {
    let h = harness_with(|config| config.security.rate_limit_requests = 3).await;

    for _ in 0..3 {
        let reply = h.call("chatty", "ping", json!({})).await;
        assert_eq!(reply["result"], "pong");
    }
    let reply = h.call("chatty", "ping", json!({})).await;
    assert_eq!(error_code(&reply), RATE_LIMITED);
    assert!(reply["error"]["data"]["retry_after"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_metrics_count_requests() {
    let h = harness().await;
    h.login("viewer", Role::Viewer);

    h.call("viewer", "ping", json!({})).await;
    h.call("viewer", "start_recording", json!({ "device": "camera0" }))
        .await;

    let metrics = h.call("viewer", "get_metrics", json!({})).await;
    let result = &metrics["result"];
    assert_eq!(result["requests_total"], 2);
    assert_eq!(result["errors_total"], 1);
    assert_eq!(result["requests_by_method"]["ping"], 1);
    assert_eq!(result["cameras_connected"], 1);
    assert_eq!(result["backend"]["active_streams"], 1);
}

#[test]
fn test_registry_counts_stay_consistent() {
    let registry = SubscriptionRegistry::new();
    let topics = vec!["camera.connected".to_string(), "recording.stop".to_string()];

    registry.subscribe("a", &topics, None);
    registry.subscribe("b", &topics[..1], None);
    // Re-subscribing is idempotent
    registry.subscribe("a", &topics[..1], None);

    let stats = registry.stats();
    assert_eq!(stats.total_subscriptions, 3);
    assert_eq!(stats.active_clients, 2);
    assert_eq!(stats.topic_counts["camera.connected"], 2);

    registry.remove_client("a");
    let stats = registry.stats();
    assert_eq!(stats.total_subscriptions, 1);
    assert_eq!(stats.active_clients, 1);
    assert!(!stats.topic_counts.contains_key("recording.stop"));

    registry.unsubscribe("b", None);
    assert_eq!(registry.stats().active_clients, 0);
    assert!(registry.stats().topic_counts.is_empty());
}

#[test]
fn test_registry_filters() {
    let registry = SubscriptionRegistry::new();
    let mut filters = Map::new();
    filters.insert("device".to_string(), json!("/dev/video1"));
    registry.subscribe("a", &["recording.start".to_string()], Some(filters));

    assert!(registry.wants("a", "recording.start", &json!({ "device": "camera1" })));
    assert!(!registry.wants("a", "recording.start", &json!({ "device": "camera0" })));
    assert!(!registry.wants("a", "recording.start", &json!({ "component": "x" })));
    assert!(!registry.wants("a", "recording.stop", &json!({ "device": "camera1" })));
    assert!(!registry.wants("nobody", "recording.start", &json!({})));
}

#[test]
fn test_events_map_to_subscribed_topics() {
    let event = ServiceEvent::CameraDisconnected {
        device_path: "/dev/video0".to_string(),
        camera_id: "camera0".to_string(),
    };
    let registry = SubscriptionRegistry::new();
    registry.subscribe("a", &["camera.disconnected".to_string()], None);

    let topic = event.topic().unwrap();
    assert!(registry.wants("a", topic, &event.notification_params()));
}
