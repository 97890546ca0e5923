//! JSON-RPC 2.0 envelopes and the service error code table

use crate::error::{
    CameraError, MediaError, RecordingError, SecurityError, ServiceError, StorageError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub const AUTH_REQUIRED: i64 = -32001;
pub const ALREADY_RECORDING: i64 = -32002;
pub const INSUFFICIENT_PERMISSIONS: i64 = -32003;
pub const AUTH_FAILED: i64 = -32004;
pub const INSUFFICIENT_STORAGE: i64 = -32005;
pub const UNSUPPORTED_CAPABILITY: i64 = -32006;
pub const CAMERA_NOT_FOUND: i64 = -32010;
pub const BACKEND_UNAVAILABLE: i64 = -32011;
pub const NO_ACTIVE_SESSION: i64 = -32012;
pub const FILE_NOT_FOUND: i64 = -32013;
pub const RATE_LIMITED: i64 = -32020;

/// A validated request or notification
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub method: String,
    pub params: Option<Value>,
    /// `None` marks a notification, which gets no response
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    /// Validate one envelope.
    ///
    /// On failure the id is returned alongside the error when it could be
    /// recovered, so the error response can still be correlated.
    pub fn from_value(value: Value) -> Result<Self, (Value, RpcError)> {
        let mut object = match value {
            Value::Object(object) => object,
            _ => return Err((Value::Null, RpcError::invalid_request("Request must be an object"))),
        };

        let id = object.remove("id");
        let reply_id = match &id {
            Some(id @ (Value::String(_) | Value::Number(_) | Value::Null)) => id.clone(),
            Some(_) => {
                return Err((
                    Value::Null,
                    RpcError::invalid_request("id must be a string, number or null"),
                ))
            }
            None => Value::Null,
        };

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err((reply_id, RpcError::invalid_request("jsonrpc must be \"2.0\"")));
        }

        let method = match object.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => method,
            _ => return Err((reply_id, RpcError::invalid_request("method must be a string"))),
        };

        let params = match object.remove("params") {
            None | Some(Value::Null) => None,
            Some(params @ (Value::Object(_) | Value::Array(_))) => Some(params),
            Some(_) => {
                return Err((
                    reply_id,
                    RpcError::invalid_request("params must be an object or array"),
                ))
            }
        };

        Ok(Self { method, params, id })
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Server-initiated event message
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, reason: impl Into<String>, suggestion: Option<&str>) -> Self {
        let mut data = json!({ "reason": reason.into() });
        if let Some(suggestion) = suggestion {
            data["suggestion"] = json!(suggestion);
        }
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(reason: &str) -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request").with_data(reason, None)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
            .with_data(format!("Unknown method: {}", method), None)
    }

    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, "Invalid params").with_data(reason, None)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, "Internal error").with_data(reason, None)
    }
}

impl From<&SecurityError> for RpcError {
    fn from(error: &SecurityError) -> Self {
        match error {
            SecurityError::AuthenticationRequired => {
                RpcError::new(AUTH_REQUIRED, "Authentication required")
            }
            SecurityError::AuthenticationFailed { reason } => {
                RpcError::new(AUTH_FAILED, "Authentication failed").with_data(
                    reason.clone(),
                    Some("Obtain a valid token and call authenticate again"),
                )
            }
            SecurityError::TokenExpired => RpcError::new(AUTH_FAILED, "Authentication failed")
                .with_data("Token expired", Some("Obtain a new token and call authenticate again")),
            SecurityError::InsufficientPermissions { required, .. } => {
                RpcError::new(INSUFFICIENT_PERMISSIONS, "Insufficient permissions")
                    .with_data(format!("Requires role {}", required), None)
            }
            SecurityError::RateLimited { retry_after_secs } => {
                let mut error = RpcError::new(RATE_LIMITED, "Rate limit exceeded").with_data(
                    format!("Too many requests, retry after {}s", retry_after_secs),
                    Some("Slow down and retry later"),
                );
                if let Some(data) = error.data.as_mut() {
                    data["retry_after"] = json!(retry_after_secs);
                }
                error
            }
            SecurityError::ConnectionLimit { max } => RpcError::new(RATE_LIMITED, "Too many connections")
                .with_data(format!("Connection limit of {} reached", max), None),
            SecurityError::TokenGeneration { details } => RpcError::internal(details.clone()),
        }
    }
}

impl From<&ServiceError> for RpcError {
    fn from(error: &ServiceError) -> Self {
        match error {
            ServiceError::Security(e) => e.into(),

            ServiceError::Camera(CameraError::NotFound { device }) => {
                RpcError::new(CAMERA_NOT_FOUND, "Camera not found or disconnected").with_data(
                    format!("No connected camera {}", device),
                    Some("Call get_camera_list for available cameras"),
                )
            }
            ServiceError::Camera(CameraError::ProbeFailed { device, details }) => {
                RpcError::new(CAMERA_NOT_FOUND, "Camera not found or disconnected")
                    .with_data(format!("{}: {}", device, details), None)
            }
            ServiceError::Camera(CameraError::UnsupportedCapability { details, .. }) => {
                RpcError::new(UNSUPPORTED_CAPABILITY, "Unsupported capability").with_data(
                    details.clone(),
                    Some("Call get_camera_capabilities for supported values"),
                )
            }

            ServiceError::Media(e) => backend_unavailable(e),

            ServiceError::Recording(RecordingError::AlreadyRecording { device, session_id }) => {
                let mut error = RpcError::new(ALREADY_RECORDING, "Camera is currently recording")
                    .with_data(
                        format!("{} is already recording", device),
                        Some("Stop the current recording first"),
                    );
                if let Some(data) = error.data.as_mut() {
                    data["session_id"] = json!(session_id);
                }
                error
            }
            ServiceError::Recording(RecordingError::NoActiveSession { target }) => {
                RpcError::new(NO_ACTIVE_SESSION, "No active recording session")
                    .with_data(format!("Nothing is recording for {}", target), None)
            }
            ServiceError::Recording(RecordingError::InvalidParameter { details }) => {
                RpcError::invalid_params(details.clone())
            }
            ServiceError::Recording(RecordingError::BackendFailure { details, .. }) => {
                RpcError::new(BACKEND_UNAVAILABLE, "Media backend unavailable")
                    .with_data(details.clone(), Some("Check the media server and retry"))
            }

            ServiceError::Storage(StorageError::FileNotFound { filename }) => {
                RpcError::new(FILE_NOT_FOUND, "File not found")
                    .with_data(format!("{} does not exist", filename), None)
            }
            ServiceError::Storage(StorageError::InvalidFilename { filename }) => {
                RpcError::invalid_params(format!("Invalid filename: {}", filename))
            }
            ServiceError::Storage(StorageError::InvalidPolicy { details }) => {
                RpcError::invalid_params(details.clone())
            }
            ServiceError::Storage(StorageError::InsufficientSpace {
                available_bytes,
                required_bytes,
            }) => RpcError::new(INSUFFICIENT_STORAGE, "Insufficient storage space").with_data(
                format!(
                    "{} bytes available, {} required",
                    available_bytes, required_bytes
                ),
                Some("Delete old recordings or run cleanup_old_files"),
            ),

            other => RpcError::internal(other.to_string()),
        }
    }
}

impl From<ServiceError> for RpcError {
    fn from(error: ServiceError) -> Self {
        RpcError::from(&error)
    }
}

impl From<SecurityError> for RpcError {
    fn from(error: SecurityError) -> Self {
        RpcError::from(&error)
    }
}

impl From<StorageError> for RpcError {
    fn from(error: StorageError) -> Self {
        RpcError::from(&ServiceError::from(error))
    }
}

fn backend_unavailable(error: &MediaError) -> RpcError {
    RpcError::new(BACKEND_UNAVAILABLE, "Media backend unavailable")
        .with_data(error.to_string(), Some("Check the media server and retry"))
}
