//! One parameter struct per method, validated before dispatch

use super::protocol::RpcError;
use crate::events::is_known_topic;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1000;

/// Deserialize params; absent params read as an empty object
pub fn parse<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = params.unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::from_value(value).map_err(|e| RpcError::invalid_params(e.to_string()))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), RpcError> {
    if value.trim().is_empty() {
        return Err(RpcError::invalid_params(format!("{} must not be empty", field)));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct AuthenticateParams {
    /// Missing and empty tokens are both reported as authentication required
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Methods addressing a single camera
#[derive(Debug, Deserialize)]
pub struct DeviceParams {
    pub device: String,
}

impl DeviceParams {
    pub fn validate(self) -> Result<Self, RpcError> {
        require_non_empty("device", &self.device)?;
        Ok(self)
    }
}

#[derive(Debug, Deserialize)]
pub struct StartRecordingParams {
    pub device: String,
    /// Seconds; absent records until stopped
    #[serde(default, alias = "duration_seconds")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub format: Option<String>,
}

impl StartRecordingParams {
    pub fn validate(self) -> Result<Self, RpcError> {
        require_non_empty("device", &self.device)?;
        if self.duration == Some(0) {
            return Err(RpcError::invalid_params("duration must be greater than 0"));
        }
        Ok(self)
    }
}

#[derive(Debug, Deserialize)]
pub struct StopRecordingParams {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl StopRecordingParams {
    /// Session id wins when both are given
    pub fn target(self) -> Result<String, RpcError> {
        match (self.session_id, self.device) {
            (Some(session_id), _) if !session_id.trim().is_empty() => Ok(session_id),
            (_, Some(device)) if !device.trim().is_empty() => Ok(device),
            _ => Err(RpcError::invalid_params(
                "device or session_id is required",
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SnapshotParams {
    pub device: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub quality: Option<u64>,
    #[serde(default)]
    pub format: Option<String>,
}

impl SnapshotParams {
    pub fn validate(self) -> Result<Self, RpcError> {
        require_non_empty("device", &self.device)?;
        Ok(self)
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl ListParams {
    /// `(limit, offset)` with defaults applied
    pub fn window(&self) -> Result<(usize, usize), RpcError> {
        let limit = self.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        if limit == 0 || limit > MAX_LIST_LIMIT {
            return Err(RpcError::invalid_params(format!(
                "limit must be between 1 and {}",
                MAX_LIST_LIMIT
            )));
        }
        Ok((limit, self.offset.unwrap_or(0)))
    }
}

#[derive(Debug, Deserialize)]
pub struct FilenameParams {
    pub filename: String,
}

impl FilenameParams {
    pub fn validate(self) -> Result<Self, RpcError> {
        require_non_empty("filename", &self.filename)?;
        Ok(self)
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    pub topics: Vec<String>,
    /// Optional per-subscription filters, e.g. `{"device": "camera0"}`
    #[serde(default)]
    pub filters: Option<Map<String, Value>>,
}

impl SubscribeParams {
    pub fn validate(self) -> Result<Self, RpcError> {
        if self.topics.is_empty() {
            return Err(RpcError::invalid_params("topics must not be empty"));
        }
        if let Some(unknown) = self.topics.iter().find(|topic| !is_known_topic(topic)) {
            return Err(RpcError::invalid_params(format!("Unknown topic: {}", unknown)));
        }
        Ok(self)
    }
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeParams {
    /// Absent removes every subscription of the client
    #[serde(default)]
    pub topics: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct RetentionPolicyParams {
    pub policy_type: String,
    #[serde(default)]
    pub max_age_days: Option<u64>,
    #[serde(default)]
    pub max_size_gb: Option<f64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}
