use super::backend::{
    BackendHealth, BackendMetrics, HealthState, MediaBackend, RecordingFormat, SnapshotFormat,
    StreamStatus,
};
use crate::config::MediaMtxConfig;
use crate::error::MediaError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Path entry as returned by `/v3/paths/get` and `/v3/paths/list`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathItem {
    name: String,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    source: Option<PathSource>,
    #[serde(default)]
    readers: Vec<Value>,
    #[serde(default)]
    bytes_received: u64,
    #[serde(default)]
    bytes_sent: u64,
}

#[derive(Debug, Deserialize)]
struct PathSource {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct PathList {
    #[serde(default)]
    items: Vec<PathItem>,
}

impl From<PathItem> for StreamStatus {
    fn from(item: PathItem) -> Self {
        StreamStatus {
            name: item.name,
            ready: item.ready,
            source: item.source.map(|s| s.kind),
            readers: item.readers.len() as u32,
            bytes_received: item.bytes_received,
            bytes_sent: item.bytes_sent,
        }
    }
}

#[derive(Debug, Default)]
struct RequestStats {
    requests_total: u64,
    request_errors: u64,
    total_response_ms: u64,
    consecutive_failures: u32,
}

/// REST client for the MediaMTX control API (v3)
pub struct MediaMtxController {
    config: MediaMtxConfig,
    client: reqwest::Client,
    base_url: String,
    retry_delay: Duration,
    stats: Mutex<RequestStats>,
}

impl MediaMtxController {
    pub fn new(config: MediaMtxConfig) -> Result<Self, MediaError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| MediaError::Unavailable {
                details: format!("HTTP client setup failed: {}", e),
            })?;

        let base_url = format!("http://{}:{}", config.host, config.api_port);
        info!("MediaMTX controller targeting {}", base_url);

        Ok(Self {
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            config,
            client,
            base_url,
            stats: Mutex::new(RequestStats::default()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Command MediaMTX runs to publish a V4L2 device into its path
    fn publish_command(&self, name: &str, device_path: &str) -> String {
        format!(
            "{} -f v4l2 -i {} -c:v libx264 -preset ultrafast -tune zerolatency -f rtsp rtsp://127.0.0.1:{}/{}",
            self.config.ffmpeg_path, device_path, self.config.rtsp_port, name
        )
    }

    fn record_outcome(&self, ok: bool, elapsed: Duration) {
        let mut stats = self.stats.lock();
        stats.requests_total += 1;
        stats.total_response_ms += elapsed.as_millis() as u64;
        if ok {
            stats.consecutive_failures = 0;
        } else {
            stats.request_errors += 1;
            stats.consecutive_failures += 1;
        }
    }

    /// Issue a request, retrying once on a transient failure
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        subject: &str,
    ) -> Result<Option<Value>, MediaError> {
        match self.request_once(method.clone(), path, body, subject).await {
            Err(e) if e.is_transient() => {
                warn!("{} {} failed ({}), retrying once", method, path, e);
                tokio::time::sleep(self.retry_delay).await;
                self.request_once(method, path, body, subject).await
            }
            other => other,
        }
    }

    async fn request_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        subject: &str,
    ) -> Result<Option<Value>, MediaError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                self.record_outcome(false, started.elapsed());
                return Err(translate_transport_error(&e, &format!("{} {}", method, path)));
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        self.record_outcome(status.is_success(), started.elapsed());

        if !status.is_success() {
            return Err(translate_status(status.as_u16(), &text, subject));
        }

        debug!("{} {} -> {}", method, path, status);
        if text.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| MediaError::Http {
                status: status.as_u16(),
                details: format!("unparseable response: {}", e),
            })
    }
}

fn translate_transport_error(error: &reqwest::Error, operation: &str) -> MediaError {
    if error.is_timeout() {
        MediaError::Timeout {
            operation: operation.to_string(),
        }
    } else {
        MediaError::Unavailable {
            details: error.to_string(),
        }
    }
}

/// Map an HTTP error status onto the media error taxonomy
pub(crate) fn translate_status(status: u16, body: &str, subject: &str) -> MediaError {
    let details = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());

    match status {
        404 => MediaError::StreamNotFound {
            name: subject.to_string(),
        },
        400 => MediaError::InvalidRequest { details },
        _ => MediaError::Http { status, details },
    }
}

/// ffmpeg `-q:v` scale runs 2 (best) to 31 (worst)
pub(crate) fn jpeg_qscale(quality: u8) -> u8 {
    let quality = quality.clamp(1, 100) as u32;
    (2 + (100 - quality) * 29 / 99) as u8
}

#[async_trait]
impl MediaBackend for MediaMtxController {
    async fn create_stream(&self, name: &str, device_path: &str) -> Result<(), MediaError> {
        let body = json!({
            "source": "publisher",
            "runOnInit": self.publish_command(name, device_path),
            "runOnInitRestart": true,
        });

        match self
            .request(
                Method::POST,
                &format!("/v3/config/paths/add/{}", name),
                Some(&body),
                name,
            )
            .await
        {
            Ok(_) => {
                info!("Created stream {} for {}", name, device_path);
                Ok(())
            }
            // Path left over from a previous run: update it in place
            Err(MediaError::InvalidRequest { details }) if details.contains("exist") => {
                debug!("Stream {} already exists, patching", name);
                self.request(
                    Method::PATCH,
                    &format!("/v3/config/paths/patch/{}", name),
                    Some(&body),
                    name,
                )
                .await
                .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_stream(&self, name: &str) -> Result<(), MediaError> {
        match self
            .request(
                Method::DELETE,
                &format!("/v3/config/paths/delete/{}", name),
                None,
                name,
            )
            .await
        {
            Ok(_) | Err(MediaError::StreamNotFound { .. }) => {
                info!("Deleted stream {}", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn start_recording(
        &self,
        name: &str,
        directory: &Path,
        stem: &str,
        format: RecordingFormat,
    ) -> Result<(), MediaError> {
        // MediaMTX requires time placeholders in segment names
        let record_path = directory.join(format!("{}_%Y-%m-%d_%H-%M-%S-%f", stem));
        let body = json!({
            "record": true,
            "recordPath": record_path.to_string_lossy(),
            "recordFormat": format.as_str(),
            "recordSegmentDuration": "24h",
        });

        self.request(
            Method::PATCH,
            &format!("/v3/config/paths/patch/{}", name),
            Some(&body),
            name,
        )
        .await?;

        info!("Recording enabled on {} ({})", name, format.as_str());
        Ok(())
    }

    async fn stop_recording(&self, name: &str) -> Result<(), MediaError> {
        self.request(
            Method::PATCH,
            &format!("/v3/config/paths/patch/{}", name),
            Some(&json!({ "record": false })),
            name,
        )
        .await?;

        info!("Recording disabled on {}", name);
        Ok(())
    }

    async fn get_stream_status(&self, name: &str) -> Result<StreamStatus, MediaError> {
        let value = self
            .request(Method::GET, &format!("/v3/paths/get/{}", name), None, name)
            .await?
            .ok_or_else(|| MediaError::StreamNotFound {
                name: name.to_string(),
            })?;

        let item: PathItem = serde_json::from_value(value).map_err(|e| MediaError::Http {
            status: 200,
            details: format!("unexpected path payload: {}", e),
        })?;
        Ok(item.into())
    }

    async fn list_streams(&self) -> Result<Vec<StreamStatus>, MediaError> {
        let value = self
            .request(Method::GET, "/v3/paths/list", None, "paths")
            .await?
            .unwrap_or(Value::Null);

        let list: PathList = serde_json::from_value(value).map_err(|e| MediaError::Http {
            status: 200,
            details: format!("unexpected path list payload: {}", e),
        })?;
        Ok(list.items.into_iter().map(StreamStatus::from).collect())
    }

    async fn get_health(&self) -> BackendHealth {
        let started = Instant::now();
        let outcome = self
            .request_once(Method::GET, "/v3/paths/list", None, "paths")
            .await;
        let response_time_ms = started.elapsed().as_millis() as u64;
        let consecutive_failures = self.stats.lock().consecutive_failures;

        let (status, details) = match outcome {
            Ok(_) if response_time_ms > self.config.degraded_latency_ms => (
                HealthState::Degraded,
                format!("slow response ({} ms)", response_time_ms),
            ),
            Ok(_) => (HealthState::Healthy, "ok".to_string()),
            // Reachable but erroring
            Err(e @ MediaError::Http { .. }) | Err(e @ MediaError::InvalidRequest { .. }) => {
                (HealthState::Degraded, e.to_string())
            }
            Err(e) => (HealthState::Unhealthy, e.to_string()),
        };

        BackendHealth {
            status,
            response_time_ms,
            consecutive_failures,
            details,
            checked_at: Utc::now(),
        }
    }

    async fn get_system_metrics(&self) -> Result<BackendMetrics, MediaError> {
        let streams = self.list_streams().await?;
        let stats = self.stats.lock();

        Ok(BackendMetrics {
            active_streams: streams.len(),
            ready_streams: streams.iter().filter(|s| s.ready).count(),
            total_readers: streams.iter().map(|s| s.readers as u64).sum(),
            bytes_received: streams.iter().map(|s| s.bytes_received).sum(),
            bytes_sent: streams.iter().map(|s| s.bytes_sent).sum(),
            requests_total: stats.requests_total,
            request_errors: stats.request_errors,
            average_response_ms: if stats.requests_total == 0 {
                0.0
            } else {
                stats.total_response_ms as f64 / stats.requests_total as f64
            },
        })
    }

    async fn capture_snapshot(
        &self,
        name: &str,
        output: &Path,
        format: SnapshotFormat,
        quality: u8,
    ) -> Result<u64, MediaError> {
        let source = format!("rtsp://{}:{}/{}", self.config.host, self.config.rtsp_port, name);
        let mut command = Command::new(&self.config.ffmpeg_path);
        command.args(["-rtsp_transport", "tcp", "-i", &source, "-frames:v", "1"]);
        if format == SnapshotFormat::Jpg {
            command.args(["-q:v", &jpeg_qscale(quality).to_string()]);
        }
        command
            .args(["-loglevel", "error", "-y"])
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| MediaError::Snapshot {
            details: format!("ffmpeg spawn failed: {}", e),
        })?;

        let timeout = Duration::from_secs(self.config.snapshot_timeout_seconds);
        // On timeout the child is dropped and killed
        let output_status = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                return Err(MediaError::Snapshot {
                    details: format!("ffmpeg execution failed: {}", e),
                })
            }
            Err(_) => {
                warn!("Snapshot of {} timed out after {:?}", name, timeout);
                return Err(MediaError::Timeout {
                    operation: format!("snapshot {}", name),
                });
            }
        };

        if !output_status.status.success() {
            return Err(MediaError::Snapshot {
                details: String::from_utf8_lossy(&output_status.stderr)
                    .trim()
                    .to_string(),
            });
        }

        let size = tokio::fs::metadata(output)
            .await
            .map(|m| m.len())
            .map_err(|e| MediaError::Snapshot {
                details: format!("snapshot file missing: {}", e),
            })?;

        if size == 0 {
            return Err(MediaError::Snapshot {
                details: "ffmpeg produced an empty file".to_string(),
            });
        }

        Ok(size)
    }
}
