//! Notification targets
//!
//! A target makes one delivery attempt and classifies the result. Retrying
//! is the dispatcher's job; targets never loop.

use super::{DeliveryOutcome, NotificationTask};
use crate::config::TargetConfig;
use crate::error::{Result, StreamhookError};
use crate::event::ResumePosition;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Receiver of outbound notifications
#[async_trait]
pub trait NotificationTarget: Send + Sync {
    /// Make a single delivery attempt
    async fn send(&self, task: &NotificationTask) -> DeliveryOutcome;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Build the target named by `config.endpoint`
///
/// `log` selects [`LogTarget`]; `http://` and `https://` select
/// [`WebhookTarget`].
///
/// # Errors
///
/// Returns `StreamhookError::Config` for anything else
pub fn build_target(config: &TargetConfig) -> Result<Arc<dyn NotificationTarget>> {
    let endpoint = config.endpoint.trim();
    if endpoint.eq_ignore_ascii_case("log") {
        return Ok(Arc::new(LogTarget));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(Arc::new(WebhookTarget::new(config)?));
    }
    Err(StreamhookError::Config(format!(
        "Unsupported target endpoint '{}': expected http://, https:// or log",
        endpoint
    ))
    .into())
}

/// Classify a webhook response status
///
/// 2xx is delivered; 408, 429 and 5xx are worth retrying; everything else
/// (other 4xx, unfollowed 3xx) is a permanent rejection.
pub fn classify_status(status: StatusCode) -> DeliveryOutcome {
    if status.is_success() {
        DeliveryOutcome::Delivered
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        DeliveryOutcome::Retryable(format!("target returned {}", status))
    } else {
        DeliveryOutcome::Permanent(format!("target returned {}", status))
    }
}

/// HTTP(S) webhook target
///
/// POSTs [`NotificationTask::body`] as JSON with `Idempotency-Key` set to
/// the task's dedup id.
#[derive(Debug, Clone)]
pub struct WebhookTarget {
    client: Client,
    url: Url,
    headers: BTreeMap<String, String>,
}

impl WebhookTarget {
    /// Create a webhook target
    ///
    /// Redirects are not followed so that a 3xx surfaces as a permanent
    /// failure instead of a silent re-post.
    ///
    /// # Errors
    ///
    /// Returns `StreamhookError::Config` for an invalid URL and
    /// `StreamhookError::Http` if the client cannot be built
    pub fn new(config: &TargetConfig) -> Result<Self> {
        let url = Url::parse(config.endpoint.trim())
            .map_err(|e| StreamhookError::Config(format!("Invalid target endpoint: {}", e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(StreamhookError::Http)?;

        Ok(Self {
            client,
            url,
            headers: config.headers.clone(),
        })
    }

    fn build_request(&self, task: &NotificationTask) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(self.url.clone())
            .header("Content-Type", "application/json")
            .header("Idempotency-Key", task.dedup_id.as_str())
            .header("X-Delivery-Attempt", task.attempts.to_string());
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request.json(&task.body())
    }
}

#[async_trait]
impl NotificationTarget for WebhookTarget {
    async fn send(&self, task: &NotificationTask) -> DeliveryOutcome {
        match self.build_request(task).send().await {
            Ok(response) => {
                let status = response.status();
                debug!(
                    dedup_id = %task.dedup_id,
                    position = %task.position,
                    status = status.as_u16(),
                    "Webhook responded"
                );
                classify_status(status)
            }
            Err(e) => DeliveryOutcome::Retryable(format!("request failed: {}", e)),
        }
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// Target that writes each notification to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTarget;

#[async_trait]
impl NotificationTarget for LogTarget {
    async fn send(&self, task: &NotificationTask) -> DeliveryOutcome {
        info!(
            target: "streamhook::notification",
            dedup_id = %task.dedup_id,
            subscription = %task.subscription,
            position = %task.position,
            operation_type = %task.operation_type,
            document = %task.payload,
            "Change notification"
        );
        DeliveryOutcome::Delivered
    }

    fn describe(&self) -> String {
        "log".to_string()
    }
}

#[derive(Debug, Default)]
struct RecordingState {
    scripts: HashMap<ResumePosition, VecDeque<DeliveryOutcome>>,
    calls: Vec<NotificationTask>,
}

/// Scripted in-process target
///
/// Every attempt is recorded. Positions with a script consume one outcome
/// per attempt; once a script is exhausted, or for unscripted positions,
/// attempts are delivered.
#[derive(Debug, Default)]
pub struct RecordingTarget {
    state: Mutex<RecordingState>,
    latency: Option<Duration>,
}

impl RecordingTarget {
    /// Create a target that delivers everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `latency` before answering each attempt
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue outcomes for attempts at `position`
    pub fn script(&self, position: u64, outcomes: impl IntoIterator<Item = DeliveryOutcome>) {
        self.state()
            .scripts
            .entry(ResumePosition(position))
            .or_default()
            .extend(outcomes);
    }

    /// Every attempt made so far, in order
    pub fn calls(&self) -> Vec<NotificationTask> {
        self.state().calls.clone()
    }

    /// Positions of every attempt, in order
    pub fn attempted_positions(&self) -> Vec<u64> {
        self.state().calls.iter().map(|t| t.position.value()).collect()
    }
}

#[async_trait]
impl NotificationTarget for RecordingTarget {
    async fn send(&self, task: &NotificationTask) -> DeliveryOutcome {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        state.calls.push(task.clone());
        state
            .scripts
            .get_mut(&task.position)
            .and_then(|script| script.pop_front())
            .unwrap_or(DeliveryOutcome::Delivered)
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PayloadConfig;
    use crate::event::{ChangeEvent, OperationType};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task(position: u64) -> NotificationTask {
        let event = ChangeEvent::new(position, OperationType::Insert, json!({"memberId": "M001"}));
        NotificationTask::from_event(&event, "gaps", "test", &PayloadConfig::default())
    }

    async fn webhook_for(server: &MockServer) -> WebhookTarget {
        let mut headers = BTreeMap::new();
        headers.insert("X-Team".to_string(), "care".to_string());
        WebhookTarget::new(&TargetConfig {
            endpoint: format!("{}/hook", server.uri()),
            timeout_secs: 5,
            headers,
        })
        .unwrap()
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), DeliveryOutcome::Delivered);
        assert_eq!(classify_status(StatusCode::ACCEPTED), DeliveryOutcome::Delivered);
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(matches!(classify_status(status), DeliveryOutcome::Retryable(_)));
        }
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::NOT_FOUND,
            StatusCode::MOVED_PERMANENTLY,
        ] {
            assert!(matches!(classify_status(status), DeliveryOutcome::Permanent(_)));
        }
    }

    #[tokio::test]
    async fn test_webhook_sends_idempotency_key_and_body() {
        let server = MockServer::start().await;
        let task = task(7);
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("Idempotency-Key", task.dedup_id.as_str()))
            .and(header("X-Team", "care"))
            .and(body_partial_json(json!({
                "id": task.dedup_id,
                "position": 7,
                "operationType": "insert",
                "document": {"memberId": "M001"}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let target = webhook_for(&server).await;
        assert_eq!(target.send(&task).await, DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_webhook_classifies_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let target = webhook_for(&server).await;
        assert!(matches!(target.send(&task(1)).await, DeliveryOutcome::Retryable(_)));
        assert!(matches!(target.send(&task(1)).await, DeliveryOutcome::Permanent(_)));
    }

    #[tokio::test]
    async fn test_webhook_transport_error_is_retryable() {
        let target = WebhookTarget::new(&TargetConfig {
            endpoint: "http://127.0.0.1:1/hook".to_string(),
            timeout_secs: 1,
            headers: BTreeMap::new(),
        })
        .unwrap();
        assert!(matches!(target.send(&task(1)).await, DeliveryOutcome::Retryable(_)));
    }

    #[test]
    fn test_build_target() {
        let mut config = TargetConfig::default();
        assert_eq!(build_target(&config).unwrap().describe(), "log");

        config.endpoint = "https://hooks.example.com/gaps".to_string();
        assert!(build_target(&config).unwrap().describe().contains("hooks.example.com"));

        config.endpoint = "ftp://hooks.example.com".to_string();
        assert!(build_target(&config).is_err());
    }

    #[tokio::test]
    async fn test_recording_target_scripts() {
        let target = RecordingTarget::new();
        target.script(2, [DeliveryOutcome::Permanent("nope".to_string())]);

        assert_eq!(target.send(&task(1)).await, DeliveryOutcome::Delivered);
        assert!(matches!(target.send(&task(2)).await, DeliveryOutcome::Permanent(_)));
        assert_eq!(target.send(&task(2)).await, DeliveryOutcome::Delivered);
        assert_eq!(target.attempted_positions(), vec![1, 2, 2]);
    }
}
