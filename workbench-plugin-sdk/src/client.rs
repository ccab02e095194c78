//! # Plugin Service Client
//!
//! Stateless-per-call HTTP client bound to one plugin's base URL. It handles
//! the three communication patterns the gateway needs:
//!
//! - **JSON POST/GET** with per-request timeouts and structured error
//!   extraction from non-2xx bodies
//! - **Task polling** (`GET /tasks/{id}`) with exponential backoff and
//!   cooperative cancellation between sleeps
//! - **Best-effort cancel** (`POST /cancel/{id}`) where every failure is
//!   swallowed
//!
//! ## Error contract
//!
//! A connection that cannot be established maps to
//! [`PluginError::Unreachable`]; other transport failures map to
//! [`PluginError::Request`]; non-2xx responses map to [`PluginError::Status`]
//! carrying the best structured error the body yields (see
//! [`extract_error`]).

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::error::{PluginError, WireError};
use crate::models::RemoteTask;

/// Knobs for [`PluginClient::poll_until_complete`].
///
/// Between polls the client sleeps `interval`, then grows it by
/// `backoff_factor` up to `max_interval`. Each poll request is bounded by
/// `request_timeout`; `max_duration` caps the whole loop.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_factor: f64,
    pub request_timeout: Duration,
    pub max_duration: Duration,
    pub cancel_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            backoff_factor: 1.5,
            request_timeout: Duration::from_secs(30),
            max_duration: Duration::from_secs(60),
            cancel_timeout: Duration::from_secs(5),
        }
    }
}

/// Next sleep interval in the backoff sequence.
fn next_interval(current: Duration, settings: &PollSettings) -> Duration {
    current.mul_f64(settings.backoff_factor).min(settings.max_interval)
}

/// HTTP client for one remote plugin service.
#[derive(Debug, Clone)]
pub struct PluginClient {
    http: reqwest::Client,
    base_url: String,
    service_name: String,
}

impl PluginClient {
    /// Bind a client to `base_url`. `service_name` is the human-readable
    /// name used in error messages.
    pub fn new(base_url: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_name: service_name.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn transport_error(&self, err: reqwest::Error) -> PluginError {
        if err.is_connect() {
            PluginError::Unreachable {
                service: self.service_name.clone(),
                message: err.to_string(),
            }
        } else {
            PluginError::Request {
                service: self.service_name.clone(),
                message: err.to_string(),
            }
        }
    }

    async fn decode_response<T: DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<T, PluginError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PluginError::Status {
                service: self.service_name.clone(),
                status: status.as_u16(),
                error: extract_error(status.as_u16(), &body),
            });
        }
        resp.json::<T>().await.map_err(|e| PluginError::Decode {
            service: self.service_name.clone(),
            message: e.to_string(),
        })
    }

    /// POST a JSON body to `endpoint` and decode the JSON response.
    pub async fn post_json<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &TReq,
        timeout: Duration,
    ) -> Result<TResp, PluginError> {
        let url = self.url(endpoint);
        tracing::debug!(service = %self.service_name, %url, "POST");
        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.decode_response(resp).await
    }

    /// GET `endpoint` and decode the JSON response.
    pub async fn get_json<TResp: DeserializeOwned>(
        &self,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<TResp, PluginError> {
        let url = self.url(endpoint);
        let resp = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.decode_response(resp).await
    }

    /// Poll `GET /tasks/{task_id}` until the remote task leaves the
    /// `queued`/`running` states, then return its final state with the
    /// status normalized onto the core domain.
    ///
    /// The cancel token is checked before every sleep; when set, the client
    /// issues a best-effort remote cancel and returns a synthesized
    /// cancelled state without polling again. Poll request failures
    /// propagate to the caller.
    pub async fn poll_until_complete(
        &self,
        task_id: &str,
        cancel: Option<&CancelToken>,
        settings: &PollSettings,
    ) -> Result<RemoteTask, PluginError> {
        let endpoint = format!("/tasks/{task_id}");
        let mut interval = settings.initial_interval;

        let mut task: RemoteTask = self.get_json(&endpoint, settings.request_timeout).await?;

        while task.is_in_flight() {
            if cancel.is_some_and(CancelToken::is_set) {
                self.cancel_task_with(task_id, settings.cancel_timeout).await;
                return Ok(RemoteTask {
                    task_id: task_id.to_string(),
                    status: "cancelled".to_string(),
                    result: None,
                    error: None,
                    cancelled: true,
                });
            }

            tokio::time::sleep(interval).await;
            interval = next_interval(interval, settings);

            task = match self.get_json(&endpoint, settings.request_timeout).await {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(
                        service = %self.service_name,
                        task_id,
                        error = %e,
                        "poll failed"
                    );
                    return Err(e);
                }
            };
        }

        Ok(task.normalized())
    }

    /// Best-effort `POST /cancel/{task_id}`; all errors are swallowed.
    pub async fn cancel_task(&self, task_id: &str) {
        self.cancel_task_with(task_id, Duration::from_secs(5)).await;
    }

    async fn cancel_task_with(&self, task_id: &str, timeout: Duration) {
        let url = self.url(&format!("/cancel/{task_id}"));
        if let Err(e) = self.http.post(&url).timeout(timeout).send().await {
            tracing::debug!(service = %self.service_name, task_id, error = %e, "cancel failed");
        }
    }
}

/// Extract a structured error from a non-2xx response body.
///
/// Tries, in order: a top-level `{"error": {...}}` object; the
/// `{"detail": {"error": {...}}}` envelope; a plain `{"detail": "..."}`
/// string; and finally a synthesized `HTTP_<status>` error carrying the raw
/// body as details.
pub fn extract_error(status: u16, body: &str) -> WireError {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return WireError::from_status(status);
    };

    if let Some(error) = parsed.get("error").filter(|e| e.is_object()) {
        return wire_error_from_object(status, error);
    }

    if let Some(detail) = parsed.get("detail") {
        if let Some(error) = detail.get("error").filter(|e| e.is_object()) {
            return wire_error_from_object(status, error);
        }
        if let Some(message) = detail.as_str() {
            return WireError::new(format!("HTTP_{status}"), message);
        }
    }

    WireError {
        details: Some(parsed),
        ..WireError::from_status(status)
    }
}

fn wire_error_from_object(status: u16, error: &Value) -> WireError {
    WireError {
        code: error
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP_{status}")),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {status}")),
        details: Some(error.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn extract_error_prefers_top_level_error_object() {
        let body = r#"{"error": {"code": "INVALID_GAME", "message": "missing root"}}"#;
        let err = extract_error(400, body);
        assert_eq!(err.code, "INVALID_GAME");
        assert_eq!(err.message, "missing root");
        assert!(err.details.is_some());
    }

    #[test]
    fn extract_error_unwraps_detail_envelope() {
        let body = r#"{"detail": {"error": {"code": "UNSUPPORTED_ANALYSIS", "message": "no Nash"}}}"#;
        let err = extract_error(400, body);
        assert_eq!(err.code, "UNSUPPORTED_ANALYSIS");
        assert_eq!(err.message, "no Nash");
    }

    #[test]
    fn extract_error_accepts_string_detail() {
        let err = extract_error(404, r#"{"detail": "Game not found: g9"}"#);
        assert_eq!(err.code, "HTTP_404");
        assert_eq!(err.message, "Game not found: g9");
    }

    #[test]
    fn extract_error_falls_back_on_garbage() {
        let err = extract_error(502, "<html>bad gateway</html>");
        assert_eq!(err.code, "HTTP_502");
        assert_eq!(err.message, "HTTP 502");
        assert!(err.details.is_none());
    }

    #[test]
    fn extract_error_keeps_unrecognized_json_as_details() {
        let err = extract_error(500, r#"{"oops": true}"#);
        assert_eq!(err.code, "HTTP_500");
        assert_eq!(err.details, Some(json!({"oops": true})));
    }

    #[test]
    fn backoff_sequence_grows_to_cap() {
        let settings = PollSettings {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
            backoff_factor: 2.0,
            ..PollSettings::default()
        };
        let mut interval = settings.initial_interval;
        let mut observed = vec![interval];
        for _ in 0..4 {
            interval = next_interval(interval, &settings);
            observed.push(interval);
        }
        assert_eq!(
            observed,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(400),
                Duration::from_millis(400),
            ]
        );
    }

    fn fast_settings() -> PollSettings {
        PollSettings {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(10),
            backoff_factor: 1.5,
            request_timeout: Duration::from_secs(2),
            max_duration: Duration::from_secs(5),
            ..PollSettings::default()
        }
    }

    #[tokio::test]
    async fn get_json_maps_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/info"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": {"code": "BOOM", "message": "kaput"}
            })))
            .mount(&server)
            .await;

        let client = PluginClient::new(server.uri(), "test-plugin");
        let err = client
            .get_json::<Value>("/info", Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            PluginError::Status { status, error, .. } => {
                assert_eq!(status, 500);
                assert_eq!(error.code, "BOOM");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_connection_is_classified() {
        // Nothing listens on this port; bind-then-drop guarantees it was free.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = PluginClient::new(format!("http://127.0.0.1:{port}"), "ghost");
        let err = client
            .get_json::<Value>("/health", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_unreachable(), "got {err:?}");
    }

    #[tokio::test]
    async fn poll_runs_until_done_and_normalizes() {
        let server = MockServer::start().await;
        // Two in-flight snapshots, then done.
        Mock::given(method("GET"))
            .and(path("/tasks/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-1", "status": "queued"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-1", "status": "running"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-1",
                "status": "done",
                "result": {"summary": "2 equilibria", "details": {}}
            })))
            .mount(&server)
            .await;

        let client = PluginClient::new(server.uri(), "gambit");
        let task = client
            .poll_until_complete("p-1", None, &fast_settings())
            .await
            .unwrap();
        assert_eq!(task.status, "completed");
        assert_eq!(task.result.unwrap().summary, "2 equilibria");
    }

    #[tokio::test]
    async fn poll_honors_cancellation_between_sleeps() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks/p-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-2", "status": "running"
            })))
            .mount(&server)
            .await;
        let cancel_mock = Mock::given(method("POST"))
            .and(path("/cancel/p-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-2", "cancelled": true
            })))
            .expect(1)
            .mount_as_scoped(&server)
            .await;

        let client = PluginClient::new(server.uri(), "gambit");
        let token = CancelToken::new();
        token.set();

        let task = client
            .poll_until_complete("p-2", Some(&token), &fast_settings())
            .await
            .unwrap();
        assert_eq!(task.status, "cancelled");
        assert!(task.cancelled);
        drop(cancel_mock);
    }
}
