//! # Remote Task Driver
//!
//! Runs a single analysis on a remote plugin end to end: submit the game to
//! `/analyze`, poll the returned task with backoff, honor cooperative
//! cancellation, and fold the final state into an [`AnalysisOutcome`].
//!
//! The driver never fails. Distributed failure (an unreachable plugin, a
//! rejected submission, a lost poll connection, a remote error) is encoded
//! in the outcome, so the task layer above has exactly one path: run the
//! driver, store the rendered result.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::cancel::CancelToken;
use crate::client::{PluginClient, PollSettings};
use crate::error::{PluginError, WireError};
use crate::models::{AnalysisDescriptor, AnalysisResult, AnalyzeRequest, Game, RemoteTask};

/// Config keys with this prefix are transport-only concerns (for example the
/// injected cancel token in the original system) and never go on the wire.
const INTERNAL_KEY_PREFIX: char = '_';

/// Terminal outcome of driving one analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Completed(AnalysisResult),
    /// The analysis was cancelled; a partial result may still be present.
    Cancelled { partial: Option<AnalysisResult> },
    Failed(WireError),
}

impl AnalysisOutcome {
    /// Render the outcome into the `{summary, details}` record stored on a
    /// task. This is the surface adapter for the sum type: human summaries
    /// here, structured codes in `details.error`.
    pub fn into_result(self) -> AnalysisResult {
        match self {
            AnalysisOutcome::Completed(mut result) => {
                if result.summary.is_empty() {
                    result.summary = "Analysis complete".to_string();
                }
                result
            }
            AnalysisOutcome::Cancelled { partial } => {
                let mut details = partial.map(|p| p.details).unwrap_or_default();
                details.insert("cancelled".to_string(), Value::Bool(true));
                AnalysisResult {
                    summary: "Cancelled".to_string(),
                    details,
                }
            }
            AnalysisOutcome::Failed(error) => {
                let summary = match error.code.as_str() {
                    "UNREACHABLE" => format!("Error: plugin unreachable ({})", error.message),
                    "POLL_FAILED" => {
                        format!("Error: lost connection during analysis ({})", error.message)
                    }
                    _ => format!("Error: {}", error.message),
                };
                let mut details = Map::new();
                details.insert("error".to_string(), json!(error));
                AnalysisResult { summary, details }
            }
        }
    }
}

/// An analysis the gateway can run on a game.
///
/// The production implementation is [`RemoteAnalysis`]; tests substitute
/// in-process fakes at this seam.
#[async_trait]
pub trait Analysis: Send + Sync {
    fn descriptor(&self) -> &AnalysisDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Whether this analysis accepts the game's format as input.
    fn can_run(&self, game: &Game) -> bool {
        let format = &game.format_name;
        self.descriptor().applicable_to.iter().any(|f| f == format)
    }

    async fn run(
        &self,
        game: &Game,
        config: Map<String, Value>,
        cancel: Option<CancelToken>,
    ) -> AnalysisOutcome;
}

/// Adapter that makes one remote analysis endpoint behave like a local
/// [`Analysis`]. One plugin service typically yields several of these, one
/// per advertised analysis.
#[derive(Debug, Clone)]
pub struct RemoteAnalysis {
    client: PluginClient,
    descriptor: AnalysisDescriptor,
    submit_timeout: Duration,
    poll: PollSettings,
}

impl RemoteAnalysis {
    pub fn new(base_url: impl Into<String>, descriptor: AnalysisDescriptor) -> Self {
        let client = PluginClient::new(base_url, descriptor.name.clone());
        Self {
            client,
            descriptor,
            submit_timeout: Duration::from_secs(30),
            poll: PollSettings::default(),
        }
    }

    pub fn with_timeouts(mut self, submit_timeout: Duration, poll: PollSettings) -> Self {
        self.submit_timeout = submit_timeout;
        self.poll = poll;
        self
    }

    pub fn plugin_url(&self) -> &str {
        self.client.base_url()
    }

    fn strip_internal_keys(config: Map<String, Value>) -> Map<String, Value> {
        config
            .into_iter()
            .filter(|(k, _)| !k.starts_with(INTERNAL_KEY_PREFIX))
            .collect()
    }

    fn outcome_from_final(task: RemoteTask) -> AnalysisOutcome {
        match task.status.as_str() {
            "completed" => AnalysisOutcome::Completed(task.result.unwrap_or(AnalysisResult {
                summary: String::new(),
                details: Map::new(),
            })),
            "failed" => AnalysisOutcome::Failed(
                task.error
                    .unwrap_or_else(|| WireError::new("UNKNOWN", "analysis failed")),
            ),
            "cancelled" => AnalysisOutcome::Cancelled {
                partial: task.result,
            },
            other => AnalysisOutcome::Failed(WireError::new(
                "UNEXPECTED_STATUS",
                format!("plugin reported status '{other}'"),
            )),
        }
    }
}

#[async_trait]
impl Analysis for RemoteAnalysis {
    fn descriptor(&self) -> &AnalysisDescriptor {
        &self.descriptor
    }

    async fn run(
        &self,
        game: &Game,
        config: Map<String, Value>,
        cancel: Option<CancelToken>,
    ) -> AnalysisOutcome {
        let request = AnalyzeRequest {
            analysis: self.descriptor.name.clone(),
            game: game.clone(),
            config: Self::strip_internal_keys(config),
        };

        let ack: RemoteTask = match self
            .client
            .post_json("/analyze", &request, self.submit_timeout)
            .await
        {
            Ok(ack) => ack,
            Err(e) => return AnalysisOutcome::Failed(e.to_wire()),
        };

        tracing::debug!(
            analysis = %self.descriptor.name,
            remote_task = %ack.task_id,
            "analysis submitted"
        );

        let polled = tokio::time::timeout(
            self.poll.max_duration,
            self.client
                .poll_until_complete(&ack.task_id, cancel.as_ref(), &self.poll),
        )
        .await;

        let task = match polled {
            Ok(Ok(task)) => task,
            Ok(Err(e)) => {
                return AnalysisOutcome::Failed(WireError::new("POLL_FAILED", e.to_string()));
            }
            Err(_) => {
                // Poll ceiling hit; tell the plugin to stop and give up.
                self.client.cancel_task(&ack.task_id).await;
                return AnalysisOutcome::Failed(WireError::new(
                    "POLL_FAILED",
                    format!(
                        "no result after {}s",
                        self.poll.max_duration.as_secs()
                    ),
                ));
            }
        };

        Self::outcome_from_final(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor() -> AnalysisDescriptor {
        serde_json::from_value(json!({
            "name": "Nash Equilibria",
            "description": "Find Nash equilibria",
            "applicable_to": ["normal"],
            "continuous": true,
            "config_schema": {}
        }))
        .unwrap()
    }

    fn game() -> Game {
        serde_json::from_value(json!({
            "id": "g1",
            "title": "Prisoner's Dilemma",
            "players": ["A", "B"],
            "format_name": "normal"
        }))
        .unwrap()
    }

    fn fast_poll() -> PollSettings {
        PollSettings {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(10),
            backoff_factor: 1.5,
            request_timeout: Duration::from_secs(2),
            max_duration: Duration::from_secs(5),
            ..PollSettings::default()
        }
    }

    #[test]
    fn can_run_matches_applicable_formats() {
        let analysis = RemoteAnalysis::new("http://127.0.0.1:1", descriptor());
        assert!(analysis.can_run(&game()));

        let mut extensive = game();
        extensive.format_name = "extensive".to_string();
        assert!(!analysis.can_run(&extensive));
    }

    #[test]
    fn internal_keys_stay_off_the_wire() {
        let config: Map<String, Value> = serde_json::from_value(json!({
            "solver": "quick",
            "_cancel_token": "opaque",
            "_trace": true
        }))
        .unwrap();
        let clean = RemoteAnalysis::strip_internal_keys(config);
        assert_eq!(clean.len(), 1);
        assert!(clean.contains_key("solver"));
    }

    #[test]
    fn outcome_rendering_matches_contract() {
        let completed = AnalysisOutcome::Completed(AnalysisResult {
            summary: String::new(),
            details: Map::new(),
        });
        assert_eq!(completed.into_result().summary, "Analysis complete");

        let cancelled = AnalysisOutcome::Cancelled { partial: None }.into_result();
        assert_eq!(cancelled.summary, "Cancelled");
        assert_eq!(cancelled.details["cancelled"], Value::Bool(true));

        let unreachable =
            AnalysisOutcome::Failed(WireError::new("UNREACHABLE", "connection refused"))
                .into_result();
        assert!(unreachable.summary.starts_with("Error: plugin unreachable ("));
        assert_eq!(unreachable.details["error"]["code"], "UNREACHABLE");

        let poll_failed =
            AnalysisOutcome::Failed(WireError::new("POLL_FAILED", "reset by peer")).into_result();
        assert!(poll_failed
            .summary
            .starts_with("Error: lost connection during analysis ("));
    }

    #[tokio::test]
    async fn drives_submit_poll_complete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(body_partial_json(json!({"analysis": "Nash Equilibria"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-1", "status": "queued"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-1", "status": "running"
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/p-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-1",
                "status": "done",
                "result": {"summary": "1 equilibrium", "details": {"profiles": []}}
            })))
            .mount(&server)
            .await;

        let analysis =
            RemoteAnalysis::new(server.uri(), descriptor()).with_timeouts(
                Duration::from_secs(2),
                fast_poll(),
            );
        let outcome = analysis.run(&game(), Map::new(), None).await;
        match outcome {
            AnalysisOutcome::Completed(result) => assert_eq!(result.summary, "1 equilibrium"),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_plugin_becomes_failed_outcome() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let analysis = RemoteAnalysis::new(format!("http://127.0.0.1:{port}"), descriptor())
            .with_timeouts(Duration::from_secs(1), fast_poll());

        let outcome = analysis.run(&game(), Map::new(), None).await;
        match outcome {
            AnalysisOutcome::Failed(error) => assert_eq!(error.code, "UNREACHABLE"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_submission_carries_structured_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "detail": {"error": {"code": "UNSUPPORTED_ANALYSIS", "message": "unknown analysis"}}
            })))
            .mount(&server)
            .await;

        let analysis = RemoteAnalysis::new(server.uri(), descriptor())
            .with_timeouts(Duration::from_secs(2), fast_poll());
        let outcome = analysis.run(&game(), Map::new(), None).await;
        match outcome {
            AnalysisOutcome::Failed(error) => assert_eq!(error.code, "UNSUPPORTED_ANALYSIS"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_mid_poll_stops_polling_and_cancels_remote() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-9", "status": "queued"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/p-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-9", "status": "running"
            })))
            .mount(&server)
            .await;
        let cancel_mock = Mock::given(method("POST"))
            .and(path("/cancel/p-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-9", "cancelled": true
            })))
            .expect(1)
            .mount_as_scoped(&server)
            .await;

        let analysis = RemoteAnalysis::new(server.uri(), descriptor())
            .with_timeouts(Duration::from_secs(2), fast_poll());
        let token = CancelToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.set();
        });

        let outcome = analysis.run(&game(), Map::new(), Some(token)).await;
        assert!(matches!(outcome, AnalysisOutcome::Cancelled { .. }));
        drop(cancel_mock);
    }

    #[tokio::test]
    async fn remote_failure_is_reported_with_its_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-3", "status": "running"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/p-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": "p-3",
                "status": "failed",
                "error": {"code": "SOLVER_ERROR", "message": "degenerate game"}
            })))
            .mount(&server)
            .await;

        let analysis = RemoteAnalysis::new(server.uri(), descriptor())
            .with_timeouts(Duration::from_secs(2), fast_poll());
        let outcome = analysis.run(&game(), Map::new(), None).await;
        match outcome {
            AnalysisOutcome::Failed(error) => {
                assert_eq!(error.code, "SOLVER_ERROR");
                let rendered = AnalysisOutcome::Failed(error).into_result();
                assert_eq!(rendered.summary, "Error: degenerate game");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
