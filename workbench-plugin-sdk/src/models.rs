//! Wire-contract types shared between the gateway and plugin services.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The plugin HTTP contract version this SDK speaks.
pub const API_VERSION: u64 = 1;

/// A self-describing, immutable game representation.
///
/// The gateway treats the format-specific body as opaque: only `id`, `title`,
/// `players` and `format_name` are interpreted, the rest of the wire dict is
/// carried in `payload` and handed back to plugins verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub players: Vec<String>,
    pub format_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

fn default_version() -> String {
    "v1".to_string()
}

/// Status domain for tasks as seen by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw status values a plugin may report while a task is still in flight.
pub const REMOTE_PENDING_STATUSES: [&str; 2] = ["queued", "running"];

/// Map a plugin-side status onto the core status domain.
///
/// `queued → pending`, `done → completed`; any other value passes through
/// unchanged. The input is never mutated; callers keep the raw value if
/// they need it.
pub fn normalize_status(raw: &str) -> String {
    match raw {
        "queued" => "pending".to_string(),
        "done" => "completed".to_string(),
        other => other.to_string(),
    }
}

/// `GET /health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub api_version: u64,
    #[serde(default)]
    pub plugin_version: Option<String>,
}

impl HealthResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok" && self.api_version == API_VERSION
    }
}

/// One analysis a plugin advertises in its `/info` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Format tags this analysis accepts as input.
    #[serde(default)]
    pub applicable_to: Vec<String>,
    /// Continuous analyses run automatically whenever a game is viewed;
    /// others require explicit invocation with config.
    #[serde(default = "default_continuous")]
    pub continuous: bool,
    #[serde(default)]
    pub config_schema: Map<String, Value>,
}

fn default_continuous() -> bool {
    true
}

/// One format conversion a plugin advertises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionDescriptor {
    pub source: String,
    pub target: String,
}

/// `GET /info` response: everything a plugin contributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginInfo {
    #[serde(default)]
    pub api_version: u64,
    #[serde(default)]
    pub plugin_version: Option<String>,
    #[serde(default)]
    pub analyses: Vec<AnalysisDescriptor>,
    /// File extensions (with leading dot) this plugin can parse.
    #[serde(default)]
    pub formats: Vec<String>,
    #[serde(default)]
    pub conversions: Vec<ConversionDescriptor>,
}

/// `POST /analyze` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub analysis: String,
    pub game: Game,
    pub config: Map<String, Value>,
}

/// Result record for a finished analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub summary: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Task state as reported by a plugin (`POST /analyze` ack and
/// `GET /tasks/{id}` body). `status` stays raw on the wire; see
/// [`normalize_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTask {
    pub task_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::WireError>,
    /// `true` on the synthesized state returned after a client-side cancel.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl RemoteTask {
    /// Copy of this task with `status` mapped onto the core domain.
    pub fn normalized(&self) -> RemoteTask {
        RemoteTask {
            status: normalize_status(&self.status),
            ..self.clone()
        }
    }

    pub fn is_in_flight(&self) -> bool {
        REMOTE_PENDING_STATUSES.contains(&self.status.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn game_round_trips_unknown_payload_fields() {
        let raw = json!({
            "id": "g1",
            "title": "Matching Pennies",
            "players": ["Row", "Col"],
            "format_name": "normal",
            "payload_matrix": [[1, -1], [-1, 1]],
        });
        let game: Game = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(game.format_name, "normal");
        assert_eq!(game.version, "v1");
        assert!(game.payload.contains_key("payload_matrix"));

        let back = serde_json::to_value(&game).unwrap();
        assert_eq!(back["payload_matrix"], raw["payload_matrix"]);
    }

    #[test]
    fn status_normalization_maps_wire_values() {
        assert_eq!(normalize_status("queued"), "pending");
        assert_eq!(normalize_status("done"), "completed");
        assert_eq!(normalize_status("running"), "running");
        assert_eq!(normalize_status("failed"), "failed");
        assert_eq!(normalize_status("cancelled"), "cancelled");
        // Unknown values pass through untouched.
        assert_eq!(normalize_status("exploded"), "exploded");
    }

    #[test]
    fn normalized_does_not_mutate_source() {
        let task = RemoteTask {
            task_id: "t1".into(),
            status: "queued".into(),
            result: None,
            error: None,
            cancelled: false,
        };
        let normalized = task.normalized();
        assert_eq!(normalized.status, "pending");
        assert_eq!(task.status, "queued");
    }

    #[test]
    fn health_response_requires_matching_api_version() {
        let ok: HealthResponse =
            serde_json::from_value(json!({"status": "ok", "api_version": 1})).unwrap();
        assert!(ok.is_ok());

        let wrong: HealthResponse =
            serde_json::from_value(json!({"status": "ok", "api_version": 2})).unwrap();
        assert!(!wrong.is_ok());
    }
}
