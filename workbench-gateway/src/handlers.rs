//! # HTTP Request Handlers
//!
//! All handlers for the gateway API. The surface is a thin router over the
//! core components:
//!
//! - `GET /health`: gateway self health
//! - `GET /api/games` / `GET /api/games/{id}` / `GET /api/games/{id}/summary`
//! - `GET /api/games/{id}/as/{format}`: cached conversion
//! - `POST /api/games/upload` (multipart) / `DELETE /api/games/{id}`
//! - `GET /api/analyses`: merged capability list
//! - `GET /api/games/{id}/analyses`: synchronous continuous analyses
//! - `POST /api/tasks`, `GET /api/tasks`, `GET|DELETE /api/tasks/{id}`
//!
//! Handlers translate component failures into the typed [`ApiError`]
//! taxonomy; transport failures inside background analyses never surface
//! here; they are folded into task results by the remote task driver.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use workbench_plugin_sdk::{Analysis, AnalysisResult, Game, TaskStatus};

use crate::formats::ParseError;
use crate::gateway_error::{truncate_message, ApiError};
use crate::server::AppState;
use crate::store::{is_supported_format, GameSummary};
use crate::tasks::Task;

const ERROR_MESSAGE_MAX_LEN: usize = 200;

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "workbench-gateway" }))
}

// ---------------------------------------------------------------------------
// Games

pub async fn list_games(State(state): State<AppState>) -> Json<Vec<GameSummary>> {
    Json(state.store.list(&state.capabilities))
}

pub async fn get_game(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<Game>, ApiError> {
    let game = state
        .store
        .get(&game_id)
        .ok_or_else(|| ApiError::not_found("Game", &game_id))?;
    Ok(Json(game))
}

pub async fn get_game_summary(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<GameSummary>, ApiError> {
    let summary = state
        .store
        .get_summary(&game_id, &state.capabilities)
        .ok_or_else(|| ApiError::not_found("Game", &game_id))?;
    Ok(Json(summary))
}

pub async fn get_game_as_format(
    State(state): State<AppState>,
    Path((game_id, target_format)): Path<(String, String)>,
) -> Result<Json<Game>, ApiError> {
    if !is_supported_format(&target_format) {
        return Err(ApiError::bad_request(format!(
            "Invalid format: {target_format}"
        )));
    }

    let game = state
        .store
        .get(&game_id)
        .ok_or_else(|| ApiError::not_found("Game", &game_id))?;

    let converted = state
        .store
        .get_converted(&game_id, &target_format, &state.capabilities)
        .await?;
    converted.map(Json).ok_or(ApiError::ConversionFailed {
        from: game.format_name,
        to: target_format,
    })
}

pub async fn delete_game(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.remove(&game_id) {
        return Err(ApiError::not_found("Game", &game_id));
    }
    Ok(Json(json!({ "status": "deleted", "id": game_id })))
}

/// Upload and parse a game file (`.json` natively; plugin formats like
/// `.efg`/`.nfg` when their plugin is healthy).
pub async fn upload_game(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Game>, ApiError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
        .ok_or_else(|| ApiError::bad_request("No file provided"))?;

    let filename = field
        .file_name()
        .map(str::to_string)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::bad_request("No filename provided"))?;

    let content = field.bytes().await.map_err(|e| {
        tracing::error!(error = %e, "failed to read upload body");
        ApiError::ParseFailed
    })?;

    let max = state.settings.max_upload_size;
    if content.len() > max {
        let max_mb = max as f64 / (1024.0 * 1024.0);
        return Err(ApiError::bad_request(format!(
            "File too large. Maximum size is {max_mb:.1}MB"
        )));
    }

    let content = String::from_utf8(content.to_vec()).map_err(|_| ApiError::InvalidFormat {
        format: filename.clone(),
        detail: Some("file is not valid UTF-8".to_string()),
    })?;

    tracing::info!(%filename, "uploading game");
    let game = state
        .formats
        .parse(&content, &filename)
        .await
        .map_err(|e| upload_error(&filename, e))?;

    let format = game.format_name.clone();
    state.store.add(game.clone());
    tracing::info!(title = %game.title, id = %game.id, %format, "uploaded game");
    Ok(Json(game))
}

fn upload_error(filename: &str, err: ParseError) -> ApiError {
    tracing::error!(%filename, error = %err, "upload failed");
    ApiError::InvalidFormat {
        format: filename.to_string(),
        detail: Some(truncate_message(&err.to_string(), ERROR_MESSAGE_MAX_LEN)),
    }
}

// ---------------------------------------------------------------------------
// Analyses

#[derive(Debug, Serialize)]
pub struct AnalysisInfo {
    pub name: String,
    pub description: String,
    pub applicable_to: Vec<String>,
    pub continuous: bool,
}

#[derive(Debug, Serialize)]
pub struct PluginAnalysisResult {
    pub plugin_name: String,
    pub result: AnalysisResult,
}

#[derive(Debug, Deserialize)]
pub struct AnalysisQuery {
    pub solver: Option<String>,
    pub max_equilibria: Option<u32>,
}

impl AnalysisQuery {
    fn to_config(&self) -> Map<String, Value> {
        let mut config = Map::new();
        if let Some(solver) = &self.solver {
            config.insert("solver".to_string(), json!(solver));
        }
        if let Some(max) = self.max_equilibria {
            config.insert("max_equilibria".to_string(), json!(max));
        }
        config
    }
}

pub async fn list_analyses(State(state): State<AppState>) -> Json<Vec<AnalysisInfo>> {
    let analyses = state
        .capabilities
        .analyses()
        .into_iter()
        .map(|registered| {
            let descriptor = registered.analysis.descriptor();
            AnalysisInfo {
                name: descriptor.name.clone(),
                description: descriptor.description.clone(),
                applicable_to: descriptor.applicable_to.clone(),
                continuous: descriptor.continuous,
            }
        })
        .collect();
    Json(analyses)
}

/// Run all continuous analyses against one game, synchronously, attempting
/// format conversion where an analysis cannot consume the native format.
pub async fn run_game_analyses(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Query(query): Query<AnalysisQuery>,
) -> Result<Json<Vec<PluginAnalysisResult>>, ApiError> {
    let game = state
        .store
        .get(&game_id)
        .ok_or_else(|| ApiError::not_found("Game", &game_id))?;

    let config = query.to_config();
    tracing::info!(%game_id, ?config, "running continuous analyses");

    let mut results = Vec::new();
    for registered in state.capabilities.analyses() {
        let analysis = &registered.analysis;
        if !analysis.descriptor().continuous {
            continue;
        }

        let Some(compatible) = resolve_compatible_game(&state, &game, analysis).await else {
            continue;
        };

        let start = Instant::now();
        let outcome = analysis.run(&compatible, config.clone(), None).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let result = with_timing(outcome.into_result(), elapsed_ms);
        tracing::info!(analysis = %analysis.name(), elapsed_ms, "analysis finished");
        results.push(PluginAnalysisResult {
            plugin_name: analysis.name().to_string(),
            result,
        });
    }

    Ok(Json(results))
}

fn with_timing(mut result: AnalysisResult, elapsed_ms: u64) -> AnalysisResult {
    result
        .details
        .insert("computation_time_ms".to_string(), json!(elapsed_ms));
    result
}

/// Find a game instance the analysis can run on: the native game if its
/// format matches, otherwise a cached conversion to one of the analysis's
/// applicable formats.
async fn resolve_compatible_game(
    state: &AppState,
    game: &Game,
    analysis: &Arc<dyn Analysis>,
) -> Option<Game> {
    if analysis.can_run(game) {
        return Some(game.clone());
    }

    for target in &analysis.descriptor().applicable_to {
        if *target == game.format_name {
            continue;
        }
        match state
            .store
            .get_converted(&game.id, target, &state.capabilities)
            .await
        {
            Ok(Some(converted)) if analysis.can_run(&converted) => {
                tracing::info!(
                    game = %game.id,
                    target = %target,
                    analysis = %analysis.name(),
                    "using converted game for analysis"
                );
                return Some(converted);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(game = %game.id, target = %target, error = %e, "conversion failed");
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tasks

#[derive(Debug, Deserialize)]
pub struct SubmitTaskQuery {
    pub game_id: String,
    pub plugin: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    pub solver: Option<String>,
    pub max_equilibria: Option<u32>,
}

fn default_owner() -> String {
    "anonymous".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub owner: Option<String>,
}

pub async fn submit_task(
    State(state): State<AppState>,
    Query(query): Query<SubmitTaskQuery>,
) -> Result<Json<Value>, ApiError> {
    let registered = state
        .capabilities
        .get_analysis(&query.plugin)
        .ok_or_else(|| ApiError::PluginUnavailable {
            plugin: query.plugin.clone(),
            available: state.capabilities.analysis_names(),
        })?;

    let game = state
        .store
        .get(&query.game_id)
        .ok_or_else(|| ApiError::not_found("Game", &query.game_id))?;
    let compatible = resolve_compatible_game(&state, &game, &registered.analysis)
        .await
        .ok_or_else(|| ApiError::IncompatiblePlugin {
            plugin: query.plugin.clone(),
            format: game.format_name.clone(),
        })?;

    let config = AnalysisQuery {
        solver: query.solver.clone(),
        max_equilibria: query.max_equilibria,
    }
    .to_config();

    let analysis = Arc::clone(&registered.analysis);
    let run_game = compatible;
    let task_id = state
        .tasks
        .submit(
            &query.owner,
            &query.game_id,
            &query.plugin,
            config,
            Box::new(move |config, cancel| {
                Box::pin(async move {
                    let start = Instant::now();
                    let outcome = analysis.run(&run_game, config, Some(cancel)).await;
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    Ok(with_timing(outcome.into_result(), elapsed_ms))
                })
            }),
        )
        .ok_or_else(|| ApiError::Internal {
            message: "task manager is shutting down".to_string(),
        })?;

    tracing::info!(task = %task_id, plugin = %query.plugin, game = %query.game_id, "task submitted");
    Ok(Json(json!({
        "task_id": task_id,
        "status": TaskStatus::Pending,
        "plugin": query.plugin,
        "game_id": query.game_id
    })))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| ApiError::not_found("Task", &task_id))?;
    Ok(Json(task))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| ApiError::not_found("Task", &task_id))?;

    if task.status.is_terminal() {
        return Ok(Json(json!({
            "task_id": task_id,
            "cancelled": false,
            "reason": format!("Task already {}", task.status)
        })));
    }

    Ok(Json(json!({
        "task_id": task_id,
        "cancelled": state.tasks.cancel(&task_id)
    })))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Json<Vec<Task>> {
    Json(state.tasks.list(query.owner.as_deref()))
}
