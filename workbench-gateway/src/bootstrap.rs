//! # Bootstrap and Lifecycle
//!
//! Startup ordering: the HTTP front-end comes up immediately; plugin
//! startup runs on a background task so a slow plugin never delays
//! readiness. As each plugin reports healthy, its capabilities are merged
//! into the capability registry and its formats into the format registry.
//! Once startup settles, the same background task keeps sweeping: crashed
//! plugins are restarted per policy and finished tasks are reaped by age.
//!
//! Shutdown ordering is mandatory: drain the task manager first (in-flight
//! tasks may be mid-conversation with a plugin), then stop the plugin
//! processes.

use std::time::Duration;

use workbench_plugin_sdk::{HealthResponse, PluginClient, PluginInfo};

use crate::server::AppState;
use crate::supervisor::{PluginSnapshot, RestartAction};

/// Cadence of the crash-restart and task-reaping sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Start all plugins and publish their capabilities. Blocks until the
/// initial startup pass finishes; intended to run on a background task.
pub async fn startup(state: &AppState) {
    resolve_url_overrides(state).await;

    let results = state.supervisor.start_all().await;
    let started = results.values().filter(|ok| **ok).count();
    tracing::info!(
        started,
        configured = results.len(),
        "plugin startup finished"
    );

    for plugin in state.supervisor.healthy_plugins() {
        publish_capabilities(state, &plugin);
    }
}

/// Plugins with a `<NAME>_URL` override are managed elsewhere (for example
/// by Docker Compose); probe them once and register what they advertise.
async fn resolve_url_overrides(state: &AppState) {
    for plugin in state.supervisor.snapshot() {
        let Some(url) = state.settings.plugin_url_override(&plugin.name) else {
            continue;
        };

        let client = PluginClient::new(url.clone(), plugin.name.clone());
        let health = client
            .get_json::<HealthResponse>("/health", state.settings.supervisor.health_request_timeout)
            .await;
        match health {
            Ok(health) if health.is_ok() => {}
            Ok(_) | Err(_) => {
                tracing::warn!(plugin = %plugin.name, %url, "override URL not healthy, skipping");
                continue;
            }
        }

        let info = client
            .get_json::<PluginInfo>("/info", state.settings.supervisor.info_request_timeout)
            .await
            .unwrap_or_default();
        state.supervisor.register_external(&plugin.name, &url, info);
        if let Some(snapshot) = state.supervisor.get_plugin(&plugin.name) {
            publish_capabilities(state, &snapshot);
        }
        tracing::info!(plugin = %plugin.name, %url, "registered externally managed plugin");
    }
}

/// Merge a healthy plugin's `/info` into the capability and format
/// registries.
fn publish_capabilities(state: &AppState, plugin: &PluginSnapshot) {
    state
        .capabilities
        .register_plugin(&plugin.name, &plugin.url, &plugin.info);
    for extension in &plugin.info.formats {
        state
            .formats
            .register_remote(extension, &plugin.name, &plugin.url);
    }
}

/// Run [`startup`] and then the periodic maintenance sweep. The task runs
/// for the life of the process.
pub fn spawn_background(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        startup(&state).await;

        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately

        loop {
            ticker.tick().await;

            let actions = state.supervisor.check_and_restart().await;
            for (name, action) in &actions {
                if *action == RestartAction::Restarted {
                    if let Some(snapshot) = state.supervisor.get_plugin(name) {
                        publish_capabilities(&state, &snapshot);
                    }
                }
            }

            state.tasks.cleanup(state.settings.tasks.cleanup_max_age);
        }
    })
}

/// Load the bundled example games from `<project_root>/games`.
///
/// Only formats parseable at call time are picked up; in practice that is
/// the native `.json` format, since plugin formats register later.
pub async fn load_example_games(state: &AppState) {
    let dir = state.project_root.join("games");
    if !dir.is_dir() {
        return;
    }

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot read games directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(filename) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };

        match state.formats.parse(&content, &filename).await {
            Ok(game) => {
                tracing::info!(%filename, id = %game.id, "loaded example game");
                state.store.add(game);
            }
            Err(e) => {
                tracing::warn!(%filename, error = %e, "failed to load example game");
            }
        }
    }
}

/// Orderly shutdown: tasks first, then plugin processes.
pub async fn shutdown(state: &AppState) {
    tracing::info!("shutting down: draining tasks");
    state.tasks.shutdown(true, true).await;
    tracing::info!("shutting down: stopping plugins");
    state.supervisor.stop_all().await;
}
