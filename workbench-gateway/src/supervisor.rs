//! # Plugin Supervisor
//!
//! Owns the lifecycle of external plugin processes. Each plugin from
//! `plugins.toml` is launched on a dynamically allocated port, health-checked
//! until ready, restarted per its policy when it crashes, and terminated on
//! shutdown.
//!
//! ## Lifecycle
//!
//! ```text
//! Defined ──start──▶ Starting ──/health ok──▶ Healthy
//!                      │                        │ (child exits)
//!                      │      policy=never ───▶ Dead
//!                      │      policy=on-failure ▶ (budget left ? Starting : Dead)
//!                      │      policy=always ───▶ Starting
//!                      └─ health fail / exit ──▶ (fresh port ≤ N ? Starting : Dead)
//! Any state ──stop_all──▶ Stopped
//! ```
//!
//! Port allocation is advisory: another process can grab the port between
//! allocation and the child's own bind. Failed health waits therefore retry
//! the whole launch with a fresh port a few times before giving up.
//!
//! ## Concurrency
//!
//! All mutations go through the supervisor's own background task (startup
//! and restart sweeps are serialized); the plugin table lock is never held
//! across an await. Other components read point-in-time [`PluginSnapshot`]s.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use tokio::process::{Child, Command};
use workbench_plugin_sdk::{HealthResponse, PluginClient, PluginInfo};

use crate::config::{PluginEntry, RestartPolicy, SupervisorSettings};

/// Ask the OS for a free loopback TCP port.
///
/// Advisory only (TOCTOU-racy): the socket is released before the child
/// binds, so callers must be prepared for the child's own `listen` to fail
/// and retry with a fresh allocation.
pub fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Where a plugin is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Defined,
    Starting,
    Healthy,
    Dead,
    Stopped,
}

/// Outcome tag per plugin from a [`PluginSupervisor::check_and_restart`] sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartAction {
    Ok,
    Restarted,
    Dead,
    Skipped,
}

/// What a crash sweep should do with an exited plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartDecision {
    Attempt,
    GiveUp,
}

fn restart_decision(policy: RestartPolicy, restart_count: u32, max_restarts: u32) -> RestartDecision {
    match policy {
        RestartPolicy::Never => RestartDecision::GiveUp,
        RestartPolicy::OnFailure if restart_count < max_restarts => RestartDecision::Attempt,
        RestartPolicy::OnFailure => RestartDecision::GiveUp,
        RestartPolicy::Always => RestartDecision::Attempt,
    }
}

struct PluginHandle {
    entry: PluginEntry,
    state: PluginState,
    port: u16,
    url: String,
    child: Option<Child>,
    restart_count: u32,
    info: PluginInfo,
    /// Registered via a URL override; not process-managed by us.
    external: bool,
}

impl PluginHandle {
    fn new(entry: PluginEntry) -> Self {
        Self {
            entry,
            state: PluginState::Defined,
            port: 0,
            url: String::new(),
            child: None,
            restart_count: 0,
            info: PluginInfo::default(),
            external: false,
        }
    }

    fn snapshot(&self) -> PluginSnapshot {
        PluginSnapshot {
            name: self.entry.name.clone(),
            url: self.url.clone(),
            state: self.state,
            restart_count: self.restart_count,
            info: self.info.clone(),
        }
    }
}

/// Stable, copyable view of one plugin's `(url, state, info)`.
#[derive(Debug, Clone)]
pub struct PluginSnapshot {
    pub name: String,
    pub url: String,
    pub state: PluginState,
    pub restart_count: u32,
    pub info: PluginInfo,
}

impl PluginSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.state == PluginState::Healthy
    }
}

/// Supervisor for all configured plugin processes.
pub struct PluginSupervisor {
    settings: SupervisorSettings,
    project_root: PathBuf,
    plugins: Mutex<HashMap<String, PluginHandle>>,
}

impl PluginSupervisor {
    pub fn new(settings: SupervisorSettings, project_root: PathBuf) -> Self {
        Self {
            settings,
            project_root,
            plugins: Mutex::new(HashMap::new()),
        }
    }

    /// Register the configured roster. Replaces any previous entries.
    pub fn load_entries(&self, entries: Vec<PluginEntry>) {
        let mut plugins = self.plugins.lock().unwrap();
        plugins.clear();
        for entry in entries {
            plugins.insert(entry.name.clone(), PluginHandle::new(entry));
        }
    }

    /// Record a plugin reachable at a fixed URL (env override); the process
    /// belongs to someone else, so crash sweeps and shutdown leave it alone.
    pub fn register_external(&self, name: &str, url: &str, info: PluginInfo) {
        let mut plugins = self.plugins.lock().unwrap();
        let handle = plugins
            .entry(name.to_string())
            .or_insert_with(|| {
                PluginHandle::new(PluginEntry {
                    name: name.to_string(),
                    command: Vec::new(),
                    cwd: ".".to_string(),
                    auto_start: false,
                    restart: RestartPolicy::Never,
                })
            });
        handle.url = url.trim_end_matches('/').to_string();
        handle.state = PluginState::Healthy;
        handle.info = info;
        handle.external = true;
    }

    pub fn snapshot(&self) -> Vec<PluginSnapshot> {
        let plugins = self.plugins.lock().unwrap();
        plugins.values().map(PluginHandle::snapshot).collect()
    }

    pub fn get_plugin(&self, name: &str) -> Option<PluginSnapshot> {
        let plugins = self.plugins.lock().unwrap();
        plugins.get(name).map(PluginHandle::snapshot)
    }

    pub fn healthy_plugins(&self) -> Vec<PluginSnapshot> {
        self.snapshot()
            .into_iter()
            .filter(PluginSnapshot::is_healthy)
            .collect()
    }

    /// Start every `auto_start` plugin, tolerating partial failure.
    /// Returns `{name: started_ok}`.
    pub async fn start_all(&self) -> HashMap<String, bool> {
        let names: Vec<(String, bool)> = {
            let plugins = self.plugins.lock().unwrap();
            plugins
                .values()
                .filter(|h| !h.external)
                .map(|h| (h.entry.name.clone(), h.entry.auto_start))
                .collect()
        };

        let mut results = HashMap::new();
        for (name, auto_start) in names {
            if auto_start {
                results.insert(name.clone(), self.start_plugin(&name).await);
            } else {
                results.insert(name, false);
            }
        }
        results
    }

    /// Launch one plugin and wait for it to become healthy.
    ///
    /// Retries the whole launch with a fresh port up to the configured
    /// budget; a health failure may just mean another process grabbed the
    /// allocated port first. Initial-start retries do not touch
    /// `restart_count`.
    pub async fn start_plugin(&self, name: &str) -> bool {
        let entry = {
            let mut plugins = self.plugins.lock().unwrap();
            let Some(handle) = plugins.get_mut(name) else {
                tracing::warn!(plugin = name, "start requested for unknown plugin");
                return false;
            };
            handle.state = PluginState::Starting;
            handle.entry.clone()
        };

        if entry.command.is_empty() {
            tracing::error!(plugin = name, "plugin has no command configured");
            self.mark_dead(name);
            return false;
        }

        for attempt in 1..=self.settings.max_port_retries {
            let port = match free_port() {
                Ok(port) => port,
                Err(e) => {
                    tracing::error!(plugin = name, error = %e, "port allocation failed");
                    self.mark_dead(name);
                    return false;
                }
            };
            let url = format!("http://127.0.0.1:{port}");

            let mut child = match self.spawn_child(&entry, port) {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(plugin = name, error = %e, "failed to launch plugin");
                    self.mark_dead(name);
                    return false;
                }
            };

            if self.wait_for_health(name, &url, &mut child).await {
                let info = self.fetch_info(name, &url).await;
                let analyses = info.analyses.len();
                {
                    let mut plugins = self.plugins.lock().unwrap();
                    if let Some(handle) = plugins.get_mut(name) {
                        handle.port = port;
                        handle.url = url.clone();
                        handle.child = Some(child);
                        handle.info = info;
                        handle.state = PluginState::Healthy;
                    }
                }
                tracing::info!(plugin = name, port, analyses, "plugin healthy");
                return true;
            }

            terminate(&mut child, name).await;
            if attempt < self.settings.max_port_retries {
                tracing::warn!(
                    plugin = name,
                    port,
                    attempt,
                    retries = self.settings.max_port_retries,
                    "plugin failed health check, retrying with fresh port"
                );
            }
        }

        tracing::error!(
            plugin = name,
            attempts = self.settings.max_port_retries,
            "plugin failed to start"
        );
        self.mark_dead(name);
        false
    }

    fn spawn_child(&self, entry: &PluginEntry, port: u16) -> std::io::Result<Child> {
        // Resolve the executable against the project root so the gateway's
        // own working directory is irrelevant.
        let exe = self.project_root.join(&entry.command[0]);
        let cwd = self.project_root.join(&entry.cwd);

        let mut cmd = Command::new(&exe);
        cmd.args(&entry.command[1..])
            .arg(format!("--port={port}"))
            .current_dir(&cwd)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // A dedicated group lets shutdown signal the plugin and any workers
        // it forked in one go.
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::info!(
            plugin = %entry.name,
            port,
            command = %exe.display(),
            cwd = %cwd.display(),
            "starting plugin"
        );
        cmd.spawn()
    }

    /// Poll `GET /health` with exponential backoff until the plugin answers
    /// `{status: "ok", api_version: 1}`, the startup timeout elapses, or the
    /// child exits.
    async fn wait_for_health(&self, name: &str, url: &str, child: &mut Child) -> bool {
        let client = PluginClient::new(url, name);
        let deadline = tokio::time::Instant::now() + self.settings.startup_timeout;
        let mut interval = self.settings.health_initial_interval;

        while tokio::time::Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::warn!(plugin = name, %status, "plugin exited during startup");
                    return false;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(plugin = name, error = %e, "could not poll plugin process");
                    return false;
                }
            }

            match client
                .get_json::<HealthResponse>("/health", self.settings.health_request_timeout)
                .await
            {
                Ok(health) if health.is_ok() => return true,
                Ok(health) => {
                    tracing::warn!(
                        plugin = name,
                        status = %health.status,
                        api_version = health.api_version,
                        "unexpected health response"
                    );
                }
                Err(e) => {
                    tracing::trace!(plugin = name, error = %e, "health probe failed");
                }
            }

            tokio::time::sleep(interval).await;
            interval = interval
                .mul_f64(self.settings.health_backoff_factor)
                .min(self.settings.health_max_interval);
        }

        false
    }

    async fn fetch_info(&self, name: &str, url: &str) -> PluginInfo {
        let client = PluginClient::new(url, name);
        match client
            .get_json::<PluginInfo>("/info", self.settings.info_request_timeout)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(plugin = name, error = %e, "failed to fetch /info");
                PluginInfo::default()
            }
        }
    }

    fn mark_dead(&self, name: &str) {
        let mut plugins = self.plugins.lock().unwrap();
        if let Some(handle) = plugins.get_mut(name) {
            handle.state = PluginState::Dead;
            handle.child = None;
        }
    }

    /// Sweep all plugins, restarting crashed ones per policy.
    /// Returns `{name: action}`.
    pub async fn check_and_restart(&self) -> HashMap<String, RestartAction> {
        let mut results = HashMap::new();
        let mut to_restart = Vec::new();

        {
            let mut plugins = self.plugins.lock().unwrap();
            for (name, handle) in plugins.iter_mut() {
                if handle.external || !handle.entry.auto_start {
                    results.insert(name.clone(), RestartAction::Skipped);
                    continue;
                }
                if handle.state == PluginState::Stopped {
                    results.insert(name.clone(), RestartAction::Skipped);
                    continue;
                }

                let exited = match handle.child.as_mut() {
                    Some(child) => !matches!(child.try_wait(), Ok(None)),
                    None => true,
                };
                if !exited {
                    results.insert(name.clone(), RestartAction::Ok);
                    continue;
                }

                handle.child = None;
                match restart_decision(
                    handle.entry.restart,
                    handle.restart_count,
                    self.settings.max_restarts,
                ) {
                    RestartDecision::Attempt => to_restart.push(name.clone()),
                    RestartDecision::GiveUp => {
                        handle.state = PluginState::Dead;
                        results.insert(name.clone(), RestartAction::Dead);
                    }
                }
            }
        }

        for name in to_restart {
            tracing::info!(plugin = %name, "restarting crashed plugin");
            if self.start_plugin(&name).await {
                let mut plugins = self.plugins.lock().unwrap();
                if let Some(handle) = plugins.get_mut(&name) {
                    handle.restart_count += 1;
                }
                results.insert(name, RestartAction::Restarted);
            } else {
                results.insert(name, RestartAction::Dead);
            }
        }

        results
    }

    /// Terminate every process-managed plugin: `SIGTERM` to the group, a 5s
    /// grace wait, then a hard kill with a 2s wait.
    pub async fn stop_all(&self) {
        let mut children: Vec<(String, Child)> = Vec::new();
        {
            let mut plugins = self.plugins.lock().unwrap();
            for (name, handle) in plugins.iter_mut() {
                if let Some(child) = handle.child.take() {
                    children.push((name.clone(), child));
                }
                if !handle.external {
                    handle.state = PluginState::Stopped;
                }
            }
        }

        for (name, mut child) in children {
            tracing::info!(plugin = %name, "stopping plugin");
            terminate(&mut child, &name).await;
        }
    }
}

/// Graceful-then-forceful termination of one plugin process.
async fn terminate(child: &mut Child, name: &str) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // Negative pid addresses the whole process group.
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    if tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .is_ok()
    {
        return;
    }

    tracing::warn!(plugin = name, "plugin ignored terminate signal, killing");
    let _ = child.start_kill();
    let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
}
