//! # Configuration Management
//!
//! Two configuration sources feed the gateway:
//!
//! - **Environment variables**: runtime settings (`ENVIRONMENT`,
//!   `CORS_ORIGINS`, `MAX_UPLOAD_SIZE_BYTES`, timeout and worker-count
//!   overrides, and per-plugin `<NAME>_URL` overrides for plugins deployed
//!   outside the supervisor).
//! - **`plugins.toml`**: the declarative plugin roster: a small settings
//!   table plus one `[[plugins]]` entry per managed process. A missing file
//!   is not an error; the gateway simply runs with no plugins.
//!
//! ## plugins.toml example
//!
//! ```toml
//! [settings]
//! startup_timeout_seconds = 60.0
//! max_restarts = 3
//!
//! [[plugins]]
//! name = "gambit"
//! command = ["plugins/gambit/run.sh"]
//! cwd = "plugins/gambit"
//! auto_start = true
//! restart = "on-failure"
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use workbench_plugin_sdk::PollSettings;

/// Files whose presence marks the project root.
const ROOT_SENTINELS: [&str; 3] = ["plugins.toml", "Cargo.toml", ".git"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

/// Runtime settings assembled from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    /// Allowed CORS origins. Empty in production unless `CORS_ORIGINS` is
    /// set; localhost dev-server defaults otherwise.
    pub cors_origins: Vec<String>,
    pub max_upload_size: usize,
    /// Whole-request timeout on the HTTP surface. Generous: the synchronous
    /// analyses endpoint waits on plugin computations.
    pub request_timeout: Duration,
    pub supervisor: SupervisorSettings,
    pub remote: RemoteSettings,
    pub tasks: TaskSettings,
}

/// Plugin discovery and health-checking knobs.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Generous because some plugins import heavy native libraries on boot.
    pub startup_timeout: Duration,
    pub max_restarts: u32,
    /// Fresh-port attempts per start, to ride out the allocator's TOCTOU race.
    pub max_port_retries: u32,
    pub health_request_timeout: Duration,
    pub info_request_timeout: Duration,
    pub health_initial_interval: Duration,
    pub health_max_interval: Duration,
    pub health_backoff_factor: f64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            max_restarts: 3,
            max_port_retries: 3,
            health_request_timeout: Duration::from_secs(2),
            info_request_timeout: Duration::from_secs(5),
            health_initial_interval: Duration::from_millis(100),
            health_max_interval: Duration::from_secs(1),
            health_backoff_factor: 1.5,
        }
    }
}

/// Timeouts for talking to plugin services mid-analysis.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub submit_timeout: Duration,
    pub poll_request_timeout: Duration,
    pub cancel_timeout: Duration,
    pub poll_initial_interval: Duration,
    pub poll_max_interval: Duration,
    pub poll_backoff_factor: f64,
    pub poll_max_duration: Duration,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(30),
            poll_request_timeout: Duration::from_secs(30),
            cancel_timeout: Duration::from_secs(5),
            poll_initial_interval: Duration::from_millis(100),
            poll_max_interval: Duration::from_secs(2),
            poll_backoff_factor: 1.5,
            poll_max_duration: Duration::from_secs(60),
        }
    }
}

impl RemoteSettings {
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            initial_interval: self.poll_initial_interval,
            max_interval: self.poll_max_interval,
            backoff_factor: self.poll_backoff_factor,
            request_timeout: self.poll_request_timeout,
            max_duration: self.poll_max_duration,
            cancel_timeout: self.cancel_timeout,
        }
    }
}

/// Task manager knobs.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub max_workers: usize,
    pub cleanup_max_age: Duration,
    pub id_length: usize,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            cleanup_max_age: Duration::from_secs(3600),
            id_length: 8,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            cors_origins: dev_cors_origins(),
            max_upload_size: 5 * 1024 * 1024,
            request_timeout: Duration::from_secs(120),
            supervisor: SupervisorSettings::default(),
            remote: RemoteSettings::default(),
            tasks: TaskSettings::default(),
        }
    }
}

fn dev_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://127.0.0.1:5173".to_string(),
    ]
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Settings {
    /// Assemble settings from the process environment, starting from the
    /// built-in defaults.
    pub fn from_env() -> Self {
        let environment = match env::var("ENVIRONMENT").as_deref() {
            Ok("production") => Environment::Production,
            _ => Environment::Development,
        };

        let cors_origins = match env::var("CORS_ORIGINS") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            // Production requires explicit origins.
            _ if environment == Environment::Production => Vec::new(),
            _ => dev_cors_origins(),
        };

        let mut settings = Settings {
            environment,
            cors_origins,
            ..Settings::default()
        };

        if let Some(bytes) = env_parse::<usize>("MAX_UPLOAD_SIZE_BYTES") {
            settings.max_upload_size = bytes;
        }
        if let Some(secs) = env_parse::<f64>("PLUGIN_STARTUP_TIMEOUT_SECONDS") {
            settings.supervisor.startup_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(n) = env_parse::<u32>("PLUGIN_MAX_RESTARTS") {
            settings.supervisor.max_restarts = n;
        }
        if let Some(n) = env_parse::<usize>("TASK_MAX_WORKERS") {
            settings.tasks.max_workers = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("TASK_CLEANUP_MAX_AGE_SECONDS") {
            settings.tasks.cleanup_max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<f64>("POLL_MAX_DURATION_SECONDS") {
            settings.remote.poll_max_duration = Duration::from_secs_f64(secs);
        }
        if let Some(secs) = env_parse::<u64>("REQUEST_TIMEOUT_SECONDS") {
            settings.request_timeout = Duration::from_secs(secs);
        }

        settings
    }

    /// URL override for a plugin deployed outside the supervisor, read from
    /// `<NAME>_URL` (name uppercased, non-alphanumerics mapped to `_`).
    pub fn plugin_url_override(&self, plugin_name: &str) -> Option<String> {
        let var: String = plugin_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        env::var(format!("{var}_URL"))
            .ok()
            .filter(|url| !url.trim().is_empty())
    }
}

/// Restart policy for a supervised plugin process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    #[default]
    #[serde(alias = "on_failure")]
    OnFailure,
    Always,
}

/// One `[[plugins]]` entry from `plugins.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    /// Argv; the executable path is resolved relative to the project root.
    pub command: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default)]
    pub restart: RestartPolicy,
}

fn default_cwd() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PluginsFileSettings {
    pub startup_timeout_seconds: Option<f64>,
    pub max_restarts: Option<u32>,
}

/// Parsed `plugins.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginsFile {
    #[serde(default)]
    pub settings: PluginsFileSettings,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

impl PluginsFile {
    /// Load and parse a plugins file. A missing file yields the empty
    /// default; a malformed file is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no plugins file, running without plugins");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let parsed: PluginsFile = toml::from_str(&content)?;
        Ok(parsed)
    }

    /// Fold the file's settings table into supervisor settings.
    pub fn apply_settings(&self, supervisor: &mut SupervisorSettings) {
        if let Some(secs) = self.settings.startup_timeout_seconds {
            supervisor.startup_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(n) = self.settings.max_restarts {
            supervisor.max_restarts = n;
        }
    }
}

/// Locate the project root by walking upward from `start` until a sentinel
/// file appears. Falls back to `start` itself so relative layouts keep
/// working in ad-hoc checkouts.
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut current = start.to_path_buf();
    for _ in 0..10 {
        if ROOT_SENTINELS.iter().any(|s| current.join(s).exists()) {
            return current;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
    start.to_path_buf()
}
