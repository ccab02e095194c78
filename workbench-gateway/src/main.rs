//! Workbench gateway binary.
//!
//! Starts the HTTP surface immediately, launches configured plugins in the
//! background, and shuts everything down in order on SIGINT/SIGTERM (tasks
//! drain first, then plugin processes). Exits non-zero on fatal startup
//! errors.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use workbench_gateway::config::{find_project_root, PluginsFile, Settings};
use workbench_gateway::{bootstrap, build_state, create_server};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the plugins configuration file. Defaults to plugins.toml at
    /// the project root; a missing file just means no plugins.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for the HTTP server.
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Host address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Logging filter (tracing env-filter syntax).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let mut settings = Settings::from_env();
    let project_root = find_project_root(&std::env::current_dir()?);

    let config_path = args
        .config
        .unwrap_or_else(|| project_root.join("plugins.toml"));
    let plugins_file = PluginsFile::load(&config_path)?;
    plugins_file.apply_settings(&mut settings.supervisor);

    let state = build_state(settings, project_root);
    state.supervisor.load_entries(plugins_file.plugins);

    // Plugins come up in the background so the API is ready immediately.
    bootstrap::spawn_background(state.clone());
    bootstrap::load_example_games(&state).await;
    tracing::info!(
        games = state.store.len(),
        "server ready, discovering plugins in background"
    );

    let app = create_server(state.clone());
    let addr = SocketAddr::new(args.host.parse()?, args.port);
    tracing::info!(%addr, "starting workbench gateway");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    bootstrap::shutdown(&state).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
