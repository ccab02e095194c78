//! # Workbench Gateway
//!
//! Orchestrator that federates external game-analysis plugins behind a
//! unified HTTP API. The gateway supervises plugin processes over their
//! full lifecycle, merges the capabilities they advertise (analyses, file
//! formats, format conversions), and runs long-lived computations on behalf
//! of callers: submitting work to the right plugin, polling it to
//! completion, supporting cancellation, and caching derived artifacts.
//!
//! ## Components
//!
//! - [`supervisor`]: launch, health-check, restart, and stop plugin
//!   processes on dynamically allocated ports
//! - [`capabilities`]: the merged capability registry with BFS conversion
//!   path finding
//! - [`store`]: thread-safe game registry with cached format conversions
//! - [`tasks`]: bounded worker pool with cancellation and age-based reaping
//! - [`formats`]: native and plugin-backed game file parsing
//! - [`handlers`] / [`server`]: the HTTP surface
//! - [`bootstrap`]: startup ordering, background sweeps, graceful shutdown
//!
//! All state is in-memory; restarts start fresh. Partial plugin
//! availability is a first-class state: a dead plugin's capabilities remain
//! advertised and calls to it surface as task-level unreachable errors, not
//! global failures.

pub mod bootstrap;
pub mod capabilities;
pub mod config;
pub mod formats;
pub mod gateway_error;
pub mod handlers;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod tasks;

pub use config::Settings;
pub use server::{build_state, create_server, AppState};
