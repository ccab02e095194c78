//! # Workbench Plugin SDK
//!
//! Client-side library for talking to workbench analysis plugins. A plugin is
//! an external process that listens on `http://127.0.0.1:<port>` and speaks
//! the plugin HTTP contract (API v1): `/health`, `/info`, `/analyze`,
//! `/tasks/{id}`, `/cancel/{id}`, `/parse/{ext}`, `/convert/{src}-to-{tgt}`.
//!
//! ## Overview
//!
//! The SDK provides:
//! - **Wire models**: the contract types a plugin exchanges with the gateway
//! - **PluginClient**: JSON POST/GET with structured error extraction and
//!   exponential-backoff task polling with cooperative cancellation
//! - **RemoteAnalysis**: the driver that runs one remote analysis end to end
//!   (submit, poll, normalize, cancel) and never fails; distributed failure
//!   is encoded in the returned [`AnalysisOutcome`]
//! - **CancelToken**: a shared set-once flag observed between suspension
//!   points; in-flight HTTP calls are never interrupted
//!
//! ## Status domains
//!
//! Plugins report `queued | running | done | failed | cancelled` on the wire.
//! The SDK normalizes at the boundary (`queued → pending`,
//! `done → completed`) so everything above it sees only the core status
//! domain `pending | running | completed | cancelled | failed`.

pub mod cancel;
pub mod client;
pub mod driver;
pub mod error;
pub mod models;

pub use cancel::CancelToken;
pub use client::{PluginClient, PollSettings};
pub use driver::{Analysis, AnalysisOutcome, RemoteAnalysis};
pub use error::{PluginError, WireError};
pub use models::{
    normalize_status, AnalysisDescriptor, AnalysisResult, ConversionDescriptor, Game,
    HealthResponse, PluginInfo, RemoteTask, TaskStatus,
};
