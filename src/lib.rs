//! tracehook - distributed run tracing for agent and chain pipelines.
//!
//! Builds [`models::run::Run`] trees, hands their serialized operations to a
//! background ingestion pipeline (buffer → compressor → worker pool →
//! uploader), and propagates the active trace across async task boundaries
//! and process boundaries via [`context`].

fn init_dotenv() {
    let _ = dotenvy::dotenv();
}

#[allow(dead_code)]
static INIT: std::sync::Once = std::sync::Once::new();

pub mod buffer;
pub mod client;
pub mod compress;
pub mod config;
pub mod context;
pub mod error;
pub mod id;
pub mod metrics;
pub mod models;
pub mod multipart;
pub mod serialize;
pub mod upload;
pub mod worker;

pub use client::Client;
pub use config::{Config, IngestConfig};
pub use context::{current, trace, AmbientContext, ParentStub, ReplicaSpec};
pub use error::{LangSmithError, Result};
pub use id::uuid7;
pub use metrics::Metrics;
pub use models::{Attachment, Operation, OperationKind, Run, RunEvent, RunFields, RunType};

/// Loads a `.env` file into the process environment, once. Mirrors the
/// teacher's opt-in `init()` entry point; [`Config::from_env`] works
/// without it if the environment is already populated some other way.
pub fn init() {
    INIT.call_once(init_dotenv);
}
