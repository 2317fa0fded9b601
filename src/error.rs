use thiserror::Error;

/// Error taxonomy for the ingestion pipeline.
///
/// Per the pipeline's propagation policy, only `Configuration`-kind failures
/// detected before an operation is enqueued are ever raised synchronously to
/// the producing thread. Everything else (serialization, transport, server
/// rejection) is logged in the background and never unwinds into caller code.
#[derive(Error, Debug)]
pub enum LangSmithError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tracing is disabled")]
    TracingDisabled,

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    /// The uncompressed queue byte cap was reached and the caller opted out
    /// of blocking.
    #[error("Backpressure: queue byte cap reached")]
    Backpressure,

    /// A transport-level failure from the uploader. `retryable` mirrors the
    /// classification rules of spec §4.7/§6.3.
    #[error("Transport error ({status:?}, retryable={retryable}): {message}")]
    Transport {
        status: Option<u16>,
        retryable: bool,
        message: String,
    },

    /// A non-retryable 4xx rejection from the ingest backend. The batch
    /// containing the operation is dropped; this variant exists for metrics
    /// and logging, it is never surfaced to a producing thread.
    #[error("Server rejected batch (status {status}): {message}")]
    ServerRejection { status: u16, message: String },

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, LangSmithError>;
