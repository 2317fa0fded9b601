//! Runtime configuration: environment-loaded defaults plus the
//! server-advertised overrides merged in on first contact with the ingest
//! endpoint (spec §9, "Server-advertised config merging").

use crate::error::{LangSmithError, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::sync::Mutex;

/// All recognized knobs, per spec §4.10. Values are the process defaults;
/// [`Config::merge_ingest_config`] applies server overrides on top.
#[derive(Debug, Clone)]
pub struct Config {
    pub tracing_enabled: bool,
    pub endpoint: String,
    pub api_key: String,
    pub service_key: Option<String>,
    pub project: Option<String>,

    pub batch_size_limit: usize,
    pub batch_byte_limit: usize,
    pub queue_byte_cap: u64,
    pub compression_level: i32,

    pub scale_up_qsize_trigger: usize,
    pub scale_up_nthreads_limit: usize,
    pub scale_down_nempty_trigger: u32,

    pub retry_max_attempts: u32,
    pub retry_max_backoff_secs: u64,

    pub hide_inputs: bool,
    pub hide_outputs: bool,
}

const DEFAULT_ENDPOINT: &str = "https://api.smith.langchain.com";
const DEFAULT_BATCH_SIZE_LIMIT: usize = 100;
const DEFAULT_BATCH_BYTE_LIMIT: usize = 20 * 1024 * 1024;
const DEFAULT_QUEUE_BYTE_CAP: u64 = 1024 * 1024 * 1024;
const DEFAULT_COMPRESSION_LEVEL: i32 = 1;
const DEFAULT_SCALE_UP_QSIZE_TRIGGER: usize = 1000;
const DEFAULT_SCALE_UP_NTHREADS_LIMIT: usize = 16;
const DEFAULT_SCALE_DOWN_NEMPTY_TRIGGER: u32 = 4;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_MAX_BACKOFF_SECS: u64 = 15;

static CONFIG: Lazy<Mutex<Option<Config>>> = Lazy::new(|| Mutex::new(None));

/// The `batch_ingest_config` blob an ingest endpoint may return on first
/// contact. Every field is optional; present fields override the
/// corresponding [`Config`] default, missing fields keep it (spec §9).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfig {
    pub size_limit: Option<usize>,
    pub size_limit_bytes: Option<usize>,
    pub scale_up_qsize_trigger: Option<usize>,
    pub scale_up_nthreads_limit: Option<usize>,
    pub scale_down_nempty_trigger: Option<u32>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_env_internal()
    }

    fn from_env_internal() -> Result<Self> {
        let tracing_enabled = std::env::var("LANGSMITH_TRACING")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase()
            .parse::<bool>()
            .unwrap_or(false);

        let endpoint =
            std::env::var("LANGSMITH_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        let api_key = std::env::var("LANGSMITH_API_KEY")
            .map_err(|_| LangSmithError::Config("LANGSMITH_API_KEY not set".to_string()))?;
        let service_key = std::env::var("LANGSMITH_SERVICE_KEY").ok();
        let project = std::env::var("LANGSMITH_PROJECT").ok();

        let env_usize = |key: &str, default: usize| -> usize {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let env_u64 = |key: &str, default: u64| -> u64 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let env_u32 = |key: &str, default: u32| -> u32 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let env_bool = |key: &str, default: bool| -> bool {
            std::env::var(key)
                .ok()
                .and_then(|v| v.to_lowercase().parse().ok())
                .unwrap_or(default)
        };

        Ok(Config {
            tracing_enabled,
            endpoint,
            api_key,
            service_key,
            project,
            batch_size_limit: env_usize("LANGSMITH_BATCH_SIZE_LIMIT", DEFAULT_BATCH_SIZE_LIMIT),
            batch_byte_limit: env_usize("LANGSMITH_BATCH_BYTE_LIMIT", DEFAULT_BATCH_BYTE_LIMIT),
            queue_byte_cap: env_u64("LANGSMITH_QUEUE_BYTE_CAP", DEFAULT_QUEUE_BYTE_CAP),
            compression_level: std::env::var("LANGSMITH_COMPRESSION_LEVEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_COMPRESSION_LEVEL),
            scale_up_qsize_trigger: env_usize(
                "LANGSMITH_SCALE_UP_QSIZE_TRIGGER",
                DEFAULT_SCALE_UP_QSIZE_TRIGGER,
            ),
            scale_up_nthreads_limit: env_usize(
                "LANGSMITH_SCALE_UP_NTHREADS_LIMIT",
                DEFAULT_SCALE_UP_NTHREADS_LIMIT,
            ),
            scale_down_nempty_trigger: env_u32(
                "LANGSMITH_SCALE_DOWN_NEMPTY_TRIGGER",
                DEFAULT_SCALE_DOWN_NEMPTY_TRIGGER,
            ),
            retry_max_attempts: env_u32("LANGSMITH_RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS),
            retry_max_backoff_secs: env_u64(
                "LANGSMITH_RETRY_MAX_BACKOFF_SECS",
                DEFAULT_RETRY_MAX_BACKOFF_SECS,
            ),
            hide_inputs: env_bool("LANGSMITH_HIDE_INPUTS", false),
            hide_outputs: env_bool("LANGSMITH_HIDE_OUTPUTS", false),
        })
    }

    /// Builds a config from explicit values, bypassing the environment.
    /// Used by tests and by callers embedding this crate in a host that
    /// already owns its own configuration story.
    #[allow(clippy::too_many_arguments)]
    pub fn builder(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Config {
            tracing_enabled: true,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            service_key: None,
            project: None,
            batch_size_limit: DEFAULT_BATCH_SIZE_LIMIT,
            batch_byte_limit: DEFAULT_BATCH_BYTE_LIMIT,
            queue_byte_cap: DEFAULT_QUEUE_BYTE_CAP,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            scale_up_qsize_trigger: DEFAULT_SCALE_UP_QSIZE_TRIGGER,
            scale_up_nthreads_limit: DEFAULT_SCALE_UP_NTHREADS_LIMIT,
            scale_down_nempty_trigger: DEFAULT_SCALE_DOWN_NEMPTY_TRIGGER,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_max_backoff_secs: DEFAULT_RETRY_MAX_BACKOFF_SECS,
            hide_inputs: false,
            hide_outputs: false,
        }
    }

    #[doc(hidden)]
    pub fn from_env_no_dotenv() -> Result<Self> {
        Self::from_env_internal()
    }

    pub fn get() -> Result<Self> {
        let mut config = CONFIG.lock().unwrap();
        if config.is_none() {
            *config = Some(Self::from_env()?);
        }
        Ok(config.as_ref().unwrap().clone())
    }

    pub fn is_tracing_enabled() -> bool {
        Self::get().map(|c| c.tracing_enabled).unwrap_or(false)
    }

    /// Applies server-advertised overrides on top of this config. Missing
    /// fields in `ingest` keep the current value (spec §9).
    pub fn merge_ingest_config(&mut self, ingest: &IngestConfig) {
        if let Some(limit) = ingest.size_limit {
            self.batch_size_limit = limit;
        }
        if let Some(limit) = ingest.size_limit_bytes {
            self.batch_byte_limit = limit;
        }
        if let Some(trigger) = ingest.scale_up_qsize_trigger {
            self.scale_up_qsize_trigger = trigger;
        }
        if let Some(limit) = ingest.scale_up_nthreads_limit {
            self.scale_up_nthreads_limit = limit;
        }
        if let Some(trigger) = ingest.scale_down_nempty_trigger {
            self.scale_down_nempty_trigger = trigger;
        }
    }

    #[doc(hidden)]
    pub fn reset() {
        let mut config = CONFIG.lock().unwrap();
        *config = None;
    }
}
