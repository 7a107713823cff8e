//! Backend-invocation strategies.
//!
//! The broker does not care how a document reaches the extraction engine.
//! It stages the input, hands an [`ExtractionJob`] to an
//! [`ExtractionBackend`], and normalises whatever comes back. Two strategies
//! exist, picked at configuration time by [`crate::config::BackendMode`]:
//!
//! 1. [`http::HttpBackend`]: multipart POST to a long-running local server
//!    that the supervisor launched. Returns `{content, format, metadata}`.
//! 2. [`library::LibraryBackend`]: run a parse entry point synchronously
//!    against the staged path and collect recognised files from an output
//!    directory. Returns `{markdown, json}` results.
//!
//! Both also answer the liveness probe the supervisor polls.

pub mod http;
pub mod library;

use crate::config::{BackendMode, ExtractMethod, OutputFormat, ServiceConfig};
use crate::error::ServiceError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

pub use http::HttpBackend;
pub use library::{CommandEngine, LibraryBackend, ParseEngine};

/// Everything a backend needs to process one staged document.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    /// Staged input document.
    pub input: PathBuf,
    /// Staged output directory, present when the backend asked for one.
    pub output_dir: Option<PathBuf>,
    pub output_format: OutputFormat,
    pub method: ExtractMethod,
}

/// What a backend produced, before the broker wraps it into a result.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// A single document body (networked variant). `content` is a string or a mapping.
    Document {
        content: Value,
        format: String,
        metadata: Map<String, Value>,
    },
    /// Files collected from an output directory, keyed by kind (`markdown`, `json`).
    Files { results: Map<String, Value> },
}

/// A strategy for reaching the extraction engine.
///
/// Implementations must be `Send + Sync`: one instance serves every
/// concurrent invocation.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether the broker must allocate an output directory for each job.
    fn needs_output_dir(&self) -> bool {
        false
    }

    /// Network endpoint, for backends that have one.
    fn endpoint(&self) -> Option<String> {
        None
    }

    /// Bounded-time liveness check. `Err` carries the reason it failed.
    async fn probe(&self) -> Result<(), String>;

    /// Process one job. Failures come back as `Err`, never as panics.
    async fn invoke(&self, job: &ExtractionJob) -> Result<Extraction, ServiceError>;
}

/// Build the backend strategy selected by `config.mode`.
pub fn from_config(config: &ServiceConfig) -> Result<Arc<dyn ExtractionBackend>, ServiceError> {
    match &config.mode {
        BackendMode::Http { base_url } => Ok(Arc::new(HttpBackend::new(
            base_url.clone(),
            config.probe_timeout,
            config.request_timeout,
        )?)),
        BackendMode::Library { program, args } => {
            let engine = CommandEngine::new(program.clone(), args.clone())
                .envs(config.backend_env())
                .timeout(config.request_timeout);
            Ok(Arc::new(LibraryBackend::new(Arc::new(engine))))
        }
    }
}
