//! # docgate
//!
//! A managed front-end for a document-extraction backend. It launches the
//! backend, waits until it is ready, and exposes the two-route contract
//! hosting platforms expect from an inference container:
//!
//! * `GET /ping`: live health of the backend
//! * `POST /invocations`: `{"pdf_base64": ..., "output_format": ...}` in,
//!   extracted content out
//!
//! ## Request Flow
//!
//! ```text
//! caller
//!  │  POST /invocations
//!  ├─ 1. Facade   content-type check, panic guard, status mapping
//!  ├─ 2. Broker   decode JSON, readiness gate
//!  ├─ 3. Staging  base64 → temp .pdf (+ output dir for the library engine)
//!  ├─ 4. Backend  multipart POST to :8000/v1/extract  |  parse command + dir scan
//!  ├─ 5. Broker   normalise to {status, content, format, metadata} / {status, results}
//!  └─ 6. Staging  release every staged path, on every exit path
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docgate::{Service, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Launches `mineru-api` and polls http://localhost:8000/health (30 × 1 s).
//!     let service = Service::initialize(ServiceConfig::default()).await?;
//!     service.serve().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docgate` binary (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod broker;
pub mod config;
pub mod error;
pub mod service;
pub mod staging;
pub mod supervisor;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{
    CommandEngine, Extraction, ExtractionBackend, ExtractionJob, HttpBackend, LibraryBackend,
    ParseEngine,
};
pub use broker::{Broker, InferenceRequest, InferenceResult};
pub use config::{
    BackendMode, ExtractMethod, LaunchCommand, OutputFormat, PollPolicy, ServiceConfig,
    ServiceConfigBuilder,
};
pub use error::{ErrorKind, ServiceError};
pub use service::{router, AppState, Service};
pub use staging::{StagedArtifact, StagingArea};
pub use supervisor::{BackendHandle, HealthStatus, Supervisor};
