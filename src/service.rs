//! Service facade: the hosting platform's `/ping` + `/invocations` contract.
//!
//! | Route | Success | Failure |
//! |-------|---------|---------|
//! | `GET /ping` | 200 `{"status":"healthy"}` | 503 `{"status":"unhealthy","reason":..}` |
//! | `POST /invocations` | 200 result body | 400 / 415 / 500 `{"status":"error",..}` |
//!
//! [`Service::initialize`] starts the supervisor and only then returns a
//! service; a startup failure means there is nothing to serve. Handlers
//! never let an error or panic reach the transport layer.

use crate::backend::{self, ExtractionBackend};
use crate::broker::{Broker, InferenceResult};
use crate::config::ServiceConfig;
use crate::error::{ErrorKind, ServiceError};
use crate::staging::StagingArea;
use crate::supervisor::{HealthStatus, Supervisor};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::FutureExt;
use serde_json::json;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state behind the router.
#[derive(Debug, Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub broker: Arc<Broker>,
}

/// An initialised service whose backend answered its readiness probe.
#[derive(Debug)]
pub struct Service {
    config: ServiceConfig,
    state: AppState,
}

impl Service {
    /// Build the configured backend, start it, and wait until it is ready.
    pub async fn initialize(config: ServiceConfig) -> Result<Self, ServiceError> {
        let backend = backend::from_config(&config)?;
        Self::with_backend(config, backend).await
    }

    /// Same as [`Service::initialize`] with an injected backend strategy.
    pub async fn with_backend(
        config: ServiceConfig,
        backend: Arc<dyn ExtractionBackend>,
    ) -> Result<Self, ServiceError> {
        let supervisor = Arc::new(Supervisor::from_config(&config, backend));
        let handle = supervisor.start().await?;
        info!(
            "Backend ready: {} (pid {:?}, endpoint {:?})",
            handle.backend, handle.pid, handle.endpoint
        );

        let staging = config
            .staging_dir
            .clone()
            .map(StagingArea::new)
            .unwrap_or_default();
        let broker = Arc::new(Broker::new(Arc::clone(&supervisor), staging));

        Ok(Self {
            config,
            state: AppState { supervisor, broker },
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        router(self.state.clone(), self.config.max_body_bytes)
    }

    /// Serve on `config.bind_addr` until `shutdown` resolves, then stop the backend.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), ServiceError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ServiceError::Internal(format!("bind {}: {e}", self.config.bind_addr)))?;
        info!("Listening on {}", self.config.bind_addr);

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServiceError::Internal(format!("server error: {e}")));

        self.state.supervisor.shutdown().await;
        result
    }

    /// Serve until Ctrl-C.
    pub async fn serve(self) -> Result<(), ServiceError> {
        self.serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
    }
}

/// Build the `/ping` + `/invocations` router over `state`.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/invocations", post(invocations))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping(State(state): State<AppState>) -> Response {
    let health = AssertUnwindSafe(state.supervisor.health())
        .catch_unwind()
        .await
        .unwrap_or_else(|_| HealthStatus::Unhealthy {
            reason: "health probe panicked".to_string(),
        });

    match health {
        HealthStatus::Healthy => (StatusCode::OK, Json(json!({"status": "healthy"}))).into_response(),
        HealthStatus::Unhealthy { reason } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unhealthy", "reason": reason})),
        )
            .into_response(),
    }
}

async fn invocations(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let result = AssertUnwindSafe(state.broker.handle(&body, content_type))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!("Invocation panicked");
            InferenceResult::failure(&ServiceError::Internal("invocation panicked".into()))
        });

    let status = match &result {
        InferenceResult::Success(_) => StatusCode::OK,
        InferenceResult::Failure { kind, .. } => status_for(*kind),
    };
    (status, Json(result)).into_response()
}

/// Transport status for a failed invocation.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::MissingField | ErrorKind::InvalidRequest | ErrorKind::DecodeError => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorKind::BackendCallFailure
        | ErrorKind::InternalError
        | ErrorKind::StartupTimeout
        | ErrorKind::StartupFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
