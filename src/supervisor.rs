//! Backend supervisor: launch, readiness gate, liveness.
//!
//! The supervisor owns the single [`BackendHandle`] of the process. It is
//! created once, [`Supervisor::start`]ed once during initialisation, and then
//! shared (behind an `Arc`) by the broker and the facade.
//!
//! # Startup
//!
//! 1. spawn the configured launch command (if any) with the backend
//!    environment applied, `kill_on_drop` set
//! 2. probe the backend every `poll.interval`, at most `poll.attempts` times,
//!    each probe capped at one second
//! 3. return on the first successful probe; fail with
//!    [`ServiceError::StartupTimeout`] when the ceiling is hit, or with
//!    [`ServiceError::BackendExited`] as soon as the child dies
//!
//! There is no restart: if the backend dies later, probes report unhealthy
//! and invocations fail until the platform replaces the container.
//!
//! # Liveness
//!
//! [`Supervisor::health`] probes live on every call. The last verdict is
//! recorded for observability only and never answers a probe by itself.

use crate::backend::ExtractionBackend;
use crate::config::{LaunchCommand, PollPolicy, ServiceConfig};
use crate::error::ServiceError;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Cap on one readiness probe during startup. A backend that accepts
/// connections but never answers must not stretch the polling ceiling.
const STARTUP_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of a liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Snapshot of the supervised backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHandle {
    /// Strategy name (`http`, `library`).
    pub backend: &'static str,
    /// OS process id of the launched child, if one was launched and is running.
    pub pid: Option<u32>,
    /// Base URL for networked backends.
    pub endpoint: Option<String>,
    /// Whether `start` completed.
    pub started: bool,
    /// Verdict of the most recent probe.
    pub last_healthy: bool,
}

#[derive(Default)]
struct ProcessState {
    child: Option<Child>,
}

/// Owns the backend lifecycle.
pub struct Supervisor {
    backend: Arc<dyn ExtractionBackend>,
    launch: Option<LaunchCommand>,
    env: Vec<(String, String)>,
    poll: PollPolicy,
    process: Mutex<ProcessState>,
    started: AtomicBool,
    last_healthy: AtomicBool,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("backend", &self.backend.name())
            .field("launch", &self.launch)
            .field("poll", &self.poll)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        backend: Arc<dyn ExtractionBackend>,
        launch: Option<LaunchCommand>,
        env: Vec<(String, String)>,
        poll: PollPolicy,
    ) -> Self {
        Self {
            backend,
            launch,
            env,
            poll,
            process: Mutex::new(ProcessState::default()),
            started: AtomicBool::new(false),
            last_healthy: AtomicBool::new(false),
        }
    }

    /// Build a supervisor from the service configuration.
    pub fn from_config(config: &ServiceConfig, backend: Arc<dyn ExtractionBackend>) -> Self {
        Self::new(backend, config.launch.clone(), config.backend_env(), config.poll)
    }

    pub fn backend(&self) -> &Arc<dyn ExtractionBackend> {
        &self.backend
    }

    fn lock_process(&self) -> MutexGuard<'_, ProcessState> {
        // The guarded state stays consistent even if a holder panicked.
        self.process.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Launch the backend and block until it answers a probe.
    ///
    /// Calling `start` again after success is a no-op that returns the
    /// current handle.
    pub async fn start(&self) -> Result<BackendHandle, ServiceError> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(self.handle());
        }

        if let Some(ref launch) = self.launch {
            self.spawn(launch)?;
        }

        let PollPolicy { attempts, interval } = self.poll;
        for attempt in 1..=attempts {
            if let Some(status) = self.exit_status() {
                error!("Backend exited during startup: {}", status);
                return Err(ServiceError::BackendExited { status });
            }

            let probe = tokio::time::timeout(STARTUP_PROBE_TIMEOUT, self.backend.probe())
                .await
                .unwrap_or_else(|_| Err("readiness probe timed out".to_string()));
            match probe {
                Ok(()) => {
                    self.last_healthy.store(true, Ordering::SeqCst);
                    self.started.store(true, Ordering::SeqCst);
                    info!(
                        "Backend '{}' ready after {} attempt(s)",
                        self.backend.name(),
                        attempt
                    );
                    return Ok(self.handle());
                }
                Err(reason) => {
                    debug!("Readiness attempt {}/{}: {}", attempt, attempts, reason);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        error!(
            "Backend '{}' not ready after {} attempts",
            self.backend.name(),
            attempts
        );
        self.shutdown().await;
        Err(ServiceError::StartupTimeout {
            attempts,
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        })
    }

    fn spawn(&self, launch: &LaunchCommand) -> Result<(), ServiceError> {
        info!("Launching backend: {} {}", launch.program, launch.args.join(" "));

        let child = Command::new(&launch.program)
            .args(&launch.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ServiceError::SpawnFailed {
                program: launch.program.clone(),
                source,
            })?;

        info!("Backend process spawned (pid {:?})", child.id());
        self.lock_process().child = Some(child);
        Ok(())
    }

    /// Exit status of the launched child, if it has exited.
    fn exit_status(&self) -> Option<String> {
        let mut state = self.lock_process();
        let child = state.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({e})")),
        }
    }

    /// Probe the backend now. Never fails: a down backend is just unhealthy.
    pub async fn health(&self) -> HealthStatus {
        let status = if !self.started.load(Ordering::SeqCst) {
            HealthStatus::Unhealthy {
                reason: "backend not started".to_string(),
            }
        } else if let Some(exit) = self.exit_status() {
            HealthStatus::Unhealthy {
                reason: format!("backend process exited with status {exit}"),
            }
        } else {
            match self.backend.probe().await {
                Ok(()) => HealthStatus::Healthy,
                Err(reason) => HealthStatus::Unhealthy { reason },
            }
        };

        let healthy = status.is_healthy();
        if self.last_healthy.swap(healthy, Ordering::SeqCst) != healthy {
            if healthy {
                info!("Backend recovered");
            } else {
                warn!("Backend became unhealthy: {:?}", status);
            }
        }
        status
    }

    pub async fn is_healthy(&self) -> bool {
        self.health().await.is_healthy()
    }

    /// Cheap readiness gate used before dispatching a job.
    ///
    /// Checks that startup completed and the child is still running; does
    /// not issue a network probe.
    pub fn ensure_ready(&self) -> Result<(), ServiceError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ServiceError::backend("backend is not ready"));
        }
        if let Some(status) = self.exit_status() {
            return Err(ServiceError::backend(format!(
                "backend process exited with status {status}"
            )));
        }
        Ok(())
    }

    /// Current handle snapshot.
    pub fn handle(&self) -> BackendHandle {
        let pid = self.lock_process().child.as_ref().and_then(Child::id);
        BackendHandle {
            backend: self.backend.name(),
            pid,
            endpoint: self.backend.endpoint(),
            started: self.started.load(Ordering::SeqCst),
            last_healthy: self.last_healthy.load(Ordering::SeqCst),
        }
    }

    /// Kill the launched child, if any, and mark the backend not started.
    /// Best-effort.
    pub async fn shutdown(&self) {
        let child = self.lock_process().child.take();
        self.started.store(false, Ordering::SeqCst);
        self.last_healthy.store(false, Ordering::SeqCst);
        if let Some(mut child) = child {
            info!("Stopping backend (pid {:?})", child.id());
            if let Err(e) = child.kill().await {
                warn!("Error while stopping backend: {}", e);
            }
        }
    }
}
