//! Configuration types for the docgate service.
//!
//! Every knob lives in [`ServiceConfig`], built via its
//! [`ServiceConfigBuilder`]. The CLI maps its flags onto the builder; tests
//! build configs directly with short polling intervals.

use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default address of the external `/ping` + `/invocations` surface.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Default base URL of the networked backend.
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// Environment toggles that force the backend to resolve models locally.
pub const LOCAL_ONLY_ENV: &[(&str, &str)] = &[("MINERU_MODEL_SOURCE", "local"), ("HF_HUB_OFFLINE", "1")];

/// Configuration for a docgate service instance.
///
/// # Example
/// ```rust
/// use docgate::{BackendMode, ServiceConfig};
/// use std::time::Duration;
///
/// let config = ServiceConfig::builder()
///     .mode(BackendMode::http("http://127.0.0.1:8000"))
///     .request_timeout(Duration::from_secs(120))
///     .build()
///     .unwrap();
/// assert_eq!(config.poll.attempts, 30);
/// ```
#[derive(Clone)]
pub struct ServiceConfig {
    /// Address the facade listens on. Default: `0.0.0.0:8080`.
    pub bind_addr: SocketAddr,

    /// Which backend-invocation strategy to use. Default: networked at `localhost:8000`.
    pub mode: BackendMode,

    /// Process to launch and supervise. `None` attaches to an already running backend.
    pub launch: Option<LaunchCommand>,

    /// Apply [`LOCAL_ONLY_ENV`] to the backend environment. Default: true.
    pub local_only: bool,

    /// Extra environment variables for the backend process or engine.
    pub env: Vec<(String, String)>,

    /// Readiness polling policy used by `Supervisor::start`. Default: 30 × 1 s.
    pub poll: PollPolicy,

    /// Timeout of a single liveness probe. Default: 5 s.
    ///
    /// Kept short so a wedged backend turns `/ping` unhealthy instead of
    /// hanging the platform's health checker.
    pub probe_timeout: Duration,

    /// Timeout of a single extraction call. Default: 300 s.
    pub request_timeout: Duration,

    /// Largest accepted `/invocations` body in bytes. Default: 100 MiB.
    ///
    /// Base64 inflates a PDF by a third, so the HTTP framework's 2 MB default
    /// would reject ordinary documents.
    pub max_body_bytes: usize,

    /// Root directory for staged artifacts. Default: the system temp dir.
    pub staging_dir: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            mode: BackendMode::default(),
            launch: Some(LaunchCommand::default()),
            local_only: true,
            env: Vec::new(),
            poll: PollPolicy::default(),
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(300),
            max_body_bytes: 100 * 1024 * 1024,
            staging_dir: None,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("bind_addr", &self.bind_addr)
            .field("mode", &self.mode)
            .field("launch", &self.launch)
            .field("local_only", &self.local_only)
            .field("env", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("poll", &self.poll)
            .field("probe_timeout", &self.probe_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("staging_dir", &self.staging_dir)
            .finish()
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// The full environment handed to the backend: local-only toggles first,
    /// then user-supplied pairs (which may override them).
    pub fn backend_env(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = Vec::new();
        if self.local_only {
            vars.extend(
                LOCAL_ONLY_ENV
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string())),
            );
        }
        vars.extend(self.env.iter().cloned());
        vars
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Select the backend strategy. Choosing [`BackendMode::Library`] clears
    /// `launch`, since the engine runs per request; call `launch` afterwards
    /// to supervise a helper process anyway.
    pub fn mode(mut self, mode: BackendMode) -> Self {
        if matches!(mode, BackendMode::Library { .. }) {
            self.config.launch = None;
        }
        self.config.mode = mode;
        self
    }

    pub fn launch(mut self, launch: Option<LaunchCommand>) -> Self {
        self.config.launch = launch;
        self
    }

    pub fn local_only(mut self, v: bool) -> Self {
        self.config.local_only = v;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    pub fn poll(mut self, poll: PollPolicy) -> Self {
        self.config.poll = poll;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_body_bytes(mut self, n: usize) -> Self {
        self.config.max_body_bytes = n.max(1024);
        self
    }

    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging_dir = Some(dir.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, ServiceError> {
        let c = &self.config;
        if c.poll.attempts == 0 {
            return Err(ServiceError::InvalidConfig(
                "Readiness polling needs at least 1 attempt".into(),
            ));
        }
        if c.probe_timeout.is_zero() || c.request_timeout.is_zero() {
            return Err(ServiceError::InvalidConfig(
                "Timeouts must be greater than zero".into(),
            ));
        }
        if let BackendMode::Http { base_url } = &c.mode {
            if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                return Err(ServiceError::InvalidConfig(format!(
                    "Backend URL must be http:// or https://, got '{base_url}'"
                )));
            }
        }
        if let Some(launch) = &c.launch {
            if launch.program.trim().is_empty() {
                return Err(ServiceError::InvalidConfig(
                    "Launch program must not be empty".into(),
                ));
            }
        }
        Ok(self.config)
    }
}

// ── Backend selection ────────────────────────────────────────────────────

/// How the broker reaches the extraction engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMode {
    /// Multipart POST to `{base_url}/v1/extract`, liveness via `{base_url}/health`.
    Http { base_url: String },
    /// Run a parse command in-process per request, then scan its output directory.
    Library { program: String, args: Vec<String> },
}

impl BackendMode {
    pub fn http(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        BackendMode::Http {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn library(program: impl Into<String>) -> Self {
        BackendMode::Library {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

impl Default for BackendMode {
    fn default() -> Self {
        BackendMode::http(DEFAULT_BACKEND_URL)
    }
}

/// A process to spawn and supervise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for LaunchCommand {
    fn default() -> Self {
        LaunchCommand::new("mineru-api", ["--host", "127.0.0.1", "--port", "8000"])
    }
}

/// Bounded readiness polling: fixed interval, fixed attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(1),
        }
    }
}

// ── Request enums ────────────────────────────────────────────────────────

/// Output format requested from the backend. Passed through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Markdown,
    Json,
    Html,
    Text,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Json => "json",
            OutputFormat::Html => "html",
            OutputFormat::Text => "text",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" => Ok(OutputFormat::Markdown),
            "json" => Ok(OutputFormat::Json),
            "html" => Ok(OutputFormat::Html),
            "text" => Ok(OutputFormat::Text),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown output_format '{other}' (expected markdown, json, html or text)"
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extraction method selector for the in-process engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractMethod {
    /// Let the engine decide between text-layer and OCR extraction.
    #[default]
    Auto,
    /// Use the embedded text layer only.
    Txt,
    /// Force OCR.
    Ocr,
}

impl ExtractMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractMethod::Auto => "auto",
            ExtractMethod::Txt => "txt",
            ExtractMethod::Ocr => "ocr",
        }
    }
}

impl FromStr for ExtractMethod {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ExtractMethod::Auto),
            "txt" => Ok(ExtractMethod::Txt),
            "ocr" => Ok(ExtractMethod::Ocr),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown method '{other}' (expected auto, txt or ocr)"
            ))),
        }
    }
}

impl fmt::Display for ExtractMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_platform_contract() {
        let c = ServiceConfig::default();
        assert_eq!(c.bind_addr.port(), 8080);
        assert_eq!(c.mode, BackendMode::http("http://localhost:8000"));
        assert_eq!(c.poll.attempts, 30);
        assert_eq!(c.poll.interval, Duration::from_secs(1));
        assert_eq!(c.request_timeout, Duration::from_secs(300));
        assert!(c.local_only);
    }

    #[test]
    fn build_rejects_zero_attempts() {
        let err = ServiceConfig::builder()
            .poll(PollPolicy {
                attempts: 0,
                interval: Duration::from_millis(10),
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidConfig(_)));
    }

    #[test]
    fn build_rejects_non_http_backend_url() {
        let err = ServiceConfig::builder()
            .mode(BackendMode::http("localhost:8000"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("localhost:8000"));
    }

    #[test]
    fn http_mode_trims_trailing_slash() {
        assert_eq!(
            BackendMode::http("http://127.0.0.1:8000/"),
            BackendMode::Http {
                base_url: "http://127.0.0.1:8000".into()
            }
        );
    }

    #[test]
    fn backend_env_puts_overrides_last() {
        let c = ServiceConfig::builder()
            .env("HF_HUB_OFFLINE", "0")
            .build()
            .unwrap();
        let env = c.backend_env();
        assert_eq!(env.first().map(|(k, _)| k.as_str()), Some("MINERU_MODEL_SOURCE"));
        assert_eq!(
            env.last(),
            Some(&("HF_HUB_OFFLINE".to_string(), "0".to_string()))
        );

        let bare = ServiceConfig::builder().local_only(false).build().unwrap();
        assert!(bare.backend_env().is_empty());
    }

    #[test]
    fn output_format_parsing() {
        assert_eq!("markdown".parse::<OutputFormat>().unwrap(), OutputFormat::Markdown);
        assert_eq!(" JSON ".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("docx".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::default().as_str(), "markdown");
    }

    #[test]
    fn method_parsing() {
        assert_eq!("ocr".parse::<ExtractMethod>().unwrap(), ExtractMethod::Ocr);
        assert_eq!(ExtractMethod::default(), ExtractMethod::Auto);
        let err = "magic".parse::<ExtractMethod>().unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }
}
