//! CLI binary for docgate.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ServiceConfig`, starts the backend and serves until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use docgate::config::DEFAULT_BIND_ADDR;
use docgate::{BackendMode, LaunchCommand, PollPolicy, Service, ServiceConfig};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"EXAMPLES:
  # Launch mineru-api on :8000 and serve /ping + /invocations on :8080
  docgate

  # Attach to a backend that is already running elsewhere
  docgate --no-launch --backend-url http://10.0.0.5:8000

  # Custom backend command line
  docgate --launch-cmd my-extractor --launch-arg=--port --launch-arg=8000

  # In-process engine: run `magic-pdf -p <in> -o <out> -m <method>` per request
  docgate --mode library --engine magic-pdf

  # Smoke test
  curl -s localhost:8080/ping
  curl -s localhost:8080/invocations -H 'content-type: application/json' \
       -d "{\"pdf_base64\":\"$(base64 -w0 doc.pdf)\"}"

ENVIRONMENT VARIABLES:
  DOCGATE_*               Every flag has a DOCGATE_ variable (see --help)
  RUST_LOG                Overrides the log filter (e.g. docgate=debug,tower_http=debug)
"#;

/// Supervise a document-extraction backend behind /ping and /invocations.
#[derive(Parser, Debug)]
#[command(
    name = "docgate",
    version,
    about = "Supervise a document-extraction backend behind /ping and /invocations",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Address for the external HTTP surface.
    #[arg(long, env = "DOCGATE_BIND", default_value = DEFAULT_BIND_ADDR)]
    bind: SocketAddr,

    /// Backend strategy: http (local server) or library (per-request engine).
    #[arg(long, env = "DOCGATE_MODE", value_enum, default_value = "http")]
    mode: ModeArg,

    /// Base URL of the networked backend.
    #[arg(long, env = "DOCGATE_BACKEND_URL", default_value = docgate::config::DEFAULT_BACKEND_URL)]
    backend_url: String,

    /// Program launched and supervised as the backend.
    #[arg(long, env = "DOCGATE_LAUNCH_CMD", default_value = "mineru-api")]
    launch_cmd: String,

    /// Arguments for the launch program (repeatable).
    #[arg(
        long = "launch-arg",
        env = "DOCGATE_LAUNCH_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true,
        default_values_t = ["--host".to_string(), "127.0.0.1".to_string(), "--port".to_string(), "8000".to_string()]
    )]
    launch_args: Vec<String>,

    /// Do not launch anything; attach to an already running backend.
    #[arg(long, env = "DOCGATE_NO_LAUNCH")]
    no_launch: bool,

    /// Parse command for library mode.
    #[arg(long, env = "DOCGATE_ENGINE", default_value = "magic-pdf")]
    engine: String,

    /// Let the backend fetch models remotely instead of forcing local-only resolution.
    #[arg(long, env = "DOCGATE_ALLOW_REMOTE_MODELS")]
    allow_remote_models: bool,

    /// Extra backend environment variable, KEY=VALUE (repeatable).
    #[arg(long = "backend-env", value_parser = parse_key_val)]
    backend_env: Vec<(String, String)>,

    /// Readiness probe attempts before giving up.
    #[arg(long, env = "DOCGATE_STARTUP_ATTEMPTS", default_value_t = 30)]
    startup_attempts: u32,

    /// Milliseconds between readiness probes.
    #[arg(long, env = "DOCGATE_STARTUP_INTERVAL_MS", default_value_t = 1000)]
    startup_interval_ms: u64,

    /// Liveness probe timeout in seconds.
    #[arg(long, env = "DOCGATE_PROBE_TIMEOUT", default_value_t = 5)]
    probe_timeout: u64,

    /// Extraction call timeout in seconds.
    #[arg(long, env = "DOCGATE_REQUEST_TIMEOUT", default_value_t = 300)]
    request_timeout: u64,

    /// Largest accepted request body in MiB.
    #[arg(long, env = "DOCGATE_MAX_BODY_MB", default_value_t = 100)]
    max_body_mb: usize,

    /// Directory for staged request files (default: system temp dir).
    #[arg(long, env = "DOCGATE_STAGING_DIR")]
    staging_dir: Option<PathBuf>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCGATE_VERBOSE")]
    verbose: bool,

    /// Only log errors.
    #[arg(short, long, env = "DOCGATE_QUIET")]
    quiet: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "DOCGATE_LOG_JSON")]
    log_json: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum ModeArg {
    Http,
    Library,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
    }

    // ── Build config ─────────────────────────────────────────────────────
    let config = build_config(&cli)?;
    tracing::debug!("{:?}", config);

    // ── Start backend, then serve ────────────────────────────────────────
    let service = Service::initialize(config)
        .await
        .context("Backend failed to start; not serving")?;
    service.serve().await.context("Server failed")?;

    Ok(())
}

/// Map CLI args to `ServiceConfig`.
fn build_config(cli: &Cli) -> Result<ServiceConfig> {
    let mode = match cli.mode {
        ModeArg::Http => BackendMode::http(&cli.backend_url),
        ModeArg::Library => BackendMode::library(&cli.engine),
    };

    let mut builder = ServiceConfig::builder()
        .bind_addr(cli.bind)
        .mode(mode)
        .local_only(!cli.allow_remote_models)
        .poll(PollPolicy {
            attempts: cli.startup_attempts,
            interval: Duration::from_millis(cli.startup_interval_ms),
        })
        .probe_timeout(Duration::from_secs(cli.probe_timeout))
        .request_timeout(Duration::from_secs(cli.request_timeout))
        .max_body_bytes(cli.max_body_mb.saturating_mul(1024 * 1024));

    // Library mode runs its engine per request; only HTTP mode launches by default.
    let launch = match cli.mode {
        ModeArg::Http if !cli.no_launch => {
            Some(LaunchCommand::new(cli.launch_cmd.clone(), cli.launch_args.clone()))
        }
        _ => None,
    };
    builder = builder.launch(launch);

    for (k, v) in &cli.backend_env {
        builder = builder.env(k.clone(), v.clone());
    }
    if let Some(ref dir) = cli.staging_dir {
        builder = builder.staging_dir(dir.clone());
    }

    builder.build().context("Invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_val_parsing() {
        assert_eq!(
            parse_key_val("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn defaults_launch_mineru_in_http_mode() {
        let cli = Cli::parse_from(["docgate"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.launch, Some(LaunchCommand::default()));
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[test]
    fn library_mode_launches_nothing() {
        let cli = Cli::parse_from(["docgate", "--mode", "library", "--engine", "magic-pdf"]);
        let config = build_config(&cli).unwrap();
        assert!(config.launch.is_none());
        assert_eq!(config.mode, BackendMode::library("magic-pdf"));
    }
}
