//! In-process strategy: call the parse entry point directly, then scan the
//! output directory for recognised files.
//!
//! The entry point is abstracted as [`ParseEngine`], a blocking call that
//! receives the staged input path, an empty output directory and the
//! extraction method. [`CommandEngine`] drives an external parser command
//! line; tests substitute their own engines.
//!
//! After the engine returns, the output directory is walked in sorted order:
//!
//! | extension | result key | value |
//! |-----------|------------|-------|
//! | `.md`     | `markdown` | file text |
//! | `.json`   | `json`     | parsed JSON |
//!
//! The first file of each kind wins. An engine that writes nothing yields an
//! empty mapping, which is still a success.

use super::{Extraction, ExtractionBackend, ExtractionJob};
use crate::config::ExtractMethod;
use crate::error::ServiceError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Keep this much of the engine's stderr for error messages.
const STDERR_TAIL_BYTES: u64 = 2048;

/// A blocking document-parse entry point.
///
/// Runs on tokio's blocking pool, so implementations may do heavy CPU work
/// and synchronous I/O freely.
pub trait ParseEngine: Send + Sync {
    /// Parse `input` and write results into `output_dir`.
    fn parse(&self, input: &Path, output_dir: &Path, method: ExtractMethod) -> Result<(), ServiceError>;

    /// Whether the engine can currently accept work.
    fn is_available(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Runs `program [args..] -p <input> -o <output_dir> -m <method>` per job.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    timeout: Duration,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn envs(mut self, envs: Vec<(String, String)>) -> Self {
        self.envs = envs;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, input: &Path, output_dir: &Path, method: ExtractMethod) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-p")
            .arg(input)
            .arg("-o")
            .arg(output_dir)
            .arg("-m")
            .arg(method.as_str())
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        cmd
    }
}

impl ParseEngine for CommandEngine {
    fn is_available(&self) -> Result<(), String> {
        resolve_program(&self.program)
            .map(|path| debug!("Parse engine resolved to {}", path.display()))
            .ok_or_else(|| format!("parse engine '{}' not found", self.program))
    }

    fn parse(&self, input: &Path, output_dir: &Path, method: ExtractMethod) -> Result<(), ServiceError> {
        // stderr goes to an anonymous file: no pipe to drain while we wait.
        let mut stderr_log = tempfile::tempfile()
            .map_err(|e| ServiceError::Internal(format!("stderr capture: {e}")))?;
        let stderr_handle = stderr_log
            .try_clone()
            .map_err(|e| ServiceError::Internal(format!("stderr capture: {e}")))?;

        let mut child = self
            .command(input, output_dir, method)
            .stderr(Stdio::from(stderr_handle))
            .spawn()
            .map_err(|e| ServiceError::backend(format!("failed to run '{}': {e}", self.program)))?;
        debug!("Parse engine '{}' started (pid {})", self.program, child.id());

        match wait_with_deadline(&mut child, self.timeout)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => {
                let tail = read_tail(&mut stderr_log);
                Err(ServiceError::backend(format!(
                    "'{}' exited with {status}: {}",
                    self.program,
                    tail.trim()
                )))
            }
            None => {
                warn!("Parse engine '{}' exceeded {:?}, killing", self.program, self.timeout);
                let _ = child.kill();
                let _ = child.wait();
                Err(ServiceError::backend(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }
}

/// Locate `program` the way spawning it would: a path is taken as is,
/// a bare name is looked up on `PATH`.
fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let dirs = std::env::var_os("PATH")?;
    std::env::split_paths(&dirs)
        .map(|dir| dir.join(program))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

/// Poll `child` until it exits or `timeout` passes. `None` means timed out.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>, ServiceError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) if Instant::now() >= deadline => return Ok(None),
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => return Err(ServiceError::Internal(format!("waiting on parse engine: {e}"))),
        }
    }
}

fn read_tail(file: &mut std::fs::File) -> String {
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(STDERR_TAIL_BYTES);
    let mut buf = Vec::new();
    if file.seek(SeekFrom::Start(start)).is_ok() {
        let _ = file.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// The in-process strategy wrapping a [`ParseEngine`].
#[derive(Clone)]
pub struct LibraryBackend {
    engine: Arc<dyn ParseEngine>,
}

impl std::fmt::Debug for LibraryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryBackend")
            .field("engine", &"<dyn ParseEngine>")
            .finish()
    }
}

impl LibraryBackend {
    pub fn new(engine: Arc<dyn ParseEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ExtractionBackend for LibraryBackend {
    fn name(&self) -> &'static str {
        "library"
    }

    fn needs_output_dir(&self) -> bool {
        true
    }

    async fn probe(&self) -> Result<(), String> {
        self.engine.is_available()
    }

    async fn invoke(&self, job: &ExtractionJob) -> Result<Extraction, ServiceError> {
        let output_dir = job
            .output_dir
            .clone()
            .ok_or_else(|| ServiceError::Internal("library backend needs an output dir".into()))?;
        let input = job.input.clone();
        let method = job.method;
        let engine = Arc::clone(&self.engine);

        let results = tokio::task::spawn_blocking(move || {
            engine.parse(&input, &output_dir, method)?;
            collect_outputs(&output_dir)
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("Parse task panicked: {e}")))??;

        if results.is_empty() {
            warn!("Parse engine produced no recognised output files");
        } else {
            info!("Collected {} output kind(s)", results.len());
        }
        Ok(Extraction::Files { results })
    }
}

/// Walk `dir` and collect recognised files into a result mapping.
pub fn collect_outputs(dir: &Path) -> Result<Map<String, Value>, ServiceError> {
    let mut files = Vec::new();
    walk_files(dir, &mut files)
        .map_err(|e| ServiceError::backend(format!("cannot scan output dir: {e}")))?;

    let mut results = Map::new();
    for path in files {
        let key = match path.extension().and_then(|e| e.to_str()) {
            Some("md") => "markdown",
            Some("json") => "json",
            _ => continue,
        };
        if results.contains_key(key) {
            debug!("Ignoring extra {} output {}", key, path.display());
            continue;
        }

        let text = std::fs::read_to_string(&path).map_err(|e| {
            ServiceError::backend(format!("cannot read output {}: {e}", path.display()))
        })?;
        let value = if key == "json" {
            serde_json::from_str(&text).map_err(|e| {
                ServiceError::backend(format!("malformed JSON output {}: {e}", path.display()))
            })?
        } else {
            Value::String(text)
        };
        results.insert(key.to_string(), value);
    }
    Ok(results)
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            walk_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collect_reads_markdown_and_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doc.md"), "# Title\n").unwrap();
        std::fs::write(dir.path().join("doc.json"), r#"{"pages": 2}"#).unwrap();
        std::fs::write(dir.path().join("page1.png"), [0u8; 4]).unwrap();

        let results = collect_outputs(dir.path()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results["markdown"], json!("# Title\n"));
        assert_eq!(results["json"], json!({"pages": 2}));
    }

    #[test]
    fn collect_walks_subdirectories_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("doc/auto");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("b.md"), "second").unwrap();
        std::fs::write(nested.join("a.md"), "first").unwrap();

        let results = collect_outputs(dir.path()).unwrap();
        assert_eq!(results["markdown"], json!("first"));
    }

    #[test]
    fn collect_empty_dir_is_empty_mapping() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_outputs(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn collect_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doc.json"), "{not json").unwrap();
        let err = collect_outputs(dir.path()).unwrap_err();
        assert!(err.to_string().contains("malformed JSON"), "got: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn command_engine_availability_follows_path() {
        assert!(CommandEngine::new("sh", vec![]).is_available().is_ok());
        assert!(CommandEngine::new("/bin/sh", vec![]).is_available().is_ok());

        let err = CommandEngine::new("docgate-missing-engine", vec![])
            .is_available()
            .unwrap_err();
        assert!(err.contains("docgate-missing-engine"), "got: {err}");
        assert!(CommandEngine::new("/nonexistent/magic-pdf", vec![])
            .is_available()
            .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_engine_reports_exit_status_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CommandEngine::new(
            "sh",
            vec!["-c".into(), "echo boom >&2; exit 3".into(), "parse".into()],
        );
        let err = engine
            .parse(&dir.path().join("in.pdf"), dir.path(), ExtractMethod::Auto)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("boom"), "got: {msg}");
        assert!(matches!(err, ServiceError::BackendCallFailure { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn command_engine_passes_paths_method_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        // $0 = "parse", then: -p <in> -o <out> -m <method>
        let script = r#"printf '%s|%s|%s' "$2" "$6" "$MINERU_MODEL_SOURCE" > "$4/args.md""#;
        let engine = CommandEngine::new("sh", vec!["-c".into(), script.into(), "parse".into()])
            .envs(vec![("MINERU_MODEL_SOURCE".into(), "local".into())]);

        let input = dir.path().join("in.pdf");
        engine.parse(&input, &out, ExtractMethod::Ocr).unwrap();

        let written = std::fs::read_to_string(out.join("args.md")).unwrap();
        assert_eq!(written, format!("{}|ocr|local", input.display()));
    }

    #[cfg(unix)]
    #[test]
    fn command_engine_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CommandEngine::new("sh", vec!["-c".into(), "sleep 5".into(), "parse".into()])
            .timeout(Duration::from_millis(100));
        let err = engine
            .parse(&dir.path().join("in.pdf"), dir.path(), ExtractMethod::Auto)
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "got: {err}");
    }
}
