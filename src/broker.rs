//! Request broker: one invocation from raw body to normalised result.
//!
//! ```text
//! body ──▶ decode ──▶ ready? ──▶ stage ──▶ backend.invoke ──▶ normalise
//!                                  │                              │
//!                                  └────────── release ◀──────────┘
//! ```
//!
//! [`Broker::handle`] always returns an [`InferenceResult`]. Every error
//! raised along the way is folded into its failure variant, and staged
//! artifacts are released whichever way the invocation ends.

use crate::backend::{Extraction, ExtractionJob};
use crate::config::{ExtractMethod, OutputFormat};
use crate::error::{ErrorKind, ServiceError};
use crate::staging::{StagedArtifact, StagingArea};
use crate::supervisor::Supervisor;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// A decoded `/invocations` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRequest {
    /// Base64-encoded document, still encoded. Never empty.
    pub pdf_base64: String,
    pub output_format: OutputFormat,
    pub method: ExtractMethod,
}

impl InferenceRequest {
    /// Validate the content type and decode the JSON body.
    pub fn decode(body: &[u8], content_type: Option<&str>) -> Result<Self, ServiceError> {
        if !is_json_content_type(content_type) {
            return Err(ServiceError::UnsupportedMediaType {
                content_type: content_type.unwrap_or("<none>").to_string(),
            });
        }

        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ServiceError::InvalidRequest(format!("body is not valid JSON: {e}")))?;
        let Value::Object(mut fields) = value else {
            return Err(ServiceError::InvalidRequest("body must be a JSON object".into()));
        };

        let pdf_base64 = match fields.remove("pdf_base64") {
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            None | Some(Value::Null) | Some(Value::String(_)) => {
                return Err(ServiceError::MissingField { field: "pdf_base64" })
            }
            Some(_) => return Err(ServiceError::InvalidRequest("pdf_base64 must be a string".into())),
        };

        let output_format = match optional_str(&mut fields, "output_format")? {
            Some(s) => s.parse()?,
            None => OutputFormat::default(),
        };
        let method = match optional_str(&mut fields, "method")? {
            Some(s) => s.parse()?,
            None => ExtractMethod::default(),
        };

        Ok(Self {
            pdf_base64,
            output_format,
            method,
        })
    }
}

fn optional_str(
    fields: &mut serde_json::Map<String, Value>,
    name: &str,
) -> Result<Option<String>, ServiceError> {
    match fields.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ServiceError::InvalidRequest(format!("{name} must be a string"))),
    }
}

/// `application/json`, optionally with parameters such as `charset`.
fn is_json_content_type(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

/// Normalised outcome of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceResult {
    Success(Extraction),
    Failure { kind: ErrorKind, message: String },
}

impl InferenceResult {
    pub fn failure(err: &ServiceError) -> Self {
        InferenceResult::Failure {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InferenceResult::Success(_))
    }
}

impl Serialize for InferenceResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            InferenceResult::Success(Extraction::Document {
                content,
                format,
                metadata,
            }) => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("status", "success")?;
                map.serialize_entry("content", content)?;
                map.serialize_entry("format", format)?;
                map.serialize_entry("metadata", metadata)?;
                map.end()
            }
            InferenceResult::Success(Extraction::Files { results }) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("status", "success")?;
                map.serialize_entry("results", results)?;
                map.end()
            }
            InferenceResult::Failure { kind, message } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("status", "error")?;
                map.serialize_entry("kind", kind)?;
                map.serialize_entry("message", message)?;
                map.end()
            }
        }
    }
}

/// Turns raw requests into backend calls.
#[derive(Debug)]
pub struct Broker {
    supervisor: Arc<Supervisor>,
    staging: StagingArea,
    next_id: AtomicU64,
}

impl Broker {
    pub fn new(supervisor: Arc<Supervisor>, staging: StagingArea) -> Self {
        Self {
            supervisor,
            staging,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Run one invocation. Never fails and never leaves staged files behind.
    pub async fn handle(&self, raw_body: &[u8], content_type: Option<&str>) -> InferenceResult {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("invocation", id);

        async move {
            let start = Instant::now();
            match self.run(raw_body, content_type).await {
                Ok(extraction) => {
                    info!("Invocation succeeded in {}ms", start.elapsed().as_millis());
                    InferenceResult::Success(extraction)
                }
                Err(e) => {
                    warn!("Invocation failed ({}): {}", e.kind(), e);
                    InferenceResult::failure(&e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(&self, raw_body: &[u8], content_type: Option<&str>) -> Result<Extraction, ServiceError> {
        let request = InferenceRequest::decode(raw_body, content_type)?;
        debug!(
            "Decoded request: {} base64 chars, format={}, method={}",
            request.pdf_base64.len(),
            request.output_format,
            request.method
        );

        self.supervisor.ensure_ready()?;
        let backend = Arc::clone(self.supervisor.backend());

        // Guards release on drop if anything below bails out early.
        let mut input = self.staging.stage_input(&request.pdf_base64)?;
        let mut output_dir = if backend.needs_output_dir() {
            Some(self.staging.allocate_output_dir()?)
        } else {
            None
        };

        let job = ExtractionJob {
            input: input.path().to_path_buf(),
            output_dir: output_dir.as_ref().map(|d| d.path().to_path_buf()),
            output_format: request.output_format,
            method: request.method,
        };

        info!("Dispatching to '{}' backend", backend.name());

        // The task owns the artifacts. If the caller goes away mid-call the
        // backend keeps running, so release must wait until it returns.
        let task = tokio::spawn(
            async move {
                let outcome = backend.invoke(&job).await;
                release_logged(&mut input);
                if let Some(dir) = output_dir.as_mut() {
                    release_logged(dir);
                }
                outcome
            }
            .in_current_span(),
        );

        task.await
            .map_err(|e| ServiceError::Internal(format!("invocation task failed: {e}")))?
    }
}

fn release_logged(artifact: &mut StagedArtifact) {
    if let Err(e) = artifact.release() {
        warn!("Failed to release {}: {}", artifact.path().display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExtractionBackend;
    use crate::config::PollPolicy;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    const JSON: Option<&str> = Some("application/json");

    /// Records the jobs it sees; fails when `fail` is set.
    #[derive(Default)]
    struct RecordingBackend {
        calls: AtomicUsize,
        seen: Mutex<Vec<PathBuf>>,
        fail: bool,
        output_dir: bool,
    }

    #[async_trait]
    impl ExtractionBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn needs_output_dir(&self) -> bool {
            self.output_dir
        }

        async fn probe(&self) -> Result<(), String> {
            Ok(())
        }

        async fn invoke(&self, job: &ExtractionJob) -> Result<Extraction, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(job.input.exists());
            let mut seen = self.seen.lock().unwrap();
            seen.push(job.input.clone());
            if let Some(ref dir) = job.output_dir {
                assert!(dir.is_dir());
                seen.push(dir.clone());
            }
            if self.fail {
                return Err(ServiceError::BackendCallFailure {
                    status: Some(500),
                    message: "engine crashed".into(),
                });
            }
            Ok(Extraction::Document {
                content: json!("OK"),
                format: job.output_format.as_str().into(),
                metadata: Map::new(),
            })
        }
    }

    async fn broker_with(backend: Arc<RecordingBackend>, root: &std::path::Path) -> Broker {
        let poll = PollPolicy {
            attempts: 1,
            interval: Duration::from_millis(1),
        };
        let sup = Arc::new(Supervisor::new(backend, None, vec![], poll));
        sup.start().await.unwrap();
        Broker::new(sup, StagingArea::new(root))
    }

    #[test]
    fn decode_applies_defaults() {
        let req = InferenceRequest::decode(br#"{"pdf_base64":"aGVsbG8="}"#, JSON).unwrap();
        assert_eq!(req.output_format, OutputFormat::Markdown);
        assert_eq!(req.method, ExtractMethod::Auto);

        let req = InferenceRequest::decode(
            br#"{"pdf_base64":"aGVsbG8=","output_format":"json","method":"ocr"}"#,
            Some("application/json; charset=utf-8"),
        )
        .unwrap();
        assert_eq!(req.output_format, OutputFormat::Json);
        assert_eq!(req.method, ExtractMethod::Ocr);
    }

    #[test]
    fn decode_rejects_wrong_content_type() {
        let err = InferenceRequest::decode(br#"{"pdf_base64":"x"}"#, Some("text/plain")).unwrap_err();
        assert!(matches!(err, ServiceError::UnsupportedMediaType { .. }));
        let err = InferenceRequest::decode(br#"{"pdf_base64":"x"}"#, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedMediaType);
    }

    #[test]
    fn decode_missing_or_empty_payload_is_missing_field() {
        for body in [r#"{}"#, r#"{"pdf_base64":""}"#, r#"{"pdf_base64":null}"#] {
            let err = InferenceRequest::decode(body.as_bytes(), JSON).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MissingField, "body: {body}");
        }
    }

    #[test]
    fn decode_rejects_malformed_bodies() {
        for body in ["not json", "[1,2]", r#"{"pdf_base64":42}"#, r#"{"pdf_base64":"x","output_format":"docx"}"#] {
            let err = InferenceRequest::decode(body.as_bytes(), JSON).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidRequest, "body: {body}");
        }
    }

    #[test]
    fn result_wire_shapes() {
        let doc = InferenceResult::Success(Extraction::Document {
            content: json!("OK"),
            format: "markdown".into(),
            metadata: Map::new(),
        });
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            json!({"status": "success", "content": "OK", "format": "markdown", "metadata": {}})
        );

        let mut results = Map::new();
        results.insert("markdown".into(), json!("# A"));
        let files = InferenceResult::Success(Extraction::Files { results });
        assert_eq!(
            serde_json::to_value(&files).unwrap(),
            json!({"status": "success", "results": {"markdown": "# A"}})
        );

        let failure = InferenceResult::failure(&ServiceError::MissingField { field: "pdf_base64" });
        assert_eq!(
            serde_json::to_value(&failure).unwrap(),
            json!({"status": "error", "kind": "missing_field", "message": "Missing pdf_base64 parameter"})
        );
    }

    #[tokio::test]
    async fn missing_payload_never_reaches_backend() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let broker = broker_with(backend.clone(), root.path()).await;

        let result = broker.handle(br#"{"output_format":"markdown"}"#, JSON).await;
        assert!(matches!(
            result,
            InferenceResult::Failure { kind: ErrorKind::MissingField, .. }
        ));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_base64_never_reaches_backend() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let broker = broker_with(backend.clone(), root.path()).await;

        let result = broker.handle(br#"{"pdf_base64":"%%%"}"#, JSON).await;
        assert!(matches!(
            result,
            InferenceResult::Failure { kind: ErrorKind::DecodeError, .. }
        ));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn staged_artifacts_are_released_on_success_and_failure() {
        for fail in [false, true] {
            let root = tempfile::tempdir().unwrap();
            let backend = Arc::new(RecordingBackend {
                fail,
                output_dir: true,
                ..Default::default()
            });
            let broker = broker_with(backend.clone(), root.path()).await;

            let result = broker.handle(br#"{"pdf_base64":"JVBERi0xLjQK"}"#, JSON).await;
            assert_eq!(result.is_success(), !fail);

            let seen = backend.seen.lock().unwrap().clone();
            assert_eq!(seen.len(), 2, "input file and output dir");
            for path in seen {
                assert!(!path.exists(), "{} should be released", path.display());
            }
            assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        }
    }

    #[tokio::test]
    async fn backend_failure_keeps_status_in_message() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(RecordingBackend {
            fail: true,
            ..Default::default()
        });
        let broker = broker_with(backend, root.path()).await;

        let InferenceResult::Failure { kind, message } =
            broker.handle(br#"{"pdf_base64":"aGVsbG8="}"#, JSON).await
        else {
            panic!("expected failure");
        };
        assert_eq!(kind, ErrorKind::BackendCallFailure);
        assert!(message.contains("500"), "got: {message}");
    }

    #[tokio::test]
    async fn not_started_backend_is_not_called() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let poll = PollPolicy {
            attempts: 1,
            interval: Duration::from_millis(1),
        };
        let sup = Arc::new(Supervisor::new(backend.clone(), None, vec![], poll));
        let broker = Broker::new(sup, StagingArea::new(root.path()));

        let result = broker.handle(br#"{"pdf_base64":"aGVsbG8="}"#, JSON).await;
        assert!(matches!(
            result,
            InferenceResult::Failure { kind: ErrorKind::BackendCallFailure, .. }
        ));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}
