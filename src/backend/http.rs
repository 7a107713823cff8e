//! Networked strategy: the backend is a local HTTP server.
//!
//! * liveness: `GET {base}/health`, short timeout, any 2xx is healthy
//! * extraction: `POST {base}/v1/extract` as `multipart/form-data` with a
//!   binary `file` field and a text `output_format` field
//!
//! Every failure mode (non-2xx, connection refused, timeout, undecodable
//! body) becomes [`ServiceError::BackendCallFailure`]; nothing here panics
//! or propagates a transport fault upward.

use super::{Extraction, ExtractionBackend, ExtractionJob};
use crate::config::OutputFormat;
use crate::error::ServiceError;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Backend error bodies are echoed to callers; cap how much.
const MAX_ERROR_BODY_CHARS: usize = 2048;

/// Talks to a backend listening on a local port.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
    probe_client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(
        base_url: impl Into<String>,
        probe_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ServiceError::InvalidConfig(format!("HTTP client: {e}")))?;

        // No pooled connections for probes: a stale keep-alive socket must not
        // make a dead backend look alive.
        let probe_client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ServiceError::InvalidConfig(format!("HTTP probe client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            probe_client,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    fn extract_url(&self) -> String {
        format!("{}/v1/extract", self.base_url)
    }
}

#[async_trait]
impl ExtractionBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.base_url.clone())
    }

    async fn probe(&self) -> Result<(), String> {
        match self.probe_client.get(self.health_url()).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("health check returned HTTP {}", resp.status().as_u16())),
            Err(e) if e.is_timeout() => Err("health check timed out".to_string()),
            Err(e) => Err(format!("health check failed: {e}")),
        }
    }

    async fn invoke(&self, job: &ExtractionJob) -> Result<Extraction, ServiceError> {
        let bytes = tokio::fs::read(&job.input)
            .await
            .map_err(|e| ServiceError::Internal(format!("Failed to read staged input: {e}")))?;

        let file_name = job
            .input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/pdf")
            .map_err(|e| ServiceError::Internal(format!("multipart: {e}")))?;
        let form = Form::new()
            .part("file", part)
            .text("output_format", job.output_format.as_str());

        debug!("POST {} (format={})", self.extract_url(), job.output_format);

        let response = self
            .client
            .post(self.extract_url())
            .timeout(self.request_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::backend(format!(
                        "timed out after {}s",
                        self.request_timeout.as_secs()
                    ))
                } else {
                    ServiceError::backend(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Backend answered HTTP {}", status.as_u16());
            return Err(ServiceError::BackendCallFailure {
                status: Some(status.as_u16()),
                message: truncate_chars(&body, MAX_ERROR_BODY_CHARS),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::backend(format!("undecodable response body: {e}")))?;

        normalise_document(body, job.output_format)
    }
}

/// Turn the backend's JSON body into an [`Extraction::Document`].
///
/// `content` is required and must be a string or an object. `format` falls
/// back to the requested format, `metadata` to an empty mapping.
pub fn normalise_document(body: Value, requested: OutputFormat) -> Result<Extraction, ServiceError> {
    let Value::Object(mut map) = body else {
        return Err(ServiceError::backend("response body is not a JSON object"));
    };

    let content = match map.remove("content") {
        Some(c @ (Value::String(_) | Value::Object(_))) => c,
        Some(other) => {
            return Err(ServiceError::backend(format!(
                "response 'content' must be a string or object, got {}",
                json_type(&other)
            )))
        }
        None => return Err(ServiceError::backend("response has no 'content' field")),
    };

    let format = match map.remove("format") {
        Some(Value::String(f)) if !f.is_empty() => f,
        _ => requested.as_str().to_string(),
    };

    let metadata = match map.remove("metadata") {
        Some(Value::Object(m)) => m,
        _ => Map::new(),
    };

    Ok(Extraction::Document {
        content,
        format,
        metadata,
    })
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalise_fills_defaults() {
        let out = normalise_document(json!({"content": "OK"}), OutputFormat::Markdown).unwrap();
        assert_eq!(
            out,
            Extraction::Document {
                content: json!("OK"),
                format: "markdown".into(),
                metadata: Map::new(),
            }
        );
    }

    #[test]
    fn normalise_keeps_backend_format_and_metadata() {
        let out = normalise_document(
            json!({"content": {"blocks": []}, "format": "json", "metadata": {"pages": 3}}),
            OutputFormat::Markdown,
        )
        .unwrap();
        let Extraction::Document {
            content,
            format,
            metadata,
        } = out
        else {
            panic!("expected a document");
        };
        assert_eq!(content, json!({"blocks": []}));
        assert_eq!(format, "json");
        assert_eq!(metadata.get("pages"), Some(&json!(3)));
    }

    #[test]
    fn normalise_rejects_missing_or_bad_content() {
        let missing = normalise_document(json!({"text": "x"}), OutputFormat::Text).unwrap_err();
        assert!(missing.to_string().contains("no 'content'"));

        let numeric = normalise_document(json!({"content": 7}), OutputFormat::Text).unwrap_err();
        assert!(numeric.to_string().contains("got number"));

        let array = normalise_document(json!(["content"]), OutputFormat::Text).unwrap_err();
        assert!(matches!(array, ServiceError::BackendCallFailure { status: None, .. }));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé…");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn urls_are_built_from_trimmed_base() {
        let b = HttpBackend::new(
            "http://127.0.0.1:8000/",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(b.health_url(), "http://127.0.0.1:8000/health");
        assert_eq!(b.extract_url(), "http://127.0.0.1:8000/v1/extract");
    }
}
