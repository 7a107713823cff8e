//! Staging area: ephemeral files that carry a request across the process
//! boundary to the backend.
//!
//! The backend wants a file-system path, not a byte buffer, so each
//! invocation decodes its payload into a uniquely named temp file and, for
//! the in-process engine, allocates an empty output directory next to it.
//!
//! Every staged path is wrapped in a [`StagedArtifact`] guard. The broker
//! calls [`StagedArtifact::release`] on the normal path so deletion errors
//! get logged; `Drop` releases anything still alive on every other path
//! (early `?` return, panic, aborted task). Releasing twice, or releasing a
//! path that is already gone, is not an error.

use crate::error::ServiceError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

const PREFIX: &str = "docgate-";

/// Allocates staged artifacts under a root directory.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl Default for StagingArea {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decode a base64 payload and write it to a fresh `.pdf` temp file.
    ///
    /// ASCII whitespace is ignored so line-wrapped payloads decode. Fails with
    /// [`ServiceError::DecodeError`] before touching the disk if the payload
    /// is malformed or decodes to nothing.
    pub fn stage_input(&self, payload_b64: &str) -> Result<StagedArtifact, ServiceError> {
        let bytes = decode_payload(payload_b64)?;

        let mut file = tempfile::Builder::new()
            .prefix(PREFIX)
            .suffix(".pdf")
            .tempfile_in(&self.root)
            .map_err(|e| ServiceError::Internal(format!("Failed to create staged input: {e}")))?;
        file.write_all(&bytes)
            .and_then(|()| file.flush())
            .map_err(|e| ServiceError::Internal(format!("Failed to write staged input: {e}")))?;

        // Ownership moves from tempfile's guard to ours.
        let (_, path) = file
            .keep()
            .map_err(|e| ServiceError::Internal(format!("Failed to persist staged input: {e}")))?;

        debug!("Staged {} input bytes at {}", bytes.len(), path.display());
        Ok(StagedArtifact::new(path, ArtifactKind::File))
    }

    /// Create a uniquely named, empty temp directory.
    pub fn allocate_output_dir(&self) -> Result<StagedArtifact, ServiceError> {
        let dir = tempfile::Builder::new()
            .prefix(PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| ServiceError::Internal(format!("Failed to create output dir: {e}")))?;
        let path = dir.keep();

        debug!("Allocated output dir {}", path.display());
        Ok(StagedArtifact::new(path, ArtifactKind::Directory))
    }
}

/// Decode a standard-alphabet base64 payload, ignoring ASCII whitespace.
pub fn decode_payload(payload_b64: &str) -> Result<Vec<u8>, ServiceError> {
    let compact: String = payload_b64
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ServiceError::DecodeError(e.to_string()))?;
    if bytes.is_empty() {
        return Err(ServiceError::DecodeError("payload decodes to zero bytes".into()));
    }
    Ok(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    File,
    Directory,
}

/// A staged file or directory, deleted when released or dropped.
#[derive(Debug)]
pub struct StagedArtifact {
    path: PathBuf,
    kind: ArtifactKind,
    created_at: SystemTime,
    released: bool,
}

impl StagedArtifact {
    fn new(path: PathBuf, kind: ArtifactKind) -> Self {
        Self {
            path,
            kind,
            created_at: SystemTime::now(),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Delete the artifact now. Idempotent.
    pub fn release(&mut self) -> std::io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        release(&[self.path.as_path()])
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release {}: {}", self.path.display(), e);
        }
    }
}

/// Delete each path, file or directory. Missing paths are skipped.
///
/// Every path is attempted; the first error (if any) is returned afterwards.
pub fn release(paths: &[&Path]) -> std::io::Result<()> {
    let mut first_err = None;
    for path in paths {
        let result = match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
            Ok(_) => std::fs::remove_file(path),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!("Released {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}
