//! Running one import as a worker.
//!
//! A worker runs the copy engine once and reports its outcome through a
//! termination message, which the controller reads back from the worker's
//! status.

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::copy::{CopyEngine, CopyOutcome};
use crate::error::ImportError;
use crate::options::ImportOptions;
use crate::tokio_util::spawn_blocking_cancellable;

/// Environment variable carrying the fetch timeout in seconds. Not part of
/// [`ImportOptions`]; it tunes the engine rather than describing the import.
pub const ENV_FETCH_TIMEOUT: &str = "IMPORTER_FETCH_TIMEOUT";

/// Environment variable naming the address a worker receives an upload
/// on. Without it, the upload is read from standard input.
pub const ENV_UPLOAD_LISTEN: &str = "IMPORTER_UPLOAD_LISTEN";

/// Environment variable naming the region object storage requests are
/// signed for.
pub const ENV_S3_REGION: &str = "IMPORTER_S3_REGION";

/// Reason code of a successful import.
pub const REASON_COMPLETED: &str = "Completed";

/// The outcome a worker reports when it exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationMessage {
    /// [`REASON_COMPLETED`] or an [`ImportError::reason`] code.
    pub reason: String,
    /// Human readable detail.
    pub message: String,
    /// Size of the image written, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_written: Option<u64>,
}

impl TerminationMessage {
    /// Summarize the result of an import.
    pub fn from_result(r: &Result<CopyOutcome, ImportError>) -> Self {
        match r {
            Ok(o) => Self {
                reason: REASON_COMPLETED.to_owned(),
                message: format!("Import complete: {} bytes", o.bytes_written),
                bytes_written: Some(o.bytes_written),
            },
            Err(e) => Self {
                reason: e.reason().to_owned(),
                message: e.to_string(),
                bytes_written: None,
            },
        }
    }

    /// Parse a termination message as reported in worker status.
    pub fn parse(s: &str) -> Result<Self> {
        serde_json::from_str(s.trim()).context("Parsing termination message")
    }

    /// Whether this message reports success.
    pub fn is_success(&self) -> bool {
        self.reason == REASON_COMPLETED
    }

    /// Write this message to `path`.
    #[context("Writing termination message")]
    pub fn write_to(&self, path: &Utf8Path) -> Result<()> {
        let buf = serde_json::to_vec(self)?;
        std::fs::write(path, buf).with_context(|| format!("Writing {path}"))?;
        Ok(())
    }
}

/// Run the engine on the blocking pool. Cancelling `cancel`, or dropping
/// the returned future, makes the import stop at the next chunk.
pub async fn run_import(
    engine: Arc<CopyEngine>,
    opts: ImportOptions,
    cancel: &CancellationToken,
) -> Result<Result<CopyOutcome, ImportError>> {
    tracing::debug!("Starting import: {opts:?}");
    spawn_blocking_cancellable(cancel, move |token| engine.copy(&opts, token)).await
}
