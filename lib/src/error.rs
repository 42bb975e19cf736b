//! Error types surfaced by an import attempt.
//!
//! Every failure of the copy engine is terminal for the current worker
//! attempt; nothing here is retried internally. The controller turns
//! [`ImportError::reason`] and the display form into request status.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// The phase of an import in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Selecting a transport provider for the source kind.
    Resolve,
    /// Obtaining bytes from the source.
    Fetch,
    /// Normalizing the byte stream into a raw disk image.
    Convert,
    /// Writing to the destination.
    Write,
    /// Enforcing the requested capacity.
    Capacity,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Resolve => "resolve",
            Phase::Fetch => "fetch",
            Phase::Convert => "convert",
            Phase::Write => "write",
            Phase::Capacity => "capacity",
        };
        f.write_str(s)
    }
}

/// A stage of the format conversion chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Inspecting leading bytes.
    Detect,
    /// gzip or xz decompression.
    Decompress,
    /// Extracting the disk image entry from a tar archive.
    Unarchive,
    /// Decoding a qcow2 image into raw blocks.
    Decode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Detect => "detect",
            Stage::Decompress => "decompress",
            Stage::Unarchive => "unarchive",
            Stage::Decode => "decode",
        };
        f.write_str(s)
    }
}

/// A failed import attempt.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// No transport provider exists for the requested source kind.
    #[error("no transport provider for source kind {0}")]
    TransportResolution(String),
    /// The source rejected the supplied credentials.
    #[error("authentication rejected by {endpoint}: {message}")]
    FetchAuth {
        /// The endpoint that was contacted.
        endpoint: String,
        /// Detail from the source.
        message: String,
    },
    /// The source does not exist.
    #[error("source not found at {endpoint}: {message}")]
    FetchNotFound {
        /// The endpoint that was contacted.
        endpoint: String,
        /// Detail from the source.
        message: String,
    },
    /// The certificate was not trusted, or the trust configuration does not
    /// permit this endpoint.
    #[error("TLS trust failure for {endpoint}: {message}")]
    FetchTls {
        /// The endpoint that was contacted.
        endpoint: String,
        /// Detail from the TLS layer or policy check.
        message: String,
    },
    /// The source did not answer in time.
    #[error("timed out fetching {endpoint}")]
    FetchTimeout {
        /// The endpoint that was contacted.
        endpoint: String,
    },
    /// Any other transport failure (connection refused, protocol error, ...).
    #[error("fetching {endpoint} failed: {message}")]
    Fetch {
        /// The endpoint that was contacted.
        endpoint: String,
        /// What went wrong.
        message: String,
    },
    /// The content could not be normalized into a raw disk image.
    #[error("conversion failed in {stage} stage: {message}")]
    Conversion {
        /// The stage of the chain that failed.
        stage: Stage,
        /// What went wrong.
        message: String,
    },
    /// The destination could not be written.
    #[error("writing destination failed: {0}")]
    Write(#[source] io::Error),
    /// The content exceeds the requested capacity.
    #[error("content exceeds requested capacity of {capacity} bytes")]
    CapacityExceeded {
        /// The requested bound in bytes.
        capacity: u64,
    },
    /// The attempt was cancelled by its surrounding lifecycle.
    #[error("import cancelled")]
    Cancelled,
}

impl ImportError {
    /// The phase in which this error happened.
    pub fn phase(&self) -> Phase {
        match self {
            ImportError::TransportResolution(_) => Phase::Resolve,
            ImportError::FetchAuth { .. }
            | ImportError::FetchNotFound { .. }
            | ImportError::FetchTls { .. }
            | ImportError::FetchTimeout { .. }
            | ImportError::Fetch { .. } => Phase::Fetch,
            ImportError::Conversion { .. } => Phase::Convert,
            ImportError::Write(_) | ImportError::Cancelled => Phase::Write,
            ImportError::CapacityExceeded { .. } => Phase::Capacity,
        }
    }

    /// A stable reason code, written to request status.
    pub fn reason(&self) -> &'static str {
        match self {
            ImportError::TransportResolution(_) => "TransportResolutionError",
            ImportError::FetchAuth { .. } => "FetchAuthError",
            ImportError::FetchNotFound { .. } => "FetchNotFoundError",
            ImportError::FetchTls { .. } => "FetchTLSError",
            ImportError::FetchTimeout { .. } => "FetchTimeoutError",
            ImportError::Fetch { .. } => "FetchError",
            ImportError::Conversion { .. } => "ConversionError",
            ImportError::Write(_) => "WriteError",
            ImportError::CapacityExceeded { .. } => "CapacityExceededError",
            ImportError::Cancelled => "Cancelled",
        }
    }

    pub(crate) fn conversion(stage: Stage, message: impl fmt::Display) -> Self {
        ImportError::Conversion {
            stage,
            message: message.to_string(),
        }
    }
}

/// An I/O error raised by a conversion stage, carried inside an
/// [`io::Error`] so that it can cross `Read` boundaries.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub(crate) struct StageFailure {
    pub(crate) stage: Stage,
    pub(crate) message: String,
}

/// An I/O error raised by a transport while its stream is being consumed.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub(crate) struct StreamFailure {
    pub(crate) endpoint: String,
    pub(crate) timed_out: bool,
    pub(crate) message: String,
}

/// Raised by a read after the import was cancelled.
#[derive(Debug, thiserror::Error)]
#[error("import cancelled")]
pub(crate) struct CancelledRead;

pub(crate) fn cancelled_read() -> io::Error {
    io::Error::other(CancelledRead)
}

/// Attribute an error to `stage` unless an upstream stage or the transport
/// already claimed it.
pub(crate) fn tag_stage(stage: Stage, e: io::Error) -> io::Error {
    if is_tagged(&e) {
        return e;
    }
    let kind = match e.kind() {
        io::ErrorKind::Interrupted => io::ErrorKind::Other,
        k => k,
    };
    io::Error::new(
        kind,
        StageFailure {
            stage,
            message: e.to_string(),
        },
    )
}

fn is_tagged(e: &io::Error) -> bool {
    e.get_ref()
        .map(|inner| {
            inner.is::<StageFailure>() || inner.is::<StreamFailure>() || inner.is::<CancelledRead>()
        })
        .unwrap_or(false)
}

/// Classify an error observed while reading the converted stream.
pub(crate) fn classify_read_error(endpoint: &str, e: io::Error) -> ImportError {
    if let Some(inner) = e.get_ref() {
        if inner.is::<CancelledRead>() {
            return ImportError::Cancelled;
        }
        if let Some(f) = inner.downcast_ref::<StageFailure>() {
            return ImportError::conversion(f.stage, &f.message);
        }
        if let Some(f) = inner.downcast_ref::<StreamFailure>() {
            if f.timed_out {
                return ImportError::FetchTimeout {
                    endpoint: f.endpoint.clone(),
                };
            }
            return ImportError::Fetch {
                endpoint: f.endpoint.clone(),
                message: f.message.clone(),
            };
        }
    }
    match e.kind() {
        io::ErrorKind::TimedOut => ImportError::FetchTimeout {
            endpoint: endpoint.to_owned(),
        },
        _ => ImportError::Fetch {
            endpoint: endpoint.to_owned(),
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagging_keeps_first_owner() {
        let e = io::Error::new(io::ErrorKind::InvalidData, "bad magic");
        let e = tag_stage(Stage::Decode, e);
        // A downstream stage re-wrapping must not steal attribution.
        let e = tag_stage(Stage::Decompress, e);
        match classify_read_error("http://example.com/a", e) {
            ImportError::Conversion { stage, message } => {
                assert_eq!(stage, Stage::Decode);
                assert_eq!(message, "bad magic");
            }
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn test_stream_failures_are_fetch_errors() {
        let e = io::Error::new(
            io::ErrorKind::TimedOut,
            StreamFailure {
                endpoint: "http://example.com/a".into(),
                timed_out: true,
                message: "operation timed out".into(),
            },
        );
        let e = tag_stage(Stage::Decompress, e);
        let e = classify_read_error("ignored", e);
        assert_eq!(e.phase(), Phase::Fetch);
        assert_eq!(e.reason(), "FetchTimeoutError");

        let e = classify_read_error("http://h/x", io::ErrorKind::ConnectionReset.into());
        assert_eq!(e.reason(), "FetchError");
    }

    #[test]
    fn test_reason_codes() {
        let e = ImportError::CapacityExceeded { capacity: 10 };
        assert_eq!(e.phase(), Phase::Capacity);
        assert_eq!(e.reason(), "CapacityExceededError");
        assert_eq!(
            e.to_string(),
            "content exceeds requested capacity of 10 bytes"
        );
        let e = ImportError::TransportResolution("none".into());
        assert_eq!(e.phase(), Phase::Resolve);
    }

    #[test]
    fn test_cancelled_read_survives_stages() {
        let e = tag_stage(Stage::Decode, cancelled_read());
        let e = tag_stage(Stage::Unarchive, e);
        assert!(matches!(classify_read_error("x", e), ImportError::Cancelled));
    }
}
