//! Accept a stream pushed by an upload server.
//!
//! The upload server and the copy engine meet at an [`UploadSlot`]: the
//! server submits the request body, the provider waits for it. A worker
//! receives the body from the upload proxy as the content of a single
//! connection, see [`UploadSlot::accept`].

use std::fmt;
use std::net::{Shutdown, TcpListener};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use super::{FetchReader, FetchRequest, TransportProvider, TransportStream};
use crate::error::ImportError;

const UPLOAD_ENDPOINT: &str = "upload";

/// A rendezvous point for one pending upload at a time.
#[derive(Clone)]
pub struct UploadSlot {
    tx: SyncSender<TransportStream>,
    rx: Arc<Mutex<Receiver<TransportStream>>>,
}

impl fmt::Debug for UploadSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadSlot").finish_non_exhaustive()
    }
}

impl Default for UploadSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Hand over an upload body. Fails if another body is still waiting to
    /// be consumed.
    pub fn submit(&self, body: TransportStream) -> Result<()> {
        match self.tx.try_send(body) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => anyhow::bail!("An upload is already pending"),
            Err(TrySendError::Disconnected(_)) => anyhow::bail!("Upload slot closed"),
        }
    }

    /// Wait for one connection on `listener` and submit everything the peer
    /// sends until it shuts down its side.
    pub fn accept(&self, listener: TcpListener) -> Result<()> {
        let (conn, peer) = listener.accept().context("Accepting upload connection")?;
        tracing::info!("Receiving upload from {peer}");
        // Nothing is sent back.
        conn.shutdown(Shutdown::Write)
            .context("Closing upload connection for writing")?;
        let endpoint = format!("upload://{peer}");
        self.submit(Box::new(FetchReader::new(conn, &endpoint)))
    }
}

/// Provider for uploads.
#[derive(Debug, Clone)]
pub struct UploadProvider {
    slot: UploadSlot,
}

impl UploadProvider {
    /// Create a provider waiting on `slot`.
    pub fn new(slot: UploadSlot) -> Self {
        Self { slot }
    }
}

impl TransportProvider for UploadProvider {
    fn fetch(&self, req: &FetchRequest<'_>) -> Result<TransportStream, ImportError> {
        let endpoint = if req.endpoint.is_empty() {
            UPLOAD_ENDPOINT
        } else {
            req.endpoint
        };
        let rx = self.slot.rx.lock().map_err(|_| ImportError::Fetch {
            endpoint: endpoint.to_owned(),
            message: "upload slot poisoned".into(),
        })?;
        tracing::debug!("Waiting up to {:?} for upload", req.timeout);
        match rx.recv_timeout(req.timeout) {
            Ok(body) => Ok(body),
            Err(RecvTimeoutError::Timeout) => Err(ImportError::FetchTimeout {
                endpoint: endpoint.to_owned(),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(ImportError::Fetch {
                endpoint: endpoint.to_owned(),
                message: "upload slot closed".into(),
            }),
        }
    }
}
