//! # Transport providers
//!
//! One provider per source kind turns an endpoint plus already-resolved
//! credentials and trust material into a byte stream. The copy engine looks
//! providers up in a [`Providers`] table keyed by [`SourceKind`]; the table
//! is an ordinary value handed to the engine, so tests substitute doubles by
//! constructing a different table.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;

use crate::error::{ImportError, StreamFailure};
use crate::options::SourceKind;

mod http;
pub use http::HttpProvider;
mod s3;
#[cfg(any(test, feature = "internal-testing-api"))]
pub(crate) use s3::verify_signed_get;
pub use s3::{ObjectStorageProvider, DEFAULT_REGION};
mod registry;
pub use registry::{CopyRequest, ImageCopier, RegistryProvider};
mod upload;
pub use upload::{UploadProvider, UploadSlot};

/// Default bound on a single fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(3600);

/// A readable byte stream produced by a provider.
pub type TransportStream = Box<dyn Read + Send>;

/// Everything a provider needs to fetch one source.
#[derive(Clone, Copy)]
pub struct FetchRequest<'a> {
    /// The source location.
    pub endpoint: &'a str,
    /// Access key or user name; empty for anonymous access.
    pub access_key: &'a str,
    /// Secret key or password.
    pub secret_key: &'a str,
    /// Directory holding PEM trust anchors.
    pub cert_dir: Option<&'a Utf8Path>,
    /// Skip TLS verification (registry only).
    pub insecure_tls: bool,
    /// Upper bound on the duration of the fetch.
    pub timeout: Duration,
    /// Where to keep intermediate files; the system temporary directory
    /// if unset.
    pub scratch_dir: Option<&'a Utf8Path>,
}

impl fmt::Debug for FetchRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("cert_dir", &self.cert_dir)
            .field("insecure_tls", &self.insecure_tls)
            .field("timeout", &self.timeout)
            .field("scratch_dir", &self.scratch_dir)
            .finish_non_exhaustive()
    }
}

impl FetchRequest<'_> {
    pub(crate) fn has_credentials(&self) -> bool {
        !self.access_key.is_empty() || !self.secret_key.is_empty()
    }
}

/// A component able to fetch bytes for one source kind.
pub trait TransportProvider: Send + Sync + fmt::Debug {
    /// Open the source and return its content as a stream.
    fn fetch(&self, req: &FetchRequest<'_>) -> Result<TransportStream, ImportError>;
}

/// The provider lookup table used by the copy engine.
#[derive(Debug, Clone)]
pub struct Providers {
    http: Arc<dyn TransportProvider>,
    object_storage: Arc<dyn TransportProvider>,
    registry: Arc<dyn TransportProvider>,
    upload: Option<Arc<dyn TransportProvider>>,
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            http: Arc::new(HttpProvider),
            object_storage: Arc::new(ObjectStorageProvider::default()),
            registry: Arc::new(RegistryProvider::default()),
            upload: None,
        }
    }
}

impl Providers {
    /// Replace the provider used for `kind`.
    ///
    /// Panics if `kind` is [`SourceKind::None`], which never has a provider.
    pub fn with(mut self, kind: SourceKind, provider: Arc<dyn TransportProvider>) -> Self {
        match kind {
            SourceKind::Http => self.http = provider,
            SourceKind::ObjectStorage => self.object_storage = provider,
            SourceKind::Registry => self.registry = provider,
            SourceKind::Upload => self.upload = Some(provider),
            SourceKind::None => panic!("cannot register a provider for source kind none"),
        }
        self
    }

    /// Use `copier` for registry access instead of forking skopeo.
    pub fn with_image_copier(self, copier: Arc<dyn ImageCopier>) -> Self {
        self.with(SourceKind::Registry, Arc::new(RegistryProvider::new(copier)))
    }

    /// Accept uploads handed over through `slot`.
    pub fn with_upload_slot(self, slot: UploadSlot) -> Self {
        self.with(SourceKind::Upload, Arc::new(UploadProvider::new(slot)))
    }

    /// Resolve the provider for `kind`.
    pub fn get(&self, kind: SourceKind) -> Result<&dyn TransportProvider, ImportError> {
        let r = match kind {
            SourceKind::Http => Some(&self.http),
            SourceKind::ObjectStorage => Some(&self.object_storage),
            SourceKind::Registry => Some(&self.registry),
            SourceKind::Upload => self.upload.as_ref(),
            SourceKind::None => None,
        };
        r.map(|p| p.as_ref())
            .ok_or_else(|| ImportError::TransportResolution(kind.to_string()))
    }
}

/// Wraps a network body so that errors raised while it is consumed are
/// attributed to the transport rather than to a conversion stage.
pub(crate) struct FetchReader<R> {
    inner: R,
    endpoint: String,
}

impl<R: Read> FetchReader<R> {
    pub(crate) fn new(inner: R, endpoint: &str) -> Self {
        Self {
            inner,
            endpoint: endpoint.to_owned(),
        }
    }
}

impl<R: Read> Read for FetchReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|e| {
            let timed_out = e.kind() == io::ErrorKind::TimedOut || error_chain_mentions_timeout(&e);
            io::Error::new(
                e.kind(),
                StreamFailure {
                    endpoint: self.endpoint.clone(),
                    timed_out,
                    message: e.to_string(),
                },
            )
        })
    }
}

fn error_chain_mentions_timeout(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur = Some(e);
    while let Some(e) = cur {
        if e.to_string().contains("timed out") {
            return true;
        }
        cur = e.source();
    }
    false
}

/// Returns `true` if any error in the chain looks like a TLS trust failure.
/// The TLS backends don't expose a typed error for this, so we match on text.
pub(crate) fn error_chain_is_tls(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur = Some(e);
    while let Some(e) = cur {
        let s = e.to_string().to_ascii_lowercase();
        if ["certificate", "x509", "ssl", "tls handshake"]
            .iter()
            .any(|needle| s.contains(needle))
        {
            return true;
        }
        cur = e.source();
    }
    false
}
