//! Fetch a disk image embedded in a container image.
//!
//! The registry protocol itself is delegated to an [`ImageCopier`], which
//! materializes the image as a `dir:` layout (a `manifest.json` plus one file
//! per blob). We then find the layer carrying a `disk/` entry and extract
//! exactly that entry into scratch space.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;
use tempfile::TempDir;

use super::{FetchRequest, TransportProvider, TransportStream};
use crate::error::{ImportError, Stage};
use crate::format::decompress::maybe_decompress;
use crate::skopeo::SkopeoCopier;

/// Directory inside the image that holds the disk image.
const DISK_DIR: &str = "disk/";
const TRANSPORT_PREFIX: &str = "docker://";

/// Arguments to an image copy.
#[derive(Clone, Copy)]
pub struct CopyRequest<'a> {
    /// Directory to materialize the image into, in `dir:` layout.
    pub dest_dir: &'a Utf8Path,
    /// Image reference, e.g. `docker://quay.io/example/disk:latest`.
    pub endpoint: &'a str,
    /// Registry user name.
    pub access_key: &'a str,
    /// Registry password.
    pub secret_key: &'a str,
    /// Directory holding trust anchors for the registry.
    pub cert_dir: Option<&'a Utf8Path>,
    /// Skip TLS verification.
    pub insecure_tls: bool,
    /// Upper bound on the duration of the copy.
    pub timeout: Duration,
}

impl fmt::Debug for CopyRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyRequest")
            .field("dest_dir", &self.dest_dir)
            .field("endpoint", &self.endpoint)
            .field("cert_dir", &self.cert_dir)
            .field("insecure_tls", &self.insecure_tls)
            .finish_non_exhaustive()
    }
}

/// An external capability that copies a container image to a local
/// directory. Errors may be an [`ImportError`] (used as-is) or any other
/// error, which is classified from its text.
pub trait ImageCopier: Send + Sync + fmt::Debug {
    /// Copy the image named by `req.endpoint` into `req.dest_dir`.
    fn copy_image(&self, req: &CopyRequest<'_>) -> anyhow::Result<()>;
}

/// Provider for container registries.
#[derive(Debug, Clone)]
pub struct RegistryProvider {
    copier: Arc<dyn ImageCopier>,
}

impl Default for RegistryProvider {
    fn default() -> Self {
        Self::new(Arc::new(SkopeoCopier))
    }
}

impl RegistryProvider {
    /// Create a provider delegating to `copier`.
    pub fn new(copier: Arc<dyn ImageCopier>) -> Self {
        Self { copier }
    }
}

/// Materialize images below `dir`, or the system temporary directory.
fn make_scratch(dir: Option<&Utf8Path>) -> io::Result<TempDir> {
    let mut b = tempfile::Builder::new();
    b.prefix("vmimport-registry-");
    match dir {
        Some(d) => b.tempdir_in(d),
        None => b.tempdir(),
    }
}

impl TransportProvider for RegistryProvider {
    fn fetch(&self, req: &FetchRequest<'_>) -> Result<TransportStream, ImportError> {
        let endpoint = req.endpoint;
        if !endpoint.starts_with(TRANSPORT_PREFIX) {
            return Err(ImportError::Fetch {
                endpoint: endpoint.to_owned(),
                message: format!("registry endpoint must start with {TRANSPORT_PREFIX}"),
            });
        }
        if req.cert_dir.is_none() && !req.insecure_tls {
            return Err(ImportError::FetchTls {
                endpoint: endpoint.to_owned(),
                message: "registry requires a trust anchor unless marked insecure".into(),
            });
        }
        let scratch = make_scratch(req.scratch_dir).map_err(ImportError::Write)?;
        let scratch_path = Utf8Path::from_path(scratch.path())
            .ok_or_else(|| {
                ImportError::Write(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "scratch directory is not UTF-8",
                ))
            })?
            .to_owned();
        let image_dir = scratch_path.join("image");
        std::fs::create_dir(&image_dir).map_err(ImportError::Write)?;
        let copy = CopyRequest {
            dest_dir: &image_dir,
            endpoint,
            access_key: req.access_key,
            secret_key: req.secret_key,
            cert_dir: req.cert_dir,
            insecure_tls: req.insecure_tls,
            timeout: req.timeout,
        };
        tracing::debug!("Copying {endpoint} to {image_dir}");
        self.copier
            .copy_image(&copy)
            .map_err(|e| classify_copy_error(endpoint, e))?;

        let disk_path = scratch_path.join("disk.img");
        let found = extract_disk_image(&image_dir, &disk_path).map_err(classify_extract_error)?;
        if !found {
            return Err(ImportError::conversion(
                Stage::Unarchive,
                format!("no {DISK_DIR} entry found in image layers"),
            ));
        }
        // The extracted image is all we need from here on.
        std::fs::remove_dir_all(&image_dir).map_err(ImportError::Write)?;
        let file = File::open(&disk_path).map_err(ImportError::Write)?;
        Ok(Box::new(ScratchFile {
            file,
            _scratch: scratch,
        }))
    }
}

/// A file whose containing scratch directory lives as long as the stream.
struct ScratchFile {
    file: File,
    _scratch: TempDir,
}

impl Read for ScratchFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Map a copier failure onto the fetch error taxonomy.
fn classify_copy_error(endpoint: &str, e: anyhow::Error) -> ImportError {
    let e = match e.downcast::<ImportError>() {
        Ok(e) => return e,
        Err(e) => e,
    };
    let message = format!("{e:#}");
    let lower = message.to_ascii_lowercase();
    let endpoint = endpoint.to_owned();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if has(&["x509", "certificate", "tls: "]) {
        ImportError::FetchTls { endpoint, message }
    } else if has(&["unauthorized", "authentication required", "denied"]) {
        ImportError::FetchAuth { endpoint, message }
    } else if has(&["manifest unknown", "name unknown", "not found"]) {
        ImportError::FetchNotFound { endpoint, message }
    } else if has(&["timed out", "timeout", "deadline exceeded"]) {
        ImportError::FetchTimeout { endpoint }
    } else {
        ImportError::Fetch { endpoint, message }
    }
}

/// Failures writing the extracted image are write errors; anything else
/// means the image content is unusable.
fn classify_extract_error(e: anyhow::Error) -> ImportError {
    match e.downcast::<ImportError>() {
        Ok(e) => e,
        Err(e) => ImportError::conversion(Stage::Unarchive, format!("{e:#}")),
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

/// Normalize an archive path: strip a leading `./` or `/`.
fn normalize(path: &str) -> &str {
    let path = path.strip_prefix("./").unwrap_or(path);
    path.trim_start_matches('/')
}

/// Search the layers of a `dir:` layout (topmost first) for a regular file
/// under `disk/` and write it to `dest`. Returns `false` if none exists.
#[context("Extracting disk image from {image_dir}")]
pub(crate) fn extract_disk_image(image_dir: &Utf8Path, dest: &Utf8Path) -> anyhow::Result<bool> {
    let manifest_path = image_dir.join("manifest.json");
    let manifest = File::open(&manifest_path)
        .with_context(|| format!("Opening {manifest_path}"))?;
    let manifest: Manifest =
        serde_json::from_reader(BufReader::new(manifest)).context("Parsing manifest")?;
    for layer in manifest.layers.iter().rev() {
        let (_, hex) = layer
            .digest
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Invalid digest {}", layer.digest))?;
        let blob = File::open(image_dir.join(hex))
            .with_context(|| format!("Opening layer {}", layer.digest))?;
        let src = maybe_decompress(BufReader::new(blob))?;
        let mut archive = tar::Archive::new(src);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path()?;
            let Some(path) = path.to_str() else {
                continue;
            };
            let path = normalize(path);
            if path.len() > DISK_DIR.len() && path.starts_with(DISK_DIR) {
                tracing::debug!("Found {path} in layer {}", layer.digest);
                let mut out = File::create(dest).map_err(ImportError::Write)?;
                let mut buf = vec![0u8; 128 * 1024];
                loop {
                    let n = match entry.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e).context("Reading disk entry"),
                    };
                    out.write_all(&buf[..n]).map_err(ImportError::Write)?;
                }
                out.sync_all().map_err(ImportError::Write)?;
                return Ok(true);
            }
        }
    }
    Ok(false)
}
