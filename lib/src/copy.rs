//! # The copy engine
//!
//! One import: resolve the provider, fetch, convert and write the raw
//! image to its destination under the requested capacity.
//!
//! The image is written to a staging file next to the destination and only
//! renamed into place once every byte has been written and synced, so a
//! destination is never observed half-written.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use vmimport_utils::PathQuotedDisplay;

use crate::error::{classify_read_error, ImportError};
use crate::format::{self, Format};
use crate::options::ImportOptions;
use crate::transport::{FetchRequest, Providers, DEFAULT_FETCH_TIMEOUT};

const CHUNK: usize = 1024 * 1024;
const PROGRESS_INTERVAL: u64 = 64 * 1024 * 1024;

/// The result of a successful import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyOutcome {
    /// Size of the raw image written.
    pub bytes_written: u64,
    /// The formats recognized in the source, outermost first.
    pub formats: Vec<Format>,
}

/// Runs imports with a fixed set of transport providers.
#[derive(Debug, Clone)]
pub struct CopyEngine {
    providers: Providers,
    scratch_dir: Option<Utf8PathBuf>,
    fetch_timeout: Duration,
}

impl Default for CopyEngine {
    fn default() -> Self {
        Self::new(Providers::default())
    }
}

impl CopyEngine {
    /// Create an engine using `providers`.
    pub fn new(providers: Providers) -> Self {
        Self {
            providers,
            scratch_dir: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Keep intermediate files (qcow2 spools, registry images) below `dir`.
    pub fn with_scratch_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Bound each fetch by `timeout`.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Import the source described by `opts` into `opts.dest`.
    ///
    /// Resolution and fetch failures leave the destination untouched. Any
    /// later failure also removes a destination left over from an earlier
    /// run, so that only a complete image from the current inputs is ever
    /// found there.
    #[tracing::instrument(skip_all, fields(source = %opts.source, endpoint = %opts.endpoint))]
    pub fn copy(
        &self,
        opts: &ImportOptions,
        cancel: &CancellationToken,
    ) -> Result<CopyOutcome, ImportError> {
        let provider = self.providers.get(opts.source)?;
        check_cancelled(cancel)?;
        let req = FetchRequest {
            endpoint: &opts.endpoint,
            access_key: &opts.access_key,
            secret_key: &opts.secret_key,
            cert_dir: opts.cert_dir.as_deref(),
            insecure_tls: opts.insecure_tls,
            timeout: self.fetch_timeout,
            scratch_dir: self.scratch_dir.as_deref(),
        };
        tracing::info!("Fetching");
        let stream = provider.fetch(&req)?;

        let r = self.convert_and_write(opts, stream, cancel);
        if let Err(e) = r.as_ref() {
            tracing::debug!("Import failed in {} phase: {e}", e.phase());
            remove_stale(&opts.dest);
        }
        r
    }

    fn convert_and_write(
        &self,
        opts: &ImportOptions,
        stream: Box<dyn Read + Send>,
        cancel: &CancellationToken,
    ) -> Result<CopyOutcome, ImportError> {
        let converted = format::convert(
            stream,
            opts.content_type,
            self.scratch_dir.as_deref(),
            cancel,
        )
        .map_err(|e| classify_read_error(&opts.endpoint, e))?;
        tracing::info!(
            "Converting {}",
            converted
                .formats
                .iter()
                .map(|f| f.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        if let (Some(capacity), Some(size)) = (opts.capacity, converted.virtual_size) {
            if size > capacity {
                tracing::debug!("Virtual size {size} exceeds capacity {capacity}");
                return Err(ImportError::CapacityExceeded { capacity });
            }
        }
        let formats = converted.formats;
        let mut src = converted.stream;

        let staging = staging_file(&opts.dest).map_err(ImportError::Write)?;
        let bytes_written = write_sparse(
            &mut src,
            staging.as_file(),
            opts.capacity,
            &opts.endpoint,
            cancel,
        )?;
        staging
            .persist(&opts.dest)
            .map_err(|e| ImportError::Write(e.error))?;
        tracing::info!(
            "Wrote {bytes_written} bytes to {}",
            PathQuotedDisplay::new(&opts.dest)
        );
        Ok(CopyOutcome {
            bytes_written,
            formats,
        })
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), ImportError> {
    if cancel.is_cancelled() {
        return Err(ImportError::Cancelled);
    }
    Ok(())
}

fn staging_file(dest: &Utf8Path) -> io::Result<NamedTempFile> {
    let parent = match dest.parent() {
        Some(p) if !p.as_str().is_empty() => p,
        _ => Utf8Path::new("."),
    };
    tempfile::Builder::new()
        .prefix(".vmimport-")
        .tempfile_in(parent)
}

fn remove_stale(dest: &Utf8Path) {
    match std::fs::remove_file(dest) {
        Ok(()) => tracing::debug!("Removed stale {dest}"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {dest}: {e}"),
    }
}

/// Copy `src` to `out`, seeking over all-zero chunks. Fails before writing
/// any chunk that would take the total past `capacity`.
fn write_sparse(
    src: &mut dyn Read,
    mut out: &File,
    capacity: Option<u64>,
    endpoint: &str,
    cancel: &CancellationToken,
) -> Result<u64, ImportError> {
    let mut buf = vec![0u8; CHUNK];
    let mut written = 0u64;
    let mut next_progress = PROGRESS_INTERVAL;
    loop {
        check_cancelled(cancel)?;
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify_read_error(endpoint, e)),
        };
        let total = written + n as u64;
        if let Some(capacity) = capacity {
            if total > capacity {
                return Err(ImportError::CapacityExceeded { capacity });
            }
        }
        let chunk = &buf[..n];
        if chunk.iter().all(|&b| b == 0) {
            out.seek(SeekFrom::Current(n as i64))
                .map_err(ImportError::Write)?;
        } else {
            out.write_all(chunk).map_err(ImportError::Write)?;
        }
        written = total;
        if written >= next_progress {
            tracing::debug!("Progress: {written} bytes written");
            next_progress += PROGRESS_INTERVAL;
        }
    }
    // Trailing holes only moved the cursor.
    out.set_len(written).map_err(ImportError::Write)?;
    out.sync_all().map_err(ImportError::Write)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use super::*;
    use crate::options::SourceKind;
    use crate::transport::{TransportProvider, TransportStream};

    // Shared between the worker runtime and blocking threads.
    static_assertions::assert_impl_all!(CopyEngine: Send, Sync);

    /// Serves fixed bytes, or fails like a rejected login.
    #[derive(Debug)]
    struct Canned(Option<Vec<u8>>);

    impl TransportProvider for Canned {
        fn fetch(&self, req: &FetchRequest<'_>) -> Result<TransportStream, ImportError> {
            match self.0.as_ref() {
                Some(b) => Ok(Box::new(Cursor::new(b.clone()))),
                None => Err(ImportError::FetchAuth {
                    endpoint: req.endpoint.to_owned(),
                    message: "HTTP status 401 Unauthorized".into(),
                }),
            }
        }
    }

    fn engine(body: Option<Vec<u8>>) -> CopyEngine {
        CopyEngine::new(Providers::default().with(SourceKind::Http, Arc::new(Canned(body))))
    }

    fn opts(dest: &Utf8Path) -> ImportOptions {
        ImportOptions {
            dest: dest.to_owned(),
            endpoint: "http://example.com/disk.img".into(),
            ..Default::default()
        }
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8Path::from_path(td.path()).unwrap().to_owned();
        (td, p)
    }

    #[test]
    fn test_sparse_copy() {
        let (_td, dir) = tempdir();
        let dest = dir.join("disk.img");
        let mut data = vec![0u8; 3 * CHUNK + 17];
        data[CHUNK + 5] = 1;
        let out = engine(Some(data.clone()))
            .copy(&opts(&dest), &CancellationToken::new())
            .unwrap();
        assert_eq!(out.bytes_written, data.len() as u64);
        assert_eq!(out.formats, [Format::Raw]);
        assert!(std::fs::read(&dest).unwrap() == data);
    }

    #[test]
    fn test_capacity() {
        let (_td, dir) = tempdir();
        let dest = dir.join("disk.img");
        let data = vec![7u8; 4096];
        let e = engine(Some(data.clone()));
        let o = ImportOptions {
            capacity: Some(4096),
            ..opts(&dest)
        };
        assert_eq!(e.copy(&o, &CancellationToken::new()).unwrap().bytes_written, 4096);
        let o = ImportOptions {
            capacity: Some(4095),
            ..o
        };
        let err = e.copy(&o, &CancellationToken::new()).unwrap_err();
        assert_eq!(err.reason(), "CapacityExceededError");
        assert!(!dest.exists());
        // No staging files left behind.
        assert_eq!(dir.read_dir_utf8().unwrap().count(), 0);
    }

    #[test]
    fn test_fetch_failure_leaves_destination() {
        let (_td, dir) = tempdir();
        let dest = dir.join("disk.img");
        std::fs::write(&dest, b"previous").unwrap();
        let err = engine(None)
            .copy(&opts(&dest), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.reason(), "FetchAuthError");
        assert_eq!(std::fs::read(&dest).unwrap(), b"previous");
    }

    #[test]
    fn test_cancelled() {
        let (_td, dir) = tempdir();
        let dest = dir.join("disk.img");
        let token = CancellationToken::new();
        token.cancel();
        let err = engine(Some(vec![1; 10])).copy(&opts(&dest), &token).unwrap_err();
        assert!(matches!(err, ImportError::Cancelled));
        assert!(!dest.exists());
    }

    #[test]
    fn test_unresolvable_source() {
        let (_td, dir) = tempdir();
        let o = ImportOptions {
            source: SourceKind::Upload,
            ..opts(&dir.join("disk.img"))
        };
        let err = CopyEngine::default()
            .copy(&o, &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.reason(), "TransportResolutionError");
    }

    #[test]
    fn test_qcow2_virtual_size_checked_before_write() {
        let (_td, dir) = tempdir();
        let dest = dir.join("disk.img");
        let disk = vec![3u8; 256 * 1024];
        let image = crate::fixture::qcow2_image(&disk, Default::default());
        let o = ImportOptions {
            capacity: Some(disk.len() as u64 - 1),
            ..opts(&dest)
        };
        let err = engine(Some(image))
            .with_scratch_dir(dir.clone())
            .copy(&o, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ImportError::CapacityExceeded { .. }), "{err:?}");
        assert_eq!(dir.read_dir_utf8().unwrap().count(), 0);
    }

    /// A stream that cancels the import once `after` bytes were served.
    #[derive(Debug)]
    struct CancelAfter {
        body: Vec<u8>,
        after: usize,
        cancel: CancellationToken,
    }

    impl TransportProvider for CancelAfter {
        fn fetch(&self, _req: &FetchRequest<'_>) -> Result<TransportStream, ImportError> {
            struct R {
                inner: Cursor<Vec<u8>>,
                after: u64,
                cancel: CancellationToken,
            }
            impl Read for R {
                fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                    if self.inner.position() >= self.after {
                        self.cancel.cancel();
                    }
                    self.inner.read(buf)
                }
            }
            Ok(Box::new(R {
                inner: Cursor::new(self.body.clone()),
                after: self.after as u64,
                cancel: self.cancel.clone(),
            }))
        }
    }

    #[test]
    fn test_cancel_while_spooling_qcow2() {
        let (_td, dir) = tempdir();
        let dest = dir.join("disk.img");
        let disk = vec![5u8; 2 * CHUNK];
        let image = crate::fixture::qcow2_image(&disk, Default::default());
        let token = CancellationToken::new();
        let provider = CancelAfter {
            body: image,
            after: 128 * 1024,
            cancel: token.clone(),
        };
        let e = CopyEngine::new(
            Providers::default().with(SourceKind::Http, Arc::new(provider)),
        )
        .with_scratch_dir(dir.clone());
        let err = e.copy(&opts(&dest), &token).unwrap_err();
        assert!(matches!(err, ImportError::Cancelled), "{err:?}");
        assert!(!dest.exists());
    }
}
