//! # Format detection and conversion
//!
//! A fetched stream is classified by its leading bytes and normalized into
//! a raw disk image by a chain of lazily composed readers:
//! decompress, then unarchive, then decode. Each stage reads from the one
//! before it; nothing holds more than a bounded window in memory, except
//! that qcow2 decoding spools its input to a scratch file.

use std::fmt;
use std::io::{self, Cursor, Read};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{cancelled_read, tag_stage, Stage};
use crate::options::ContentType;

pub(crate) mod decompress;
pub(crate) mod qcow2;
pub(crate) mod tar;

/// Enough bytes to see the ISO 9660 volume descriptor.
const DETECT_LEN: usize = 36 * 1024;
const ISO_MAGIC_OFFSET: usize = 0x8001;
const TAR_MAGIC_OFFSET: usize = 257;

/// An encoding recognized in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// gzip compression.
    Gzip,
    /// xz compression.
    Xz,
    /// A tar archive.
    Tar,
    /// A qcow2 encoded disk image.
    Qcow2,
    /// An ISO 9660 image, copied as-is.
    Iso,
    /// Anything else, copied as-is.
    Raw,
}

impl Format {
    /// The lowercase name of this format.
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Gzip => "gzip",
            Format::Xz => "xz",
            Format::Tar => "tar",
            Format::Qcow2 => "qcow2",
            Format::Iso => "iso",
            Format::Raw => "raw",
        }
    }

    /// Formats after which detection stops.
    fn is_terminal(&self) -> bool {
        matches!(self, Format::Qcow2 | Format::Iso | Format::Raw)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a stream by its leading bytes.
pub fn detect(header: &[u8]) -> Format {
    let at = |off: usize, magic: &[u8]| header.get(off..off + magic.len()) == Some(magic);
    if at(0, &[0x1f, 0x8b]) {
        Format::Gzip
    } else if at(0, &[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Format::Xz
    } else if at(0, b"QFI\xfb") {
        Format::Qcow2
    } else if at(TAR_MAGIC_OFFSET, b"ustar") {
        Format::Tar
    } else if at(ISO_MAGIC_OFFSET, b"CD001") {
        Format::Iso
    } else {
        Format::Raw
    }
}

/// Read up to `DETECT_LEN` bytes and hand back a reader that replays them.
fn peek(mut src: Box<dyn Read + Send>) -> io::Result<(Vec<u8>, Box<dyn Read + Send>)> {
    let mut head = Vec::with_capacity(DETECT_LEN);
    (&mut src).take(DETECT_LEN as u64).read_to_end(&mut head)?;
    let replay = Cursor::new(head.clone()).chain(src);
    Ok((head, Box::new(replay)))
}

/// Fails reads once the token is cancelled, so that stages which drain
/// their upstream eagerly (qcow2 spooling) stop promptly.
struct Cancellable {
    inner: Box<dyn Read + Send>,
    cancel: CancellationToken,
}

impl Read for Cancellable {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_read());
        }
        self.inner.read(buf)
    }
}

/// The outcome of setting up a conversion chain.
pub struct Converted {
    /// The formats recognized, outermost first.
    pub formats: Vec<Format>,
    /// The size of the raw image, when an image header declares it.
    pub virtual_size: Option<u64>,
    /// The raw disk image.
    pub stream: Box<dyn Read + Send>,
}

impl fmt::Debug for Converted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converted")
            .field("formats", &self.formats)
            .field("virtual_size", &self.virtual_size)
            .finish_non_exhaustive()
    }
}

/// Build the conversion chain for `src`.
///
/// Each of gzip, xz and tar may occur at most once; detection stops at the
/// first qcow2, ISO or raw layer. [`ContentType::Archive`] content must
/// contain a tar layer. Qcow2 spooling uses `scratch_dir`, or the system
/// temporary directory.
///
/// Reads from `src` fail once `cancel` fires, both while the chain is being
/// set up and later while the returned stream is consumed.
///
/// Errors are attributed to the stage that raised them, or left untagged
/// when they come from upstream; see [`crate::error::classify_read_error`].
pub fn convert(
    src: Box<dyn Read + Send>,
    content_type: ContentType,
    scratch_dir: Option<&Utf8Path>,
    cancel: &CancellationToken,
) -> io::Result<Converted> {
    let mut formats: Vec<Format> = Vec::new();
    let mut virtual_size = None;
    let mut stream: Box<dyn Read + Send> = Box::new(Cancellable {
        inner: src,
        cancel: cancel.clone(),
    });
    loop {
        let (head, replay) = peek(stream)?;
        stream = replay;
        let format = detect(&head);
        if formats.contains(&format) {
            return Err(detect_err(format!("nested {format} layers are not supported")));
        }
        tracing::debug!("Detected {format} layer");
        formats.push(format);
        match format {
            Format::Gzip | Format::Xz => {
                let upstream = decompress::buffered(stream);
                stream = Box::new(
                    decompress::Decompressor::new(format, upstream)
                        .map_err(|e| detect_err(format!("{e:#}")))?,
                );
            }
            Format::Tar => {
                let entry = tar::open_disk_entry(stream)?;
                tracing::debug!("Extracting archive entry {}", entry.path());
                stream = Box::new(entry);
            }
            Format::Qcow2 => {
                let spool = match scratch_dir {
                    Some(d) => tempfile::tempfile_in(d),
                    None => tempfile::tempfile(),
                }
                .map_err(|e| tag_stage(Stage::Decode, e))?;
                let image = qcow2::Qcow2Reader::spool(stream, spool)?;
                virtual_size = Some(image.virtual_size());
                stream = Box::new(image);
            }
            Format::Iso | Format::Raw => {}
        }
        if format.is_terminal() {
            break;
        }
    }
    if content_type == ContentType::Archive && !formats.contains(&Format::Tar) {
        return Err(detect_err("archive content does not contain a tar archive"));
    }
    Ok(Converted {
        formats,
        virtual_size,
        stream,
    })
}

fn detect_err(msg: impl Into<String>) -> io::Error {
    tag_stage(
        Stage::Detect,
        io::Error::new(io::ErrorKind::InvalidData, msg.into()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify_read_error;
    use crate::fixture::{self, Qcow2Options};
    use crate::ImportError;

    fn run(input: Vec<u8>, ct: ContentType) -> io::Result<(Vec<Format>, Vec<u8>)> {
        let mut c = convert(
            Box::new(Cursor::new(input)),
            ct,
            None,
            &CancellationToken::new(),
        )?;
        let mut out = Vec::new();
        c.stream.read_to_end(&mut out)?;
        Ok((c.formats, out))
    }

    #[test]
    fn test_detect() {
        assert_eq!(detect(&[]), Format::Raw);
        assert_eq!(detect(&fixture::gzip(b"x")), Format::Gzip);
        assert_eq!(detect(&fixture::xz(b"x")), Format::Xz);
        assert_eq!(detect(&fixture::tar_with_entry("a.img", b"x")), Format::Tar);
        let mut iso = vec![0u8; 40000];
        iso[0x8001..0x8006].copy_from_slice(b"CD001");
        assert_eq!(detect(&iso), Format::Iso);
    }

    #[test]
    fn test_chains() {
        let disk = (0..200_000u32).map(|i| (i % 7) as u8).collect::<Vec<_>>();
        let qcow2 = fixture::qcow2_image(
            &disk,
            Qcow2Options {
                cluster_bits: 12,
                compress: true,
            },
        );
        let cases = [
            (disk.clone(), vec![Format::Raw]),
            (fixture::gzip(&disk), vec![Format::Gzip, Format::Raw]),
            (fixture::xz(&qcow2), vec![Format::Xz, Format::Qcow2]),
            (
                fixture::gzip(&fixture::tar_with_entry("disk/d.qcow2", &qcow2)),
                vec![Format::Gzip, Format::Tar, Format::Qcow2],
            ),
        ];
        for (input, expected) in cases {
            let (formats, out) = run(input, ContentType::DiskImage).unwrap();
            assert_eq!(formats, expected);
            assert!(out == disk, "{expected:?}");
        }
    }

    #[test]
    fn test_archive_requires_tar() {
        let e = run(b"just bytes".to_vec(), ContentType::Archive).unwrap_err();
        match classify_read_error("x", e) {
            ImportError::Conversion { stage, .. } => assert_eq!(stage, Stage::Detect),
            o => panic!("unexpected {o:?}"),
        }
        let (formats, out) = run(
            fixture::tar_with_entry("disk/a.img", b"abc"),
            ContentType::Archive,
        )
        .unwrap();
        assert_eq!(formats, [Format::Tar, Format::Raw]);
        assert_eq!(out, b"abc");
    }

    #[test]
    fn test_nested_compression_rejected() {
        let e = run(fixture::gzip(&fixture::gzip(b"x")), ContentType::DiskImage).unwrap_err();
        assert!(e.to_string().contains("nested gzip"), "{e}");
    }

    /// Counts bytes handed out and cancels the token once the header has
    /// been read.
    struct CancelOnRead {
        inner: Cursor<Vec<u8>>,
        cancel: CancellationToken,
        consumed: std::sync::Arc<std::sync::atomic::AtomicU64>,
    }

    impl Read for CancelOnRead {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            let total = self
                .consumed
                .fetch_add(n as u64, std::sync::atomic::Ordering::SeqCst);
            if total + n as u64 > 64 * 1024 {
                self.cancel.cancel();
            }
            Ok(n)
        }
    }

    #[test]
    fn test_cancel_stops_qcow2_spool() {
        let disk = vec![9u8; 768 * 1024];
        let image = fixture::qcow2_image(&disk, Default::default());
        let total = image.len() as u64;
        let cancel = CancellationToken::new();
        let consumed = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let src = CancelOnRead {
            inner: Cursor::new(image),
            cancel: cancel.clone(),
            consumed: consumed.clone(),
        };
        let e = convert(Box::new(src), ContentType::DiskImage, None, &cancel).unwrap_err();
        assert!(matches!(classify_read_error("x", e), ImportError::Cancelled));
        let consumed = consumed.load(std::sync::atomic::Ordering::SeqCst);
        assert!(consumed < total, "{consumed} of {total}");
    }

    #[test]
    fn test_qcow2_virtual_size() {
        let disk = vec![1u8; 100_000];
        let image = fixture::qcow2_image(&disk, Default::default());
        let c = convert(
            Box::new(Cursor::new(image)),
            ContentType::DiskImage,
            None,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(c.virtual_size, Some(disk.len() as u64));
        let c = convert(
            Box::new(Cursor::new(disk)),
            ContentType::DiskImage,
            None,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(c.virtual_size, None);
    }
}
