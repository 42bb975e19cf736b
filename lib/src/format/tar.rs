//! Lazily extract the disk image entry from a tar stream.
//!
//! `tar::Archive` hands out entries borrowing the archive, which doesn't
//! compose with a pipeline of owned readers. Instead we walk the headers
//! ourselves (using the `tar` crate's header parsing) and stop at the
//! designated entry, whose content is then read straight from upstream.

use std::io::{self, Read};

use tar::EntryType;

use crate::error::{tag_stage, Stage};

const BLOCK: u64 = 512;
/// Upper bound for GNU long name and pax extension payloads.
const MAX_METADATA_LEN: u64 = 1024 * 1024;
const DISK_DIR: &str = "disk/";

fn unarchive_err(msg: impl Into<String>) -> io::Error {
    tag_stage(
        Stage::Unarchive,
        io::Error::new(io::ErrorKind::InvalidData, msg.into()),
    )
}

/// The content of one archive entry.
pub(crate) struct TarEntryReader<R> {
    inner: R,
    remaining: u64,
    path: String,
}

impl<R> std::fmt::Debug for TarEntryReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarEntryReader")
            .field("path", &self.path)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl<R: Read> TarEntryReader<R> {
    pub(crate) fn path(&self) -> &str {
        &self.path
    }
}

impl<R: Read> Read for TarEntryReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self
            .inner
            .read(&mut buf[..max])
            .map_err(|e| tag_stage(Stage::Unarchive, e))?;
        if n == 0 {
            return Err(unarchive_err(format!(
                "archive truncated inside {} with {} bytes missing",
                self.path, self.remaining
            )));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Whether `path` names the disk image: a regular file either under
/// `disk/` or at the top level of the archive.
fn is_disk_entry(path: &str) -> bool {
    let path = path.strip_prefix("./").unwrap_or(path);
    let path = path.trim_start_matches('/');
    if path.is_empty() || path.ends_with('/') {
        return false;
    }
    match path.strip_prefix(DISK_DIR) {
        Some(rest) => !rest.is_empty(),
        None => !path.contains('/'),
    }
}

/// Fill `block`, returning `false` on a clean end of stream.
fn read_block(r: &mut impl Read, block: &mut [u8; BLOCK as usize]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < block.len() {
        match r.read(&mut block[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(unarchive_err("archive truncated inside a header")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(tag_stage(Stage::Unarchive, e)),
        }
    }
    Ok(true)
}

fn padded(size: u64) -> u64 {
    size.div_ceil(BLOCK) * BLOCK
}

fn skip(r: &mut impl Read, n: u64) -> io::Result<()> {
    let copied = io::copy(&mut r.by_ref().take(n), &mut io::sink())
        .map_err(|e| tag_stage(Stage::Unarchive, e))?;
    if copied != n {
        return Err(unarchive_err("archive truncated inside an entry"));
    }
    Ok(())
}

fn read_metadata(r: &mut impl Read, size: u64) -> io::Result<Vec<u8>> {
    if size > MAX_METADATA_LEN {
        return Err(unarchive_err(format!("oversized metadata entry ({size} bytes)")));
    }
    let mut buf = Vec::with_capacity(size as usize);
    r.by_ref()
        .take(size)
        .read_to_end(&mut buf)
        .map_err(|e| tag_stage(Stage::Unarchive, e))?;
    if buf.len() as u64 != size {
        return Err(unarchive_err("archive truncated inside a metadata entry"));
    }
    skip(r, padded(size) - size)?;
    Ok(buf)
}

/// Find `key` among pax extended header records (`"<len> <key>=<value>\n"`).
fn pax_value(data: &[u8], key: &str) -> Option<Vec<u8>> {
    let mut rest = data;
    while !rest.is_empty() {
        let sp = rest.iter().position(|&b| b == b' ')?;
        let len: usize = std::str::from_utf8(&rest[..sp]).ok()?.parse().ok()?;
        if len <= sp || len > rest.len() {
            return None;
        }
        let record = &rest[sp + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(eq) = record.iter().position(|&b| b == b'=') {
            if &record[..eq] == key.as_bytes() {
                return Some(record[eq + 1..].to_vec());
            }
        }
        rest = &rest[len..];
    }
    None
}

/// Advance `inner` to the content of the disk image entry.
pub(crate) fn open_disk_entry<R: Read>(mut inner: R) -> io::Result<TarEntryReader<R>> {
    let mut block = [0u8; BLOCK as usize];
    let mut long_name: Option<Vec<u8>> = None;
    let mut pax_path: Option<Vec<u8>> = None;
    loop {
        if !read_block(&mut inner, &mut block)? || block.iter().all(|&b| b == 0) {
            return Err(unarchive_err("no disk image entry found in archive"));
        }
        let header = tar::Header::from_byte_slice(&block);
        let size = header
            .entry_size()
            .map_err(|e| unarchive_err(format!("invalid entry header: {e}")))?;
        let entry_type = header.entry_type();
        match entry_type {
            EntryType::GNULongName => {
                let mut name = read_metadata(&mut inner, size)?;
                while name.last() == Some(&0) {
                    name.pop();
                }
                long_name = Some(name);
                continue;
            }
            EntryType::XHeader => {
                let data = read_metadata(&mut inner, size)?;
                pax_path = pax_value(&data, "path");
                continue;
            }
            _ => {}
        }
        let path_bytes = match (pax_path.take(), long_name.take()) {
            (Some(p), _) | (None, Some(p)) => p,
            (None, None) => header.path_bytes().into_owned(),
        };
        let path = String::from_utf8_lossy(&path_bytes).into_owned();
        if entry_type.is_file() && is_disk_entry(&path) {
            tracing::debug!("Extracting {path} ({size} bytes) from archive");
            return Ok(TarEntryReader {
                inner,
                remaining: size,
                path,
            });
        }
        tracing::trace!("Skipping archive entry {path}");
        // Only regular files carry data in the stream for our purposes;
        // links and directories have a zero size.
        skip(&mut inner, padded(size))?;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::fixture;

    #[test]
    fn test_disk_entry_rules() {
        for p in ["disk/a.img", "./disk/b.qcow2", "tinyCore.iso", "/disk/x"] {
            assert!(is_disk_entry(p), "{p}");
        }
        for p in ["disk/", "etc/hosts", "", "./", "other/disk/a.img"] {
            assert!(!is_disk_entry(p), "{p}");
        }
    }

    #[test]
    fn test_extracts_designated_entry() {
        let mut b = tar::Builder::new(Vec::new());
        fixture::append_file(&mut b, "etc/hosts", b"localhost");
        fixture::append_dir(&mut b, "disk/");
        let long = format!("disk/{}.img", "x".repeat(150));
        fixture::append_file(&mut b, &long, b"payload");
        let buf = b.into_inner().unwrap();

        let mut r = open_disk_entry(Cursor::new(buf)).unwrap();
        assert_eq!(r.path(), long);
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "payload");
    }

    #[test]
    fn test_missing_and_truncated() {
        let mut b = tar::Builder::new(Vec::new());
        fixture::append_file(&mut b, "etc/hosts", b"localhost");
        let buf = b.into_inner().unwrap();
        let e = open_disk_entry(Cursor::new(buf)).unwrap_err();
        assert!(e.to_string().contains("no disk image entry"), "{e}");

        let buf = fixture::tar_with_entry("disk/a.img", &[1u8; 4096]);
        let mut r = open_disk_entry(Cursor::new(&buf[..2048])).unwrap();
        let e = io::copy(&mut r, &mut io::sink()).unwrap_err();
        assert!(e.to_string().contains("truncated"), "{e}");
    }

    #[test]
    fn test_pax_value() {
        let rec = b"28 path=disk/some/long/name\n19 mtime=12345.678\n";
        assert_eq!(
            pax_value(rec, "path").as_deref(),
            Some(&b"disk/some/long/name"[..])
        );
        assert_eq!(pax_value(rec, "uname"), None);
        assert_eq!(pax_value(b"garbage", "path"), None);
    }
}
