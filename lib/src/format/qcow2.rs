//! Decode qcow2 images into their raw virtual disk.
//!
//! Cluster lookup needs random access, so the upstream stream is first
//! spooled into an unlinked scratch file. The virtual disk is then produced
//! lazily, one cluster at a time; unallocated and zero clusters read as
//! zeros without touching the file.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;

use flate2::read::DeflateDecoder;

use crate::error::{tag_stage, Stage};

const MAGIC: &[u8; 4] = b"QFI\xfb";
const V2_HEADER_LEN: usize = 72;
const V3_HEADER_LEN: usize = 104;

const OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
const L2_COMPRESSED: u64 = 1 << 62;
const L2_ZERO: u64 = 1;

/// Incompatible feature bits we can read despite.
const INCOMPAT_DIRTY: u64 = 1;
const INCOMPAT_COMPRESSION_TYPE: u64 = 1 << 3;

const MIN_CLUSTER_BITS: u32 = 9;
const MAX_CLUSTER_BITS: u32 = 21;
/// Bound on the L1 table we are willing to load (32MiB).
const MAX_L1_ENTRIES: u64 = 4 * 1024 * 1024;

fn decode_err(msg: impl Into<String>) -> io::Error {
    tag_stage(
        Stage::Decode,
        io::Error::new(io::ErrorKind::InvalidData, msg.into()),
    )
}

fn be32(b: &[u8], off: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[off..off + 4]);
    u32::from_be_bytes(a)
}

fn be64(b: &[u8], off: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[off..off + 8]);
    u64::from_be_bytes(a)
}

/// The parts of the image header the decoder needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) version: u32,
    pub(crate) cluster_bits: u32,
    pub(crate) size: u64,
    pub(crate) l1_size: u32,
    pub(crate) l1_table_offset: u64,
}

impl Header {
    /// Parse and validate a header, rejecting images we cannot decode
    /// standalone.
    pub(crate) fn parse(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < V2_HEADER_LEN || &buf[..4] != MAGIC {
            return Err(decode_err("not a qcow2 image"));
        }
        let version = be32(buf, 4);
        if !(2..=3).contains(&version) {
            return Err(decode_err(format!("unsupported qcow2 version {version}")));
        }
        if be64(buf, 8) != 0 {
            return Err(decode_err("qcow2 images with a backing file are not supported"));
        }
        let cluster_bits = be32(buf, 20);
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&cluster_bits) {
            return Err(decode_err(format!("invalid cluster bits {cluster_bits}")));
        }
        if be32(buf, 32) != 0 {
            return Err(decode_err("encrypted qcow2 images are not supported"));
        }
        let size = be64(buf, 24);
        let l1_size = be32(buf, 36);
        let l1_table_offset = be64(buf, 40);
        if version == 3 {
            if buf.len() < V3_HEADER_LEN {
                return Err(decode_err("truncated qcow2 v3 header"));
            }
            let incompatible = be64(buf, 72);
            let header_len = be32(buf, 100) as usize;
            let compression_type = if header_len > V3_HEADER_LEN && buf.len() > V3_HEADER_LEN {
                buf[V3_HEADER_LEN]
            } else {
                0
            };
            let unknown = incompatible & !(INCOMPAT_DIRTY | INCOMPAT_COMPRESSION_TYPE);
            if unknown != 0 {
                return Err(decode_err(format!(
                    "unsupported qcow2 incompatible features {unknown:#x}"
                )));
            }
            if compression_type != 0 {
                return Err(decode_err(format!(
                    "unsupported qcow2 compression type {compression_type}"
                )));
            }
        }
        let h = Self {
            version,
            cluster_bits,
            size,
            l1_size,
            l1_table_offset,
        };
        let needed = size.div_ceil(h.cluster_size() * h.l2_entries());
        if needed > u64::from(l1_size) || u64::from(l1_size) > MAX_L1_ENTRIES {
            return Err(decode_err(format!(
                "L1 table of {l1_size} entries does not fit a {size} byte disk"
            )));
        }
        Ok(h)
    }

    pub(crate) fn cluster_size(&self) -> u64 {
        1 << self.cluster_bits
    }

    fn l2_entries(&self) -> u64 {
        self.cluster_size() / 8
    }
}

/// Where the bytes of one guest cluster live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cluster {
    Zero,
    Data(u64),
    Compressed { offset: u64, len: u64 },
}

/// A reader producing the virtual disk of a spooled qcow2 image.
#[derive(Debug)]
pub(crate) struct Qcow2Reader {
    file: File,
    file_len: u64,
    header: Header,
    l1: Vec<u64>,
    l2_cache: Option<(u64, Vec<u64>)>,
    cluster_cache: Option<(u64, Vec<u8>)>,
    pos: u64,
}

impl Qcow2Reader {
    /// Copy `src` to `spool` and open the result as an image.
    pub(crate) fn spool(mut src: impl Read, mut spool: File) -> io::Result<Self> {
        io::copy(&mut src, &mut spool).map_err(|e| tag_stage(Stage::Decode, e))?;
        Self::open(spool)
    }

    pub(crate) fn open(file: File) -> io::Result<Self> {
        let file_len = file.metadata()?.len();
        let mut buf = vec![0u8; V3_HEADER_LEN + 1];
        let n = read_at_most(&file, &mut buf, 0)?;
        buf.truncate(n);
        let header = Header::parse(&buf)?;
        let mut raw = vec![0u8; header.l1_size as usize * 8];
        file.read_exact_at(&mut raw, header.l1_table_offset)
            .map_err(|e| decode_err(format!("reading L1 table: {e}")))?;
        let l1 = raw.chunks_exact(8).map(|c| be64(c, 0)).collect();
        tracing::debug!(
            "qcow2 v{} image: {} byte disk, {} byte clusters",
            header.version,
            header.size,
            header.cluster_size()
        );
        Ok(Self {
            file,
            file_len,
            header,
            l1,
            l2_cache: None,
            cluster_cache: None,
            pos: 0,
        })
    }

    /// The size of the virtual disk.
    pub(crate) fn virtual_size(&self) -> u64 {
        self.header.size
    }

    fn lookup(&mut self, cluster: u64) -> io::Result<Cluster> {
        let l2_entries = self.header.l2_entries();
        let l1_index = cluster / l2_entries;
        let l2_index = (cluster % l2_entries) as usize;
        let l2_offset = self
            .l1
            .get(l1_index as usize)
            .copied()
            .unwrap_or_default()
            & OFFSET_MASK;
        if l2_offset == 0 {
            return Ok(Cluster::Zero);
        }
        let cached = matches!(&self.l2_cache, Some((off, _)) if *off == l2_offset);
        if !cached {
            let mut raw = vec![0u8; self.header.cluster_size() as usize];
            self.file
                .read_exact_at(&mut raw, l2_offset)
                .map_err(|e| decode_err(format!("reading L2 table at {l2_offset}: {e}")))?;
            let table = raw.chunks_exact(8).map(|c| be64(c, 0)).collect();
            self.l2_cache = Some((l2_offset, table));
        }
        let entry = self
            .l2_cache
            .as_ref()
            .map(|(_, t)| t[l2_index])
            .unwrap_or_default();
        if entry & L2_COMPRESSED != 0 {
            // Host offset and sector count share the low 62 bits; the split
            // depends on the cluster size.
            let x = 62 - (self.header.cluster_bits - 8);
            let offset = entry & ((1 << x) - 1);
            let sectors = ((entry & ((1 << 62) - 1)) >> x) + 1;
            let len = (sectors * 512 - (offset & 511)).min(self.file_len.saturating_sub(offset));
            return Ok(Cluster::Compressed { offset, len });
        }
        let offset = entry & OFFSET_MASK;
        if offset == 0 || entry & L2_ZERO != 0 {
            return Ok(Cluster::Zero);
        }
        Ok(Cluster::Data(offset))
    }

    fn inflate(&mut self, cluster: u64, offset: u64, len: u64) -> io::Result<&[u8]> {
        let cached = matches!(&self.cluster_cache, Some((c, _)) if *c == cluster);
        if !cached {
            let mut compressed = vec![0u8; len as usize];
            self.file
                .read_exact_at(&mut compressed, offset)
                .map_err(|e| decode_err(format!("reading compressed cluster: {e}")))?;
            let mut out = vec![0u8; self.header.cluster_size() as usize];
            DeflateDecoder::new(&compressed[..])
                .read_exact(&mut out)
                .map_err(|e| decode_err(format!("inflating cluster {cluster}: {e}")))?;
            self.cluster_cache = Some((cluster, out));
        }
        Ok(self
            .cluster_cache
            .as_ref()
            .map(|(_, b)| b.as_slice())
            .unwrap_or_default())
    }
}

fn read_at_most(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(tag_stage(Stage::Decode, e)),
        }
    }
    Ok(filled)
}

impl Read for Qcow2Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.header.size || buf.is_empty() {
            return Ok(0);
        }
        let cluster_size = self.header.cluster_size();
        let cluster = self.pos >> self.header.cluster_bits;
        let within = self.pos & (cluster_size - 1);
        let n = (buf.len() as u64)
            .min(cluster_size - within)
            .min(self.header.size - self.pos) as usize;
        let buf = &mut buf[..n];
        match self.lookup(cluster)? {
            Cluster::Zero => buf.fill(0),
            Cluster::Data(offset) => self
                .file
                .read_exact_at(buf, offset + within)
                .map_err(|e| decode_err(format!("reading cluster {cluster}: {e}")))?,
            Cluster::Compressed { offset, len } => {
                let data = self.inflate(cluster, offset, len)?;
                buf.copy_from_slice(&data[within as usize..within as usize + n]);
            }
        }
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, Write};

    use super::*;
    use crate::fixture::{qcow2_image, Qcow2Options};

    fn spooled(image: &[u8]) -> io::Result<Qcow2Reader> {
        Qcow2Reader::spool(image, tempfile::tempfile().unwrap())
    }

    fn pattern(len: usize) -> Vec<u8> {
        // Mix allocated, zero and repeated data so all cluster kinds occur.
        let mut v = vec![0u8; len];
        for (i, b) in v.iter_mut().enumerate() {
            let cluster = i / 4096;
            *b = match cluster % 3 {
                0 => (i % 251) as u8,
                1 => 0,
                _ => 0x5a,
            };
        }
        v
    }

    #[test]
    fn test_decode_plain_and_compressed() {
        let data = pattern(10 * 4096 + 1234);
        for compress in [false, true] {
            let opts = Qcow2Options {
                cluster_bits: 12,
                compress,
            };
            let image = qcow2_image(&data, opts);
            let mut r = spooled(&image).unwrap();
            assert_eq!(r.virtual_size(), data.len() as u64);
            let mut out = Vec::new();
            r.read_to_end(&mut out).unwrap();
            similar_asserts::assert_eq!(out.len(), data.len());
            assert!(out == data, "compress={compress}");
        }
    }

    #[test]
    fn test_rejects_unsupported() {
        let image = qcow2_image(&[1u8; 512], Qcow2Options::default());

        let mut backing = image.clone();
        backing[8..16].copy_from_slice(&4096u64.to_be_bytes());
        let mut encrypted = image.clone();
        encrypted[32..36].copy_from_slice(&1u32.to_be_bytes());
        let mut extl2 = image.clone();
        extl2[72..80].copy_from_slice(&(1u64 << 4).to_be_bytes());
        let mut version = image.clone();
        version[4..8].copy_from_slice(&4u32.to_be_bytes());

        for (img, needle) in [
            (backing, "backing file"),
            (encrypted, "encrypted"),
            (extl2, "incompatible features"),
            (version, "version 4"),
        ] {
            let e = spooled(&img).unwrap_err();
            assert!(e.to_string().contains(needle), "{e}");
        }
    }

    #[test]
    fn test_truncated_data_is_a_decode_error() {
        let data = pattern(8 * 4096);
        let image = qcow2_image(
            &data,
            Qcow2Options {
                cluster_bits: 12,
                compress: false,
            },
        );
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&image[..image.len() - 4096]).unwrap();
        f.rewind().unwrap();
        let mut r = Qcow2Reader::open(f).unwrap();
        let e = io::copy(&mut r, &mut io::sink()).unwrap_err();
        match crate::error::classify_read_error("x", e) {
            crate::ImportError::Conversion { stage, .. } => assert_eq!(stage, Stage::Decode),
            o => panic!("unexpected {o:?}"),
        }
    }
}
