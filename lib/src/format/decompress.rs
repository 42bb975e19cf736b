//! Streaming gzip and xz decompression.
//!
//! Decoder errors are attributed to the decompress stage; errors already
//! attributed upstream (the transport, say) pass through untouched.

use std::io::{self, BufRead, BufReader, Read};

use crate::error::{tag_stage, Stage};

use super::Format;

/// A decompressing reader for one of the supported compression formats.
pub(crate) struct Decompressor {
    inner: Box<dyn Read + Send>,
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor").finish_non_exhaustive()
    }
}

impl Decompressor {
    /// Create a decompressor for `format`, which must be [`Format::Gzip`] or
    /// [`Format::Xz`].
    pub(crate) fn new(format: Format, src: impl BufRead + Send + 'static) -> anyhow::Result<Self> {
        let inner: Box<dyn Read + Send> = match format {
            // Multi-member streams (as produced by pigz and friends) are valid gzip.
            Format::Gzip => Box::new(flate2::bufread::MultiGzDecoder::new(src)),
            Format::Xz => Box::new(xz2::bufread::XzDecoder::new_multi_decoder(src)),
            o => anyhow::bail!("Not a compression format: {o}"),
        };
        Ok(Self { inner })
    }
}

impl Read for Decompressor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .read(buf)
            .map_err(|e| tag_stage(Stage::Decompress, e))
    }
}

/// Transparently decompress `src` if it starts with a gzip or xz header.
pub(crate) fn maybe_decompress(
    mut src: impl BufRead + Send + 'static,
) -> anyhow::Result<Box<dyn Read + Send>> {
    let format = super::detect(src.fill_buf()?);
    let r: Box<dyn Read + Send> = match format {
        Format::Gzip | Format::Xz => {
            tracing::trace!("Decompressing {format} stream");
            Box::new(Decompressor::new(format, src)?)
        }
        _ => Box::new(src),
    };
    Ok(r)
}

/// Buffer a decompressor's upstream.
pub(crate) fn buffered<R: Read + Send + 'static>(r: R) -> BufReader<R> {
    BufReader::with_capacity(128 * 1024, r)
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use super::*;
    use crate::error::classify_read_error;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut e = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    fn xz(data: &[u8]) -> Vec<u8> {
        let mut e = xz2::write::XzEncoder::new(Vec::new(), 1);
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    #[test]
    fn test_maybe_decompress() {
        let data = b"some disk bytes".repeat(100);
        for input in [gzip(&data), xz(&data), data.clone()] {
            let mut r = maybe_decompress(Cursor::new(input)).unwrap();
            let mut out = Vec::new();
            r.read_to_end(&mut out).unwrap();
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_corrupt_gzip_is_a_decompress_failure() {
        // A valid member header followed by a reserved deflate block type.
        let mut input = gzip(&[7u8; 4096])[..10].to_vec();
        input.extend_from_slice(&[0xff; 64]);
        let mut d = Decompressor::new(Format::Gzip, Cursor::new(input)).unwrap();
        let e = io::copy(&mut d, &mut io::sink()).unwrap_err();
        match classify_read_error("x", e) {
            crate::ImportError::Conversion { stage, .. } => assert_eq!(stage, Stage::Decompress),
            o => panic!("unexpected {o:?}"),
        }
    }
}
