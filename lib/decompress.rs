//! Compression sniffing and stream decoding for layer archives.
//!
//! Layer streams arrive either uncompressed or wrapped in a compression
//! framing. Producers do not reliably declare which, so the format is
//! detected from magic bytes and the stream is transparently decoded.

use std::io::{Chain, Cursor, Read};

use crate::{UnlayerError, UnlayerResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// Longest magic sequence we sniff for (the xz framing).
const MAGIC_LEN: usize = 6;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A compression format recognized in a layer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// No recognized compression framing; the stream is passed through.
    Uncompressed,

    /// Gzip framing.
    Gzip,

    /// Zstandard framing.
    Zstd,

    /// Bzip2 framing (recognized but not decodable by this crate).
    Bzip2,

    /// Xz framing (recognized but not decodable by this crate).
    Xz,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Detects the compression format from the first bytes of a stream.
pub fn detect_compression(header: &[u8]) -> Compression {
    if header.starts_with(GZIP_MAGIC) {
        Compression::Gzip
    } else if header.starts_with(ZSTD_MAGIC) {
        Compression::Zstd
    } else if header.starts_with(BZIP2_MAGIC) {
        Compression::Bzip2
    } else if header.starts_with(XZ_MAGIC) {
        Compression::Xz
    } else {
        Compression::Uncompressed
    }
}

/// Wraps a layer stream in the decoder its framing calls for.
///
/// Unrecognized framing is treated as an already-uncompressed stream and
/// passed through unchanged. Formats that are recognized but for which no
/// decoder is available fail with
/// [`UnsupportedCompression`](UnlayerError::UnsupportedCompression).
pub fn decompress_stream<R: Read + 'static>(mut reader: R) -> UnlayerResult<Box<dyn Read>> {
    let mut header = [0u8; MAGIC_LEN];
    let mut filled = 0;
    while filled < MAGIC_LEN {
        let n = reader.read(&mut header[filled..]).map_err(UnlayerError::Stream)?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let compression = detect_compression(&header[..filled]);
    tracing::debug!("detected layer compression: {:?}", compression);

    // Stitch the sniffed bytes back onto the front of the stream.
    let restored: Chain<Cursor<Vec<u8>>, R> = Cursor::new(header[..filled].to_vec()).chain(reader);

    match compression {
        Compression::Uncompressed => Ok(Box::new(restored)),
        Compression::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(restored))),
        Compression::Zstd => Ok(Box::new(
            zstd::stream::read::Decoder::new(restored).map_err(UnlayerError::Stream)?,
        )),
        Compression::Bzip2 => Err(UnlayerError::UnsupportedCompression("bzip2".to_string())),
        Compression::Xz => Err(UnlayerError::UnsupportedCompression("xz".to_string())),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
