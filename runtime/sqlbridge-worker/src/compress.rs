//! Size-gated compression of materialized results.

use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Results shorter than this are never compressed.
pub const MIN_COMPRESS_LEN: u64 = 128;
/// Results shorter than this get the cheap level.
pub const LOW_EFFORT_LIMIT: u64 = 512;
pub const LOW_EFFORT_LEVEL: u32 = 5;
pub const MAX_LEVEL: u32 = 9;
pub const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("compression level {0} is outside 0..=9")]
    InvalidLevel(u32),
    #[error("compression stream failed: {0}")]
    Io(#[from] io::Error),
}

/// Compression level for a result of `length` encoded bytes; 0 means none.
pub fn choose_level(length: u64, requested: bool) -> u32 {
    if length < MIN_COMPRESS_LEN || !requested {
        0
    } else if length < LOW_EFFORT_LIMIT {
        LOW_EFFORT_LEVEL
    } else {
        MAX_LEVEL
    }
}

/// Deflates (zlib format) everything in `source` into `dest`.
///
/// The level is checked before any input is read. On success the stream is
/// finished and `dest` flushed; the compressed size is returned.
pub fn deflate<R, W>(mut source: R, dest: W, level: u32) -> Result<u64, CompressError>
where
    R: Read,
    W: Write,
{
    if level > MAX_LEVEL {
        return Err(CompressError::InvalidLevel(level));
    }
    let mut encoder = ZlibEncoder::new(dest, Compression::new(level));
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let read = match source.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        encoder.write_all(&chunk[..read])?;
    }
    encoder.try_finish()?;
    let total = encoder.total_out();
    let mut dest = encoder.finish()?;
    dest.flush()?;
    Ok(total)
}
