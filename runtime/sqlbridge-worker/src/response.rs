//! Response framing: `NAME=value` fields joined by `,` and closed by `;`.

use crate::codec::{self, EscapeWriter};
use std::fmt::Display;
use std::io::{self, Read, Write};
use thiserror::Error;

const STREAM_CHUNK: usize = 8 * 1024;

/// Failure while streaming a value: reading its source or writing the response.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to read response body: {0}")]
    Source(#[source] io::Error),
    #[error(transparent)]
    Sink(#[from] io::Error),
}

pub struct ResponseWriter<W: Write> {
    out: W,
    fields: usize,
}

impl<W: Write> ResponseWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, fields: 0 }
    }

    fn begin(&mut self, name: &str) -> io::Result<()> {
        if self.fields > 0 {
            self.out.write_all(b",")?;
        }
        self.fields += 1;
        self.out.write_all(name.as_bytes())?;
        self.out.write_all(b"=")
    }

    /// A bare value. Callers only pass values that need no escaping.
    pub fn plain(&mut self, name: &str, value: impl Display) -> io::Result<()> {
        self.begin(name)?;
        write!(self.out, "{value}")
    }

    pub fn quoted(&mut self, name: &str, value: &[u8]) -> io::Result<()> {
        self.begin(name)?;
        self.out.write_all(b"\"")?;
        self.out.write_all(&codec::encode(value))?;
        self.out.write_all(b"\"")
    }

    /// Streams `source` through the escape codec as a quoted value. Returns
    /// the number of encoded bytes written between the quotes.
    pub fn quoted_stream<R: Read>(&mut self, name: &str, mut source: R) -> Result<u64, StreamError> {
        self.begin(name)?;
        self.out.write_all(b"\"")?;
        let mut escaped = EscapeWriter::new(&mut self.out);
        let mut chunk = [0u8; STREAM_CHUNK];
        loop {
            let read = match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(StreamError::Source(err)),
            };
            escaped.write_all(&chunk[..read])?;
        }
        let written = escaped.encoded_len();
        self.out.write_all(b"\"")?;
        Ok(written)
    }

    /// Terminates the response. Flushing is left to the caller.
    pub fn finish(mut self) -> io::Result<W> {
        self.out.write_all(b";")?;
        Ok(self.out)
    }
}
