//! Percent-style escaping shared by the request and response paths.
//!
//! A byte is escaped as `%XX` (uppercase hex) when it is a control byte or
//! one of the structural bytes of the wire format. Decoding is lenient: a
//! digit that is not hex counts as 0 and never fails the decode.

use std::io::{self, Write};

const UPPER_HEX: &[u8; 16] = b"0123456789ABCDEF";
const LOWER_HEX: &[u8; 16] = b"0123456789abcdef";

pub fn needs_escape(byte: u8) -> bool {
    byte < 32 || matches!(byte, b'"' | b'%' | b';' | b',' | b'=')
}

/// Appends the escaped form of `bytes` to `out`.
pub fn encode_into(bytes: &[u8], out: &mut Vec<u8>) {
    for &byte in bytes {
        if needs_escape(byte) {
            out.extend_from_slice(&escape_triplet(byte));
        } else {
            out.push(byte);
        }
    }
}

pub fn encode(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    encode_into(bytes, &mut out);
    out
}

/// Forced mode: every byte as two lowercase hex digits, no `%`.
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(LOWER_HEX[usize::from(byte >> 4)] as char);
        out.push(LOWER_HEX[usize::from(byte & 0x0f)] as char);
    }
    out
}

pub fn decode(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut unescaper = Unescaper::default();
    for &byte in bytes {
        if let Some(decoded) = unescaper.push(byte) {
            out.push(decoded);
        }
    }
    if let Some(pending) = unescaper.finish() {
        out.push(pending);
    }
    out
}

/// Hex digit value; anything that is not a hex digit is 0.
pub fn hex_nibble(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        b'A'..=b'F' => digit - b'A' + 10,
        _ => 0,
    }
}

fn escape_triplet(byte: u8) -> [u8; 3] {
    [
        b'%',
        UPPER_HEX[usize::from(byte >> 4)],
        UPPER_HEX[usize::from(byte & 0x0f)],
    ]
}

/// Byte-at-a-time `%XX` decoder.
///
/// Once a `%` is seen the next two bytes are consumed as hex digits whatever
/// they are, so a pending escape swallows a quote or another `%`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Unescaper {
    #[default]
    Plain,
    High,
    Low(u8),
}

impl Unescaper {
    pub fn push(&mut self, byte: u8) -> Option<u8> {
        match *self {
            Unescaper::Plain if byte == b'%' => {
                *self = Unescaper::High;
                None
            }
            Unescaper::Plain => Some(byte),
            Unescaper::High => {
                *self = Unescaper::Low(hex_nibble(byte));
                None
            }
            Unescaper::Low(high) => {
                *self = Unescaper::Plain;
                Some((high << 4) | hex_nibble(byte))
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self, Unescaper::Plain)
    }

    /// Flushes an escape cut short by end of input; missing digits count as 0.
    pub fn finish(&mut self) -> Option<u8> {
        let pending = match *self {
            Unescaper::Plain => None,
            Unescaper::High => Some(0),
            Unescaper::Low(high) => Some(high << 4),
        };
        *self = Unescaper::Plain;
        pending
    }
}

/// Writer adapter that escapes everything written through it and counts the
/// encoded bytes it produced.
pub struct EscapeWriter<W> {
    inner: W,
    written: u64,
    scratch: Vec<u8>,
}

impl<W: Write> EscapeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            written: 0,
            scratch: Vec::new(),
        }
    }

    /// Number of encoded bytes handed to the inner writer.
    pub fn encoded_len(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Writes bytes through unescaped, still counting them.
    pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

impl<W: Write> Write for EscapeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        encode_into(buf, &mut self.scratch);
        self.inner.write_all(&self.scratch)?;
        self.written += self.scratch.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
