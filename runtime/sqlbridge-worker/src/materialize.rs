//! Result materialization.
//!
//! Draining a cursor is split into two stages: [`drain_rows`] walks the rows
//! and hands raw column chunks to a [`RowVisitor`], and the visitor used by
//! [`materialize`] feeds each chunk both to a [`Fingerprinter`] and, escaped,
//! to the output sink. The fingerprint therefore only ever sees raw bytes.

use crate::codec::{self, EscapeWriter};
use md5::{Digest, Md5};
use sqlbridge_db::{ColumnDescriptor, RowCursor};
use std::io::{self, Write};
use tracing::warn;

/// Minimum read buffer when any column can hold blob-sized values.
pub const LARGE_VALUE_BUFFER: usize = 32 * 1024;

/// Field and record separators written between values and rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Separators {
    pub field: Vec<u8>,
    pub record: Vec<u8>,
}

impl Default for Separators {
    fn default() -> Self {
        Self {
            field: b"\t".to_vec(),
            record: b"\n".to_vec(),
        }
    }
}

/// 128-bit content digest of a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// 32 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        codec::hex(&self.0)
    }

    /// Exact comparison against a fingerprint supplied by a client.
    pub fn matches(&self, claimed: &[u8]) -> bool {
        !claimed.is_empty() && self.to_hex().as_bytes() == claimed
    }
}

#[derive(Clone, Default)]
pub struct Fingerprinter {
    hasher: Md5,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, raw: &[u8]) {
        self.hasher.update(raw);
    }

    pub fn finish(self) -> Fingerprint {
        let mut out = [0u8; 16];
        out.copy_from_slice(&self.hasher.finalize());
        Fingerprint(out)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Materialized {
    /// Encoded bytes of row values. The header and separators are not counted.
    pub length: u64,
    pub rows: u64,
    pub fingerprint: Fingerprint,
}

/// Receives the raw content of a result, one chunk at a time.
pub trait RowVisitor {
    fn chunk(&mut self, raw: &[u8]) -> io::Result<()>;
    /// Called between two fields of a row.
    fn end_field(&mut self) -> io::Result<()>;
    fn end_record(&mut self) -> io::Result<()>;
}

/// Read buffer size for a set of columns: twice the widest declared size
/// plus slack, and never below [`LARGE_VALUE_BUFFER`] when a column is large.
pub fn read_buffer_size(columns: &[ColumnDescriptor]) -> usize {
    let widest = columns.iter().map(|c| c.size_hint).max().unwrap_or(0);
    let size = widest.saturating_mul(2).saturating_add(128);
    if columns.iter().any(|c| c.category.is_large()) {
        size.max(LARGE_VALUE_BUFFER)
    } else {
        size
    }
}

/// Walks every remaining row of `cursor`, delivering raw chunks to `visitor`.
///
/// A cursor error is not reported: a failing `next_row` ends the result and
/// a failing `read_column` ends that field, exactly as if the data had run
/// out. Only visitor (sink) errors are returned. Returns the row count.
pub fn drain_rows<C, V>(
    cursor: &mut C,
    column_count: usize,
    buffer: &mut [u8],
    visitor: &mut V,
) -> io::Result<u64>
where
    C: RowCursor + ?Sized,
    V: RowVisitor + ?Sized,
{
    let mut rows = 0u64;
    loop {
        match cursor.next_row() {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                warn!(error = %err, rows, "row fetch failed, treating as end of result");
                break;
            }
        }
        for index in 0..column_count {
            loop {
                let read = match cursor.read_column(index, buffer) {
                    Ok(read) => read,
                    Err(err) => {
                        warn!(error = %err, column = index, "column read failed, ending field");
                        break;
                    }
                };
                if read.is_null {
                    break;
                }
                if read.written > 0 {
                    visitor.chunk(&buffer[..read.written])?;
                }
                if !read.more || read.written == 0 {
                    break;
                }
            }
            if index + 1 < column_count {
                visitor.end_field()?;
            }
        }
        visitor.end_record()?;
        rows += 1;
    }
    Ok(rows)
}

struct EncodingVisitor<'a, W: Write> {
    out: EscapeWriter<W>,
    digest: Fingerprinter,
    separators: &'a Separators,
    value_len: u64,
}

impl<W: Write> RowVisitor for EncodingVisitor<'_, W> {
    fn chunk(&mut self, raw: &[u8]) -> io::Result<()> {
        self.digest.update(raw);
        let before = self.out.encoded_len();
        self.out.write_all(raw)?;
        self.value_len += self.out.encoded_len() - before;
        Ok(())
    }

    fn end_field(&mut self) -> io::Result<()> {
        self.out.write_raw(&self.separators.field)
    }

    fn end_record(&mut self) -> io::Result<()> {
        self.out.write_raw(&self.separators.record)
    }
}

/// Writes the header and every row of `cursor` to `sink`.
pub fn materialize<C, W>(
    columns: &[ColumnDescriptor],
    cursor: &mut C,
    sink: W,
    separators: &Separators,
) -> io::Result<Materialized>
where
    C: RowCursor + ?Sized,
    W: Write,
{
    let mut visitor = EncodingVisitor {
        out: EscapeWriter::new(sink),
        digest: Fingerprinter::new(),
        separators,
        value_len: 0,
    };
    for (index, column) in columns.iter().enumerate() {
        if index > 0 {
            visitor.out.write_raw(&separators.field)?;
        }
        visitor.out.write_all(column.name.as_bytes())?;
    }
    visitor.out.write_raw(&separators.record)?;

    let mut buffer = vec![0u8; read_buffer_size(columns)];
    let rows = drain_rows(cursor, columns.len(), &mut buffer, &mut visitor)?;
    visitor.out.flush()?;

    Ok(Materialized {
        length: visitor.value_len,
        rows,
        fingerprint: visitor.digest.finish(),
    })
}
