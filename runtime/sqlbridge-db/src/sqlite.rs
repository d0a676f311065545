//! SQLite connector for the bridge.

use crate::{ColumnDescriptor, ColumnRead, Connection, EngineError, RowCursor, Statement, TypeCategory};
use rusqlite::OpenFlags;
use rusqlite::types::ValueRef;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqliteOpenMode {
    ReadOnly,
    ReadWrite,
}

pub struct SqliteConn {
    conn: rusqlite::Connection,
}

impl SqliteConn {
    pub fn open(path: &Path, mode: SqliteOpenMode, busy_timeout: Duration) -> Result<Self, EngineError> {
        let flags = match mode {
            SqliteOpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
            SqliteOpenMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            }
        };
        let conn = rusqlite::Connection::open_with_flags(path, flags)
            .map_err(|err| engine_error("connect", err))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|err| engine_error("connect", err))?;
        if matches!(mode, SqliteOpenMode::ReadOnly) {
            conn.pragma_update(None, "query_only", 1)
                .map_err(|err| engine_error("connect", err))?;
        }
        debug!(path = %path.display(), ?mode, "sqlite connection opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|err| engine_error("connect", err))?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &rusqlite::Connection {
        &self.conn
    }
}

impl Drop for SqliteConn {
    fn drop(&mut self) {
        debug!("sqlite connection released");
    }
}

impl Connection for SqliteConn {
    type Statement<'c> = SqliteStatement<'c>;

    fn prepare(&self, sql: &str) -> Result<SqliteStatement<'_>, EngineError> {
        let stmt = self
            .conn
            .prepare(sql)
            .map_err(|err| engine_error("prepare", err))?;
        let columns = stmt
            .columns()
            .iter()
            .map(|column| {
                let (category, size_hint) = classify_decl_type(column.decl_type());
                ColumnDescriptor::new(column.name(), category, size_hint)
            })
            .collect();
        Ok(SqliteStatement { stmt, columns })
    }
}

pub struct SqliteStatement<'c> {
    stmt: rusqlite::Statement<'c>,
    columns: Vec<ColumnDescriptor>,
}

impl Statement for SqliteStatement<'_> {
    type Cursor<'s>
        = SqliteCursor<'s>
    where
        Self: 's;

    fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    fn execute(&mut self) -> Result<u64, EngineError> {
        let changed = self
            .stmt
            .execute([])
            .map_err(|err| engine_error("execute", err))?;
        Ok(changed as u64)
    }

    fn query(&mut self) -> Result<SqliteCursor<'_>, EngineError> {
        let width = self.columns.len();
        let rows = self
            .stmt
            .query([])
            .map_err(|err| engine_error("query", err))?;
        Ok(SqliteCursor {
            rows,
            current: Vec::with_capacity(width),
            width,
        })
    }
}

/// A fetched value and how much of it has been handed out already.
struct Cell {
    value: Option<Vec<u8>>,
    offset: usize,
}

pub struct SqliteCursor<'s> {
    rows: rusqlite::Rows<'s>,
    current: Vec<Cell>,
    width: usize,
}

impl RowCursor for SqliteCursor<'_> {
    fn next_row(&mut self) -> Result<bool, EngineError> {
        self.current.clear();
        let Some(row) = self.rows.next().map_err(|err| engine_error("fetch", err))? else {
            return Ok(false);
        };
        for index in 0..self.width {
            let value = row
                .get_ref(index)
                .map_err(|err| engine_error("fetch", err))?;
            self.current.push(Cell {
                value: render_value(value),
                offset: 0,
            });
        }
        Ok(true)
    }

    fn read_column(&mut self, index: usize, buf: &mut [u8]) -> Result<ColumnRead, EngineError> {
        let cell = self.current.get_mut(index).ok_or_else(|| {
            EngineError::new("fetch", -1, format!("column {index} is not in the current row"))
        })?;
        let Some(value) = cell.value.as_deref() else {
            return Ok(ColumnRead {
                written: 0,
                is_null: true,
                more: false,
            });
        };
        let remaining = &value[cell.offset.min(value.len())..];
        let written = remaining.len().min(buf.len());
        buf[..written].copy_from_slice(&remaining[..written]);
        cell.offset += written;
        Ok(ColumnRead {
            written,
            is_null: false,
            more: cell.offset < value.len(),
        })
    }
}

/// Values are handed out the way a character-mode fetch renders them.
fn render_value(value: ValueRef<'_>) -> Option<Vec<u8>> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(v) => Some(v.to_string().into_bytes()),
        ValueRef::Real(v) => Some(format!("{v:?}").into_bytes()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Some(bytes.to_vec()),
    }
}

/// Maps a declared column type onto a category plus size hint, using the
/// same substring rules SQLite applies for type affinity.
pub fn classify_decl_type(decl: Option<&str>) -> (TypeCategory, usize) {
    let Some(decl) = decl else {
        return (TypeCategory::Other, 0);
    };
    let upper = decl.to_ascii_uppercase();
    let size = declared_size(&upper);
    if upper.contains("BLOB") || upper.contains("BINARY") {
        return (TypeCategory::Binary, size.unwrap_or(0));
    }
    if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        return match size {
            Some(size) if !upper.contains("CLOB") && !upper.contains("TEXT") => {
                (TypeCategory::Character, size)
            }
            _ => (TypeCategory::LongCharacter, size.unwrap_or(0)),
        };
    }
    (TypeCategory::Other, size.unwrap_or(0))
}

fn declared_size(decl: &str) -> Option<usize> {
    let start = decl.find('(')? + 1;
    let digits: String = decl[start..]
        .chars()
        .skip_while(|c| c.is_ascii_whitespace())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn engine_error(stage: &'static str, err: rusqlite::Error) -> EngineError {
    let code = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => i64::from(failure.extended_code),
        _ => -1,
    };
    EngineError::new(stage, code, err.to_string())
}
