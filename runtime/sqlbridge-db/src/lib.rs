//! Query engine interface for the sqlbridge worker.
//!
//! The worker only ever talks to a data source through the traits in this
//! module: a [`Connection`] prepares a [`Statement`], which either executes
//! for an affected-row count or opens a [`RowCursor`] over its result rows.
//! Connections and statements are released when they are dropped.

use thiserror::Error;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(all(feature = "sqlite", target_arch = "wasm32"))]
compile_error!("the `sqlite` feature is not available on wasm32");

/// Declared type of a result column, as far as the bridge cares about it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeCategory {
    /// Bounded character data (`CHAR(n)`, `VARCHAR(n)`).
    Character,
    /// Unbounded character data (`TEXT`, `CLOB`).
    LongCharacter,
    /// Raw bytes (`BLOB`, `BINARY`, `VARBINARY`).
    Binary,
    Other,
}

impl TypeCategory {
    /// Large values need a read buffer big enough for blob payloads.
    pub fn is_large(self) -> bool {
        matches!(self, TypeCategory::LongCharacter | TypeCategory::Binary)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub category: TypeCategory,
    /// Declared column size, 0 when the engine does not know it.
    pub size_hint: usize,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, category: TypeCategory, size_hint: usize) -> Self {
        Self {
            name: name.into(),
            category,
            size_hint,
        }
    }
}

/// Result of one [`RowCursor::read_column`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColumnRead {
    /// Bytes copied into the caller's buffer.
    pub written: usize,
    pub is_null: bool,
    /// More bytes of the same value are pending; call again to continue.
    pub more: bool,
}

/// Failure reported by the query engine.
///
/// `stage` names the operation that failed (`connect`, `prepare`, ...) and
/// `code` carries the engine's numeric result code, or -1 when it has none.
#[derive(Debug, Error)]
#[error("source={stage},code={code}\n{message}")]
pub struct EngineError {
    pub stage: &'static str,
    pub code: i64,
    pub message: String,
}

impl EngineError {
    pub fn new(stage: &'static str, code: i64, message: impl Into<String>) -> Self {
        Self {
            stage,
            code,
            message: message.into(),
        }
    }
}

/// An open connection to a data source.
pub trait Connection {
    type Statement<'c>: Statement
    where
        Self: 'c;

    fn prepare(&self, sql: &str) -> Result<Self::Statement<'_>, EngineError>;
}

/// A prepared statement. Columns are known before it runs.
pub trait Statement {
    type Cursor<'s>: RowCursor
    where
        Self: 's;

    fn columns(&self) -> &[ColumnDescriptor];

    /// Runs a statement that produces no columns and returns the number of
    /// rows it changed.
    fn execute(&mut self) -> Result<u64, EngineError>;

    fn query(&mut self) -> Result<Self::Cursor<'_>, EngineError>;
}

/// Forward-only iteration over result rows.
pub trait RowCursor {
    /// Advances to the next row. `Ok(false)` means the result is exhausted.
    fn next_row(&mut self) -> Result<bool, EngineError>;

    /// Copies the next chunk of column `index` of the current row into `buf`.
    ///
    /// A value longer than `buf` is returned over several calls, each
    /// reporting `more` until the last chunk.
    fn read_column(&mut self, index: usize, buf: &mut [u8]) -> Result<ColumnRead, EngineError>;
}
