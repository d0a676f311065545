//! The request/response loop.
//!
//! A session owns one connection and the two byte channels. Each cycle reads
//! a request, runs its statement, and writes exactly one response record:
//!
//! ```text
//! ID="..",ROWCOUNT=n;
//! ID="..",MD5=<hex>,RESULT=CACHED;
//! ID="..",MD5=<hex>[,ZIP=<level>],RESULT="<escaped body>";
//! ID="..",RESULT="";
//! ID="..",ERROR="<escaped source=..,code=..\nmessage>";
//! ```
//!
//! Statement failures become `ERROR` responses and the loop continues. A
//! request that cannot be decoded ends the session without a response.

use crate::classify::StatementKind;
use crate::compress::{self, CompressError};
use crate::materialize::{self, Fingerprint, Separators};
use crate::request::{self, DecodeError, Request};
use crate::response::{ResponseWriter, StreamError};
use crate::scratch::{ScratchFile, ScratchStore};
use sqlbridge_db::{Connection, EngineError, RowCursor, Statement};
use std::fs::File;
use std::io::{self, BufRead, Write};
use std::str::Utf8Error;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Written once the connection is up, before the first request is read.
pub const READY_BANNER: &[u8] = b"OK";

#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    pub separators: Separators,
    pub scratch: ScratchStore,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Ready,
    AwaitingRequest,
    Executing,
    Emitting,
    Terminated,
}

#[derive(Debug)]
pub enum Termination {
    /// Input closed between requests.
    EndOfInput,
    /// Malformed request, or input closed mid-request.
    DecodeFailed(DecodeError),
    /// A request carried no statement text.
    EmptyQuery,
    SingleShotComplete,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open data source: {0}")]
    Connect(#[source] EngineError),
    #[error("failed to write response: {0}")]
    Output(#[from] io::Error),
    /// The materialized body became unreadable after the response started,
    /// so no `ERROR` can be sent in its place.
    #[error("failed to read result body: {0}")]
    Body(#[source] io::Error),
}

impl From<StreamError> for SessionError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Source(err) => SessionError::Body(err),
            StreamError::Sink(err) => SessionError::Output(err),
        }
    }
}

/// Failure of a single request, reported to the client as `ERROR`.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("{0} statements are not supported")]
    Unsupported(&'static str),
    #[error("statement is not valid UTF-8: {0}")]
    InvalidQuery(#[source] Utf8Error),
    #[error("scratch file failure: {0}")]
    Scratch(#[source] io::Error),
    #[error(transparent)]
    Compress(#[from] CompressError),
}

impl CycleError {
    pub fn stage(&self) -> &'static str {
        match self {
            CycleError::Engine(err) => err.stage,
            CycleError::Unsupported(_) => "classify",
            CycleError::InvalidQuery(_) => "request",
            CycleError::Scratch(_) => "scratch",
            CycleError::Compress(_) => "compress",
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            CycleError::Engine(err) => err.code,
            CycleError::Scratch(err) => err.raw_os_error().map_or(-1, i64::from),
            CycleError::Compress(CompressError::Io(err)) => {
                err.raw_os_error().map_or(-1, i64::from)
            }
            _ => -1,
        }
    }

    /// `source=<stage>,code=<code>` followed by the diagnostic text.
    pub fn diagnostic(&self) -> String {
        match self {
            CycleError::Engine(err) => err.to_string(),
            other => format!("source={},code={}\n{}", other.stage(), other.code(), other),
        }
    }
}

/// Steps a mutation with a `RETURNING` clause to completion. Each returned
/// row is one affected row.
fn count_rows<K: RowCursor + ?Sized>(cursor: &mut K) -> Result<u64, EngineError> {
    let mut rows = 0;
    while cursor.next_row()? {
        rows += 1;
    }
    Ok(rows)
}

enum Reply {
    RowCount(u64),
    Empty,
    Cached(Fingerprint),
    Body {
        fingerprint: Fingerprint,
        level: u32,
        body: File,
        // Keeps the scratch file alive until the body is streamed.
        _payload: ScratchFile,
    },
    Error(CycleError),
}

impl Reply {
    /// Opens `payload` for streaming.
    fn body(fingerprint: Fingerprint, level: u32, payload: ScratchFile) -> Result<Self, CycleError> {
        let body = payload.open_for_read().map_err(CycleError::Scratch)?;
        Ok(Reply::Body {
            fingerprint,
            level,
            body,
            _payload: payload,
        })
    }
}

pub struct Session<C, R, W> {
    conn: C,
    input: R,
    output: W,
    config: SessionConfig,
    phase: Phase,
}

impl<C, R, W> Session<C, R, W>
where
    C: Connection,
    R: BufRead,
    W: Write,
{
    /// Opens the connection with `open`. On failure the error is written to
    /// `output` as a single `ERROR` response before being returned.
    pub fn connect<F>(
        open: F,
        input: R,
        mut output: W,
        config: SessionConfig,
    ) -> Result<Self, SessionError>
    where
        F: FnOnce() -> Result<C, EngineError>,
    {
        trace!(phase = ?Phase::Connecting, "session phase");
        match open() {
            Ok(conn) => {
                trace!(phase = ?Phase::Ready, "session phase");
                Ok(Self {
                    conn,
                    input,
                    output,
                    config,
                    phase: Phase::Ready,
                })
            }
            Err(err) => {
                let mut response = ResponseWriter::new(&mut output);
                response.quoted("ERROR", err.to_string().as_bytes())?;
                response.finish()?;
                output.flush()?;
                Err(SessionError::Connect(err))
            }
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn into_output(self) -> W {
        self.output
    }

    fn enter(&mut self, phase: Phase) {
        trace!(from = ?self.phase, to = ?phase, "session phase");
        self.phase = phase;
    }

    /// Serves requests from the input channel until it closes or a request
    /// cannot be decoded.
    pub fn run(&mut self) -> Result<Termination, SessionError> {
        self.output.write_all(READY_BANNER)?;
        self.output.flush()?;
        loop {
            self.enter(Phase::AwaitingRequest);
            let request = match request::read_request(&mut self.input) {
                Ok(request) => request,
                Err(err) if err.is_eof() => return Ok(self.terminate(Termination::EndOfInput)),
                Err(err) => {
                    warn!(error = %err, "discarding malformed request");
                    return Ok(self.terminate(Termination::DecodeFailed(err)));
                }
            };
            if request.statement().is_empty() {
                return Ok(self.terminate(Termination::EmptyQuery));
            }
            self.serve(&request)?;
        }
    }

    /// Serves one request without reading the input channel or writing the
    /// ready banner.
    pub fn run_single(&mut self, request: Request) -> Result<Termination, SessionError> {
        if request.statement().is_empty() {
            return Ok(self.terminate(Termination::EmptyQuery));
        }
        self.serve(&request)?;
        Ok(self.terminate(Termination::SingleShotComplete))
    }

    fn terminate(&mut self, reason: Termination) -> Termination {
        info!(?reason, "session terminated");
        self.enter(Phase::Terminated);
        reason
    }

    fn serve(&mut self, request: &Request) -> Result<(), SessionError> {
        self.enter(Phase::Executing);
        let reply = self.execute(request);
        self.enter(Phase::Emitting);
        self.emit(request, reply)
    }

    fn execute(&self, request: &Request) -> Reply {
        let sql = match std::str::from_utf8(request.statement()) {
            Ok(sql) => sql,
            Err(err) => return Reply::Error(CycleError::InvalidQuery(err)),
        };
        let kind = StatementKind::of(sql);
        debug!(?kind, id = %String::from_utf8_lossy(&request.id), "executing statement");
        if kind == StatementKind::CatalogListing {
            return Reply::Error(CycleError::Unsupported("catalog listing"));
        }
        match self.run_statement(sql, kind, request) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(error = %err, "statement failed");
                Reply::Error(err)
            }
        }
    }

    fn run_statement(
        &self,
        sql: &str,
        kind: StatementKind,
        request: &Request,
    ) -> Result<Reply, CycleError> {
        let mut stmt = self.conn.prepare(sql)?;
        if kind == StatementKind::RowCount {
            let changed = if stmt.columns().is_empty() {
                stmt.execute()?
            } else {
                count_rows(&mut stmt.query()?)?
            };
            return Ok(Reply::RowCount(changed));
        }
        if stmt.columns().is_empty() {
            stmt.execute()?;
            return Ok(Reply::Empty);
        }

        let columns = stmt.columns().to_vec();
        let mut cursor = stmt.query()?;
        let mut result = self.config.scratch.create().map_err(CycleError::Scratch)?;
        let materialized = materialize::materialize(
            &columns,
            &mut cursor,
            result.writer(),
            &self.config.separators,
        )
        .map_err(CycleError::Scratch)?;
        let fingerprint = materialized.fingerprint;
        debug!(
            rows = materialized.rows,
            length = materialized.length,
            "materialized result"
        );

        if fingerprint.matches(&request.fingerprint) {
            return Ok(Reply::Cached(fingerprint));
        }

        let level = compress::choose_level(materialized.length, request.compression_requested());
        if level == 0 {
            return Reply::body(fingerprint, level, result);
        }

        let mut compressed = self.config.scratch.create().map_err(CycleError::Scratch)?;
        let source = result.open_for_read().map_err(CycleError::Scratch)?;
        let size = compress::deflate(source, compressed.writer(), level)?;
        debug!(
            length = materialized.length,
            compressed = size,
            level,
            "compressed result"
        );
        Reply::body(fingerprint, level, compressed)
    }

    fn emit(&mut self, request: &Request, reply: Reply) -> Result<(), SessionError> {
        let mut response = ResponseWriter::new(&mut self.output);
        if !request.id.is_empty() {
            response.quoted("ID", &request.id)?;
        }
        match reply {
            Reply::RowCount(changed) => response.plain("ROWCOUNT", changed)?,
            Reply::Empty => response.quoted("RESULT", b"")?,
            Reply::Cached(fingerprint) => {
                response.plain("MD5", fingerprint.to_hex())?;
                response.plain("RESULT", "CACHED")?;
            }
            Reply::Body {
                fingerprint,
                level,
                body,
                ..
            } => {
                response.plain("MD5", fingerprint.to_hex())?;
                if level > 0 {
                    response.plain("ZIP", level)?;
                }
                response.quoted_stream("RESULT", body)?;
            }
            Reply::Error(err) => response.quoted("ERROR", err.diagnostic().as_bytes())?,
        }
        response.finish()?;
        self.output.flush()?;
        Ok(())
    }
}
