//! Command-line and environment configuration.

use crate::materialize::Separators;
use crate::scratch::ScratchStore;
use crate::session::SessionConfig;
use clap::Parser;
use sqlbridge_db::sqlite::{DEFAULT_BUSY_TIMEOUT_MS, SqliteOpenMode};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sqlbridge-worker",
    about = "Runs SQL requests read from stdin and writes escaped results to stdout"
)]
pub struct Args {
    /// Database to open. `:memory:` opens a private in-memory database.
    #[arg(env = "SQLBRIDGE_TARGET")]
    pub target: PathBuf,

    /// Run this one statement and exit instead of serving stdin.
    pub sql: Option<String>,

    /// Written between the values of a row.
    #[arg(
        long,
        env = "SQLBRIDGE_FIELD_SEP",
        default_value = "\\t",
        value_parser = parse_separator
    )]
    pub field_separator: Separator,

    /// Written after every row, including the header.
    #[arg(
        long,
        env = "SQLBRIDGE_RECORD_SEP",
        default_value = "\\n",
        value_parser = parse_separator
    )]
    pub record_separator: Separator,

    /// Directory for per-request scratch files. Defaults to the system temp dir.
    #[arg(long, env = "SQLBRIDGE_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    #[arg(long, env = "SQLBRIDGE_READ_ONLY")]
    pub read_only: bool,

    /// How long a statement waits on a locked database (ms).
    #[arg(long, env = "SQLBRIDGE_BUSY_TIMEOUT_MS", default_value_t = DEFAULT_BUSY_TIMEOUT_MS)]
    pub busy_timeout_ms: u64,
}

impl Args {
    pub fn open_mode(&self) -> SqliteOpenMode {
        if self.read_only {
            SqliteOpenMode::ReadOnly
        } else {
            SqliteOpenMode::ReadWrite
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            separators: Separators {
                field: self.field_separator.0.clone(),
                record: self.record_separator.0.clone(),
            },
            scratch: ScratchStore::new(self.scratch_dir.clone()),
        }
    }
}

/// Raw separator bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Separator(pub Vec<u8>);

/// Accepts literal text plus the `\t`, `\n`, `\r` and `\\` escapes.
fn parse_separator(raw: &str) -> Result<Separator, String> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.bytes();
    while let Some(byte) = bytes.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        match bytes.next() {
            Some(b't') => out.push(b'\t'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b'\\') => out.push(b'\\'),
            Some(other) => return Err(format!("unknown escape \\{}", char::from(other))),
            None => return Err("trailing backslash".to_string()),
        }
    }
    if out.is_empty() {
        return Err("separator must not be empty".to_string());
    }
    Ok(Separator(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separator_escapes() {
        assert_eq!(parse_separator("\\t").unwrap().0, b"\t");
        assert_eq!(parse_separator("\\r\\n").unwrap().0, b"\r\n");
        assert_eq!(parse_separator("|").unwrap().0, b"|");
        assert_eq!(parse_separator("a\\\\b").unwrap().0, b"a\\b");
        assert!(parse_separator("\\x").is_err());
        assert!(parse_separator("\\").is_err());
        assert!(parse_separator("").is_err());
    }

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["sqlbridge-worker", "data.db"]).unwrap();
        assert_eq!(args.target, PathBuf::from("data.db"));
        assert!(args.sql.is_none());
        assert_eq!(args.open_mode(), SqliteOpenMode::ReadWrite);
        assert_eq!(args.busy_timeout(), Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS));
        assert_eq!(args.session_config().separators, Separators::default());
    }

    #[test]
    fn single_shot_and_flags() {
        let args = Args::try_parse_from([
            "sqlbridge-worker",
            "--read-only",
            "--field-separator",
            ",",
            "--busy-timeout-ms",
            "250",
            ":memory:",
            "select 1",
        ])
        .unwrap();
        assert_eq!(args.sql.as_deref(), Some("select 1"));
        assert_eq!(args.open_mode(), SqliteOpenMode::ReadOnly);
        assert_eq!(args.busy_timeout(), Duration::from_millis(250));
        assert_eq!(args.session_config().separators.field, b",".to_vec());
    }
}
