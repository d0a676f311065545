use anyhow::Context;
use clap::Parser;
use sqlbridge_db::sqlite::SqliteConn;
use sqlbridge_worker::config::Args;
use sqlbridge_worker::request::Request;
use sqlbridge_worker::{Session, SessionError};
use std::io::{self, BufWriter};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let args = Args::parse();
    info!(target = %args.target.display(), read_only = args.read_only, "starting sqlbridge worker");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let input = stdin.lock();
    let output = BufWriter::new(stdout.lock());

    let open = || SqliteConn::open(&args.target, args.open_mode(), args.busy_timeout());
    let mut session = match Session::connect(open, input, output, args.session_config()) {
        Ok(session) => session,
        Err(SessionError::Connect(err)) => {
            return Err(err).with_context(|| format!("opening {}", args.target.display()));
        }
        Err(err) => return Err(err.into()),
    };

    let termination = match args.sql.as_deref() {
        Some(sql) => session.run_single(Request::single_shot(sql)),
        None => session.run(),
    }
    .context("serving requests")?;
    info!(?termination, "sqlbridge worker exiting");
    Ok(())
}
