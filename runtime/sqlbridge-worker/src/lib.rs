//! Stdio SQL bridge.
//!
//! Requests arrive on an input channel as `TAG="value",...;` records. Each
//! statement runs against a [`sqlbridge_db::Connection`]; rows are
//! materialized into a scratch file while being fingerprinted, optionally
//! deflated, and streamed back as an escaped `RESULT` field.

pub mod classify;
pub mod codec;
pub mod compress;
pub mod config;
pub mod materialize;
pub mod request;
pub mod response;
pub mod scratch;
pub mod session;

pub use session::{Session, SessionConfig, SessionError, Termination};
