//! Debug Adapter Protocol wire layer: framing codec, message envelopes and
//! the payload types this engine consumes.
//!
//! The protocol itself is treated as an external collaborator; only the
//! requests the session and synchronizer need are modeled here.

use std::io;

use thiserror::Error;

pub mod codec;
pub mod messages;
pub mod types;

/// Maximum size of a single header line (`Content-Length: ...\r\n`).
pub const MAX_DAP_HEADER_LINE_BYTES: usize = 8 * 1024;

/// Maximum size of a single DAP message body.
pub const MAX_DAP_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dap protocol error: {0}")]
    Protocol(String),

    #[error("'{command}' request failed: {message}")]
    Request { command: String, message: String },

    #[error("connection to debug adapter closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DapError>;
