use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by session establishment and teardown.
///
/// `Connection` and `Handshake` abort the connect attempt entirely and are
/// reported to the caller. `Aborted` means the readiness wait was cancelled
/// before the adapter came up; no transport was opened. Synchronization
/// failures never appear here: they are isolated per server/source pair as
/// [`SyncError`] values and logged by the synchronizer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open transport to debug adapter: {0}")]
    Connection(#[source] io::Error),

    #[error("debug adapter rejected '{request}': {message}")]
    Handshake { request: &'static str, message: String },

    #[error("connection aborted before the debug adapter became ready")]
    Aborted,

    #[error(transparent)]
    Dap(#[from] crate::dap::DapError),
}

/// A failed `setBreakpoints` / `setExceptionBreakpoints` call for one
/// server/source pair. One such failure must not prevent other servers or
/// other source groups from synchronizing.
#[derive(Debug, Error)]
#[error("{request} failed for server #{server}{}: {message}", path_label(.path))]
pub struct SyncError {
    pub request: &'static str,
    pub server: u64,
    /// The source file of the failed group; absent for exception-filter
    /// calls.
    pub path: Option<PathBuf>,
    pub message: String,
}

fn path_label(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" ({})", path.display()),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_error_names_server_and_source() {
        let err = SyncError {
            request: "setBreakpoints",
            server: 3,
            path: Some(PathBuf::from("a.py")),
            message: "no such file".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("server #3"));
        assert!(text.contains("a.py"));
        assert!(text.contains("no such file"));
    }
}
