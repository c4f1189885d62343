//! Connection-side configuration: debugging mode, wait strategy, message
//! tracing level, and the launch/attach parameter map.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::extractor::TracePattern;

/// Whether the session launches the debuggee or attaches to a running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    Launch,
    Attach,
}

impl DebugMode {
    pub fn as_request(self) -> &'static str {
        match self {
            DebugMode::Launch => "launch",
            DebugMode::Attach => "attach",
        }
    }
}

/// Message-level trace verbosity for the protocol client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServerTrace {
    #[default]
    Off,
    Messages,
    Verbose,
}

/// How to decide that a freshly spawned debug adapter is ready to accept a
/// client connection.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// Resolve a fixed delay after the process reports started. Best-effort:
    /// this does not confirm the server actually opened its listening port.
    Timeout(Duration),
    /// Resolve when an output chunk matches the pattern. If the marker never
    /// appears the wait never resolves on its own; it must be cancelled.
    Trace(TracePattern),
    /// No explicit signal: probe the socket when a port is known, otherwise
    /// resolve immediately.
    None,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitStrategyParseError {
    #[error("invalid wait strategy {0:?}: expected `timeout:N`, `trace:\"text\"` or `none`")]
    Unrecognized(String),
    #[error("invalid timeout in wait strategy {0:?}: expected milliseconds")]
    InvalidTimeout(String),
}

impl WaitStrategy {
    /// Parse the `timeout:N` / `trace:"text"` / `none` selector syntax.
    pub fn parse(selector: &str) -> Result<Self, WaitStrategyParseError> {
        let selector = selector.trim();
        if selector.eq_ignore_ascii_case("none") || selector.is_empty() {
            return Ok(WaitStrategy::None);
        }
        if let Some(millis) = selector.strip_prefix("timeout:") {
            let millis: u64 = millis
                .trim()
                .parse()
                .map_err(|_| WaitStrategyParseError::InvalidTimeout(selector.to_string()))?;
            return Ok(WaitStrategy::Timeout(Duration::from_millis(millis)));
        }
        if let Some(text) = selector.strip_prefix("trace:") {
            let text = text.trim();
            let text = text
                .strip_prefix('"')
                .and_then(|t| t.strip_suffix('"'))
                .unwrap_or(text);
            return Ok(WaitStrategy::Trace(TracePattern::new(text)));
        }
        Err(WaitStrategyParseError::Unrecognized(selector.to_string()))
    }
}

/// Predicate deciding which source files this session installs breakpoints
/// for. Sessions reject breakpoints in files their adapter cannot debug.
pub type FileFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

pub fn accept_all_files() -> FileFilter {
    Arc::new(|_| true)
}

/// Everything needed to establish one adapter connection.
#[derive(Clone)]
pub struct AdapterConfig {
    /// Stable identity of the debug-adapter server definition; keys the
    /// persisted exception-filter preferences.
    pub adapter_id: String,
    pub mode: DebugMode,
    /// `true` for a debug launch, `false` for a plain run. Becomes the
    /// standard `noDebug` parameter, inverted.
    pub debug: bool,
    /// Launch/attach parameters forwarded verbatim to the adapter.
    pub parameters: Map<String, Value>,
    pub wait: WaitStrategy,
    pub trace: ServerTrace,
}

impl AdapterConfig {
    pub fn new(adapter_id: impl Into<String>, mode: DebugMode) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            mode,
            debug: true,
            parameters: Map::new(),
            wait: WaitStrategy::None,
            trace: ServerTrace::Off,
        }
    }

    /// The wire parameter map for `launch`/`attach`: the configured
    /// parameters plus the standard `noDebug` flag.
    pub fn dap_parameters(&self) -> Map<String, Value> {
        let mut parameters = self.parameters.clone();
        parameters.insert("noDebug".to_string(), Value::Bool(!self.debug));
        parameters
    }
}

impl fmt::Debug for AdapterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterConfig")
            .field("adapter_id", &self.adapter_id)
            .field("mode", &self.mode)
            .field("debug", &self.debug)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timeout_selector() {
        match WaitStrategy::parse("timeout:500").unwrap() {
            WaitStrategy::Timeout(d) => assert_eq!(d, Duration::from_millis(500)),
            other => panic!("expected timeout strategy, got {other:?}"),
        }
    }

    #[test]
    fn parses_trace_selector_with_and_without_quotes() {
        for selector in ["trace:\"Listening on\"", "trace:Listening on"] {
            match WaitStrategy::parse(selector).unwrap() {
                WaitStrategy::Trace(pattern) => {
                    assert!(pattern.matches("Listening on 4711").is_some());
                }
                other => panic!("expected trace strategy, got {other:?}"),
            }
        }
    }

    #[test]
    fn parses_none_and_rejects_garbage() {
        assert!(matches!(WaitStrategy::parse("none"), Ok(WaitStrategy::None)));
        assert!(matches!(WaitStrategy::parse(""), Ok(WaitStrategy::None)));
        assert!(matches!(
            WaitStrategy::parse("sleep:10"),
            Err(WaitStrategyParseError::Unrecognized(s)) if s == "sleep:10"
        ));
        assert!(matches!(
            WaitStrategy::parse("timeout:abc"),
            Err(WaitStrategyParseError::InvalidTimeout(_))
        ));
    }

    #[test]
    fn dap_parameters_inject_no_debug() {
        let mut config = AdapterConfig::new("debugpy", DebugMode::Launch);
        config
            .parameters
            .insert("program".to_string(), Value::String("app.py".to_string()));

        let debug = config.dap_parameters();
        assert_eq!(debug["noDebug"], Value::Bool(false));
        assert_eq!(debug["program"], "app.py");

        config.debug = false;
        assert_eq!(config.dap_parameters()["noDebug"], Value::Bool(true));
    }
}
