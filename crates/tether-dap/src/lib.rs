//! Tether: Debug Adapter Protocol session establishment and breakpoint
//! synchronization.
//!
//! This crate provides:
//! - Readiness detection for spawned debug adapters (fixed timeout, trace
//!   marker, or socket probe).
//! - A duplex transport to the adapter over TCP or process standard
//!   streams, with an optional byte-level trace decorator.
//! - Session orchestration: the initialize/launch-or-attach handshake, the
//!   configuration phase, and guaranteed-terminal teardown.
//! - A breakpoint synchronizer that keeps one host-owned breakpoint set in
//!   step with any number of connected adapter servers.
//! - Exception breakpoint filters with per-adapter persisted preferences.

pub mod breakpoints;
pub mod client;
pub mod config;
pub mod dap;
pub mod error;
pub mod exceptions;
pub mod extractor;
pub mod process;
pub mod readiness;
pub mod session;
pub mod settings;
pub mod transport;

pub use crate::breakpoints::{
    BreakpointDescriptor, BreakpointSynchronizer, DefaultBreakpointPolicy,
    SessionBreakpointPolicy, SourceBreakpointGroup, SourcePosition, Verification,
};
pub use crate::client::DapClient;
pub use crate::config::{AdapterConfig, DebugMode, FileFilter, ServerTrace, WaitStrategy};
pub use crate::error::{SessionError, SessionResult, SyncError};
pub use crate::exceptions::{ExceptionFilter, ExceptionFilterRegistry};
pub use crate::extractor::TracePattern;
pub use crate::process::{AdapterProcess, ProcessKey};
pub use crate::readiness::{ReadinessMonitor, ReadinessRegistry, ReadinessSurface};
pub use crate::session::{DebugSession, SessionParams, SessionState};
pub use crate::settings::FilterSettingsStore;
pub use crate::transport::{TraceSink, TransportChannel};
