//! Readiness detection for freshly spawned debug adapters.
//!
//! A [`ReadinessMonitor`] resolves exactly once: to `Ready` when the
//! configured strategy fires, or to `Cancelled` through [`ReadinessMonitor::cancel`].
//! The internal state machine is deliberately separate from the public
//! handle; callers only ever observe the single terminal transition via
//! [`ReadinessMonitor::wait`].

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::WaitStrategy;
use crate::error::{SessionError, SessionResult};
use crate::extractor::TracePattern;
use crate::process::{AdapterProcess, ProcessKey};

/// Per-attempt connect timeout and retry pacing for the socket probe.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const PROBE_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyState {
    Pending,
    Ready,
    Cancelled,
}

/// The slice of the process surface the monitor consumes: the started
/// signal, the output-line feed, and the port the adapter is expected to
/// listen on (when known up front).
pub struct ReadinessSurface {
    pub started: watch::Receiver<bool>,
    pub output: broadcast::Receiver<String>,
    pub port: Option<u16>,
}

impl ReadinessSurface {
    pub fn of_process(process: &AdapterProcess, port: Option<u16>) -> Self {
        Self {
            started: process.started(),
            output: process.output_lines(),
            port,
        }
    }

    /// A surface with no process behind it, for attaching to an adapter
    /// somebody else started. The started signal is already set; there is
    /// no output feed, so a trace strategy would wait forever.
    pub fn detached(port: Option<u16>) -> Self {
        let (_started_tx, started) = watch::channel(true);
        let (_output_tx, output) = broadcast::channel(1);
        Self {
            started,
            output,
            port,
        }
    }
}

struct Shared {
    state: watch::Sender<ReadyState>,
    port: Mutex<Option<u16>>,
}

impl Shared {
    /// Transition out of `Pending`. The first transition wins; later calls
    /// are no-ops.
    fn resolve(&self, next: ReadyState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ReadyState::Pending {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn is_resolved(&self) -> bool {
        *self.state.borrow() != ReadyState::Pending
    }
}

pub struct ReadinessMonitor {
    shared: Arc<Shared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ReadinessMonitor {
    /// Start watching. The returned monitor resolves according to the
    /// strategy; dropping it cancels the watch.
    pub fn start(strategy: WaitStrategy, surface: ReadinessSurface) -> Self {
        let (state_tx, _) = watch::channel(ReadyState::Pending);
        let shared = Arc::new(Shared {
            state: state_tx,
            port: Mutex::new(surface.port),
        });

        let watcher = tokio::spawn(run_strategy(strategy, surface, Arc::clone(&shared)));

        Self {
            shared,
            watcher: Mutex::new(Some(watcher)),
        }
    }

    /// Wait for the single resolution. `Err(Aborted)` when the monitor was
    /// cancelled before the adapter became ready.
    pub async fn wait(&self) -> SessionResult<()> {
        let mut rx = self.shared.state.subscribe();
        let result = match rx.wait_for(|state| *state != ReadyState::Pending).await {
            Ok(state) if *state == ReadyState::Ready => Ok(()),
            _ => Err(SessionError::Aborted),
        };
        result
    }

    /// Cancel the wait. Safe to call at any time: after resolution this is a
    /// no-op. Cancellation detaches the output watcher immediately.
    pub fn cancel(&self) {
        self.shared.resolve(ReadyState::Cancelled);
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.is_resolved()
    }

    /// The adapter's listening port: the configured one, or the port
    /// extracted from a trace match.
    pub fn port(&self) -> Option<u16> {
        *self.shared.port.lock()
    }
}

impl Drop for ReadinessMonitor {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_strategy(strategy: WaitStrategy, surface: ReadinessSurface, shared: Arc<Shared>) {
    match strategy {
        WaitStrategy::Timeout(delay) => {
            wait_timeout(surface.started, delay, &shared).await;
        }
        WaitStrategy::Trace(pattern) => {
            wait_trace(surface.output, pattern, &shared).await;
        }
        WaitStrategy::None => {
            let port = *shared.port.lock();
            match port {
                Some(port) => wait_probe(port, &shared).await,
                // Nothing to wait on: the adapter is assumed ready as soon
                // as it is spawned.
                None => {
                    shared.resolve(ReadyState::Ready);
                }
            }
        }
    }
    // The watcher task ending drops its output subscription, detaching the
    // listener from the process for the remainder of its life.
}

async fn wait_timeout(mut started: watch::Receiver<bool>, delay: Duration, shared: &Shared) {
    if started.wait_for(|started| *started).await.is_err() {
        // Started signal went away without firing; leave the monitor
        // pending for the consumer to cancel.
        return;
    }
    tokio::time::sleep(delay).await;
    shared.resolve(ReadyState::Ready);
}

async fn wait_trace(
    mut output: broadcast::Receiver<String>,
    pattern: TracePattern,
    shared: &Shared,
) {
    loop {
        match output.recv().await {
            Ok(line) => {
                if let Some(matched) = pattern.matches(&line) {
                    if let Some(port) = matched.port {
                        *shared.port.lock() = Some(port);
                    }
                    shared.resolve(ReadyState::Ready);
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(
                    target: "tether.readiness",
                    skipped,
                    "output feed lagged while waiting for trace marker"
                );
            }
            // Output ended without the marker. The marker may never appear;
            // that is the documented risk of the trace strategy, so stay
            // pending and rely on external cancellation.
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn wait_probe(port: u16, shared: &Shared) {
    loop {
        if shared.is_resolved() {
            return;
        }
        let attempt = TcpStream::connect((Ipv4Addr::LOCALHOST, port));
        match tokio::time::timeout(PROBE_CONNECT_TIMEOUT, attempt).await {
            Ok(Ok(_)) => {
                shared.resolve(ReadyState::Ready);
                return;
            }
            _ => tokio::time::sleep(PROBE_RETRY_DELAY).await,
        }
    }
}

/// Explicit monitor lookup keyed by process identity. The session manager
/// inserts a monitor when it spawns an adapter and removes it when the
/// session consuming it is disposed.
#[derive(Default)]
pub struct ReadinessRegistry {
    monitors: Mutex<HashMap<ProcessKey, Arc<ReadinessMonitor>>>,
}

impl ReadinessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: ProcessKey, monitor: Arc<ReadinessMonitor>) {
        self.monitors.lock().insert(key, monitor);
    }

    pub fn get(&self, key: ProcessKey) -> Option<Arc<ReadinessMonitor>> {
        self.monitors.lock().get(&key).cloned()
    }

    /// Remove and return the monitor for a process. The caller decides
    /// whether to cancel it.
    pub fn remove(&self, key: ProcessKey) -> Option<Arc<ReadinessMonitor>> {
        self.monitors.lock().remove(&key)
    }
}
