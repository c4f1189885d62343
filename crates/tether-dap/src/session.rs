//! Debug session orchestration.
//!
//! A [`DebugSession`] ties the pieces together: wait for the readiness
//! monitor, open the transport, build the protocol client, run the
//! initialize/launch-or-attach handshake, and hand the negotiated
//! capabilities to the breakpoint synchronizer and exception-filter
//! registry. Teardown is guaranteed: whatever the protocol-level disconnect
//! does, the session ends `Terminated` with its transport closed.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::breakpoints::BreakpointSynchronizer;
use crate::client::DapClient;
use crate::config::{AdapterConfig, DebugMode};
use crate::dap::messages::Event;
use crate::dap::types::{
    BreakpointEventBody, Capabilities, DisconnectArguments, InitializeRequestArguments,
    OutputEventBody, StoppedEventBody, TerminateArguments,
};
use crate::error::{SessionError, SessionResult};
use crate::exceptions::ExceptionFilterRegistry;
use crate::process::AdapterProcess;
use crate::readiness::ReadinessMonitor;
use crate::transport::{TraceSink, TransportChannel};

/// How long the protocol-level `terminate`/`disconnect` may take before the
/// transport is closed underneath it.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Running,
    Suspended,
    Terminating,
    Terminated,
}

pub struct SessionParams {
    pub config: AdapterConfig,
    /// The spawned adapter, when this session launched one. Absent for
    /// attach-to-remote setups.
    pub process: Option<Arc<AdapterProcess>>,
    pub readiness: Arc<ReadinessMonitor>,
    pub breakpoints: Arc<BreakpointSynchronizer>,
    pub exceptions: Arc<ExceptionFilterRegistry>,
    /// Optional byte-level transport tracing.
    pub byte_trace: Option<Arc<dyn TraceSink>>,
}

pub struct DebugSession {
    /// Self-reference handed to background tasks that may outlive a caller's
    /// borrow (event pump, adapter-initiated teardown).
    weak: Weak<DebugSession>,
    config: AdapterConfig,
    process: Option<Arc<AdapterProcess>>,
    readiness: Arc<ReadinessMonitor>,
    breakpoints: Arc<BreakpointSynchronizer>,
    exceptions: Arc<ExceptionFilterRegistry>,
    byte_trace: Option<Arc<dyn TraceSink>>,
    state: watch::Sender<SessionState>,
    initialized: watch::Sender<bool>,
    client: Mutex<Option<DapClient>>,
    capabilities: Mutex<Option<Capabilities>>,
    sent_terminate_request: AtomicBool,
    /// A `stopped` event that arrived while still `Connecting` (stop-on-entry
    /// adapters); applied once the connect completes.
    pending_suspend: AtomicBool,
    event_pump: Mutex<Option<JoinHandle<()>>>,
}

impl DebugSession {
    pub fn new(params: SessionParams) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Connecting);
        let (initialized, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config: params.config,
            process: params.process,
            readiness: params.readiness,
            breakpoints: params.breakpoints,
            exceptions: params.exceptions,
            byte_trace: params.byte_trace,
            state,
            initialized,
            client: Mutex::new(None),
            capabilities: Mutex::new(None),
            sent_terminate_request: AtomicBool::new(false),
            pending_suspend: AtomicBool::new(false),
            event_pump: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The capabilities negotiated during `connect`, once available.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities.lock().clone()
    }

    pub fn breakpoints(&self) -> &Arc<BreakpointSynchronizer> {
        &self.breakpoints
    }

    pub fn exceptions(&self) -> &Arc<ExceptionFilterRegistry> {
        &self.exceptions
    }

    /// The protocol client, once connected. Execution-control calls go
    /// straight through it.
    pub fn client(&self) -> Option<DapClient> {
        self.client.lock().clone()
    }

    /// Establish the session: await readiness, open the transport, perform
    /// the handshake and run the configuration phase.
    ///
    /// Cancelling the token aborts the attempt with [`SessionError::Aborted`];
    /// no transport is opened when the readiness wait is cancelled.
    pub async fn connect(&self, cancel: CancellationToken) -> SessionResult<()> {
        tokio::select! {
            _ = cancel.cancelled() => {
                self.readiness.cancel();
                return Err(SessionError::Aborted);
            }
            ready = self.readiness.wait() => ready?,
        }

        let channel = self.open_channel().await?;
        let channel = match &self.byte_trace {
            Some(sink) => channel.with_trace(Arc::clone(sink)),
            None => channel,
        };

        let (client, events) = DapClient::new(channel, self.config.trace)?;
        *self.client.lock() = Some(client.clone());
        self.spawn_event_pump(events);

        if let Err(err) = self.handshake(&client, &cancel).await {
            client.shutdown().await;
            return Err(err);
        }

        self.set_state(SessionState::Connected);
        if self.pending_suspend.swap(false, Ordering::AcqRel) {
            self.set_state(SessionState::Suspended);
        } else {
            // Leave a concurrent `stopped` event alone: only an untouched
            // Connected session starts out running.
            self.set_state_if(SessionState::Connected, SessionState::Running);
        }
        Ok(())
    }

    async fn open_channel(&self) -> SessionResult<TransportChannel> {
        // A known port wins; otherwise the session talks to the spawned
        // process over its standard streams.
        if let Some(port) = self.readiness.port() {
            return TransportChannel::open_socket(port).await;
        }
        let streams = self.process.as_ref().and_then(|process| process.take_stdio());
        match streams {
            Some((stdin, stdout)) => Ok(TransportChannel::open_process_streams(stdin, stdout)),
            None => Err(SessionError::Connection(io::Error::new(
                io::ErrorKind::NotConnected,
                "no adapter port known and no process streams available",
            ))),
        }
    }

    async fn handshake(
        &self,
        client: &DapClient,
        cancel: &CancellationToken,
    ) -> SessionResult<()> {
        let capabilities = client
            .initialize(InitializeRequestArguments::for_adapter(
                &self.config.adapter_id,
            ))
            .await
            .map_err(|err| handshake_error("initialize", err))?;
        *self.capabilities.lock() = Some(capabilities.clone());

        let parameters = self.config.dap_parameters();

        // The launch/attach response and the configuration phase overlap:
        // many adapters answer `launch` only after `configurationDone`, so
        // the two must not be sequenced.
        let launch_attach = async {
            match self.config.mode {
                DebugMode::Launch => client.launch(parameters).await,
                DebugMode::Attach => client.attach(parameters).await,
            }
            .map_err(|err| handshake_error(self.config.mode.as_request(), err))
        };

        let configuration = async {
            self.wait_initialized(cancel).await?;
            if self.config.debug {
                // Sync failures are isolated; they must not abort the
                // connect.
                self.breakpoints.initialize(client, &capabilities).await;
                if !capabilities.exception_breakpoint_filters.is_empty() {
                    if let Err(err) = self
                        .exceptions
                        .initialize(client, &capabilities.exception_breakpoint_filters)
                        .await
                    {
                        tracing::warn!(target: "tether.dap", "{err}");
                    }
                }
            }
            if capabilities.supports_configuration_done_request {
                client
                    .configuration_done()
                    .await
                    .map_err(|err| handshake_error("configurationDone", err))?;
            }
            Ok(())
        };

        tokio::try_join!(launch_attach, configuration)?;
        Ok(())
    }

    async fn wait_initialized(&self, cancel: &CancellationToken) -> SessionResult<()> {
        let mut initialized = self.initialized.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Aborted),
            result = initialized.wait_for(|ready| *ready) => {
                result.map(|_| ()).map_err(|_| SessionError::Aborted)
            }
        }
    }

    /// End the session. Idempotent, never fails: teardown errors are
    /// logged, the transport is closed even if the protocol-level
    /// disconnect hangs, and the state is `Terminated` afterwards no matter
    /// what.
    pub async fn terminate(&self) {
        let first = self.state.send_if_modified(|state| match *state {
            SessionState::Terminating | SessionState::Terminated => false,
            _ => {
                *state = SessionState::Terminating;
                true
            }
        });
        if !first {
            return;
        }

        self.readiness.cancel();

        let client = self.client.lock().clone();
        if let Some(client) = client {
            let request = self.teardown_request(&client);
            match tokio::time::timeout(TERMINATE_GRACE, request).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::debug!(target: "tether.dap", "teardown request failed: {err}")
                }
                Err(_) => {
                    tracing::debug!(target: "tether.dap", "teardown request timed out")
                }
            }
            // The transport closes regardless of what the request did.
            client.shutdown().await;
            self.breakpoints.remove_server(client.id());
            self.exceptions.remove_server(client.id());
        }

        if let Some(pump) = self.event_pump.lock().take() {
            pump.abort();
        }
        if let Some(process) = &self.process {
            process.kill();
        }

        self.state.send_if_modified(|state| {
            *state = SessionState::Terminated;
            true
        });
    }

    /// Graceful teardown per the protocol guidelines: a launched debuggee
    /// gets one `terminate` request when the adapter supports it; attach
    /// sessions (and retries) disconnect without terminating the debuggee.
    async fn teardown_request(&self, client: &DapClient) -> crate::dap::Result<()> {
        let supports_terminate = self
            .capabilities()
            .map(|capabilities| capabilities.supports_terminate_request)
            .unwrap_or(false);
        let use_terminate = self.config.mode == DebugMode::Launch
            && supports_terminate
            && !self.sent_terminate_request.swap(true, Ordering::AcqRel);

        if use_terminate {
            client.terminate(TerminateArguments::default()).await
        } else {
            client.disconnect(DisconnectArguments::default()).await
        }
    }

    fn spawn_event_pump(&self, mut events: mpsc::UnboundedReceiver<Event>) {
        let session = self.weak.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.handle_event(event);
            }
        });
        *self.event_pump.lock() = Some(pump);
    }

    fn handle_event(&self, event: Event) {
        match event.event.as_str() {
            "initialized" => {
                let _ = self.initialized.send(true);
            }
            "stopped" => {
                let body: StoppedEventBody = parse_body(event.body);
                tracing::debug!(
                    target: "tether.dap",
                    reason = %body.reason,
                    thread = ?body.thread_id,
                    "debuggee stopped"
                );
                if !self.set_state(SessionState::Suspended) {
                    // Still connecting (stop-on-entry): apply once the
                    // handshake finishes.
                    self.pending_suspend.store(true, Ordering::Release);
                }
            }
            "continued" => {
                self.set_state(SessionState::Running);
            }
            "output" => {
                let body: OutputEventBody = parse_body(event.body);
                let category = body.category.as_deref().unwrap_or("console");
                let output = body.output.trim_end_matches('\n');
                if !output.is_empty() {
                    tracing::info!(target: "tether.dap.output", category, "{output}");
                }
            }
            "breakpoint" => {
                let body: BreakpointEventBody = match event
                    .body
                    .map(serde_json::from_value)
                    .transpose()
                {
                    Ok(Some(body)) => body,
                    _ => return,
                };
                if body.reason == "changed" {
                    self.breakpoints.apply_breakpoint_event(&body.breakpoint);
                }
            }
            "terminated" | "exited" => {
                tracing::debug!(target: "tether.dap", event = %event.event, "session ended by adapter");
                if let Some(session) = self.weak.upgrade() {
                    // Off this task: terminate() aborts the event pump,
                    // which is where this handler runs.
                    tokio::spawn(async move { session.terminate().await });
                }
            }
            other => {
                tracing::trace!(target: "tether.dap", event = other, "unhandled event");
            }
        }
    }

    /// Apply a state transition if the machine allows it. Returns whether
    /// the transition happened.
    fn set_state(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            let allowed = match (*state, next) {
                (SessionState::Terminated, _) => false,
                (SessionState::Terminating, SessionState::Terminated) => true,
                (SessionState::Terminating, _) => false,
                // Terminating is reachable from any non-terminal state.
                (_, SessionState::Terminating) => true,
                (SessionState::Connecting, SessionState::Connected) => true,
                (SessionState::Connecting, _) => false,
                (SessionState::Connected, SessionState::Running | SessionState::Suspended) => true,
                (SessionState::Running, SessionState::Suspended) => true,
                (SessionState::Suspended, SessionState::Running) => true,
                _ => false,
            };
            if allowed {
                *state = next;
            }
            allowed
        })
    }

    fn set_state_if(&self, expected: SessionState, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == expected {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

fn handshake_error(request: &'static str, err: crate::dap::DapError) -> SessionError {
    SessionError::Handshake {
        request,
        message: err.to_string(),
    }
}

fn parse_body<T: serde::de::DeserializeOwned + Default>(body: Option<serde_json::Value>) -> T {
    body.and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}
