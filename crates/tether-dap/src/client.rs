//! Protocol client over an established [`TransportChannel`].
//!
//! One background task owns the read half and routes incoming messages:
//! responses complete their pending request by sequence number, events are
//! forwarded to the session, and reverse requests are declined. The write
//! half lives behind an async mutex so any task holding a [`DapClient`]
//! handle can issue requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ServerTrace;
use crate::dap::codec::{DapReader, DapWriter};
use crate::dap::messages::{make_request, make_response, Event, Message, Request, Response};
use crate::dap::types::{
    Capabilities, ConfigurationDoneArguments, DisconnectArguments, InitializeRequestArguments,
    SetBreakpointsArguments, SetBreakpointsResponseBody, SetExceptionBreakpointsArguments,
    TerminateArguments, ThreadIdArguments, to_arguments,
};
use crate::dap::{DapError, Result};
use crate::error::{SessionError, SessionResult};
use crate::transport::{BoxedWriter, TransportChannel};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Cloneable handle to one connected debug-adapter server endpoint.
#[derive(Clone)]
pub struct DapClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: u64,
    trace: ServerTrace,
    next_seq: AtomicI64,
    closed: AtomicBool,
    pending: Mutex<HashMap<i64, oneshot::Sender<Response>>>,
    writer: tokio::sync::Mutex<Option<DapWriter<BoxedWriter>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl DapClient {
    /// Build the client over a channel and start the read loop. Returns the
    /// stream of server events alongside the handle.
    pub fn new(
        channel: TransportChannel,
        trace: ServerTrace,
    ) -> SessionResult<(Self, mpsc::UnboundedReceiver<Event>)> {
        let (reader, writer) = channel.into_parts().map_err(SessionError::Connection)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            trace,
            next_seq: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(Some(DapWriter::new(writer))),
            reader_task: Mutex::new(None),
        });

        let reader_task = tokio::spawn(read_loop(
            DapReader::new(reader),
            Arc::clone(&inner),
            events_tx,
        ));
        *inner.reader_task.lock() = Some(reader_task);

        Ok((Self { inner }, events_rx))
    }

    /// Stable identity of this server endpoint within the process.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Issue one request and await its response. A response with
    /// `success == false` is an error carrying the server's message.
    pub async fn request(&self, command: &str, arguments: Value) -> Result<Response> {
        if self.is_closed() {
            return Err(DapError::Closed);
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let request = make_request(seq, command, arguments);
        let payload = serde_json::to_value(&request)?;
        self.trace_outgoing(&request);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(seq, tx);

        let write_result = {
            let mut writer = self.inner.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer.write_value(&payload).await,
                None => Err(DapError::Closed),
            }
        };
        if let Err(err) = write_result {
            self.inner.pending.lock().remove(&seq);
            return Err(err);
        }

        let response = rx.await.map_err(|_| DapError::Closed)?;
        self.trace_incoming(&response);

        if !response.success {
            return Err(DapError::Request {
                command: command.to_string(),
                message: response
                    .message
                    .clone()
                    .unwrap_or_else(|| "request failed".to_string()),
            });
        }
        Ok(response)
    }

    async fn request_body<T>(&self, command: &str, arguments: Value) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let response = self.request(command, arguments).await?;
        match response.body {
            Some(body) => Ok(serde_json::from_value(body)?),
            None => Ok(T::default()),
        }
    }

    pub async fn initialize(&self, arguments: InitializeRequestArguments) -> Result<Capabilities> {
        let response = self.request("initialize", to_arguments(&arguments)).await?;
        match response.body {
            Some(Value::Null) | None => {
                tracing::warn!(
                    target: "tether.dap",
                    server = self.inner.id,
                    "adapter returned no capabilities from 'initialize'; using defaults"
                );
                Ok(Capabilities::default())
            }
            Some(body) => Ok(serde_json::from_value(body)?),
        }
    }

    pub async fn launch(&self, parameters: serde_json::Map<String, Value>) -> Result<()> {
        self.request("launch", Value::Object(parameters)).await?;
        Ok(())
    }

    pub async fn attach(&self, parameters: serde_json::Map<String, Value>) -> Result<()> {
        self.request("attach", Value::Object(parameters)).await?;
        Ok(())
    }

    pub async fn set_breakpoints(
        &self,
        arguments: SetBreakpointsArguments,
    ) -> Result<SetBreakpointsResponseBody> {
        self.request_body("setBreakpoints", to_arguments(&arguments))
            .await
    }

    pub async fn set_exception_breakpoints(
        &self,
        arguments: SetExceptionBreakpointsArguments,
    ) -> Result<()> {
        self.request("setExceptionBreakpoints", to_arguments(&arguments))
            .await?;
        Ok(())
    }

    pub async fn configuration_done(&self) -> Result<()> {
        self.request(
            "configurationDone",
            to_arguments(&ConfigurationDoneArguments::default()),
        )
        .await?;
        Ok(())
    }

    pub async fn disconnect(&self, arguments: DisconnectArguments) -> Result<()> {
        self.request("disconnect", to_arguments(&arguments)).await?;
        Ok(())
    }

    pub async fn terminate(&self, arguments: TerminateArguments) -> Result<()> {
        self.request("terminate", to_arguments(&arguments)).await?;
        Ok(())
    }

    // Execution control: simple one-shot requests over the established
    // channel.

    pub async fn continue_(&self, thread_id: i64) -> Result<()> {
        self.thread_request("continue", thread_id).await
    }

    pub async fn next(&self, thread_id: i64) -> Result<()> {
        self.thread_request("next", thread_id).await
    }

    pub async fn step_in(&self, thread_id: i64) -> Result<()> {
        self.thread_request("stepIn", thread_id).await
    }

    pub async fn step_out(&self, thread_id: i64) -> Result<()> {
        self.thread_request("stepOut", thread_id).await
    }

    pub async fn pause(&self, thread_id: i64) -> Result<()> {
        self.thread_request("pause", thread_id).await
    }

    async fn thread_request(&self, command: &str, thread_id: i64) -> Result<()> {
        self.request(command, to_arguments(&ThreadIdArguments { thread_id }))
            .await?;
        Ok(())
    }

    /// Close the transport and fail all outstanding requests. Idempotent;
    /// safe to call while requests are in flight.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(err) = writer.shutdown().await {
                tracing::debug!(
                    target: "tether.dap",
                    server = self.inner.id,
                    "transport shutdown failed: {err}"
                );
            }
        }
        if let Some(task) = self.inner.reader_task.lock().take() {
            task.abort();
        }
        // Outstanding requests observe the drop of their response senders.
        self.inner.pending.lock().clear();
    }

    fn trace_outgoing(&self, request: &Request) {
        match self.inner.trace {
            ServerTrace::Off => {}
            ServerTrace::Messages => tracing::debug!(
                target: "tether.dap.wire",
                server = self.inner.id,
                seq = request.seq,
                "--> {}", request.command
            ),
            ServerTrace::Verbose => tracing::debug!(
                target: "tether.dap.wire",
                server = self.inner.id,
                "--> {}",
                serde_json::to_string(request).unwrap_or_default()
            ),
        }
    }

    fn trace_incoming(&self, response: &Response) {
        match self.inner.trace {
            ServerTrace::Off => {}
            ServerTrace::Messages => tracing::debug!(
                target: "tether.dap.wire",
                server = self.inner.id,
                request_seq = response.request_seq,
                success = response.success,
                "<-- {}", response.command
            ),
            ServerTrace::Verbose => tracing::debug!(
                target: "tether.dap.wire",
                server = self.inner.id,
                "<-- {}",
                serde_json::to_string(response).unwrap_or_default()
            ),
        }
    }
}

async fn read_loop(
    mut reader: DapReader<crate::transport::BoxedReader>,
    inner: Arc<ClientInner>,
    events_tx: mpsc::UnboundedSender<Event>,
) {
    loop {
        let value = match reader.read_value().await {
            Ok(Some(value)) => value,
            Ok(None) => break,
            Err(err) => {
                if !inner.closed.load(Ordering::Acquire) {
                    tracing::debug!(
                        target: "tether.dap",
                        server = inner.id,
                        "read loop ended: {err}"
                    );
                }
                break;
            }
        };

        match Message::classify(value) {
            Ok(Message::Response(response)) => {
                let sender = inner.pending.lock().remove(&response.request_seq);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(response);
                    }
                    None => tracing::debug!(
                        target: "tether.dap",
                        server = inner.id,
                        request_seq = response.request_seq,
                        "response for unknown request"
                    ),
                }
            }
            Ok(Message::Event(event)) => {
                // A send error means the session stopped listening; keep
                // draining responses so in-flight requests still complete.
                let _ = events_tx.send(event);
            }
            Ok(Message::Request(request)) => {
                decline_reverse_request(&inner, &request).await;
            }
            Err(err) => {
                tracing::warn!(
                    target: "tether.dap",
                    server = inner.id,
                    "discarding malformed message: {err}"
                );
            }
        }
    }

    inner.closed.store(true, Ordering::Release);
    // Dropping the senders fails any request still waiting for a response.
    inner.pending.lock().clear();
}

/// Reverse requests (`runInTerminal`, `startDebugging`, ...) are not part of
/// this engine; decline them so well-behaved adapters can fall back.
async fn decline_reverse_request(inner: &Arc<ClientInner>, request: &Request) {
    tracing::debug!(
        target: "tether.dap",
        server = inner.id,
        command = %request.command,
        "declining reverse request"
    );
    let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
    let response = make_response(
        seq,
        request,
        false,
        None,
        Some(format!("unsupported request '{}'", request.command)),
    );
    let mut writer = inner.writer.lock().await;
    if let Some(writer) = writer.as_mut() {
        if let Ok(value) = serde_json::to_value(&response) {
            let _ = writer.write_value(&value).await;
        }
    }
}
