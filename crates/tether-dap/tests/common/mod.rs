//! A scripted debug-adapter double speaking real DAP framing.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};

use tether_dap::dap::codec::{DapReader, DapWriter};
use tether_dap::dap::messages::{make_event, make_response, Request};

pub struct FakeAdapter {
    /// Capabilities body returned from `initialize`.
    pub capabilities: Value,
    /// Reject the `initialize` request.
    pub fail_initialize: bool,
    /// Reject every `setBreakpoints` request.
    pub fail_set_breakpoints: bool,
    /// Fixed body for `setBreakpoints` responses. When `None`, every
    /// requested breakpoint is verified with a fresh id, in request order.
    pub breakpoint_results: Option<Value>,
    /// Emit a `stopped` event right after answering `configurationDone`.
    pub stop_on_configuration_done: bool,
}

impl Default for FakeAdapter {
    fn default() -> Self {
        Self {
            capabilities: json!({
                "supportsConfigurationDoneRequest": true,
            }),
            fail_initialize: false,
            fail_set_breakpoints: false,
            breakpoint_results: None,
            stop_on_configuration_done: false,
        }
    }
}

#[derive(Clone)]
pub struct FakeAdapterHandle {
    pub requests: Arc<Mutex<Vec<Request>>>,
    pub connections: Arc<AtomicUsize>,
}

impl FakeAdapterHandle {
    fn new() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Requests received so far for one command.
    pub fn requests_for(&self, command: &str) -> Vec<Request> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.command == command)
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl FakeAdapter {
    /// Serve a single duplex stream.
    pub fn serve<S>(self, stream: S) -> FakeAdapterHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let handle = FakeAdapterHandle::new();
        handle.connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve_connection(Arc::new(self), stream, handle.clone()));
        handle
    }

    /// Listen on an ephemeral loopback port, serving every accepted
    /// connection (readiness probes included) against the same request log.
    pub async fn listen(self) -> (u16, FakeAdapterHandle) {
        let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind fake adapter");
        let port = listener.local_addr().unwrap().port();
        let handle = FakeAdapterHandle::new();
        let accept_handle = handle.clone();
        let adapter = Arc::new(self);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_handle.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(
                    Arc::clone(&adapter),
                    stream,
                    accept_handle.clone(),
                ));
            }
        });
        (port, handle)
    }
}

async fn serve_connection<S>(adapter: Arc<FakeAdapter>, stream: S, handle: FakeAdapterHandle)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = DapReader::new(read_half);
    let mut writer = DapWriter::new(write_half);
    let next_seq = AtomicI64::new(1);
    let next_breakpoint_id = AtomicI64::new(1);

    while let Ok(Some(value)) = reader.read_value().await {
        let Ok(request) = serde_json::from_value::<Request>(value) else {
            continue;
        };
        handle.requests.lock().push(request.clone());

        let mut alloc_seq = || next_seq.fetch_add(1, Ordering::Relaxed);
        let (success, body, message) = match request.command.as_str() {
            "initialize" => {
                if adapter.fail_initialize {
                    (false, None, Some("unsupported client".to_string()))
                } else {
                    (true, Some(adapter.capabilities.clone()), None)
                }
            }
            "setBreakpoints" => {
                if adapter.fail_set_breakpoints {
                    (false, None, Some("breakpoints rejected".to_string()))
                } else {
                    let body = match &adapter.breakpoint_results {
                        Some(body) => body.clone(),
                        None => default_breakpoint_results(&request, &next_breakpoint_id),
                    };
                    (true, Some(body), None)
                }
            }
            _ => (true, None, None),
        };

        let response = make_response(alloc_seq(), &request, success, body, message);
        if writer
            .write_value(&serde_json::to_value(&response).unwrap())
            .await
            .is_err()
        {
            break;
        }

        // Adapters send `initialized` after replying to launch/attach.
        let follow_up = match request.command.as_str() {
            "launch" | "attach" if success => Some(make_event(alloc_seq(), "initialized", None)),
            "configurationDone" if adapter.stop_on_configuration_done => Some(make_event(
                alloc_seq(),
                "stopped",
                Some(json!({"reason": "breakpoint", "threadId": 1})),
            )),
            "continue" => Some(make_event(
                alloc_seq(),
                "continued",
                Some(json!({"threadId": 1})),
            )),
            _ => None,
        };
        if let Some(event) = follow_up {
            if writer
                .write_value(&serde_json::to_value(&event).unwrap())
                .await
                .is_err()
            {
                break;
            }
        }

        if request.command == "disconnect" {
            break;
        }
    }
}

fn default_breakpoint_results(request: &Request, next_id: &AtomicI64) -> Value {
    let requested = request.arguments["breakpoints"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let results: Vec<Value> = requested
        .iter()
        .map(|_| {
            json!({
                "verified": true,
                "id": next_id.fetch_add(1, Ordering::Relaxed),
            })
        })
        .collect();
    json!({ "breakpoints": results })
}
