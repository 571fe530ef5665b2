//! RPC Client - WebSocket connection to a tool endpoint
//!
//! One `Connection` owns one stream. A reader task routes inbound frames to
//! the waiter registered under the response id; a writer task drains the
//! outbound channel. Several calls may be outstanding at once.
//!
//! This layer never retries. Every failure comes back as a `TransportError`.

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use mathgrade_shared::config::ClientConfig;
use mathgrade_shared::error::codes;
use mathgrade_shared::rpc::{unix_timestamp, RpcRequest, ToolList};
use mathgrade_shared::{
    CapabilityDescriptor, ControlMessage, EndpointAddress, Inbound, RpcResponse, ServerInfo,
    TransportError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Waiter = oneshot::Sender<Result<Value, TransportError>>;

/// Lifecycle of a connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

/// State shared between the connection handle and its reader task
struct Shared {
    state: ConnectionState,
    /// Next request id; every id below it has been issued
    next_id: u64,
    pending: HashMap<u64, Waiter>,
    /// Single outstanding keepalive; a newer ping replaces an older one
    ping: Option<oneshot::Sender<f64>>,
    tx_out: Option<mpsc::Sender<Message>>,
}

impl Shared {
    fn shut_down(&mut self) {
        self.state = ConnectionState::Closed;
        self.tx_out = None;
        self.ping = None;
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(TransportError::Closed));
        }
    }

    /// The peer answered with an id we never issued: nothing on this
    /// connection can be trusted any more.
    fn violate(&mut self, received: &str) {
        error!(
            received,
            pending = self.pending.len(),
            "Protocol violation: response id was never issued; closing connection"
        );
        self.state = ConnectionState::Closed;
        self.tx_out = None;
        self.ping = None;
        for (id, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(TransportError::ResponseMismatch {
                expected: id,
                received: received.to_string(),
            }));
        }
    }
}

/// Removes a pending entry when the caller stops waiting before the call
/// finishes, e.g. when its future is dropped by `select!`.
struct PendingGuard {
    shared: Arc<Mutex<Shared>>,
    id: u64,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.id;
        if let Ok(mut st) = self.shared.try_lock() {
            st.pending.remove(&id);
            debug!(id, "call abandoned");
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            handle.spawn(async move {
                shared.lock().await.pending.remove(&id);
            });
        }
    }
}

pub struct Connection {
    addr: EndpointAddress,
    server_info: ServerInfo,
    shared: Arc<Mutex<Shared>>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Open with the configured connect and handshake timeouts
    pub async fn open(addr: EndpointAddress, config: &ClientConfig) -> Result<Self, TransportError> {
        Self::open_with(addr, config.connect_timeout(), config.handshake_timeout()).await
    }

    pub async fn open_with(
        addr: EndpointAddress,
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self, TransportError> {
        debug!(%addr, "connecting");
        let ws = match timeout(connect_timeout, connect_async(addr.ws_url())).await {
            Err(_) => return Err(TransportError::ConnectTimeout(addr)),
            Ok(Err(e)) => {
                return Err(TransportError::ConnectionRefused {
                    addr,
                    reason: e.to_string(),
                })
            }
            Ok(Ok((ws, _))) => ws,
        };

        let (mut sink, mut source) = ws.split();

        let server_info = match timeout(handshake_timeout, read_welcome(&mut source)).await {
            Err(_) => {
                return Err(TransportError::Handshake {
                    addr,
                    reason: format!("no welcome within {:?}", handshake_timeout),
                })
            }
            Ok(Err(reason)) => return Err(TransportError::Handshake { addr, reason }),
            Ok(Ok(info)) => info,
        };
        info!(
            %addr,
            version = %server_info.version,
            capabilities = server_info.capabilities.len(),
            "connected to tool endpoint"
        );

        let (tx_out, mut rx_out) = mpsc::channel::<Message>(64);
        tokio::spawn(async move {
            while let Some(message) = rx_out.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let shared = Arc::new(Mutex::new(Shared {
            state: ConnectionState::Open,
            next_id: 1,
            pending: HashMap::new(),
            ping: None,
            tx_out: Some(tx_out),
        }));
        let reader = tokio::spawn(run_reader(source, Arc::clone(&shared)));

        Ok(Self {
            addr,
            server_info,
            shared,
            reader,
        })
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.addr
    }

    /// Identity advertised in the welcome
    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.lock().await.state
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == ConnectionState::Open
    }

    /// Calls waiting for a response
    pub async fn pending_count(&self) -> usize {
        self.shared.lock().await.pending.len()
    }

    /// Invoke one capability and wait at most `wait` for its response
    pub async fn call(
        &self,
        capability: &str,
        args: Value,
        wait: Duration,
    ) -> Result<Value, TransportError> {
        self.request(|id| RpcRequest::tools_call(id, capability, args), wait)
            .await
    }

    /// Fetch the endpoint's catalog
    pub async fn list_capabilities(
        &self,
        wait: Duration,
    ) -> Result<Vec<CapabilityDescriptor>, TransportError> {
        let result = self.request(RpcRequest::tools_list, wait).await?;
        serde_json::from_value::<ToolList>(result)
            .map(|list| list.tools)
            .map_err(|e| TransportError::Remote {
                code: codes::PARSE_ERROR,
                message: format!("malformed tool list: {}", e),
            })
    }

    async fn request<F>(&self, build: F, wait: Duration) -> Result<Value, TransportError>
    where
        F: FnOnce(u64) -> RpcRequest,
    {
        let (tx, rx) = oneshot::channel();
        let (id, out, frame) = {
            let mut st = self.shared.lock().await;
            if st.state != ConnectionState::Open {
                return Err(TransportError::Closed);
            }
            let out = st.tx_out.clone().ok_or(TransportError::Closed)?;
            let id = st.next_id;
            let frame = serde_json::to_string(&build(id)).map_err(|e| TransportError::Remote {
                code: codes::INVALID_PARAMS,
                message: format!("failed to encode request: {}", e),
            })?;
            st.next_id += 1;
            st.pending.insert(id, tx);
            (id, out, frame)
        };

        let mut guard = PendingGuard {
            shared: Arc::clone(&self.shared),
            id,
            armed: true,
        };

        debug!(id, "sending request");
        if out.send(Message::Text(frame.into())).await.is_err() {
            self.shared.lock().await.pending.remove(&id);
            guard.armed = false;
            return Err(TransportError::Closed);
        }

        let outcome = timeout(wait, rx).await;
        guard.armed = false;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.shared.lock().await.pending.remove(&id);
                warn!(id, "request timed out after {:?}", wait);
                Err(TransportError::RequestTimeout { id, timeout: wait })
            }
        }
    }

    /// Ping the endpoint. True only when a pong echoing our timestamp
    /// arrives within `wait`.
    pub async fn keepalive(&self, wait: Duration) -> bool {
        let timestamp = unix_timestamp();
        let (tx, rx) = oneshot::channel();
        let out = {
            let mut st = self.shared.lock().await;
            if st.state != ConnectionState::Open {
                return false;
            }
            st.ping = Some(tx);
            match st.tx_out.clone() {
                Some(out) => out,
                None => return false,
            }
        };

        let frame = match serde_json::to_string(&ControlMessage::Ping { timestamp }) {
            Ok(frame) => frame,
            Err(_) => return false,
        };
        if out.send(Message::Text(frame.into())).await.is_err() {
            return false;
        }

        match timeout(wait, rx).await {
            Ok(Ok(echo)) => (echo - timestamp).abs() < 1e-6,
            _ => {
                debug!("keepalive got no pong within {:?}", wait);
                false
            }
        }
    }

    /// Close the connection. Pending calls fail with `Closed`; calling it
    /// again does nothing.
    pub async fn close(&self) {
        let mut st = self.shared.lock().await;
        if st.state == ConnectionState::Closed {
            return;
        }
        info!(addr = %self.addr, "closing connection");
        // Dropping the outbound sender lets the writer send a close frame.
        st.shut_down();
        drop(st);
        self.reader.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_welcome(source: &mut SplitStream<WsStream>) -> Result<ServerInfo, String> {
    loop {
        let text = match source.next().await {
            None => return Err("stream closed before welcome".to_string()),
            Some(Err(e)) => return Err(e.to_string()),
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) => return Err("endpoint closed during handshake".to_string()),
            Some(Ok(_)) => continue,
        };
        return match Inbound::decode(text.as_str()) {
            Ok(Inbound::Control(ControlMessage::Welcome { server_info, .. })) => Ok(server_info),
            Ok(other) => Err(format!("expected welcome, got {:?}", other)),
            Err(e) => Err(format!("malformed welcome: {}", e)),
        };
    }
}

async fn run_reader(mut source: SplitStream<WsStream>, shared: Arc<Mutex<Shared>>) {
    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("read failed: {}", e);
                break;
            }
        };
        if !route_frame(text.as_str(), &shared).await {
            return;
        }
    }

    let mut st = shared.lock().await;
    if st.state != ConnectionState::Closed {
        warn!("endpoint closed the stream");
        st.shut_down();
    }
}

/// Deliver one inbound frame. False once the connection has been shut down
/// for a protocol violation.
async fn route_frame(text: &str, shared: &Mutex<Shared>) -> bool {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            shared.lock().await.violate("<unparseable frame>");
            return false;
        }
    };

    if value.get("type").is_some() {
        match serde_json::from_value::<ControlMessage>(value) {
            Ok(ControlMessage::Pong { timestamp, .. }) => {
                if let Some(waiter) = shared.lock().await.ping.take() {
                    let _ = waiter.send(timestamp);
                }
            }
            Ok(ControlMessage::Error { message, .. }) => warn!("endpoint reported: {}", message),
            Ok(other) => debug!("ignoring control message {:?}", other),
            Err(e) => warn!("dropping unknown control message: {}", e),
        }
        return true;
    }

    let received = value
        .get("id")
        .map(|id| id.to_string())
        .unwrap_or_else(|| "<none>".to_string());
    let response: RpcResponse = match serde_json::from_value::<RpcResponse>(value) {
        Ok(response) if response.is_well_formed() => response,
        _ => {
            shared.lock().await.violate(&received);
            return false;
        }
    };

    let mut st = shared.lock().await;
    if let Some(waiter) = st.pending.remove(&response.id) {
        debug!(id = response.id, "routing response");
        let result = response
            .into_result()
            .map_err(|e| TransportError::Remote {
                code: e.code,
                message: e.message,
            });
        let _ = waiter.send(result);
        true
    } else if response.id >= 1 && response.id < st.next_id {
        debug!(id = response.id, "discarding late response");
        true
    } else {
        st.violate(&received);
        false
    }
}
