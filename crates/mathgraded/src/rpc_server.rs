//! RPC Server - WebSocket endpoint serving the tool registry

use crate::dispatch::ToolRegistry;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use mathgrade_shared::error::codes;
use mathgrade_shared::rpc::{
    unix_timestamp, ToolCallParams, ToolList, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use mathgrade_shared::{ControlMessage, RpcResponse, ServerInfo, PROTOCOL_VERSION};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Endpoint state shared across connections
pub struct EndpointState {
    pub version: String,
    pub registry: ToolRegistry,
}

impl EndpointState {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            registry,
        }
    }

    fn welcome(&self) -> ControlMessage {
        ControlMessage::Welcome {
            message: "Connected to mathgrade tool endpoint".to_string(),
            server_info: ServerInfo {
                version: self.version.clone(),
                capabilities: self.registry.names(),
            },
        }
    }
}

/// Accept connections forever, one task per connection
pub async fn serve(listener: TcpListener, state: Arc<EndpointState>) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("Failed to read listener address")?;
    info!(
        "Tool endpoint listening on ws://{} ({} capabilities)",
        addr,
        state.registry.len()
    );

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, state).await {
                        warn!("Connection {} ended with error: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Drive one WebSocket connection to completion
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<EndpointState>,
) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    info!("Caller connected from {}", peer);

    let (mut sink, mut source) = ws.split();

    // Welcome goes out before any request is read.
    let welcome = serde_json::to_string(&state.welcome())?;
    sink.send(Message::Text(welcome.into()))
        .await
        .context("Failed to send welcome")?;

    // Frames are handled one at a time, in arrival order.
    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Read error from {}: {}", peer, e);
                break;
            }
        };

        if let Some(reply) = handle_frame(text.as_str(), &state).await {
            sink.send(Message::Text(reply.into()))
                .await
                .context("Failed to send reply")?;
        }
    }

    let _ = sink.close().await;
    info!("Caller {} disconnected", peer);
    Ok(())
}

/// Handle one inbound text frame, returning the reply frame if any.
///
/// Control `ping` gets a `pong`. Other control types and frames without a
/// usable id are dropped. Everything else gets exactly one response.
pub async fn handle_frame(text: &str, state: &EndpointState) -> Option<String> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Dropping unparseable frame: {}", e);
            return None;
        }
    };

    if value.get("type").is_some() {
        return handle_control(value, state);
    }

    let id = match value.get("id").and_then(Value::as_u64) {
        Some(id) => id,
        None => {
            warn!("Dropping request without id");
            return None;
        }
    };

    let response = handle_request(id, &value, state).await;
    serde_json::to_string(&response).ok()
}

fn handle_control(value: Value, state: &EndpointState) -> Option<String> {
    match serde_json::from_value::<ControlMessage>(value) {
        Ok(ControlMessage::Ping { timestamp }) => {
            let pong = ControlMessage::Pong {
                timestamp,
                server_time: unix_timestamp(),
                server_version: Some(state.version.clone()),
            };
            serde_json::to_string(&pong).ok()
        }
        Ok(other) => {
            debug!("Ignoring control message {:?}", other);
            None
        }
        Err(e) => {
            debug!("Ignoring unknown control message: {}", e);
            None
        }
    }
}

async fn handle_request(id: u64, request: &Value, state: &EndpointState) -> RpcResponse {
    let method = match request.get("method").and_then(Value::as_str) {
        Some(m) => m,
        None => return RpcResponse::error(id, codes::INVALID_REQUEST, "missing method"),
    };

    match method {
        METHOD_TOOLS_LIST => {
            let list = ToolList {
                tools: state.registry.list_capabilities(),
            };
            match serde_json::to_value(list) {
                Ok(result) => RpcResponse::success(id, result),
                Err(e) => RpcResponse::error(id, codes::INTERNAL_ERROR, e.to_string()),
            }
        }
        METHOD_TOOLS_CALL => {
            let params = request.get("params").cloned().unwrap_or(Value::Null);
            let params: ToolCallParams = match serde_json::from_value(params) {
                Ok(p) => p,
                Err(e) => {
                    return RpcResponse::error(
                        id,
                        codes::INVALID_PARAMS,
                        format!("invalid tools/call params: {}", e),
                    )
                }
            };
            info!(id, capability = %params.name, "tools/call");
            match state.registry.invoke(&params.name, params.arguments).await {
                Ok(result) => RpcResponse::success(id, result),
                Err(e) => RpcResponse::error(id, e.code(), e.to_string()),
            }
        }
        other => RpcResponse::error(
            id,
            codes::METHOD_NOT_FOUND,
            format!("unknown method: {}", other),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use mathgrade_shared::CapabilitySelector;
    use serde_json::json;

    fn state() -> EndpointState {
        let backend = Arc::new(
            ScriptedBackend::builder()
                .reply("grade_question", r#"{"is_correct": true, "score": 10}"#)
                .build(),
        );
        EndpointState::new(ToolRegistry::standard(
            backend,
            CapabilitySelector::default(),
            2000,
        ))
    }

    async fn reply(frame: Value) -> Option<Value> {
        handle_frame(&frame.to_string(), &state())
            .await
            .map(|s| serde_json::from_str(&s).unwrap())
    }

    #[tokio::test]
    async fn test_ping_pong_echoes_timestamp() {
        let pong = reply(json!({"type": "ping", "timestamp": 42.5})).await.unwrap();
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["timestamp"], 42.5);
        assert_eq!(pong["server_version"], "2.0");
    }

    #[tokio::test]
    async fn test_dropped_frames() {
        assert!(handle_frame("{not json", &state()).await.is_none());
        assert!(reply(json!({"type": "subscribe"})).await.is_none());
        assert!(reply(json!({"jsonrpc": "2.0", "method": "tools/list"})).await.is_none());
    }

    #[tokio::test]
    async fn test_bad_shapes_get_errors() {
        let missing_method = reply(json!({"jsonrpc": "2.0", "id": 1})).await.unwrap();
        assert_eq!(missing_method["error"]["code"], codes::INVALID_REQUEST);

        let bad_params = reply(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"arguments": {}}}))
            .await
            .unwrap();
        assert_eq!(bad_params["error"]["code"], codes::INVALID_PARAMS);

        let unknown_method = reply(json!({"jsonrpc": "2.0", "id": 3, "method": "resources/list"}))
            .await
            .unwrap();
        assert_eq!(unknown_method["error"]["code"], codes::METHOD_NOT_FOUND);
        assert_eq!(unknown_method["id"], 3);
    }

    #[tokio::test]
    async fn test_tools_call_success() {
        let frame = json!({
            "jsonrpc": "2.0",
            "id": 9,
            "method": "tools/call",
            "params": {
                "name": "grade_question",
                "arguments": {"question_text": "1+1", "student_answer": "2", "grade_level": "grade 1"}
            }
        });
        let response = reply(frame).await.unwrap();
        assert_eq!(response["id"], 9);
        assert_eq!(response["result"]["content"][0]["type"], "text");
    }
}
