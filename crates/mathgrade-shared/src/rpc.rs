//! JSON-RPC 2.0 envelopes and control messages exchanged over the tool
//! endpoint's WebSocket.
//!
//! Two families of frames share the stream:
//! - JSON-RPC requests/responses (`jsonrpc`, `id`, `method`/`result`/`error`)
//! - control messages tagged by `type` (`welcome`, `ping`, `pong`, `error`)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const JSONRPC_VERSION: &str = "2.0";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_TOOLS_LIST: &str = "tools/list";

/// Host + port of a tool endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub host: String,
    pub port: u16,
}

impl EndpointAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// WebSocket URL for this endpoint
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for EndpointAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got '{}'", s))?;
        if host.is_empty() {
            return Err(format!("missing host in '{}'", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in '{}': {}", s, e))?;
        Ok(Self::new(host, port))
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn tools_call(id: u64, name: &str, arguments: Value) -> Self {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments,
        };
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: METHOD_TOOLS_CALL.to_string(),
            params: serde_json::to_value(params).ok(),
        }
    }

    pub fn tools_list(id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: METHOD_TOOLS_LIST.to_string(),
            params: None,
        }
    }
}

/// Parameters of a `tools/call` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Exactly one of `result` and `error` is present
    pub fn is_well_formed(&self) -> bool {
        self.result.is_some() != self.error.is_some()
    }

    /// Collapse the result/error pair. An envelope carrying both or neither
    /// is reported as an invalid-request error.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.error, self.result) {
            (Some(error), None) => Err(error),
            (None, Some(result)) => Ok(result),
            (Some(_), Some(_)) => Err(RpcError {
                code: crate::error::codes::INVALID_REQUEST,
                message: "response carried both result and error".to_string(),
                data: None,
            }),
            (None, None) => Err(RpcError {
                code: crate::error::codes::INVALID_REQUEST,
                message: "response carried neither result nor error".to_string(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Identity advertised in the welcome message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Non-RPC frames, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Welcome {
        message: String,
        server_info: ServerInfo,
    },
    Ping {
        timestamp: f64,
    },
    Pong {
        timestamp: f64,
        server_time: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_version: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
}

/// A frame received by the caller side
#[derive(Debug, Clone)]
pub enum Inbound {
    Control(ControlMessage),
    Response(RpcResponse),
}

impl Inbound {
    /// Classify and decode one text frame. Frames with a `type` field are
    /// control messages, everything else must be a JSON-RPC response.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("type").is_some() {
            Ok(Inbound::Control(serde_json::from_value(value)?))
        } else {
            Ok(Inbound::Response(serde_json::from_value(value)?))
        }
    }
}

/// Catalog entry returned by `tools/list`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Result body of `tools/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolList {
    pub tools: Vec<CapabilityDescriptor>,
}

/// Seconds since the Unix epoch with millisecond precision
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tools_call_serialization() {
        let req = RpcRequest::tools_call(7, "grade_question", json!({"score": 1}));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "tools/call");
        assert_eq!(json["params"]["name"], "grade_question");
        assert_eq!(json["params"]["arguments"]["score"], 1);
    }

    #[test]
    fn test_tools_list_has_no_params() {
        let json = serde_json::to_string(&RpcRequest::tools_list(1)).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_response_into_result() {
        let ok = RpcResponse::success(1, json!({"ok": true}));
        assert_eq!(ok.into_result().unwrap()["ok"], true);

        let err = RpcResponse::error(2, -32601, "unknown capability: nope");
        assert_eq!(err.into_result().unwrap_err().code, -32601);

        let empty = RpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: 3,
            result: None,
            error: None,
        };
        assert!(!empty.is_well_formed());
        assert!(empty.into_result().is_err());

        let both: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "result": {"ok": true},
            "error": {"code": -32603, "message": "boom"}
        }))
        .unwrap();
        assert!(!both.is_well_formed());
        assert_eq!(both.into_result().unwrap_err().code, -32600);
    }

    #[test]
    fn test_control_message_tags() {
        let ping = serde_json::to_value(ControlMessage::Ping { timestamp: 12.5 }).unwrap();
        assert_eq!(ping["type"], "ping");

        let welcome = r#"{"type":"welcome","message":"hi","server_info":{"version":"2.0","capabilities":["a"]}}"#;
        match Inbound::decode(welcome).unwrap() {
            Inbound::Control(ControlMessage::Welcome { server_info, .. }) => {
                assert_eq!(server_info.capabilities, vec!["a".to_string()]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_decode_response_frame() {
        let frame = r#"{"jsonrpc":"2.0","id":4,"result":{"tools":[]}}"#;
        match Inbound::decode(frame).unwrap() {
            Inbound::Response(resp) => assert_eq!(resp.id, 4),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(Inbound::decode(r#"{"jsonrpc":"2.0","result":{}}"#).is_err());
        assert!(Inbound::decode("not json").is_err());
    }

    #[test]
    fn test_endpoint_address_parse() {
        let addr: EndpointAddress = "localhost:8765".parse().unwrap();
        assert_eq!(addr, EndpointAddress::new("localhost", 8765));
        assert_eq!(addr.ws_url(), "ws://localhost:8765");
        assert!("localhost".parse::<EndpointAddress>().is_err());
        assert!(":80".parse::<EndpointAddress>().is_err());
    }
}
