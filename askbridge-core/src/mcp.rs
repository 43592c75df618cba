//! JSON-RPC 2.0 tool service exposing the `ask` tool.
//!
//! Transport-agnostic: the stdio loop and the HTTP handler both feed raw
//! messages in and write whatever `Reply` comes back in their own framing.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::dispatcher::{CallerMode, Dispatched, Dispatcher};
use crate::projector::LiveStream;
use crate::request::Model;

pub const TOOL_NAME: &str = "ask";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Protocol revision answered when the client does not name one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";

/// What to send back for one inbound message.
pub enum Reply {
    /// Notification: nothing is written.
    None,
    Single(Value),
    /// Progress notifications followed by the response for `rpc_id`.
    Live {
        rpc_id: Value,
        progress_token: Value,
        events: LiveStream,
    },
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Single(v) => f.debug_tuple("Single").field(v).finish(),
            Self::Live { rpc_id, progress_token, .. } => f
                .debug_struct("Live")
                .field("rpc_id", rpc_id)
                .field("progress_token", progress_token)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

pub fn rpc_result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn rpc_error(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// Fixed handshake reply: echoes the client's protocol revision and
/// advertises the tools capability only.
fn initialize_result(params: &Value) -> Value {
    let version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);
    json!({
        "protocolVersion": version,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

#[derive(Clone)]
pub struct McpService {
    dispatcher: Dispatcher,
}

impl McpService {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// `tools/list` entry for the `ask` tool. Model choices follow the active profile.
    pub fn tool_descriptor(&self) -> Value {
        let profile = self.dispatcher.profile();
        let models: Vec<&str> = Model::ALL
            .iter()
            .filter(|m| profile.allows(**m))
            .map(|m| m.as_str())
            .collect();
        json!({
            "name": TOOL_NAME,
            "description": "Ask a search-grounded question. Returns the answer text and, when available, the sources it cites.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The question to answer." },
                    "model": { "type": "string", "enum": models, "default": profile.default_model.as_str() },
                    "stream": { "type": "boolean", "description": "Ask the upstream for an incremental response.", "default": profile.upstream_stream },
                    "search_mode": { "type": "string", "enum": ["web", "academic", "sec"] },
                    "recency_filter": { "type": "string", "enum": ["hour", "day", "week", "month", "year"] },
                    "reasoning_effort": { "type": "string", "enum": ["low", "medium", "high"] },
                    "max_tokens": { "type": "integer", "minimum": 1, "maximum": profile.max_tokens_ceiling },
                    "temperature": { "type": "number", "minimum": 0, "maximum": 2 },
                    "search_context_size": { "type": "string", "enum": ["low", "medium", "high"] }
                },
                "required": ["query"]
            }
        })
    }

    /// Handle one raw text message (a stdio line or an HTTP body).
    pub async fn handle_text(&self, text: &str, live_ok: bool) -> Reply {
        match serde_json::from_str::<Value>(text) {
            Ok(msg) => self.handle_message(msg, live_ok).await,
            Err(e) => Reply::Single(rpc_error(&Value::Null, PARSE_ERROR, &format!("parse error: {e}"))),
        }
    }

    /// Handle one decoded message. `live_ok` says whether the transport can
    /// carry progress frames for this request.
    pub async fn handle_message(&self, msg: Value, live_ok: bool) -> Reply {
        // `"id": null` is still a request; only a missing id makes a notification
        let has_id = msg.get("id").is_some();
        let req: RpcRequest = match serde_json::from_value(msg) {
            Ok(r) => r,
            Err(e) => {
                return Reply::Single(rpc_error(
                    &Value::Null,
                    INVALID_REQUEST,
                    &format!("invalid request: {e}"),
                ));
            }
        };
        if !has_id {
            debug!(method = %req.method, "notification ignored");
            return Reply::None;
        }
        let id = req.id.unwrap_or(Value::Null);
        debug!(method = %req.method, "rpc request");

        match req.method.as_str() {
            "initialize" => Reply::Single(rpc_result(&id, initialize_result(&req.params))),
            "ping" => Reply::Single(rpc_result(&id, json!({}))),
            "tools/list" => Reply::Single(rpc_result(&id, json!({ "tools": [self.tool_descriptor()] }))),
            "tools/call" => self.call_tool(id, &req.params, live_ok).await,
            other => Reply::Single(rpc_error(
                &id,
                METHOD_NOT_FOUND,
                &format!("method not found: {other}"),
            )),
        }
    }

    async fn call_tool(&self, id: Value, params: &Value, live_ok: bool) -> Reply {
        match params.get("name").and_then(Value::as_str) {
            Some(TOOL_NAME) => {}
            Some(other) => {
                return Reply::Single(rpc_error(&id, INVALID_PARAMS, &format!("unknown tool: {other}")));
            }
            None => return Reply::Single(rpc_error(&id, INVALID_PARAMS, "missing tool name")),
        }
        let args = params.get("arguments").cloned().unwrap_or(Value::Null);
        let progress_token = params
            .get("_meta")
            .and_then(|m| m.get("progressToken"))
            .filter(|t| t.is_string() || t.is_number())
            .cloned();

        let mode = match (&progress_token, live_ok) {
            (Some(_), true) => CallerMode::Live,
            _ => CallerMode::Consolidated,
        };

        match self.dispatcher.handle(&args, mode).await {
            Dispatched::Completed(result) => match serde_json::to_value(&result) {
                Ok(v) => Reply::Single(rpc_result(&id, v)),
                Err(e) => Reply::Single(rpc_error(&id, -32603, &format!("internal error: {e}"))),
            },
            Dispatched::Streamed(events) => Reply::Live {
                rpc_id: id,
                progress_token: progress_token.unwrap_or(Value::Null),
                events,
            },
        }
    }
}
