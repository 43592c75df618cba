use std::convert::Infallible;
use std::net::SocketAddr;

use askbridge_core::mcp::{McpService, PARSE_ERROR, Reply, rpc_error};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::info;

#[derive(Clone)]
struct AppState {
    service: McpService,
}

pub fn router(service: McpService) -> Router {
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(AppState { service })
}

pub async fn serve(service: McpService, bind: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "serving JSON-RPC at POST /mcp");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().starts_with("text/event-stream")))
}

async fn mcp_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let msg: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(rpc_error(&Value::Null, PARSE_ERROR, &format!("parse error: {e}"))),
            )
                .into_response();
        }
    };

    match state.service.handle_message(msg, accepts_event_stream(&headers)).await {
        Reply::None => StatusCode::ACCEPTED.into_response(),
        Reply::Single(v) => Json(v).into_response(),
        Reply::Live {
            rpc_id,
            progress_token,
            events,
        } => {
            let frames = events.map(move |ev| {
                let frame = match ev.envelope(&rpc_id, &progress_token) {
                    Some(msg) => Event::default().event("message").data(msg.to_string()),
                    None => Event::default().event("done").data("[DONE]"),
                };
                Ok::<_, Infallible>(frame)
            });
            Sse::new(frames).keep_alive(KeepAlive::default()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askbridge_core::{config::Profile, dispatcher::Dispatcher, provider::NullProvider};
    use serde_json::json;
    use std::sync::Arc;

    async fn spawn_server() -> String {
        let service = McpService::new(Dispatcher::new(Arc::new(NullProvider), Profile::default()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(service)).await.unwrap();
        });
        format!("http://{addr}/mcp")
    }

    #[test]
    fn accept_header_detection() {
        let mut h = HeaderMap::new();
        assert!(!accepts_event_stream(&h));
        h.insert(header::ACCEPT, "application/json, text/event-stream".parse().unwrap());
        assert!(accepts_event_stream(&h));
    }

    #[tokio::test]
    async fn json_reply_for_plain_callers() {
        let url = spawn_server().await;
        let resp = reqwest::Client::new()
            .post(&url)
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                          "params": {"name": "ask", "arguments": {"query": "hi"}, "_meta": {"progressToken": "t"}}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["isError"], false);
    }

    #[tokio::test]
    async fn sse_reply_ends_with_done_marker() {
        let url = spawn_server().await;
        let resp = reqwest::Client::new()
            .post(&url)
            .header("accept", "text/event-stream")
            .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
                          "params": {"name": "ask", "arguments": {"query": "hi there"}, "_meta": {"progressToken": "t"}}}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let text = resp.text().await.unwrap();
        assert!(text.contains("notifications/progress"));
        assert!(text.contains("\"id\":2"));
        assert!(text.trim_end().ends_with("data: [DONE]"));
    }

    #[tokio::test]
    async fn invalid_json_is_bad_request_and_notifications_are_accepted() {
        let url = spawn_server().await;
        let client = reqwest::Client::new();
        let bad = client.post(&url).body("{oops").send().await.unwrap();
        assert_eq!(bad.status(), 400);

        let note = client
            .post(&url)
            .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .send()
            .await
            .unwrap();
        assert_eq!(note.status(), 202);
    }
}
