use async_trait::async_trait;

use crate::error::CoreResult;
use crate::http_client::RequestCtx;
use crate::model::{ChunkChoice, ChunkContent, CompletionChunk};
use crate::request::CompletionRequest;
use crate::stream::{ByteSource, UpstreamResponse};

/// One upstream completion backend.
///
/// `complete` returns as soon as the upstream has answered with a success
/// status: a streaming response is handed back unread so the caller decides
/// whether to drain or re-stream it.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(
        &self,
        req: &CompletionRequest,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<UpstreamResponse>;
}

/// Provider that never touches the network. Echoes the query back in the same
/// shape the real upstream would use, honouring `req.stream`.
pub struct NullProvider;

impl NullProvider {
    fn reply(req: &CompletionRequest) -> String {
        format!("[null provider response to: {}]", req.query)
    }
}

#[async_trait]
impl CompletionProvider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }

    async fn complete(
        &self,
        req: &CompletionRequest,
        _ctx: &RequestCtx<'_>,
    ) -> CoreResult<UpstreamResponse> {
        let text = Self::reply(req);
        if !req.stream {
            return Ok(UpstreamResponse::Buffered(CompletionChunk {
                id: Some("null".into()),
                model: Some(req.model.as_str().into()),
                choices: vec![ChunkChoice {
                    message: Some(ChunkContent { content: Some(text) }),
                    finish_reason: Some("stop".into()),
                    ..ChunkChoice::default()
                }],
                ..CompletionChunk::default()
            }));
        }
        let frames: Vec<String> = text
            .split_inclusive(' ')
            .map(|word| {
                let frame = serde_json::json!({
                    "id": "null",
                    "model": req.model.as_str(),
                    "choices": [{"delta": {"content": word}}],
                });
                format!("data: {frame}\n\n")
            })
            .chain(std::iter::once("data: [DONE]\n\n".to_string()))
            .collect();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
        Ok(UpstreamResponse::Streaming(ByteSource::from_chunks(frames, deadline)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::drain;
    use crate::config::Profile;

    #[tokio::test]
    async fn null_provider_buffered() {
        let mut req = CompletionRequest::new("hi", &Profile::default());
        req.stream = false;
        let resp = NullProvider.complete(&req, &RequestCtx::default()).await.unwrap();
        assert!(!resp.is_streaming());
        let acc = drain(resp.into_events()).await.unwrap();
        assert_eq!(acc.text, "[null provider response to: hi]");
        assert!(acc.completed);
    }

    #[tokio::test]
    async fn null_provider_streaming_matches_buffered_text() {
        let mut req = CompletionRequest::new("what is rust", &Profile::default());
        req.stream = true;
        let resp = NullProvider.complete(&req, &RequestCtx::default()).await.unwrap();
        assert!(resp.is_streaming());
        let acc = drain(resp.into_events()).await.unwrap();
        assert_eq!(acc.text, "[null provider response to: what is rust]");
        assert_eq!(acc.model.as_deref(), Some("sonar-pro"));
    }
}
