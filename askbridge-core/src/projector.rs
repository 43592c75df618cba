//! Re-encodes accumulated upstream output for the caller.
//!
//! Two shapes leave this module:
//! - a consolidated `ToolResult` built once from a frozen `Answer`;
//! - a live, pull-driven sequence of `LiveEvent`s that forwards each text
//!   delta as it is absorbed and always ends with a result (or error) followed
//!   by exactly one `Done`.

use std::collections::VecDeque;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::accumulator::{AccumulatedResult, Answer};
use crate::error::BridgeError;
use crate::model::Citation;
use crate::stream::UpstreamEvents;

pub const SEARCH_RESULTS_RESOURCE: &str = "search_results";

/// Tool-call result payload as the caller sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Resource { resource: ResourceBlock },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub results: Vec<Citation>,
}

impl ToolResult {
    /// Failure payload; `code` prefixes the message so callers can branch on it.
    pub fn error(err: &BridgeError) -> Self {
        Self {
            content: vec![ContentBlock::Text {
                text: format!("Error ({}): {}", err.code(), err),
            }],
            is_error: true,
        }
    }

    /// First text block, if any.
    pub fn text(&self) -> Option<&str> {
        self.content.iter().find_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn citations(&self) -> &[Citation] {
        self.content
            .iter()
            .find_map(|b| match b {
                ContentBlock::Resource { resource } if resource.kind == SEARCH_RESULTS_RESOURCE => {
                    Some(resource.results.as_slice())
                }
                _ => None,
            })
            .unwrap_or(&[])
    }
}

/// Consolidated projection. The resource block is present only when there is
/// at least one citation.
pub fn consolidate(answer: &Answer) -> ToolResult {
    let mut content = vec![ContentBlock::Text {
        text: answer.text.clone(),
    }];
    if !answer.citations.is_empty() {
        content.push(citations_block(&answer.citations));
    }
    ToolResult {
        content,
        is_error: false,
    }
}

fn citations_block(citations: &[Citation]) -> ContentBlock {
    ContentBlock::Resource {
        resource: ResourceBlock {
            kind: SEARCH_RESULTS_RESOURCE.to_string(),
            results: citations.to_vec(),
        },
    }
}

/// One frame of a live re-stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Appended text; `seq` starts at 1 and increases by one per progress frame.
    Delta { seq: u64, text: String },
    Citations { seq: u64, citations: Vec<Citation> },
    Result(ToolResult),
    Error(ToolResult),
    Done,
}

pub type LiveStream = BoxStream<'static, LiveEvent>;

impl LiveEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::Citations { .. } => "citations",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// JSON-RPC message for this frame. Progress frames become
    /// `notifications/progress` tagged with the caller's token; the result or
    /// error frame is the response to `rpc_id`. `Done` has no JSON-RPC form.
    pub fn envelope(&self, rpc_id: &Value, progress_token: &Value) -> Option<Value> {
        match self {
            Self::Delta { seq, text } => Some(json!({
                "jsonrpc": "2.0",
                "method": "notifications/progress",
                "params": {
                    "progressToken": progress_token,
                    "progress": seq,
                    "message": text,
                }
            })),
            Self::Citations { seq, citations } => Some(json!({
                "jsonrpc": "2.0",
                "method": "notifications/progress",
                "params": {
                    "progressToken": progress_token,
                    "progress": seq,
                    "message": "",
                    "_meta": { "search_results": citations },
                }
            })),
            Self::Result(result) | Self::Error(result) => Some(json!({
                "jsonrpc": "2.0",
                "id": rpc_id,
                "result": result,
            })),
            Self::Done => None,
        }
    }
}

/// Live events for a request that failed before any upstream output.
pub fn live_failure(err: &BridgeError) -> LiveStream {
    stream::iter([LiveEvent::Error(ToolResult::error(err)), LiveEvent::Done]).boxed()
}

enum Phase {
    Reading,
    Tail(VecDeque<LiveEvent>),
    Finished,
}

struct LiveState<F> {
    events: UpstreamEvents,
    acc: AccumulatedResult,
    seq: u64,
    phase: Phase,
    on_finish: Option<F>,
}

impl<F> LiveState<F>
where
    F: FnOnce(Result<&Answer, &BridgeError>) + Send + 'static,
{
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Stop reading upstream; dropping the source releases its connection.
    fn close_source(&mut self) {
        self.events = stream::empty().boxed();
    }

    fn succeed(&mut self) {
        self.close_source();
        let answer = std::mem::take(&mut self.acc).into_answer();
        if let Some(f) = self.on_finish.take() {
            f(Ok(&answer));
        }
        let mut tail = VecDeque::with_capacity(3);
        if !answer.citations.is_empty() {
            let seq = self.next_seq();
            tail.push_back(LiveEvent::Citations {
                seq,
                citations: answer.citations.clone(),
            });
        }
        tail.push_back(LiveEvent::Result(consolidate(&answer)));
        tail.push_back(LiveEvent::Done);
        self.phase = Phase::Tail(tail);
    }

    fn fail(&mut self, err: BridgeError) {
        self.close_source();
        if let Some(f) = self.on_finish.take() {
            f(Err(&err));
        }
        self.phase = Phase::Tail(VecDeque::from([
            LiveEvent::Error(ToolResult::error(&err)),
            LiveEvent::Done,
        ]));
    }
}

/// Live projection of `events`. Upstream is only read when the returned
/// stream is polled. `on_finish` runs once, with the final answer or the
/// error, just before the tail is emitted.
pub fn project_live<F>(events: UpstreamEvents, on_finish: F) -> LiveStream
where
    F: FnOnce(Result<&Answer, &BridgeError>) + Send + 'static,
{
    let state = LiveState {
        events,
        acc: AccumulatedResult::new(),
        seq: 0,
        phase: Phase::Reading,
        on_finish: Some(on_finish),
    };

    stream::unfold(state, |mut st| async move {
        loop {
            match &mut st.phase {
                Phase::Finished => return None,
                Phase::Tail(queue) => match queue.pop_front() {
                    Some(ev) => return Some((ev, st)),
                    None => st.phase = Phase::Finished,
                },
                Phase::Reading => match st.events.next().await {
                    Some(Ok(event)) => {
                        let appended = st.acc.absorb(&event);
                        if event.is_done() {
                            st.succeed();
                        } else if let Some(text) = appended {
                            let seq = st.next_seq();
                            return Some((LiveEvent::Delta { seq, text }, st));
                        }
                    }
                    Some(Err(err)) => st.fail(err),
                    // connection closed without the sentinel
                    None => st.succeed(),
                },
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::NO_RESPONSE_PLACEHOLDER;
    use crate::model::CompletionChunk;
    use crate::stream::UpstreamEvent;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delta(text: &str) -> UpstreamEvent {
        UpstreamEvent::Chunk(
            serde_json::from_value::<CompletionChunk>(json!({"choices": [{"delta": {"content": text}}]}))
                .unwrap(),
        )
    }

    fn with_citations(text: &str) -> UpstreamEvent {
        UpstreamEvent::Chunk(
            serde_json::from_value::<CompletionChunk>(json!({
                "choices": [{"delta": {"content": text}}],
                "search_results": [{"title": "T", "url": "https://t.example", "snippet": "s"}]
            }))
            .unwrap(),
        )
    }

    fn events(items: Vec<crate::error::CoreResult<UpstreamEvent>>) -> UpstreamEvents {
        stream::iter(items).boxed()
    }

    fn answer(text: &str, citations: Vec<Citation>) -> Answer {
        Answer {
            text: text.into(),
            citations,
            usage: None,
            id: None,
            model: None,
            stop_reason: None,
        }
    }

    #[test]
    fn consolidated_wire_shape() {
        let result = consolidate(&answer(
            "hello",
            vec![Citation {
                title: "A".into(),
                url: "https://a.example".into(),
                snippet: None,
            }],
        ));
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "content": [
                    {"type": "text", "text": "hello"},
                    {"type": "resource", "resource": {"type": "search_results", "results": [
                        {"title": "A", "url": "https://a.example"}
                    ]}}
                ],
                "isError": false
            })
        );
        assert_eq!(result.citations().len(), 1);
    }

    #[test]
    fn no_citations_means_single_text_block() {
        let result = consolidate(&answer("plain", vec![]));
        assert_eq!(result.content.len(), 1);
        assert_eq!(result.text(), Some("plain"));
        assert!(result.citations().is_empty());
    }

    #[test]
    fn error_payload_carries_code() {
        let result = ToolResult::error(&BridgeError::Timeout { elapsed_ms: 30_000 });
        assert!(result.is_error);
        assert!(result.text().unwrap().starts_with("Error (timeout):"));
    }

    #[tokio::test]
    async fn live_forwards_deltas_then_tail() {
        let upstream = events(vec![
            Ok(delta("Hel")),
            Ok(delta("")),
            Ok(with_citations("lo")),
            Ok(UpstreamEvent::Done),
        ]);
        let out: Vec<LiveEvent> = project_live(upstream, |_| {}).collect().await;
        let names: Vec<_> = out.iter().map(|e| e.event_name()).collect();
        assert_eq!(names, ["delta", "delta", "citations", "result", "done"]);
        assert_eq!(out[0], LiveEvent::Delta { seq: 1, text: "Hel".into() });
        assert_eq!(out[1], LiveEvent::Delta { seq: 2, text: "lo".into() });
        match &out[3] {
            LiveEvent::Result(r) => {
                assert_eq!(r.text(), Some("Hello"));
                assert_eq!(r.citations().len(), 1);
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_sentinel_still_synthesizes_tail() {
        let upstream = events(vec![Ok(delta("partial"))]);
        let out: Vec<LiveEvent> = project_live(upstream, |_| {}).collect().await;
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[1], LiveEvent::Result(r) if r.text() == Some("partial")));
        assert!(out[2].is_terminal());
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_error_then_done() {
        let upstream = events(vec![
            Ok(delta("a")),
            Err(BridgeError::Stream("connection reset".into())),
            Ok(delta("never")),
        ]);
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let out: Vec<LiveEvent> = project_live(upstream, move |outcome| {
            *sink.lock().unwrap() = Some(outcome.err().map(|e| e.code()));
        })
        .collect()
        .await;
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[1], LiveEvent::Error(r) if r.is_error));
        assert_eq!(out.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(*seen.lock().unwrap(), Some(Some("stream_error")));
    }

    #[tokio::test]
    async fn empty_stream_yields_placeholder() {
        let out: Vec<LiveEvent> = project_live(events(vec![Ok(UpstreamEvent::Done)]), |_| {})
            .collect()
            .await;
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], LiveEvent::Result(r) if r.text() == Some(NO_RESPONSE_PLACEHOLDER)));
    }

    #[tokio::test]
    async fn upstream_is_read_only_on_demand() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream = stream::iter(["a", "b", "c"])
            .map(move |t| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BridgeError>(delta(t))
            })
            .boxed();
        let mut live = project_live(upstream, |_| {});
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
        let first = live.next().await.unwrap();
        assert_eq!(first, LiveEvent::Delta { seq: 1, text: "a".into() });
        assert_eq!(pulled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_stops_reading_after_sentinel() {
        let upstream = events(vec![Ok(delta("x")), Ok(UpstreamEvent::Done), Ok(delta("late"))]);
        let out: Vec<LiveEvent> = project_live(upstream, |_| {}).collect().await;
        assert!(matches!(&out[1], LiveEvent::Result(r) if r.text() == Some("x")));
    }

    #[test]
    fn envelopes() {
        let id = json!(7);
        let token = json!("tok");
        let d = LiveEvent::Delta { seq: 3, text: "hi".into() }
            .envelope(&id, &token)
            .unwrap();
        assert_eq!(d["method"], "notifications/progress");
        assert_eq!(d["params"]["progressToken"], "tok");
        assert_eq!(d["params"]["progress"], 3);
        assert_eq!(d["params"]["message"], "hi");

        let r = LiveEvent::Result(consolidate(&answer("done", vec![])))
            .envelope(&id, &token)
            .unwrap();
        assert_eq!(r["id"], 7);
        assert_eq!(r["result"]["isError"], false);
        assert!(LiveEvent::Done.envelope(&id, &token).is_none());
    }

    #[tokio::test]
    async fn live_failure_is_error_then_done() {
        let out: Vec<LiveEvent> = live_failure(&BridgeError::Input("`query` is required".into()))
            .collect()
            .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].event_name(), "error");
        assert!(out[1].is_terminal());
    }
}
