//! Ordered fold of upstream events into one logical answer.

use futures::StreamExt;

use crate::error::CoreResult;
use crate::model::{Citation, StopReason, Usage};
use crate::stream::{UpstreamEvent, UpstreamEvents};

pub const NO_RESPONSE_PLACEHOLDER: &str = "No response generated.";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedResult {
    pub text: String,
    pub citations: Vec<Citation>,
    pub usage: Option<Usage>,
    pub id: Option<String>,
    pub model: Option<String>,
    pub stop_reason: Option<StopReason>,
    /// Whether the `[DONE]` sentinel was observed.
    pub completed: bool,
}

/// Frozen result handed to the projector. `text` is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    pub usage: Option<Usage>,
    pub id: Option<String>,
    pub model: Option<String>,
    pub stop_reason: Option<StopReason>,
}

impl AccumulatedResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the state, returning the text it appended, if any.
    pub fn absorb(&mut self, event: &UpstreamEvent) -> Option<String> {
        let chunk = match event {
            UpstreamEvent::Done => {
                self.completed = true;
                return None;
            }
            UpstreamEvent::Chunk(c) | UpstreamEvent::Snapshot(c) => c,
        };

        if let Some(id) = &chunk.id {
            self.id = Some(id.clone());
        }
        if let Some(model) = &chunk.model {
            self.model = Some(model.clone());
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
        if let Some(reason) = StopReason::from_finish(chunk.finish_reason()) {
            self.stop_reason = Some(reason);
        }
        // whole-list replacement; a record without citations keeps the old list
        if let Some(list) = chunk.citation_list() {
            self.citations = list;
        }

        let delta = match event {
            UpstreamEvent::Snapshot(c) => c.message_text().or_else(|| c.delta_text()),
            _ => chunk.delta_text(),
        };
        match delta {
            Some(d) if !d.is_empty() => {
                self.text.push_str(d);
                Some(d.to_string())
            }
            _ => None,
        }
    }

    /// Pure form of `absorb`.
    pub fn apply(mut self, event: &UpstreamEvent) -> Self {
        self.absorb(event);
        self
    }

    pub fn into_answer(self) -> Answer {
        let text = if self.text.is_empty() {
            NO_RESPONSE_PLACEHOLDER.to_string()
        } else {
            self.text
        };
        Answer {
            text,
            citations: self.citations,
            usage: self.usage,
            id: self.id,
            model: self.model,
            stop_reason: self.stop_reason,
        }
    }
}

/// Consume events until the sentinel or the end of the connection.
/// The first error aborts the drain.
pub async fn drain(mut events: UpstreamEvents) -> CoreResult<AccumulatedResult> {
    let mut acc = AccumulatedResult::new();
    while let Some(event) = events.next().await {
        let event = event?;
        acc.absorb(&event);
        if event.is_done() {
            break;
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::model::CompletionChunk;
    use futures::stream;
    use serde_json::{Value, json};

    fn chunk(v: Value) -> UpstreamEvent {
        UpstreamEvent::Chunk(serde_json::from_value::<CompletionChunk>(v).unwrap())
    }

    fn delta(text: &str) -> UpstreamEvent {
        chunk(json!({"choices": [{"delta": {"content": text}}]}))
    }

    #[test]
    fn text_is_concatenated_in_arrival_order() {
        let events = [delta("a"), delta("b"), delta(""), delta("c"), UpstreamEvent::Done];
        let acc = events.iter().fold(AccumulatedResult::new(), |acc, e| acc.apply(e));
        assert_eq!(acc.text, "abc");
        assert!(acc.completed);
    }

    #[test]
    fn citations_from_frame_three_survive_later_frames() {
        let events = [
            delta("one "),
            delta("two "),
            chunk(json!({
                "choices": [{"delta": {"content": "three "}}],
                "search_results": [
                    {"title": "A", "url": "https://a.example", "snippet": "sa"},
                    {"title": "B", "url": "https://b.example"}
                ]
            })),
            delta("four "),
            chunk(json!({"choices": [{"delta": {"content": "five"}, "finish_reason": "stop"}]})),
        ];
        let acc = events.iter().fold(AccumulatedResult::new(), |acc, e| acc.apply(e));
        assert_eq!(acc.text, "one two three four five");
        assert_eq!(acc.citations.len(), 2);
        assert_eq!(acc.citations[0].url, "https://a.example");
        assert_eq!(acc.citations[1].title, "B");
        assert_eq!(acc.stop_reason, Some(StopReason::Stop));
    }

    #[test]
    fn later_citation_list_replaces_wholesale() {
        let mut acc = AccumulatedResult::new();
        acc.absorb(&chunk(json!({"citations": ["https://a", "https://b", "https://c"]})));
        acc.absorb(&chunk(json!({"citations": ["https://z"]})));
        acc.absorb(&chunk(json!({"citations": []})));
        assert_eq!(acc.citations.len(), 1);
        assert_eq!(acc.citations[0].url, "https://z");
    }

    #[test]
    fn metadata_is_last_seen_wins() {
        let mut acc = AccumulatedResult::new();
        acc.absorb(&chunk(json!({"id": "a", "model": "sonar", "usage": {"prompt_tokens": 1}})));
        acc.absorb(&chunk(json!({"id": "b", "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}})));
        assert_eq!(acc.id.as_deref(), Some("b"));
        assert_eq!(acc.model.as_deref(), Some("sonar"));
        assert_eq!(acc.usage.unwrap().total_tokens, Some(7));
    }

    #[test]
    fn snapshot_uses_message_text() {
        let snap: CompletionChunk = serde_json::from_value(json!({
            "id": "x",
            "choices": [{"message": {"role": "assistant", "content": "full answer"}, "finish_reason": "stop"}],
            "citations": ["https://a.example"]
        }))
        .unwrap();
        let mut acc = AccumulatedResult::new();
        assert_eq!(acc.absorb(&UpstreamEvent::Snapshot(snap)).as_deref(), Some("full answer"));
        assert_eq!(acc.citations.len(), 1);
    }

    #[test]
    fn empty_result_gets_placeholder() {
        let answer = AccumulatedResult::new().apply(&UpstreamEvent::Done).into_answer();
        assert_eq!(answer.text, NO_RESPONSE_PLACEHOLDER);
        assert!(answer.citations.is_empty());
    }

    #[tokio::test]
    async fn drain_stops_at_sentinel() {
        let events: UpstreamEvents = Box::pin(stream::iter(vec![
            Ok(delta("x")),
            Ok(UpstreamEvent::Done),
            Ok(delta("ignored")),
        ]));
        let acc = drain(events).await.unwrap();
        assert_eq!(acc.text, "x");
        assert!(acc.completed);
    }

    #[tokio::test]
    async fn drain_without_sentinel_keeps_text() {
        let events: UpstreamEvents = Box::pin(stream::iter(vec![Ok(delta("x")), Ok(delta("y"))]));
        let acc = drain(events).await.unwrap();
        assert_eq!(acc.text, "xy");
        assert!(!acc.completed);
    }

    #[tokio::test]
    async fn drain_surfaces_stream_errors() {
        let events: UpstreamEvents = Box::pin(stream::iter(vec![
            Ok(delta("x")),
            Err(BridgeError::Stream("reset".into())),
        ]));
        assert!(matches!(drain(events).await, Err(BridgeError::Stream(_))));
    }
}
