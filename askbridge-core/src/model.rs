use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ContentFilter,
    Other,
}

impl StopReason {
    pub fn from_finish(s: Option<&str>) -> Option<Self> {
        match s {
            Some("stop") => Some(Self::Stop),
            Some("length") => Some(Self::Length),
            Some("content_filter") => Some(Self::ContentFilter),
            Some(_) => Some(Self::Other),
            None => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// One search result attached to an answer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Citation {
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
    #[serde(default)]
    pub total_tokens: Option<u32>,
}

// ---- Upstream wire structs ----
//
// The same shape covers a streamed SSE frame (`choices[].delta`) and a
// buffered body (`choices[].message`). Everything is optional so a frame with
// an unexpected layout still decodes as far as it can.

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct CompletionChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// Bare URL list, older upstream shape.
    #[serde(default, deserialize_with = "lenient_list")]
    pub citations: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub search_results: Option<Vec<SearchResult>>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Option<ChunkContent>,
    #[serde(default)]
    pub message: Option<ChunkContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ChunkContent {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct SearchResult {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
}

/// Decode a list field element by element, dropping entries of the wrong
/// shape. A citation list that is not an array at all counts as absent, so a
/// bad side payload never costs the frame its text.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::Array(items)) => Some(
            items
                .into_iter()
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect(),
        ),
        _ => None,
    })
}

impl CompletionChunk {
    /// Incremental text of a streamed frame.
    pub fn delta_text(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.delta.as_ref())
            .and_then(|d| d.content.as_deref())
    }

    /// Full message text of a buffered body.
    pub fn message_text(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.as_deref())
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.finish_reason.as_deref())
    }

    /// Citation snapshot carried by this record, if it carries a non-empty one.
    /// `search_results` wins over the bare `citations` URL list.
    pub fn citation_list(&self) -> Option<Vec<Citation>> {
        let from_results: Vec<Citation> = self
            .search_results
            .iter()
            .flatten()
            .filter_map(|r| {
                let url = r.url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
                Some(Citation {
                    title: r
                        .title
                        .clone()
                        .filter(|t| !t.trim().is_empty())
                        .unwrap_or_else(|| url.to_string()),
                    url: url.to_string(),
                    snippet: r.snippet.clone().filter(|s| !s.is_empty()),
                })
            })
            .collect();
        if !from_results.is_empty() {
            return Some(from_results);
        }
        let urls: Vec<Citation> = self
            .citations
            .iter()
            .flatten()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(|u| Citation {
                title: u.to_string(),
                url: u.to_string(),
                snippet: None,
            })
            .collect();
        (!urls.is_empty()).then_some(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_json_lowercase() {
        let json = r#"{"role":"assistant","content":"ok"}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        let back = serde_json::to_string(&msg).unwrap();
        assert!(back.contains("\"assistant\""));
    }

    #[test]
    fn chunk_reads_delta_and_finish() {
        let chunk: CompletionChunk = serde_json::from_value(json!({
            "id": "c1",
            "model": "sonar",
            "choices": [{"delta": {"content": "Hel"}, "finish_reason": null}]
        }))
        .unwrap();
        assert_eq!(chunk.delta_text(), Some("Hel"));
        assert_eq!(chunk.message_text(), None);
        assert_eq!(chunk.finish_reason(), None);
        assert!(chunk.citation_list().is_none());
    }

    #[test]
    fn search_results_win_over_bare_urls() {
        let chunk: CompletionChunk = serde_json::from_value(json!({
            "citations": ["https://a.example"],
            "search_results": [
                {"title": "B", "url": "https://b.example", "snippet": "about b"},
                {"title": "", "url": "https://c.example"}
            ]
        }))
        .unwrap();
        let cites = chunk.citation_list().unwrap();
        assert_eq!(cites.len(), 2);
        assert_eq!(cites[0].title, "B");
        assert_eq!(cites[0].snippet.as_deref(), Some("about b"));
        // empty title falls back to the url
        assert_eq!(cites[1].title, "https://c.example");
    }

    #[test]
    fn bare_urls_become_citations() {
        let chunk: CompletionChunk =
            serde_json::from_value(json!({"citations": ["https://a.example"]})).unwrap();
        let cites = chunk.citation_list().unwrap();
        assert_eq!(cites[0].url, "https://a.example");
        assert_eq!(cites[0].title, "https://a.example");
        assert!(cites[0].snippet.is_none());
    }

    #[test]
    fn search_results_without_url_are_dropped() {
        let chunk: CompletionChunk = serde_json::from_value(json!({
            "choices": [{"delta": {"content": "B"}}],
            "search_results": [
                {"title": "no url", "url": null},
                {"title": "missing"},
                {"title": "ok", "url": "https://ok.example"}
            ]
        }))
        .unwrap();
        assert_eq!(chunk.delta_text(), Some("B"));
        let cites = chunk.citation_list().unwrap();
        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].url, "https://ok.example");
    }

    #[test]
    fn odd_citation_entries_do_not_fail_the_record() {
        let chunk: CompletionChunk = serde_json::from_value(json!({
            "choices": [{"delta": {"content": "x"}}],
            "citations": [null, 7, "https://a.example"],
            "search_results": {"unexpected": "object"}
        }))
        .unwrap();
        assert_eq!(chunk.delta_text(), Some("x"));
        let cites = chunk.citation_list().unwrap();
        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].url, "https://a.example");

        let only_nulls: CompletionChunk =
            serde_json::from_value(json!({"search_results": [{"url": null}], "citations": [null]})).unwrap();
        assert!(only_nulls.citation_list().is_none());
    }

    #[test]
    fn empty_citation_lists_are_absent() {
        let chunk: CompletionChunk =
            serde_json::from_value(json!({"citations": [], "search_results": []})).unwrap();
        assert!(chunk.citation_list().is_none());
    }

    #[test]
    fn citation_serializes_without_missing_snippet() {
        let c = Citation {
            title: "t".into(),
            url: "u".into(),
            snippet: None,
        };
        assert_eq!(serde_json::to_value(&c).unwrap(), json!({"title":"t","url":"u"}));
    }

    #[test]
    fn finish_reason_matrix() {
        assert_eq!(StopReason::from_finish(Some("stop")), Some(StopReason::Stop));
        assert_eq!(StopReason::from_finish(Some("length")), Some(StopReason::Length));
        assert_eq!(
            StopReason::from_finish(Some("content_filter")),
            Some(StopReason::ContentFilter)
        );
        assert_eq!(StopReason::from_finish(Some("weird")), Some(StopReason::Other));
        assert_eq!(StopReason::from_finish(None), None);
    }
}
