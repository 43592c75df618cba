//! Typed view of the `ask` tool arguments.
//!
//! Decoding is permissive on purpose: only `query` is mandatory. Every other
//! argument that has the wrong JSON type, an unknown enum value, or an
//! out-of-range number falls back to the profile default (numbers are clamped
//! where a sensible bound exists). Keys are accepted in snake_case and
//! camelCase.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Profile;
use crate::error::{BridgeError, CoreResult};
use crate::normalizer::{clamp_round_f32, clamp_token_count, clean_text};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Model {
    Sonar,
    #[default]
    SonarPro,
    SonarReasoning,
    SonarReasoningPro,
    SonarDeepResearch,
}

impl Model {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sonar => "sonar",
            Self::SonarPro => "sonar-pro",
            Self::SonarReasoning => "sonar-reasoning",
            Self::SonarReasoningPro => "sonar-reasoning-pro",
            Self::SonarDeepResearch => "sonar-deep-research",
        }
    }

    pub const ALL: [Model; 5] = [
        Self::Sonar,
        Self::SonarPro,
        Self::SonarReasoning,
        Self::SonarReasoningPro,
        Self::SonarDeepResearch,
    ];
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Web,
    Academic,
    Sec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecencyFilter {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchContextSize {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub query: String,
    pub model: Model,
    /// Ask the upstream for an SSE body instead of one JSON document.
    pub stream: bool,
    pub search_mode: SearchMode,
    pub recency_filter: Option<RecencyFilter>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub search_context_size: Option<SearchContextSize>,
}

impl CompletionRequest {
    /// Minimal request with profile defaults; used by the CLI and tests.
    pub fn new(query: impl Into<String>, profile: &Profile) -> Self {
        Self {
            query: query.into(),
            model: profile.default_model,
            stream: profile.upstream_stream,
            search_mode: SearchMode::default(),
            recency_filter: None,
            reasoning_effort: None,
            max_tokens: profile.default_max_tokens,
            temperature: None,
            search_context_size: None,
        }
    }

    /// Decode tool arguments under `profile`.
    pub fn from_arguments(args: &Value, profile: &Profile) -> CoreResult<Self> {
        let empty = Map::new();
        let obj = match args {
            Value::Object(m) => m,
            Value::Null => &empty,
            _ => {
                return Err(BridgeError::Input(
                    "arguments must be an object".to_string(),
                ));
            }
        };

        let query = match lookup(obj, "query", "query") {
            Some(Value::String(q)) => clean_text(q),
            Some(_) => return Err(BridgeError::Input("`query` must be a string".into())),
            None => return Err(BridgeError::Input("`query` is required".into())),
        };
        if query.is_empty() {
            return Err(BridgeError::Input("`query` must not be empty".into()));
        }

        let mut req = Self::new(query, profile);

        if let Some(model) = enum_arg::<Model>(obj, "model", "model")
            && profile.allows(model)
        {
            req.model = model;
        }
        if let Some(Value::Bool(b)) = lookup(obj, "stream", "useUpstreamStreaming") {
            req.stream = *b;
        }
        if let Some(mode) = enum_arg(obj, "search_mode", "searchMode") {
            req.search_mode = mode;
        }
        req.recency_filter = enum_arg(obj, "recency_filter", "recencyFilter")
            .or_else(|| enum_arg(obj, "search_recency_filter", "searchRecencyFilter"));
        req.reasoning_effort = enum_arg(obj, "reasoning_effort", "reasoningEffort");
        req.search_context_size = enum_arg(obj, "search_context_size", "searchContextSize");

        if let Some(n) = lookup(obj, "max_tokens", "maxTokens").and_then(Value::as_f64)
            && let Some(tokens) = clamp_token_count(n, profile.max_tokens_ceiling)
        {
            req.max_tokens = Some(tokens);
        }
        if let Some(t) = lookup(obj, "temperature", "temperature").and_then(Value::as_f64)
            && t.is_finite()
        {
            req.temperature = Some(clamp_round_f32(t as f32, 0.0, 2.0, 3));
        }

        Ok(req)
    }
}

fn lookup<'a>(obj: &'a Map<String, Value>, snake: &str, camel: &str) -> Option<&'a Value> {
    obj.get(snake)
        .or_else(|| obj.get(camel))
        .filter(|v| !v.is_null())
}

fn enum_arg<T: DeserializeOwned>(obj: &Map<String, Value>, snake: &str, camel: &str) -> Option<T> {
    match lookup(obj, snake, camel)? {
        Value::String(s) => {
            serde_json::from_value(Value::String(s.trim().to_ascii_lowercase())).ok()
        }
        _ => None,
    }
}
