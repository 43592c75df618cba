use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::Config;
use crate::error::CoreResult;
use crate::http_client::{HttpClient, RequestCtx, RetryPolicy};
use crate::model::{ChatMessage, Role};
use crate::provider::CompletionProvider;
use crate::request::{
    CompletionRequest, Model, ReasoningEffort, RecencyFilter, SearchContextSize, SearchMode,
};
use crate::stream::UpstreamResponse;

/// Search-grounded chat completions endpoint (OpenAI-compatible request shape).
#[derive(Debug, Clone)]
pub struct CompletionsApi {
    http: HttpClient,
    endpoint: String,
    name: String, // "completions"
    api_key: SecretString,
    deadline: Duration,
}

impl CompletionsApi {
    pub fn new(http: HttpClient, api_key: SecretString, endpoint: String, deadline: Duration) -> Self {
        Self {
            http,
            endpoint,
            name: "completions".into(),
            api_key,
            deadline,
        }
    }

    /// Build from configuration. Fails when the API key variable is unset.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        let http = HttpClient::new(&cfg.http, RetryPolicy::from(&cfg.retry))?;
        Ok(Self::new(
            http,
            cfg.api_key()?,
            cfg.upstream.endpoint(),
            cfg.upstream.deadline(),
        ))
    }

    #[cfg(test)]
    pub fn new_for_tests(endpoint: &str, deadline: Duration) -> Self {
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            jitter: 0.0,
        };
        CompletionsApi::new(
            HttpClient::new(&crate::config::HttpCfg::default(), retry).unwrap(),
            SecretString::from("test-key".to_string()),
            endpoint.to_string(),
            deadline,
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key.expose_secret()),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }
}

// ----- Wire structs -----
#[derive(Serialize)]
struct WireReq {
    model: Model,
    messages: Vec<ChatMessage>,
    stream: bool,
    search_mode: SearchMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_recency_filter: Option<RecencyFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    web_search_options: Option<WebSearchOptions>,
}

#[derive(Serialize)]
struct WebSearchOptions {
    search_context_size: SearchContextSize,
}

impl WireReq {
    fn from_request(req: &CompletionRequest) -> Self {
        Self {
            model: req.model,
            messages: vec![ChatMessage {
                role: Role::User,
                content: req.query.clone(),
            }],
            stream: req.stream,
            search_mode: req.search_mode,
            search_recency_filter: req.recency_filter,
            // only the reasoning family accepts an effort hint
            reasoning_effort: match req.model {
                Model::SonarReasoning | Model::SonarReasoningPro | Model::SonarDeepResearch => {
                    req.reasoning_effort
                }
                _ => None,
            },
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            web_search_options: req
                .search_context_size
                .map(|search_context_size| WebSearchOptions { search_context_size }),
        }
    }
}

#[async_trait]
impl CompletionProvider for CompletionsApi {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        req: &CompletionRequest,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<UpstreamResponse> {
        let payload = WireReq::from_request(req);
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        debug!(model = req.model.as_str(), stream = req.stream, "sending completion request");
        self.http
            .post_completion(
                &self.endpoint,
                &payload,
                &hdrs,
                ctx,
                Instant::now() + self.deadline,
                req.stream,
            )
            .await
    }
}
