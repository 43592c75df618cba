//! Entry point for one `ask` tool call: validate, call upstream, project.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::accumulator::{Answer, drain};
use crate::config::Profile;
use crate::error::{BridgeError, CoreResult};
use crate::http_client::RequestCtx;
use crate::projector::{LiveStream, ToolResult, consolidate, live_failure, project_live};
use crate::provider::CompletionProvider;
use crate::request::CompletionRequest;
use crate::telemetry::{CompletionLog, emit_completion};

/// How the caller wants the answer delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerMode {
    Consolidated,
    Live,
}

impl CallerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consolidated => "consolidated",
            Self::Live => "live",
        }
    }
}

pub enum Dispatched {
    Completed(ToolResult),
    Streamed(LiveStream),
}

impl std::fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed(r) => f.debug_tuple("Completed").field(r).finish(),
            Self::Streamed(_) => f.write_str("Streamed(..)"),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    provider: Arc<dyn CompletionProvider>,
    profile: Profile,
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn CompletionProvider>, profile: Profile) -> Self {
        Self { provider, profile }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Handle one tool call. Never fails: every error is turned into an
    /// error payload in the caller's mode.
    pub async fn handle(&self, args: &Value, mode: CallerMode) -> Dispatched {
        let request_id = Uuid::new_v4().to_string();
        self.handle_with_id(args, mode, &request_id).await
    }

    pub async fn handle_with_id(&self, args: &Value, mode: CallerMode, request_id: &str) -> Dispatched {
        let started = Instant::now();
        let log = CompletionLog::new()
            .request_id(request_id)
            .caller_mode(mode.as_str());

        let req = match CompletionRequest::from_arguments(args, &self.profile) {
            Ok(req) => req,
            Err(err) => return reject(err, mode, log, started),
        };
        let log = log.model(req.model.as_str()).upstream_stream(req.stream);

        let ctx = RequestCtx {
            request_id: Some(request_id),
        };
        let resp = match self.provider.complete(&req, &ctx).await {
            Ok(resp) => resp,
            Err(err) => return reject(err, mode, log, started),
        };

        match mode {
            // streaming upstream drains server-side; buffered upstream folds its single snapshot
            CallerMode::Consolidated => match drain(resp.into_events()).await {
                Ok(acc) => {
                    let answer = acc.into_answer();
                    record_answer(log, &answer, started);
                    Dispatched::Completed(consolidate(&answer))
                }
                Err(err) => reject(err, mode, log, started),
            },
            // buffered upstream re-streams its whole text as one delta
            CallerMode::Live => {
                let events = resp.into_events();
                Dispatched::Streamed(project_live(events, move |outcome| match outcome {
                    Ok(answer) => record_answer(log, answer, started),
                    Err(err) => record_error(log, err, started),
                }))
            }
        }
    }

    /// Consolidated convenience wrapper, returning the error instead of a payload.
    pub async fn ask(&self, args: &Value) -> CoreResult<ToolResult> {
        match self.handle(args, CallerMode::Consolidated).await {
            Dispatched::Completed(result) => Ok(result),
            Dispatched::Streamed(_) => Err(BridgeError::Other(anyhow::anyhow!(
                "consolidated dispatch produced a stream"
            ))),
        }
    }
}

fn reject(err: BridgeError, mode: CallerMode, log: CompletionLog, started: Instant) -> Dispatched {
    record_error(log, &err, started);
    match mode {
        CallerMode::Consolidated => Dispatched::Completed(ToolResult::error(&err)),
        CallerMode::Live => Dispatched::Streamed(live_failure(&err)),
    }
}

fn record_answer(log: CompletionLog, answer: &Answer, started: Instant) {
    let latency_ms = started.elapsed().as_millis() as u64;
    let usage = answer.usage.unwrap_or_default();
    info!(
        request_id = log.request_id.as_deref().unwrap_or(""),
        caller_mode = log.caller_mode.as_deref().unwrap_or(""),
        latency_ms,
        text_len = answer.text.len(),
        citations = answer.citations.len(),
        "ask completed"
    );
    emit_completion(
        log.latency_ms(latency_ms)
            .upstream_model_opt(answer.model.as_deref())
            .upstream_id_opt(answer.id.as_deref())
            .stop_reason_opt(answer.stop_reason.map(|r| r.as_str()))
            .text_len(answer.text.len())
            .citations(answer.citations.len())
            .tokens(usage.prompt_tokens, usage.completion_tokens, usage.total_tokens),
    );
}

fn record_error(log: CompletionLog, err: &BridgeError, started: Instant) {
    let latency_ms = started.elapsed().as_millis() as u64;
    warn!(
        request_id = log.request_id.as_deref().unwrap_or(""),
        caller_mode = log.caller_mode.as_deref().unwrap_or(""),
        latency_ms,
        kind = err.code(),
        error = %err,
        "ask failed"
    );
    emit_completion(log.latency_ms(latency_ms).error(err.code(), &err.to_string()));
}
