use serde::Serialize;

/// Structured record of one dispatched tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletionLog {
    pub request_id: Option<String>,
    pub model: Option<String>,
    /// Model name reported back by the upstream, when it differs from the requested one.
    pub upstream_model: Option<String>,
    pub upstream_id: Option<String>,
    /// "consolidated" or "live".
    pub caller_mode: Option<String>,
    pub upstream_stream: Option<bool>,
    pub latency_ms: Option<u64>,

    pub stop_reason: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,

    pub text_len: Option<usize>,
    pub citations: Option<usize>,
    pub tokens_prompt: Option<u32>,
    pub tokens_completion: Option<u32>,
    pub tokens_total: Option<u32>,
}

impl CompletionLog {
    pub fn new() -> Self { Self::default() }
    pub fn request_id(mut self, v: &str) -> Self { self.request_id = Some(v.to_string()); self }
    pub fn model(mut self, v: &str) -> Self { self.model = Some(v.to_string()); self }
    pub fn upstream_model_opt(mut self, v: Option<&str>) -> Self { self.upstream_model = v.map(|s| s.to_string()); self }
    pub fn upstream_id_opt(mut self, v: Option<&str>) -> Self { self.upstream_id = v.map(|s| s.to_string()); self }
    pub fn caller_mode(mut self, v: &str) -> Self { self.caller_mode = Some(v.to_string()); self }
    pub fn upstream_stream(mut self, v: bool) -> Self { self.upstream_stream = Some(v); self }
    pub fn latency_ms(mut self, v: u64) -> Self { self.latency_ms = Some(v); self }
    pub fn stop_reason_opt(mut self, v: Option<&str>) -> Self { self.stop_reason = v.map(|s| s.to_string()); self }
    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }
    pub fn text_len(mut self, v: usize) -> Self { self.text_len = Some(v); self }
    pub fn citations(mut self, v: usize) -> Self { self.citations = Some(v); self }
    pub fn tokens(mut self, p: Option<u32>, c: Option<u32>, t: Option<u32>) -> Self {
        self.tokens_prompt = p; self.tokens_completion = c; self.tokens_total = t; self
    }
}
