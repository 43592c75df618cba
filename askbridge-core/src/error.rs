use thiserror::Error;

/// Core error type for askbridge.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing or mistyped required tool argument. No upstream call is made.
    #[error("invalid input: {0}")]
    Input(String),

    /// Transport failure reaching the upstream (connect, send, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// The per-request deadline elapsed.
    #[error("upstream timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Non-2xx response from the upstream, body kept verbatim.
    #[error("upstream returned {status}: {body}")]
    Upstream {
        status: u16,
        body: String,
        retry_after: Option<u64>,
    },

    /// One malformed SSE frame. Recovered inside the decoder.
    #[error("malformed frame: {0}")]
    Decode(String),

    /// The body failed while being read mid-stream.
    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// Stable short code carried in caller-facing error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Input(_) => "input_error",
            Self::Network(_) => "network_error",
            Self::Timeout { .. } => "timeout",
            Self::Upstream { .. } => "upstream_error",
            Self::Decode(_) => "decode_error",
            Self::Stream(_) => "stream_error",
            Self::Config(_) => "config_error",
            Self::Io(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Whether the transport client may try the request again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Upstream { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

/// 408, 429 and every 5xx are treated as transient.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

pub type CoreResult<T> = std::result::Result<T, BridgeError>;
