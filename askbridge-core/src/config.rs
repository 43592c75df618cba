use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use std::{fs, path::Path};

use crate::error::{BridgeError, CoreResult};
use crate::request::Model;

pub const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpstreamCfg {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Deadline for one whole upstream call, stream included (default 30000ms)
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for UpstreamCfg {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            path: default_path(),
            api_key_env: default_api_key_env(),
            deadline_ms: default_deadline_ms(),
        }
    }
}

impl UpstreamCfg {
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.path)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

fn default_base_url() -> String {
    "https://api.perplexity.ai".to_string()
}
fn default_path() -> String {
    "/chat/completions".to_string()
}
fn default_api_key_env() -> String {
    "PERPLEXITY_API_KEY".to_string()
}
fn default_deadline_ms() -> u64 {
    30_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Backstop total request timeout in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default = "default_pool_idle")]
    pub pool_max_idle_per_host: Option<usize>,
    /// Upper bound on concurrent in-flight upstream requests
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: default_pool_idle(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}
fn default_pool_idle() -> Option<usize> {
    Some(8)
}
fn default_max_connections() -> usize {
    8
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RetryCfg {
    /// Total attempts including the first one (default 2)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Relative jitter applied to each backoff delay (default 0.3 = +/-30%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    2
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_jitter() -> f64 {
    0.3
}

/// Per-entry-point policy: which models are allowed, how many tokens may be
/// requested, and whether the upstream is asked to stream by default.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Profile {
    #[serde(default)]
    pub default_model: Model,
    /// Empty means every known model is allowed.
    #[serde(default)]
    pub allowed_models: Vec<Model>,
    #[serde(default = "default_max_tokens_ceiling")]
    pub max_tokens_ceiling: u32,
    #[serde(default)]
    pub default_max_tokens: Option<u32>,
    #[serde(default = "default_upstream_stream")]
    pub upstream_stream: bool,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            default_model: Model::default(),
            allowed_models: Vec::new(),
            max_tokens_ceiling: default_max_tokens_ceiling(),
            default_max_tokens: None,
            upstream_stream: default_upstream_stream(),
        }
    }
}

impl Profile {
    pub fn allows(&self, model: Model) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.contains(&model)
    }
}

fn default_max_tokens_ceiling() -> u32 {
    8_192
}
fn default_upstream_stream() -> bool {
    true
}
fn default_active_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub retry: RetryCfg,
    #[serde(default = "default_active_profile")]
    pub active_profile: String,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: UpstreamCfg::default(),
            http: HttpCfg::default(),
            retry: RetryCfg::default(),
            active_profile: default_active_profile(),
            profiles: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(BridgeError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| BridgeError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| BridgeError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| BridgeError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| BridgeError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s).map_err(|e| BridgeError::Other(e.into()))
                })?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(BridgeError::Config("retry.max_attempts must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(BridgeError::Config("retry.jitter must be within [0, 1]".into()));
        }
        if self.upstream.deadline_ms == 0 {
            return Err(BridgeError::Config("upstream.deadline_ms must be > 0".into()));
        }
        // the per-request client timeout would otherwise fire before the deadline
        if self.upstream.deadline_ms > self.http.request_timeout_ms {
            return Err(BridgeError::Config(format!(
                "upstream.deadline_ms ({}) must not exceed http.request_timeout_ms ({})",
                self.upstream.deadline_ms, self.http.request_timeout_ms
            )));
        }
        if self.http.max_connections == 0 {
            return Err(BridgeError::Config("http.max_connections must be >= 1".into()));
        }
        for (name, p) in &self.profiles {
            if p.max_tokens_ceiling == 0 {
                return Err(BridgeError::Config(format!(
                    "profile '{name}': max_tokens_ceiling must be >= 1"
                )));
            }
            if !p.allows(p.default_model) {
                return Err(BridgeError::Config(format!(
                    "profile '{name}': default_model {} is not in allowed_models",
                    p.default_model.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Resolve a profile by name; `None` means the configured active profile.
    /// The built-in `default` profile exists unless overridden.
    pub fn profile(&self, name: Option<&str>) -> CoreResult<Profile> {
        let name = name.unwrap_or(&self.active_profile);
        match self.profiles.get(name) {
            Some(p) => Ok(p.clone()),
            None if name == DEFAULT_PROFILE => Ok(Profile::default()),
            None => Err(BridgeError::Config(format!("unknown profile '{name}'"))),
        }
    }

    /// Read the upstream API key from the configured environment variable.
    pub fn api_key(&self) -> CoreResult<SecretString> {
        let var = &self.upstream.api_key_env;
        match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => Ok(SecretString::from(v.trim().to_string())),
            _ => Err(BridgeError::Config(format!(
                "environment variable {var} is not set"
            ))),
        }
    }
}
