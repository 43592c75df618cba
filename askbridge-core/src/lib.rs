pub mod accumulator;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http_client;
pub mod mcp;
pub mod model;
pub mod normalizer;
pub mod projector;
pub mod provider;
pub mod providers;
pub mod request;
pub mod sse;
pub mod stream;
pub mod telemetry;
