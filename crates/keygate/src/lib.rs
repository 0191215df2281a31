//! keygate: a transparent, token-mediated reverse proxy for upstream
//! OpenAI-compatible APIs.
//!
//! Untrusted clients present short-lived, project-scoped bearer tokens; the
//! proxy validates them, injects the project's provider credential from an
//! encrypted store, forwards the request with minimal transformation
//! (streaming included), caches idempotent responses, and emits a durable
//! stream of observability events consumed by a separate dispatcher process.

pub mod audit;
pub mod cache;
pub mod client;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod events;
pub mod http;
pub mod management;
pub mod proxy;
pub mod signal;
pub mod store;
pub mod telemetry;
pub mod token;

pub use config::Config;
