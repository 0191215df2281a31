//! The proxy data plane: per-API configuration, error → status mapping, the
//! request pipeline and the listener loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod httpproxy;
pub mod server;

use crate::audit::Auditor;
use crate::cache::SharedCache;
use crate::client::Client;
use crate::crypto::FieldEncryptor;
use crate::events::SharedBus;
use crate::http::{Body, Response, StatusCode, header};
use crate::store::SharedStore;
use crate::telemetry::metrics::Metrics;
use crate::token::TokenService;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("no matching endpoint")]
	EndpointNotFound,
	#[error("method not allowed")]
	MethodNotAllowed,
	#[error("missing required header {0}")]
	MissingRequiredHeader(String),
	#[error("authentication failed")]
	AuthenticationFailed,
	#[error("rate limited")]
	RateLimited,
	#[error("request body too large")]
	PayloadTooLarge,
	#[error("upstream unavailable: {0}")]
	UpstreamUnavailable(String),
	#[error("upstream timeout")]
	UpstreamTimeout,
	#[error("shutting down")]
	ShuttingDown,
	#[error("internal: {0}")]
	Internal(String),
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::EndpointNotFound => StatusCode::NOT_FOUND,
			ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
			ProxyError::MissingRequiredHeader(_) => StatusCode::BAD_REQUEST,
			ProxyError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
			ProxyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
			ProxyError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Client-visible body. Authentication failures share one fixed body so
	/// the reason (revoked vs expired vs unknown) is not enumerable.
	pub fn as_response(&self) -> Response {
		let status = self.status();
		let message = match self {
			ProxyError::AuthenticationFailed => "unauthorized",
			ProxyError::RateLimited => "rate limit exceeded",
			ProxyError::EndpointNotFound => "not found",
			ProxyError::MethodNotAllowed => "method not allowed",
			ProxyError::MissingRequiredHeader(_) => "missing required header",
			ProxyError::PayloadTooLarge => "request body too large",
			ProxyError::UpstreamUnavailable(_) => "upstream unavailable",
			ProxyError::UpstreamTimeout => "upstream timeout",
			ProxyError::ShuttingDown => "shutting down",
			ProxyError::Internal(_) => "internal error",
		};
		let body = format!("{{\"error\":\"{message}\"}}");
		::http::Response::builder()
			.status(status)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(Bytes::from(body)))
			.expect("static response must build")
	}
}

fn default_auth_header_name() -> String {
	"authorization".to_string()
}

fn default_auth_header_template() -> String {
	"Bearer {key}".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeoutConfig {
	/// Whole-request deadline.
	#[serde(default = "TimeoutConfig::default_request_ms")]
	pub request_ms: u64,
	#[serde(default = "TimeoutConfig::default_response_header_ms")]
	pub response_header_ms: u64,
	#[serde(default = "TimeoutConfig::default_idle_ms")]
	pub idle_ms: u64,
	/// Streaming flush cadence.
	#[serde(default = "TimeoutConfig::default_flush_interval_ms")]
	pub flush_interval_ms: u64,
}

impl TimeoutConfig {
	fn default_request_ms() -> u64 {
		120_000
	}
	fn default_response_header_ms() -> u64 {
		30_000
	}
	fn default_idle_ms() -> u64 {
		90_000
	}
	fn default_flush_interval_ms() -> u64 {
		100
	}

	pub fn request(&self) -> Duration {
		Duration::from_millis(self.request_ms)
	}
	pub fn flush_interval(&self) -> Duration {
		Duration::from_millis(self.flush_interval_ms)
	}
}

impl Default for TimeoutConfig {
	fn default() -> Self {
		Self {
			request_ms: Self::default_request_ms(),
			response_header_ms: Self::default_response_header_ms(),
			idle_ms: Self::default_idle_ms(),
			flush_interval_ms: Self::default_flush_interval_ms(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectionConfig {
	#[serde(default = "ConnectionConfig::default_max_idle")]
	pub max_idle: usize,
	#[serde(default = "ConnectionConfig::default_max_idle_per_host")]
	pub max_idle_per_host: usize,
}

impl ConnectionConfig {
	fn default_max_idle() -> usize {
		100
	}
	fn default_max_idle_per_host() -> usize {
		32
	}
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			max_idle: Self::default_max_idle(),
			max_idle_per_host: Self::default_max_idle_per_host(),
		}
	}
}

/// One upstream API the proxy fronts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiConfig {
	/// Upstream origin, e.g. `https://api.openai.com`.
	pub base_url: String,
	/// Exact-prefix allowlist of inbound paths.
	pub allowed_endpoints: Vec<String>,
	pub allowed_methods: Vec<String>,
	#[serde(default)]
	pub required_headers: Vec<String>,
	#[serde(default = "default_auth_header_name")]
	pub auth_header_name: String,
	/// `{key}` is replaced with the project's decrypted credential.
	#[serde(default = "default_auth_header_template")]
	pub auth_header_template: String,
	#[serde(default)]
	pub timeouts: TimeoutConfig,
	#[serde(default)]
	pub connection: ConnectionConfig,
}

impl ApiConfig {
	pub fn openai_default() -> Self {
		Self {
			base_url: "https://api.openai.com".to_string(),
			allowed_endpoints: vec![
				"/v1/chat/completions".to_string(),
				"/v1/completions".to_string(),
				"/v1/embeddings".to_string(),
				"/v1/models".to_string(),
				"/v1/moderations".to_string(),
			],
			allowed_methods: vec!["GET".to_string(), "POST".to_string()],
			required_headers: Vec::new(),
			auth_header_name: default_auth_header_name(),
			auth_header_template: default_auth_header_template(),
			timeouts: TimeoutConfig::default(),
			connection: ConnectionConfig::default(),
		}
	}

	pub fn host(&self) -> &str {
		self
			.base_url
			.trim_start_matches("https://")
			.trim_start_matches("http://")
			.trim_end_matches('/')
	}

	fn matches_path(&self, path: &str) -> Option<usize> {
		self
			.allowed_endpoints
			.iter()
			.filter(|prefix| path.starts_with(prefix.as_str()))
			.map(String::len)
			.max()
	}

	fn allows_method(&self, method: &str) -> bool {
		self
			.allowed_methods
			.iter()
			.any(|m| m.eq_ignore_ascii_case(method))
	}
}

/// The table of configured APIs, selected by longest endpoint-prefix match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTable {
	pub apis: HashMap<String, ApiConfig>,
}

impl ApiTable {
	pub fn openai_default() -> Self {
		Self {
			apis: HashMap::from([("openai".to_string(), ApiConfig::openai_default())]),
		}
	}

	pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
		serde_yaml::from_str(raw)
	}

	/// 404 when no endpoint prefix matches anywhere; 405 when a path matched
	/// but no API listing it allows the method.
	pub fn select(&self, method: &str, path: &str) -> Result<(&str, &ApiConfig), ProxyError> {
		let mut best: Option<(usize, &str, &ApiConfig)> = None;
		let mut path_known = false;
		for (name, api) in &self.apis {
			if let Some(len) = api.matches_path(path) {
				path_known = true;
				if !api.allows_method(method) {
					continue;
				}
				if best.is_none_or(|(l, _, _)| len > l) {
					best = Some((len, name.as_str(), api));
				}
			}
		}
		match best {
			Some((_, name, api)) => Ok((name, api)),
			None if path_known => Err(ProxyError::MethodNotAllowed),
			None => Err(ProxyError::EndpointNotFound),
		}
	}
}

/// Everything the request pipeline needs; constructor-injected, shared.
pub struct ProxyInputs {
	pub apis: ApiTable,
	/// Once shutdown triggers, new requests are refused with 503 while
	/// in-flight ones drain.
	pub drain: crate::signal::ShutdownWatcher,
	pub tokens: TokenService,
	pub store: SharedStore,
	pub encryptor: Arc<dyn FieldEncryptor>,
	pub cache: SharedCache,
	pub bus: SharedBus,
	pub upstream: Client,
	pub auditor: Auditor,
	pub metrics: Metrics,
	pub max_request_size: usize,
	/// Responses above this are streamed through uncaptured and uncached.
	pub max_response_buffer: usize,
}
