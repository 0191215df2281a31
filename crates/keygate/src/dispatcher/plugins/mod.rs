//! Sink plugins the dispatcher fans out to.
//!
//! A plugin receives transformed payload batches. Errors are split into
//! transient (retried with backoff) and permanent (batch dropped without
//! retry), mirroring how sinks signal unrecoverable rejects with 4xx.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub mod file;
pub mod helicone;
pub mod lunary;

#[derive(thiserror::Error, Debug)]
pub enum PluginError {
	#[error("transient: {0}")]
	Transient(String),
	#[error("permanent: {0}")]
	Permanent(String),
}

impl PluginError {
	pub fn is_permanent(&self) -> bool {
		matches!(self, PluginError::Permanent(_))
	}

	/// Classify a sink HTTP status: 408/429 stay retryable, other 4xx are
	/// permanent, everything else transient.
	pub fn from_status(status: u16, context: &str) -> Self {
		if (400..500).contains(&status) && status != 408 && status != 429 {
			PluginError::Permanent(format!("{context}: status {status}"))
		} else {
			PluginError::Transient(format!("{context}: status {status}"))
		}
	}
}

/// Token accounting extracted from an upstream response.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TokenUsage {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub prompt_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub completion_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub total_tokens: Option<u64>,
}

/// One transformed event as delivered to sinks. `log_id` enables duplicate
/// suppression on at-least-once redelivery.
#[derive(Debug, Clone, Serialize)]
pub struct Payload {
	pub log_id: String,
	pub request_id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub correlation_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub project_id: Option<String>,
	pub method: String,
	pub path: String,
	pub status: u16,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client_ip: Option<String>,
	pub duration_ms: i64,
	pub received_at: DateTime<Utc>,
	pub completed_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub request_body: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response_body: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub assistant_content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub usage: Option<TokenUsage>,
}

/// External sink capability. Variants: file (JSONL), Lunary, Helicone.
#[async_trait]
pub trait BackendPlugin: Send + Sync {
	fn name(&self) -> &'static str;
	async fn send_events(&self, payloads: &[Payload]) -> Result<(), PluginError>;
	async fn close(&self) {}
}
