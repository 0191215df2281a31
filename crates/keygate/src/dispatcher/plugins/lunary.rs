//! Lunary sink: posts run events to the ingest endpoint.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, header};
use http_body_util::BodyExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use super::{BackendPlugin, Payload, PluginError};
use crate::client::Client;
use crate::http::Body;

const DEFAULT_ENDPOINT: &str = "https://api.lunary.ai/v1/runs/ingest";

pub struct LunaryPlugin {
	client: Client,
	endpoint: String,
	api_key: SecretString,
}

impl LunaryPlugin {
	pub fn new(client: Client, api_key: SecretString, endpoint: Option<String>) -> Self {
		Self {
			client,
			endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
			api_key,
		}
	}

	fn to_run(p: &Payload) -> serde_json::Value {
		json!({
			"type": "llm",
			"event": "end",
			"runId": p.request_id,
			// log_id lets the sink deduplicate redelivered batches
			"idempotencyKey": p.log_id,
			"name": p.model,
			"timestamp": p.completed_at.to_rfc3339(),
			"input": p.request_body,
			"output": p.assistant_content,
			"tokensUsage": p.usage.as_ref().map(|u| json!({
				"prompt": u.prompt_tokens,
				"completion": u.completion_tokens,
			})),
			"metadata": {
				"projectId": p.project_id,
				"path": p.path,
				"status": p.status,
				"durationMs": p.duration_ms,
			},
		})
	}
}

#[async_trait]
impl BackendPlugin for LunaryPlugin {
	fn name(&self) -> &'static str {
		"lunary"
	}

	async fn send_events(&self, payloads: &[Payload]) -> Result<(), PluginError> {
		let events: Vec<_> = payloads.iter().map(Self::to_run).collect();
		let body = serde_json::to_vec(&json!({ "events": events }))
			.map_err(|e| PluginError::Permanent(e.to_string()))?;
		let req = Request::builder()
			.method(Method::POST)
			.uri(&self.endpoint)
			.header(header::CONTENT_TYPE, "application/json")
			.header(
				header::AUTHORIZATION,
				format!("Bearer {}", self.api_key.expose_secret()),
			)
			.body(Body::from(Bytes::from(body)))
			.map_err(|e| PluginError::Permanent(e.to_string()))?;

		let resp = self
			.client
			.request(req)
			.await
			.map_err(|e| PluginError::Transient(e.to_string()))?;
		let status = resp.status();
		if !status.is_success() {
			// Drain so the connection returns to the pool.
			let _ = resp.into_body().collect().await;
			return Err(PluginError::from_status(status.as_u16(), "lunary"));
		}
		Ok(())
	}
}
