//! Helicone sink: posts request/response logs to the custom-model log API.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, header};
use http_body_util::BodyExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use super::{BackendPlugin, Payload, PluginError};
use crate::client::Client;
use crate::http::Body;

const DEFAULT_ENDPOINT: &str = "https://api.worker.helicone.ai/custom/v1/log";

pub struct HeliconePlugin {
	client: Client,
	endpoint: String,
	api_key: SecretString,
}

impl HeliconePlugin {
	pub fn new(client: Client, api_key: SecretString, endpoint: Option<String>) -> Self {
		Self {
			client,
			endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
			api_key,
		}
	}

	fn to_log(p: &Payload) -> serde_json::Value {
		json!({
			"providerRequest": {
				"url": p.path,
				"json": p.request_body,
				"meta": {
					"requestId": p.request_id,
					"logId": p.log_id,
					"projectId": p.project_id,
				},
			},
			"providerResponse": {
				"status": p.status,
				"json": p.response_body,
			},
			"timing": {
				"startTime": {
					"seconds": p.received_at.timestamp(),
					"milliseconds": p.received_at.timestamp_subsec_millis(),
				},
				"endTime": {
					"seconds": p.completed_at.timestamp(),
					"milliseconds": p.completed_at.timestamp_subsec_millis(),
				},
			},
		})
	}
}

#[async_trait]
impl BackendPlugin for HeliconePlugin {
	fn name(&self) -> &'static str {
		"helicone"
	}

	async fn send_events(&self, payloads: &[Payload]) -> Result<(), PluginError> {
		// The log API takes one record per call.
		for p in payloads {
			let body = serde_json::to_vec(&Self::to_log(p))
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
				let _ = resp.into_body().collect().await;
				return Err(PluginError::from_status(status.as_u16(), "helicone"));
			}
		}
		Ok(())
	}
}
