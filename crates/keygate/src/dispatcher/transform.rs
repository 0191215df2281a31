//! Default event → payload transformation.
//!
//! Decodes captured bodies (base64 wrapping, gzip/brotli content encodings),
//! merges OpenAI-style SSE chunk streams back into one assistant message,
//! replaces binary and multipart content with placeholders and extracts token
//! usage plus assistant content into structured fields.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::Value;
use tokio::io::AsyncReadExt;

use super::plugins::{Payload, TokenUsage};
use crate::events::Event;

const BINARY_PLACEHOLDER: &str = "<binary omitted>";
const MULTIPART_PLACEHOLDER: &str = "<multipart omitted>";

#[derive(thiserror::Error, Debug)]
pub enum TransformError {
	#[error("body decode: {0}")]
	BodyDecode(String),
}

/// Transform one event; `Ok(None)` filters it out (CORS preflight noise).
pub async fn transform(event: &Event) -> Result<Option<Payload>, TransformError> {
	if event.method.eq_ignore_ascii_case("OPTIONS") {
		return Ok(None);
	}

	let request_body = match &event.request_body_b64 {
		Some(b64) => Some(decode_body(b64, &event.request_headers).await?),
		None => None,
	};
	let response_body = match &event.response_body_b64 {
		Some(b64) => Some(decode_body(b64, &event.response_headers).await?),
		None => None,
	};

	let (response_body, assistant_content, usage, model) = match response_body {
		Some(DecodedBody::Json(v)) => {
			let usage = extract_usage(&v);
			let content = extract_assistant_content(&v);
			let model = v.get("model").and_then(Value::as_str).map(String::from);
			(Some(v), content, usage, model)
		},
		Some(DecodedBody::Sse(raw)) => {
			let merged = merge_sse_chunks(&raw);
			let usage = merged.as_ref().and_then(|m| extract_usage(m));
			let content = merged.as_ref().and_then(extract_assistant_content);
			let model = merged
				.as_ref()
				.and_then(|m| m.get("model"))
				.and_then(Value::as_str)
				.map(String::from);
			(merged, content, usage, model)
		},
		Some(DecodedBody::Text(t)) => (Some(Value::String(t)), None, None, None),
		None => (None, None, None, None),
	};

	let request_body = request_body.map(|b| match b {
		DecodedBody::Json(v) => v,
		DecodedBody::Sse(raw) | DecodedBody::Text(raw) => Value::String(raw),
	});
	let model = model.or_else(|| {
		request_body
			.as_ref()
			.and_then(|b| b.get("model"))
			.and_then(Value::as_str)
			.map(String::from)
	});

	Ok(Some(Payload {
		log_id: event.log_id.clone(),
		request_id: event.request_id.clone(),
		correlation_id: event.correlation_id.clone(),
		project_id: event.project_id.clone(),
		method: event.method.clone(),
		path: event.path.clone(),
		status: event.status,
		client_ip: event.client_ip.clone(),
		duration_ms: (event.completed_at - event.received_at).num_milliseconds(),
		received_at: event.received_at,
		completed_at: event.completed_at,
		request_body,
		response_body,
		model,
		assistant_content,
		usage,
	}))
}

enum DecodedBody {
	Json(Value),
	Sse(String),
	Text(String),
}

async fn decode_body(
	b64: &str,
	headers: &std::collections::BTreeMap<String, String>,
) -> Result<DecodedBody, TransformError> {
	let content_type = headers
		.get("content-type")
		.map(String::as_str)
		.unwrap_or("")
		.to_ascii_lowercase();
	if content_type.starts_with("multipart/") {
		return Ok(DecodedBody::Text(MULTIPART_PLACEHOLDER.to_string()));
	}
	if is_binary_content_type(&content_type) {
		return Ok(DecodedBody::Text(BINARY_PLACEHOLDER.to_string()));
	}

	let raw = B64
		.decode(b64)
		.map_err(|e| TransformError::BodyDecode(e.to_string()))?;
	let raw = match headers.get("content-encoding").map(String::as_str) {
		Some("gzip") => decompress_gzip(&raw).await?,
		Some("br") => decompress_brotli(&raw).await?,
		_ => raw,
	};

	let Ok(text) = String::from_utf8(raw) else {
		return Ok(DecodedBody::Text(BINARY_PLACEHOLDER.to_string()));
	};
	if content_type.starts_with("text/event-stream") || looks_like_sse(&text) {
		return Ok(DecodedBody::Sse(text));
	}
	match serde_json::from_str::<Value>(&text) {
		Ok(v) => Ok(DecodedBody::Json(v)),
		Err(_) => Ok(DecodedBody::Text(text)),
	}
}

fn is_binary_content_type(content_type: &str) -> bool {
	content_type.starts_with("application/octet-stream")
		|| content_type.starts_with("image/")
		|| content_type.starts_with("audio/")
		|| content_type.starts_with("video/")
}

fn looks_like_sse(text: &str) -> bool {
	text.trim_start().starts_with("data:")
}

async fn decompress_gzip(raw: &[u8]) -> Result<Vec<u8>, TransformError> {
	let mut out = Vec::new();
	let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(raw);
	decoder
		.read_to_end(&mut out)
		.await
		.map_err(|e| TransformError::BodyDecode(e.to_string()))?;
	Ok(out)
}

async fn decompress_brotli(raw: &[u8]) -> Result<Vec<u8>, TransformError> {
	let mut out = Vec::new();
	let mut decoder = async_compression::tokio::bufread::BrotliDecoder::new(raw);
	decoder
		.read_to_end(&mut out)
		.await
		.map_err(|e| TransformError::BodyDecode(e.to_string()))?;
	Ok(out)
}

/// Merge an OpenAI chat-completions SSE stream back into a single message.
/// Deltas are concatenated in order; the last chunk carrying `usage` wins.
fn merge_sse_chunks(raw: &str) -> Option<Value> {
	let mut content = String::new();
	let mut role = None;
	let mut model = None;
	let mut id = None;
	let mut usage = None;
	let mut finish_reason = None;
	let mut saw_chunk = false;

	for line in raw.lines() {
		let Some(data) = line.strip_prefix("data:") else {
			continue;
		};
		let data = data.trim();
		if data.is_empty() || data == "[DONE]" {
			continue;
		}
		let Ok(chunk) = serde_json::from_str::<Value>(data) else {
			continue;
		};
		saw_chunk = true;
		if model.is_none() {
			model = chunk.get("model").and_then(Value::as_str).map(String::from);
		}
		if id.is_none() {
			id = chunk.get("id").and_then(Value::as_str).map(String::from);
		}
		if let Some(u) = chunk.get("usage").filter(|u| !u.is_null()) {
			usage = Some(u.clone());
		}
		if let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) {
			if let Some(delta) = choice.get("delta") {
				if role.is_none() {
					role = delta.get("role").and_then(Value::as_str).map(String::from);
				}
				if let Some(part) = delta.get("content").and_then(Value::as_str) {
					content.push_str(part);
				}
			}
			if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
				finish_reason = Some(reason.to_string());
			}
		}
	}

	if !saw_chunk {
		return None;
	}
	Some(serde_json::json!({
		"id": id,
		"model": model,
		"usage": usage,
		"choices": [{
			"message": {
				"role": role.unwrap_or_else(|| "assistant".to_string()),
				"content": content,
			},
			"finish_reason": finish_reason,
		}],
	}))
}

fn extract_usage(body: &Value) -> Option<TokenUsage> {
	let usage = body.get("usage")?;
	let usage = TokenUsage {
		prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
		completion_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
		total_tokens: usage.get("total_tokens").and_then(Value::as_u64),
	};
	if usage == TokenUsage::default() {
		None
	} else {
		Some(usage)
	}
}

fn extract_assistant_content(body: &Value) -> Option<String> {
	body
		.get("choices")?
		.get(0)?
		.get("message")?
		.get("content")?
		.as_str()
		.map(String::from)
}
