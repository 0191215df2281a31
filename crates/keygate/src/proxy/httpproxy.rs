//! The request pipeline: authenticate, consult the cache, forward, stream
//! back, finalize.
//!
//! The chain runs outer → inner: request id, canonical logging, bearer
//! authentication, cache lookup, timeout, reverse proxy, finalization (cache
//! store + event publish) and usage recording. Events are published only once
//! the response body has been fully written to the client (or the connection
//! died), via a body wrapper that fires on completion.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use http_body::{Frame, SizeHint};
use hyper::body::Incoming;
use tracing::{debug, error, info, warn};

use super::{ApiConfig, ProxyError, ProxyInputs};
use crate::cache::{CacheOutcome, CachedResponse, Lookup, NoStoreReason, RequestKey};
use crate::cache::{self, CacheControl};
use crate::events::Event;
use crate::http::{
	Body, HeaderMap, HeaderValue, Request, Response, StatusCode, bearer_token, header,
	is_streaming_response, sensitive_headers, strip_hop_by_hop_headers, valid_request_id, x_headers,
};
use crate::store::{AuditOutcome, AuditRecord};
use crate::telemetry::metrics::CacheResult;
use crate::token::{TokenError, obfuscate};

/// Headers never captured into events.
const SENSITIVE_HEADERS: &[&str] = &[
	"authorization",
	"proxy-authorization",
	"cookie",
	"set-cookie",
	"x-api-key",
];

#[derive(Clone)]
pub struct HTTPProxy {
	pub(super) inputs: Arc<ProxyInputs>,
}

impl HTTPProxy {
	pub fn new(inputs: Arc<ProxyInputs>) -> Self {
		Self { inputs }
	}

	pub async fn handle(&self, req: ::http::Request<Incoming>, client_ip: IpAddr) -> Response {
		let this = self.clone();
		let fut = async move { this.proxy(req, client_ip).await };
		// A panicking handler must not take the connection down silently.
		match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
			Ok(resp) => resp,
			Err(panic) => {
				let message = panic
					.downcast_ref::<&str>()
					.map(|s| s.to_string())
					.or_else(|| panic.downcast_ref::<String>().cloned())
					.unwrap_or_else(|| "unknown panic".to_string());
				error!(message = %message, "handler panicked");
				ProxyError::Internal("panic".to_string()).as_response()
			},
		}
	}

	async fn proxy(&self, req: ::http::Request<Incoming>, client_ip: IpAddr) -> Response {
		let start = Instant::now();
		let mut req = req.map(Body::new);

		// Middleware 1: request id, respected when inbound and well-formed.
		let request_id = req
			.headers()
			.get(x_headers::X_REQUEST_ID)
			.filter(|v| valid_request_id(v))
			.and_then(|v| v.to_str().ok())
			.map(String::from)
			.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
		let correlation_id = req
			.headers()
			.get(x_headers::X_CORRELATION_ID)
			.and_then(|v| v.to_str().ok())
			.map(String::from);

		let mut ctx = RequestCtx {
			request_id,
			correlation_id,
			client_ip,
			received_at: Utc::now(),
			method: req.method().to_string(),
			path: req.uri().path().to_string(),
			project_id: None,
		};
		sensitive_headers(&mut req);

		let result = self.proxy_internal(req, &mut ctx).await;
		let status = match &result {
			Ok(resp) => resp.status(),
			Err(e) => e.status(),
		};
		// Middleware 2: canonical request log once the verdict is known.
		info!(
			target: "access",
			request_id = %ctx.request_id,
			correlation_id = ctx.correlation_id.as_deref(),
			project_id = ctx.project_id.as_deref(),
			client_ip = %ctx.client_ip,
			method = %ctx.method,
			path = %ctx.path,
			status_code = status.as_u16(),
			duration_ms = start.elapsed().as_millis() as u64,
		);
		self.inputs.metrics.observe_request(&ctx.method, status.as_u16());

		let mut resp = result.unwrap_or_else(|e| e.as_response());
		if let Ok(v) = HeaderValue::from_str(&ctx.request_id) {
			resp.headers_mut().insert(x_headers::X_REQUEST_ID, v);
		}
		resp
	}

	async fn proxy_internal(
		&self,
		req: Request,
		ctx: &mut RequestCtx,
	) -> Result<Response, ProxyError> {
		let inputs = self.inputs.clone();
		if inputs.drain.is_shutdown() {
			return Err(ProxyError::ShuttingDown);
		}
		let (parts, body) = req.into_parts();

		// Allowlist gate before anything upstream-shaped happens.
		let (api_name, api) = inputs.apis.select(ctx.method.as_str(), &ctx.path)?;
		debug!(request_id = %ctx.request_id, api = api_name, "api selected");
		for required in &api.required_headers {
			if !parts.headers.contains_key(required.as_str()) {
				return Err(ProxyError::MissingRequiredHeader(required.clone()));
			}
		}

		// Middleware 3: bearer authentication against the token service.
		let token = bearer_token(&parts.headers).ok_or_else(|| {
			self.audit_auth_failure(ctx, None, "missing bearer token");
			ProxyError::AuthenticationFailed
		})?;
		let token_data = match inputs.tokens.validate(token).await {
			Ok(data) => data,
			Err(e) => {
				inputs.metrics.auth_failures.inc();
				self.audit_auth_failure(ctx, Some(token), &e.to_string());
				return Err(match e {
					TokenError::RateLimited => ProxyError::RateLimited,
					TokenError::Internal(msg) => ProxyError::Internal(msg),
					// Revoked, expired and unknown all collapse to one answer.
					_ => ProxyError::AuthenticationFailed,
				});
			},
		};
		ctx.project_id = Some(token_data.project_id.clone());

		let project = inputs
			.store
			.get_project(&token_data.project_id)
			.await
			.map_err(|e| ProxyError::Internal(e.to_string()))?;
		if !project.is_active {
			self.audit_auth_failure(ctx, Some(token), "project inactive");
			return Err(ProxyError::AuthenticationFailed);
		}
		let api_key = inputs
			.encryptor
			.decrypt(&project.api_key_encrypted)
			.map_err(|e| ProxyError::Internal(format!("credential decrypt: {e}")))?;

		// Buffer the request body; it is re-sent verbatim and captured for
		// the event (within limits).
		let body_bytes = read_request_body(body, &parts.headers, inputs.max_request_size).await?;
		let stream_hint = crate::http::accepts_event_stream(&parts.headers)
			|| json_stream_hint(&parts.headers, &body_bytes);

		let query = parts.uri.query();
		let cache_key = RequestKey {
			method: ctx.method.as_str(),
			host: api.host(),
			path: &ctx.path,
			query,
		};

		// Middleware 4: cache lookup. Streaming exchanges bypass entirely.
		let mut revalidate: Option<CachedResponse> = None;
		if !stream_hint {
			match inputs.cache.lookup(cache_key, &parts.headers) {
				Lookup::Hit(entry) => {
					inputs.metrics.observe_cache(CacheResult::hit);
					debug!(request_id = %ctx.request_id, "cache hit");
					return Ok(cached_response(&entry, CacheOutcome::Hit));
				},
				Lookup::NeedsRevalidation(entry)
					if entry.etag.is_some() || entry.last_modified.is_some() =>
				{
					revalidate = Some(entry);
				},
				Lookup::NeedsRevalidation(_) | Lookup::Miss => {},
			}
		}

		// Build the upstream request: same method/path/body, swapped origin,
		// swapped credentials.
		let uri_str = match query {
			Some(q) => format!("{}{}?{}", api.base_url.trim_end_matches('/'), ctx.path, q),
			None => format!("{}{}", api.base_url.trim_end_matches('/'), ctx.path),
		};
		let uri = uri_str
			.parse::<::http::Uri>()
			.map_err(|e| ProxyError::Internal(format!("upstream uri: {e}")))?;

		let mut upstream_req = ::http::Request::builder()
			.method(parts.method.clone())
			.uri(uri)
			.body(Body::from(body_bytes.clone()))
			.map_err(|e| ProxyError::Internal(e.to_string()))?;
		*upstream_req.headers_mut() = parts.headers.clone();
		prepare_upstream_headers(upstream_req.headers_mut(), ctx, api, &api_key, revalidate.as_ref())?;

		// Middleware 5+6: deadline around the forwarded call.
		let upstream_started_at = Utc::now();
		let call = inputs.upstream.request(upstream_req);
		let result = tokio::time::timeout(api.timeouts.request(), call).await;

		// Middleware 8: a dispatched request counts, success or not.
		let tokens = inputs.tokens.clone();
		let lookup_key = token_data.lookup_key.clone();
		tokio::spawn(async move {
			if let Err(e) = tokens.record_use_by_key(&lookup_key).await {
				warn!(token_key = %obfuscate(&lookup_key), error = %e, "record_use failed");
			}
		});

		let upstream_resp = match result {
			Ok(Ok(resp)) => resp,
			Ok(Err(e)) => {
				warn!(request_id = %ctx.request_id, error = %e, "upstream call failed");
				return Err(ProxyError::UpstreamUnavailable(e.to_string()));
			},
			Err(_) => return Err(ProxyError::UpstreamTimeout),
		};
		let upstream_finished_at = Utc::now();

		let (mut resp_parts, resp_body) = upstream_resp.into_parts();
		strip_hop_by_hop_headers(&mut resp_parts.headers);
		stamp_upstream_timings(&mut resp_parts.headers, upstream_started_at, upstream_finished_at);

		let mut event = self.base_event(ctx, &parts.headers, &resp_parts.headers);
		event.upstream_started_at = upstream_started_at;
		event.upstream_finished_at = upstream_finished_at;
		event.request_body_b64 = capture_body(&parts.headers, &body_bytes);

		// Conditional revalidation resolved by upstream.
		if let Some(entry) = revalidate
			&& resp_parts.status == StatusCode::NOT_MODIFIED
		{
			let cc = CacheControl::parse(&resp_parts.headers);
			let ttl = cc
				.s_maxage
				.or(cc.max_age)
				.map(std::time::Duration::from_secs);
			let entry = inputs
				.cache
				.refresh(cache_key, &parts.headers, ttl)
				.unwrap_or(entry);
			inputs.metrics.observe_cache(CacheResult::conditional_hit);
			let resp = cached_response(&entry, CacheOutcome::ConditionalHit);
			event.status = resp.status().as_u16();
			return Ok(self.finalize(resp, event));
		}

		event.status = resp_parts.status.as_u16();

		// Streaming responses are never buffered, captured or stored.
		let streaming = stream_hint || is_streaming_response(&resp_parts.headers);
		let content_length = content_length(&resp_parts.headers);
		if streaming || content_length.is_some_and(|l| l > inputs.max_response_buffer as u64) {
			let reason = if streaming {
				NoStoreReason::Streaming
			} else {
				NoStoreReason::TooLarge
			};
			cache::apply_outcome_headers(
				&mut resp_parts.headers,
				CacheOutcome::Bypass,
				Some(reason.as_str()),
			);
			inputs.metrics.observe_cache(CacheResult::bypass);
			let resp = Response::from_parts(resp_parts, resp_body);
			return Ok(self.finalize(resp, event));
		}

		// Buffered path: read fully, decide storage, replay to the client.
		let body_bytes =
			match crate::http::read_body_with_limit(resp_body, inputs.max_response_buffer).await {
				Ok(b) => b,
				Err(e) => {
					warn!(request_id = %ctx.request_id, error = %e, "upstream body read failed");
					return Err(ProxyError::UpstreamUnavailable("body read failed".to_string()));
				},
			};

		let (outcome, debug_reason) = match inputs.cache.store(
			cache_key,
			&parts.headers,
			resp_parts.status,
			&resp_parts.headers,
			body_bytes.clone(),
		) {
			Ok(_) => (CacheOutcome::Stored, None),
			Err(reason) => (CacheOutcome::Miss, Some(reason)),
		};
		inputs.metrics.observe_cache(match outcome {
			CacheOutcome::Stored => CacheResult::stored,
			_ => CacheResult::miss,
		});
		cache::apply_outcome_headers(
			&mut resp_parts.headers,
			outcome,
			debug_reason.map(|r| r.as_str()),
		);

		event.response_body_b64 = capture_body(&resp_parts.headers, &body_bytes);
		let resp = Response::from_parts(resp_parts, Body::from(body_bytes));
		Ok(self.finalize(resp, event))
	}

	/// Attach the completion-fired event publisher to the response body.
	fn finalize(&self, resp: Response, event: Event) -> Response {
		let finalizer = EventFinalizer {
			event: Some(event),
			inputs: self.inputs.clone(),
		};
		resp.map(|body| {
			Body::new(FinalizeBody {
				body,
				finalizer: Some(finalizer),
			})
		})
	}

	fn base_event(
		&self,
		ctx: &RequestCtx,
		request_headers: &HeaderMap,
		response_headers: &HeaderMap,
	) -> Event {
		let now = Utc::now();
		Event {
			request_id: ctx.request_id.clone(),
			correlation_id: ctx.correlation_id.clone(),
			project_id: ctx.project_id.clone(),
			method: ctx.method.clone(),
			path: ctx.path.clone(),
			status: 0,
			client_ip: Some(ctx.client_ip.to_string()),
			request_headers: safe_headers(request_headers),
			response_headers: safe_headers(response_headers),
			request_body_b64: None,
			response_body_b64: None,
			upstream_started_at: now,
			upstream_finished_at: now,
			received_at: ctx.received_at,
			completed_at: now,
			log_id: String::new(),
		}
	}

	fn audit_auth_failure(&self, ctx: &RequestCtx, token: Option<&str>, reason: &str) {
		let mut record = AuditRecord::new("token.validate", "proxy", AuditOutcome::Denied);
		record.request_id = Some(ctx.request_id.clone());
		record.correlation_id = ctx.correlation_id.clone();
		record.project_id = ctx.project_id.clone();
		record.client_ip = Some(ctx.client_ip.to_string());
		record.method = Some(ctx.method.clone());
		record.path = Some(ctx.path.clone());
		record.reason = Some(reason.to_string());
		record.token_id = token.map(obfuscate);
		self.inputs.auditor.record(record);
	}
}

struct RequestCtx {
	request_id: String,
	correlation_id: Option<String>,
	client_ip: IpAddr,
	received_at: DateTime<Utc>,
	method: String,
	path: String,
	project_id: Option<String>,
}

async fn read_request_body(
	body: Body,
	headers: &HeaderMap,
	max_request_size: usize,
) -> Result<Bytes, ProxyError> {
	if content_length(headers).is_some_and(|l| l > max_request_size as u64) {
		return Err(ProxyError::PayloadTooLarge);
	}
	crate::http::read_body_with_limit(body, max_request_size)
		.await
		.map_err(|_| ProxyError::PayloadTooLarge)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
	headers
		.get(header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse().ok())
}

/// `stream: true` in a JSON request body marks the exchange as streaming.
fn json_stream_hint(headers: &HeaderMap, body: &Bytes) -> bool {
	if body.is_empty() {
		return false;
	}
	let is_json = headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|ct| ct.split(';').next().is_some_and(|m| m.trim() == "application/json"));
	if !is_json {
		return false;
	}
	serde_json::from_slice::<serde_json::Value>(body)
		.ok()
		.and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
		.unwrap_or(false)
}

fn prepare_upstream_headers(
	headers: &mut HeaderMap,
	ctx: &RequestCtx,
	api: &ApiConfig,
	api_key: &str,
	revalidate: Option<&CachedResponse>,
) -> Result<(), ProxyError> {
	strip_hop_by_hop_headers(headers);
	// The client bearer must never reach the provider.
	headers.remove(header::AUTHORIZATION);
	headers.remove(header::HOST);
	headers.remove(header::CONTENT_LENGTH);

	if let Ok(v) = HeaderValue::from_str(&ctx.request_id) {
		headers.insert(x_headers::X_REQUEST_ID, v);
	}
	if !headers.contains_key(x_headers::X_REQUEST_START)
		&& let Some(nanos) = Utc::now().timestamp_nanos_opt()
		&& let Ok(v) = HeaderValue::from_str(&nanos.to_string())
	{
		headers.insert(x_headers::X_REQUEST_START, v);
	}
	if let Some(entry) = revalidate {
		if let Some(etag) = &entry.etag
			&& let Ok(v) = HeaderValue::from_str(etag)
		{
			headers.insert(header::IF_NONE_MATCH, v);
		}
		if let Some(lm) = &entry.last_modified
			&& let Ok(v) = HeaderValue::from_str(lm)
		{
			headers.insert(header::IF_MODIFIED_SINCE, v);
		}
	}

	// The injected credential goes in last.
	let name = ::http::HeaderName::try_from(api.auth_header_name.as_str())
		.map_err(|e| ProxyError::Internal(format!("auth header name: {e}")))?;
	let value = api.auth_header_template.replace("{key}", api_key);
	let mut value =
		HeaderValue::from_str(&value).map_err(|_| ProxyError::Internal("auth header value".to_string()))?;
	value.set_sensitive(true);
	headers.insert(name, value);
	Ok(())
}

fn stamp_upstream_timings(headers: &mut HeaderMap, started: DateTime<Utc>, finished: DateTime<Utc>) {
	if let Some(nanos) = started.timestamp_nanos_opt()
		&& let Ok(v) = HeaderValue::from_str(&nanos.to_string())
	{
		headers.insert(x_headers::X_UPSTREAM_REQUEST_START, v);
	}
	if let Some(nanos) = finished.timestamp_nanos_opt()
		&& let Ok(v) = HeaderValue::from_str(&nanos.to_string())
	{
		headers.insert(x_headers::X_UPSTREAM_REQUEST_STOP, v);
	}
}

fn cached_response(entry: &CachedResponse, outcome: CacheOutcome) -> Response {
	let mut headers = entry.headers.clone();
	cache::apply_outcome_headers(&mut headers, outcome, None);
	let mut resp = ::http::Response::builder()
		.status(entry.status)
		.body(Body::from(entry.body.clone()))
		.expect("cached response must build");
	*resp.headers_mut() = headers;
	resp
}

fn safe_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
	headers
		.iter()
		.filter(|(name, _)| !SENSITIVE_HEADERS.contains(&name.as_str()))
		.filter_map(|(name, value)| {
			value
				.to_str()
				.ok()
				.map(|v| (name.as_str().to_string(), v.to_string()))
		})
		.collect()
}

fn capture_body(headers: &HeaderMap, body: &Bytes) -> Option<String> {
	if body.is_empty() {
		return None;
	}
	let content_type = headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
		.to_ascii_lowercase();
	// Multipart and binary payloads are represented by their absence; the
	// dispatcher substitutes placeholders from the headers.
	if content_type.starts_with("multipart/")
		|| content_type.starts_with("application/octet-stream")
		|| content_type.starts_with("image/")
		|| content_type.starts_with("audio/")
		|| content_type.starts_with("video/")
	{
		return None;
	}
	Some(B64.encode(body))
}

struct EventFinalizer {
	event: Option<Event>,
	inputs: Arc<ProxyInputs>,
}

impl Drop for EventFinalizer {
	fn drop(&mut self) {
		let Some(mut event) = self.event.take() else {
			return;
		};
		event.completed_at = Utc::now();
		let inputs = self.inputs.clone();
		// Fires on clean completion and on mid-stream disconnect alike; the
		// publish itself happens off the request task.
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move {
				match inputs.bus.publish(event).await {
					Ok(()) => {
						inputs.metrics.events_published.inc();
					},
					Err(e) => {
						inputs.metrics.events_dropped.inc();
						warn!(error = %e, "event publish failed");
					},
				};
			});
		}
	}
}

pin_project_lite::pin_project! {
	/// Body wrapper that fires the event finalizer when the stream completes
	/// (or is dropped by a disconnecting client).
	struct FinalizeBody {
		#[pin]
		body: Body,
		finalizer: Option<EventFinalizer>,
	}
}

impl http_body::Body for FinalizeBody {
	type Data = Bytes;
	type Error = crate::http::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let res = this.body.poll_frame(cx);
		if matches!(&res, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
			// Completion: dropping the finalizer publishes the event.
			this.finalizer.take();
		}
		res
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn safe_headers_filters_credentials() {
		let mut headers = HeaderMap::new();
		headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer kg_x"));
		headers.insert(header::COOKIE, HeaderValue::from_static("session=1"));
		headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
		let safe = safe_headers(&headers);
		assert!(!safe.contains_key("authorization"));
		assert!(!safe.contains_key("cookie"));
		assert_eq!(safe.get("content-type").unwrap(), "application/json");
	}

	#[test]
	fn stream_hint_from_json_body() {
		let mut headers = HeaderMap::new();
		headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
		let body = Bytes::from_static(b"{\"model\":\"x\",\"stream\":true}");
		assert!(json_stream_hint(&headers, &body));
		let body = Bytes::from_static(b"{\"model\":\"x\"}");
		assert!(!json_stream_hint(&headers, &body));
		let body = Bytes::from_static(b"stream: true");
		assert!(!json_stream_hint(&headers, &body));
	}

	#[test]
	fn binary_bodies_not_captured() {
		let mut headers = HeaderMap::new();
		headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
		assert!(capture_body(&headers, &Bytes::from_static(b"\x89PNG")).is_none());

		let mut headers = HeaderMap::new();
		headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
		let captured = capture_body(&headers, &Bytes::from_static(b"{}")).unwrap();
		assert_eq!(B64.decode(captured).unwrap(), b"{}");
	}

	#[test]
	fn auth_header_injection_replaces_client_bearer() {
		let mut headers = HeaderMap::new();
		headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer kg_client"));
		headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
		let ctx = RequestCtx {
			request_id: "req-1".to_string(),
			correlation_id: None,
			client_ip: "127.0.0.1".parse().unwrap(),
			received_at: Utc::now(),
			method: "POST".to_string(),
			path: "/v1/chat/completions".to_string(),
			project_id: None,
		};
		let api = ApiConfig::openai_default();
		prepare_upstream_headers(&mut headers, &ctx, &api, "sk-upstream", None).unwrap();

		let auth = headers.get(header::AUTHORIZATION).unwrap();
		assert_eq!(auth.to_str().unwrap(), "Bearer sk-upstream");
		assert!(auth.is_sensitive());
		assert!(headers.get(header::CONNECTION).is_none());
		assert!(headers.get(x_headers::X_REQUEST_START).is_some());
		assert_eq!(headers.get(x_headers::X_REQUEST_ID).unwrap(), "req-1");
	}
}
