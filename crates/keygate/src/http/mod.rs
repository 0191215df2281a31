//! Shared HTTP types and header plumbing for the proxy data plane.

use bytes::Bytes;

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};

/// Headers added by the proxy on top of the upstream response.
pub mod x_headers {
	use http::HeaderName;

	pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
	pub const X_CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");
	pub const X_PROXY_CACHE: HeaderName = HeaderName::from_static("x-proxy-cache");
	pub const CACHE_STATUS: HeaderName = HeaderName::from_static("cache-status");
	pub const X_CACHE_DEBUG: HeaderName = HeaderName::from_static("x-cache-debug");
	pub const X_REQUEST_START: HeaderName = HeaderName::from_static("x-request-start");
	pub const X_UPSTREAM_REQUEST_START: HeaderName =
		HeaderName::from_static("x-upstream-request-start");
	pub const X_UPSTREAM_REQUEST_STOP: HeaderName =
		HeaderName::from_static("x-upstream-request-stop");
}

static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	// non-standard but still sent by libcurl and rejected by e.g. google
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

/// Strip hop-by-hop headers in place; applied on both legs.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
	// Headers named by Connection are hop-by-hop as well.
	let named: Vec<HeaderName> = headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.filter_map(|n| HeaderName::try_from(n.trim()).ok())
		.collect();
	for h in named {
		headers.remove(h);
	}
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
}

/// Mark authorization values sensitive so they never render in debug output.
pub fn sensitive_headers(req: &mut Request) {
	for (name, value) in req.headers_mut() {
		if name == header::AUTHORIZATION {
			value.set_sensitive(true)
		}
	}
}

/// Extract the bearer token from `Authorization`, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
	let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
	let (scheme, rest) = value.split_once(' ')?;
	if scheme.eq_ignore_ascii_case("bearer") && !rest.is_empty() {
		Some(rest)
	} else {
		None
	}
}

/// Whether the exchange must be treated as a stream (never buffered).
pub fn is_streaming_response(headers: &HeaderMap) -> bool {
	if let Some(ct) = headers.get(header::CONTENT_TYPE)
		&& let Ok(ct) = ct.to_str()
		&& ct
			.split(';')
			.next()
			.is_some_and(|m| m.trim().eq_ignore_ascii_case("text/event-stream"))
	{
		return true;
	}
	headers
		.get(header::TRANSFER_ENCODING)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}

/// Client-side streaming hints: Accept: text/event-stream or a JSON body
/// carrying `"stream": true` (checked by the caller on the buffered body).
pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
	headers
		.get(header::ACCEPT)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.contains("text/event-stream"))
}

/// A valid inbound request id: printable ASCII, at most 128 bytes.
pub fn valid_request_id(value: &HeaderValue) -> bool {
	match value.to_str() {
		Ok(s) => {
			!s.is_empty() && s.len() <= 128 && s.bytes().all(|b| (0x21..=0x7e).contains(&b))
		},
		Err(_) => false,
	}
}

pub async fn read_body_with_limit(body: Body, limit: usize) -> Result<Bytes, Error> {
	axum::body::to_bytes(body, limit).await
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hop_by_hop_stripped_including_connection_named() {
		let mut headers = HeaderMap::new();
		headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-custom-hop"));
		headers.insert(
			HeaderName::from_static("x-custom-hop"),
			HeaderValue::from_static("1"),
		);
		headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
		headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
		strip_hop_by_hop_headers(&mut headers);
		assert!(headers.get(header::CONNECTION).is_none());
		assert!(headers.get("x-custom-hop").is_none());
		assert!(headers.get(header::TRANSFER_ENCODING).is_none());
		assert!(headers.get(header::ACCEPT).is_some());
	}

	#[test]
	fn bearer_extraction() {
		let mut headers = HeaderMap::new();
		headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer kg_abc"));
		assert_eq!(bearer_token(&headers), Some("kg_abc"));
		headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
		assert_eq!(bearer_token(&headers), None);
		headers.remove(header::AUTHORIZATION);
		assert_eq!(bearer_token(&headers), None);
	}

	#[test]
	fn streaming_detection() {
		let mut headers = HeaderMap::new();
		headers.insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("text/event-stream; charset=utf-8"),
		);
		assert!(is_streaming_response(&headers));

		let mut headers = HeaderMap::new();
		headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
		assert!(is_streaming_response(&headers));

		let mut headers = HeaderMap::new();
		headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
		assert!(!is_streaming_response(&headers));
	}

	#[test]
	fn request_id_validation() {
		assert!(valid_request_id(&HeaderValue::from_static("req-123_abc")));
		assert!(!valid_request_id(&HeaderValue::from_static("")));
		assert!(!valid_request_id(&HeaderValue::from_static("has space")));
		let long = "a".repeat(129);
		assert!(!valid_request_id(&HeaderValue::from_str(&long).unwrap()));
	}
}
