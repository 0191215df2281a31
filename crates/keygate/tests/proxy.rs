//! End-to-end proxy scenarios against a mock upstream.

mod common;

use std::time::Duration;

use common::{UPSTREAM_KEY, spawn_proxy, spawn_proxy_with};
use futures::StreamExt;
use keygate::cache::CacheConfig;
use keygate::events::EventBus;
use keygate::store::{AuditStore, TokenStore};
use keygate::token;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHAT_BODY: &str = r#"{"model":"x","messages":[{"role":"user","content":"hi"}]}"#;

#[tokio::test]
async fn happy_path_swaps_credentials_and_counts_use() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		// The project key must be injected; the client bearer must be gone.
		.and(header("authorization", format!("Bearer {UPSTREAM_KEY}").as_str()))
		.and(body_json(serde_json::json!({
			"model": "x",
			"messages": [{"role": "user", "content": "hi"}],
		})))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "application/json")
				.set_body_string(r#"{"id":"cmpl-1","choices":[]}"#),
		)
		.expect(1)
		.mount(&upstream)
		.await;

	let harness = spawn_proxy(&upstream.uri()).await;
	let mut events = harness.bus.subscribe().await.unwrap();
	let project = harness.create_project("alpha").await;
	let bearer = harness.mint_token(&project, Some(2)).await;

	let (status, headers, body) = harness
		.send(
			"POST",
			"/v1/chat/completions",
			Some(&bearer),
			&[("content-type", "application/json")],
			CHAT_BODY,
		)
		.await;

	assert_eq!(status, 200);
	assert_eq!(&body[..], br#"{"id":"cmpl-1","choices":[]}"#);
	assert!(headers.contains_key("x-request-id"));
	assert!(headers.contains_key("x-upstream-request-start"));
	assert!(headers.contains_key("x-upstream-request-stop"));

	// Usage recording is applied off the response path.
	tokio::time::sleep(Duration::from_millis(100)).await;
	let row = harness
		.store
		.get_token(&token::lookup_key(&bearer))
		.await
		.unwrap();
	assert_eq!(row.request_count, 1);

	let event = tokio::time::timeout(Duration::from_secs(1), events.next())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(event.status, 200);
	assert_eq!(event.method, "POST");
	assert_eq!(event.project_id.as_deref(), Some(project.as_str()));
	assert!(event.response_body_b64.is_some());
	// The bearer token never reaches the event stream.
	assert!(!event.request_headers.contains_key("authorization"));
}

#[tokio::test]
async fn rate_limit_blocks_third_call_without_upstream_contact() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_string("{}"))
		.expect(2)
		.mount(&upstream)
		.await;

	let harness = spawn_proxy(&upstream.uri()).await;
	let project = harness.create_project("alpha").await;
	let bearer = harness.mint_token(&project, Some(2)).await;

	for _ in 0..2 {
		let (status, _, _) = harness
			.send(
				"POST",
				"/v1/chat/completions",
				Some(&bearer),
				&[("content-type", "application/json")],
				CHAT_BODY,
			)
			.await;
		assert_eq!(status, 200);
		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	let (status, _, body) = harness
		.send(
			"POST",
			"/v1/chat/completions",
			Some(&bearer),
			&[("content-type", "application/json")],
			CHAT_BODY,
		)
		.await;
	assert_eq!(status, 429);
	assert_eq!(&body[..], br#"{"error":"rate limit exceeded"}"#);

	tokio::time::sleep(Duration::from_millis(100)).await;
	let row = harness
		.store
		.get_token(&token::lookup_key(&bearer))
		.await
		.unwrap();
	assert_eq!(row.request_count, 2);
}

#[tokio::test]
async fn revoked_token_is_rejected_uniformly() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(ResponseTemplate::new(200).set_body_string("{}"))
		.mount(&upstream)
		.await;

	let harness = spawn_proxy(&upstream.uri()).await;
	let project = harness.create_project("alpha").await;
	let bearer = harness.mint_token(&project, None).await;

	let (status, _, _) = harness
		.send("POST", "/v1/chat/completions", Some(&bearer), &[], CHAT_BODY)
		.await;
	assert_eq!(status, 200);

	assert!(harness.tokens.revoke(&bearer).await.unwrap());

	let (status, _, body) = harness
		.send("POST", "/v1/chat/completions", Some(&bearer), &[], CHAT_BODY)
		.await;
	assert_eq!(status, 401);
	// Same body as an unknown token: nothing to enumerate.
	let (unknown_status, _, unknown_body) = harness
		.send("POST", "/v1/chat/completions", Some("kg_unknown"), &[], CHAT_BODY)
		.await;
	assert_eq!(unknown_status, 401);
	assert_eq!(body, unknown_body);
}

#[tokio::test]
async fn cache_serves_second_identical_get() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/v1/models"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "application/json")
				.insert_header("cache-control", "public, s-maxage=60")
				.set_body_string(r#"{"data":[]}"#),
		)
		.expect(1)
		.mount(&upstream)
		.await;

	let harness = spawn_proxy(&upstream.uri()).await;
	let project = harness.create_project("alpha").await;
	let bearer = harness.mint_token(&project, None).await;

	let (status, headers, _) = harness
		.send("GET", "/v1/models", Some(&bearer), &[], "")
		.await;
	assert_eq!(status, 200);
	assert_eq!(headers.get("x-proxy-cache").unwrap(), "stored");

	let (status, headers, body) = harness
		.send("GET", "/v1/models", Some(&bearer), &[], "")
		.await;
	assert_eq!(status, 200);
	assert_eq!(headers.get("x-proxy-cache").unwrap(), "hit");
	assert!(headers.get("cache-status").unwrap().to_str().unwrap().contains("hit"));
	assert_eq!(&body[..], br#"{"data":[]}"#);
}

#[tokio::test]
async fn streaming_response_bypasses_cache_and_body_capture() {
	let upstream = MockServer::start().await;
	let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "text/event-stream")
				.set_body_string(sse),
		)
		.mount(&upstream)
		.await;

	let harness = spawn_proxy(&upstream.uri()).await;
	let mut events = harness.bus.subscribe().await.unwrap();
	let project = harness.create_project("alpha").await;
	let bearer = harness.mint_token(&project, None).await;

	let (status, headers, body) = harness
		.send(
			"POST",
			"/v1/chat/completions",
			Some(&bearer),
			&[("accept", "text/event-stream")],
			CHAT_BODY,
		)
		.await;

	assert_eq!(status, 200);
	assert_eq!(headers.get("x-proxy-cache").unwrap(), "bypass");
	assert_eq!(headers.get("x-cache-debug").unwrap(), "streaming");
	assert_eq!(&body[..], sse.as_bytes());

	let event = tokio::time::timeout(Duration::from_secs(1), events.next())
		.await
		.unwrap()
		.unwrap();
	// Metadata only for streams.
	assert!(event.response_body_b64.is_none());
	assert_eq!(event.status, 200);
}

#[tokio::test]
async fn unknown_path_and_wrong_method_rejected_before_upstream() {
	let upstream = MockServer::start().await;
	let harness = spawn_proxy(&upstream.uri()).await;
	let project = harness.create_project("alpha").await;
	let bearer = harness.mint_token(&project, None).await;

	let (status, _, _) = harness
		.send("POST", "/v1/not-listed", Some(&bearer), &[], "{}")
		.await;
	assert_eq!(status, 404);

	let (status, _, _) = harness
		.send("DELETE", "/v1/models", Some(&bearer), &[], "")
		.await;
	assert_eq!(status, 405);

	// Nothing reached the mock server.
	assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn oversized_request_rejected_with_413() {
	let upstream = MockServer::start().await;
	let harness = spawn_proxy_with(&upstream.uri(), CacheConfig::default(), 64).await;
	let project = harness.create_project("alpha").await;
	let bearer = harness.mint_token(&project, None).await;

	let big = "x".repeat(256);
	let body = format!(r#"{{"model":"x","padding":"{big}"}}"#);
	let (status, _, _) = harness
		.send("POST", "/v1/chat/completions", Some(&bearer), &[], &body)
		.await;
	assert_eq!(status, 413);
	assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn upstream_down_maps_to_502() {
	// Bind-then-drop gives a dead port.
	let dead = {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);
		format!("http://{addr}")
	};
	let harness = spawn_proxy(&dead).await;
	let project = harness.create_project("alpha").await;
	let bearer = harness.mint_token(&project, None).await;

	let (status, _, _) = harness
		.send("POST", "/v1/chat/completions", Some(&bearer), &[], CHAT_BODY)
		.await;
	assert_eq!(status, 502);

	// A dispatched request still counts.
	tokio::time::sleep(Duration::from_millis(100)).await;
	let row = harness
		.store
		.get_token(&token::lookup_key(&bearer))
		.await
		.unwrap();
	assert_eq!(row.request_count, 1);
}

#[tokio::test]
async fn missing_bearer_rejected_and_audited() {
	let upstream = MockServer::start().await;
	let harness = spawn_proxy(&upstream.uri()).await;

	let (status, _, body) = harness
		.send("POST", "/v1/chat/completions", None, &[], CHAT_BODY)
		.await;
	assert_eq!(status, 401);
	assert_eq!(&body[..], br#"{"error":"unauthorized"}"#);

	tokio::time::sleep(Duration::from_millis(100)).await;
	let audit = harness.store.recent_audit(10).await.unwrap();
	assert!(
		audit
			.iter()
			.any(|r| r.action == "token.validate"
				&& r.outcome == keygate::store::AuditOutcome::Denied)
	);
}
