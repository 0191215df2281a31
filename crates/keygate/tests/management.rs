//! Management surface tests driven through the axum router.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ConnectInfo;
use bytes::Bytes;
use http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use keygate::audit::Auditor;
use keygate::cache::{CacheConfig, HttpCache, MemoryHttpCache, RequestKey, SharedCache};
use keygate::crypto::{AesFieldEncryptor, CIPHERTEXT_PREFIX, EncryptionKey, FieldEncryptor};
use keygate::management::{ManagementState, router};
use keygate::store::memory::MemoryStore;
use keygate::store::{AuditStore, SharedStore, TokenStore};
use keygate::telemetry::metrics::Metrics;
use keygate::token::{self, TokenService, TokenServiceConfig};
use secrecy::SecretString;
use serde_json::{Value, json};
use tower::ServiceExt;

const MGMT_TOKEN: &str = "mgmt-secret";

struct Surface {
	router: Router,
	store: SharedStore,
	cache: SharedCache,
	tokens: TokenService,
}

fn surface() -> Surface {
	let store: SharedStore = Arc::new(MemoryStore::new());
	let encryptor: Arc<dyn FieldEncryptor> =
		Arc::new(AesFieldEncryptor::new(EncryptionKey::generate()));
	let cache: SharedCache = Arc::new(MemoryHttpCache::new(CacheConfig::default()));
	let tokens = TokenService::new(
		store.clone(),
		TokenServiceConfig {
			bcrypt_cost: 4,
			..Default::default()
		},
	);
	let state = Arc::new(ManagementState {
		store: store.clone(),
		tokens: tokens.clone(),
		cache: cache.clone(),
		encryptor,
		auditor: Auditor::new(store.clone()),
		metrics: Metrics::new(),
		management_token: SecretString::new(MGMT_TOKEN.to_string().into_boxed_str()),
	});
	Surface {
		router: router(state),
		store,
		cache,
		tokens,
	}
}

async fn call(
	router: &Router,
	method: &str,
	path: &str,
	bearer: Option<&str>,
	body: Option<Value>,
) -> (StatusCode, Value) {
	let mut builder = Request::builder().method(method).uri(path);
	if let Some(token) = bearer {
		builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
	}
	let body = match body {
		Some(v) => {
			builder = builder.header(header::CONTENT_TYPE, "application/json");
			axum::body::Body::from(Bytes::from(v.to_string()))
		},
		None => axum::body::Body::empty(),
	};
	let mut req = builder.body(body).unwrap();
	// The router is driven without a listener; provide the peer info the
	// ConnectInfo extractor would normally see.
	req
		.extensions_mut()
		.insert(ConnectInfo::<SocketAddr>("127.0.0.1:9999".parse().unwrap()));
	let resp = router.clone().oneshot(req).await.unwrap();
	let status = resp.status();
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	let value = if bytes.is_empty() {
		Value::Null
	} else {
		serde_json::from_slice(&bytes).unwrap_or(Value::Null)
	};
	(status, value)
}

#[tokio::test]
async fn management_requires_bearer() {
	let s = surface();
	let (status, body) = call(&s.router, "GET", "/manage/projects", None, None).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);
	assert_eq!(body["error"], "unauthorized");

	let (status, _) = call(&s.router, "GET", "/manage/projects", Some("wrong"), None).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);

	// Health and metrics stay open.
	let (status, _) = call(&s.router, "GET", "/healthz", None, None).await;
	assert_eq!(status, StatusCode::OK);

	tokio::time::sleep(Duration::from_millis(100)).await;
	let audit = s.store.recent_audit(10).await.unwrap();
	assert!(audit.iter().any(|r| r.action == "management.auth"));
}

#[tokio::test]
async fn project_crud_roundtrip() {
	let s = surface();
	let (status, created) = call(
		&s.router,
		"POST",
		"/manage/projects",
		Some(MGMT_TOKEN),
		Some(json!({"name": "alpha", "api_key": "sk-live-1234567890"})),
	)
	.await;
	assert_eq!(status, StatusCode::CREATED);
	let id = created["id"].as_str().unwrap().to_string();
	// The key is echoed obfuscated, never in full.
	let echoed = created["api_key"].as_str().unwrap();
	assert!(echoed.contains('…'));
	assert!(!echoed.contains("1234567890"));

	// Ciphertext lands in the store.
	let stored = keygate::store::ProjectStore::get_project(s.store.as_ref(), &id)
		.await
		.unwrap();
	assert!(stored.api_key_encrypted.starts_with(CIPHERTEXT_PREFIX));

	let (status, listed) = call(&s.router, "GET", "/manage/projects", Some(MGMT_TOKEN), None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(listed.as_array().unwrap().len(), 1);

	let (status, patched) = call(
		&s.router,
		"PATCH",
		&format!("/manage/projects/{id}"),
		Some(MGMT_TOKEN),
		Some(json!({"name": "beta"})),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(patched["name"], "beta");

	let (status, _) = call(
		&s.router,
		"GET",
		"/manage/projects/missing",
		Some(MGMT_TOKEN),
		None,
	)
	.await;
	assert_eq!(status, StatusCode::NOT_FOUND);

	// Duplicate names are rejected.
	let (status, body) = call(
		&s.router,
		"POST",
		"/manage/projects",
		Some(MGMT_TOKEN),
		Some(json!({"name": "beta", "api_key": "sk-2"})),
	)
	.await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn token_issue_list_revoke() {
	let s = surface();
	let (_, created) = call(
		&s.router,
		"POST",
		"/manage/projects",
		Some(MGMT_TOKEN),
		Some(json!({"name": "alpha", "api_key": "sk-1"})),
	)
	.await;
	let project_id = created["id"].as_str().unwrap().to_string();

	let (status, minted) = call(
		&s.router,
		"POST",
		"/manage/tokens",
		Some(MGMT_TOKEN),
		Some(json!({"project_id": project_id, "duration_minutes": 10, "max_requests": 5})),
	)
	.await;
	assert_eq!(status, StatusCode::CREATED);
	let plaintext = minted["token"].as_str().unwrap().to_string();
	assert!(plaintext.starts_with(token::TOKEN_PREFIX));
	assert!(minted["expires_at"].is_string());

	// Listing never exposes the plaintext.
	let (status, listed) = call(
		&s.router,
		"GET",
		&format!("/manage/tokens?project_id={project_id}"),
		Some(MGMT_TOKEN),
		None,
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	let listed = listed.as_array().unwrap();
	assert_eq!(listed.len(), 1);
	assert!(!listed[0].to_string().contains(&plaintext));
	let lookup_key = listed[0]["lookup_key"].as_str().unwrap().to_string();
	assert_eq!(lookup_key, token::lookup_key(&plaintext));

	let (status, _) = call(
		&s.router,
		"DELETE",
		&format!("/manage/tokens/{lookup_key}"),
		Some(MGMT_TOKEN),
		None,
	)
	.await;
	assert_eq!(status, StatusCode::NO_CONTENT);
	assert!(matches!(
		s.tokens.validate(&plaintext).await,
		Err(keygate::token::TokenError::Revoked)
	));

	let (status, _) = call(
		&s.router,
		"DELETE",
		&format!("/manage/tokens/{lookup_key}"),
		Some(MGMT_TOKEN),
		None,
	)
	.await;
	assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_token_requests_rejected() {
	let s = surface();
	let (status, body) = call(
		&s.router,
		"POST",
		"/manage/tokens",
		Some(MGMT_TOKEN),
		Some(json!({"project_id": "nope", "duration_minutes": 10})),
	)
	.await;
	assert_eq!(status, StatusCode::NOT_FOUND);
	assert!(body["error"].as_str().is_some());

	let (status, _) = call(
		&s.router,
		"POST",
		"/manage/tokens",
		Some(MGMT_TOKEN),
		Some(json!({"project_id": "nope", "duration_minutes": 0})),
	)
	.await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn project_delete_cascades_token_revocation() {
	let s = surface();
	let (_, created) = call(
		&s.router,
		"POST",
		"/manage/projects",
		Some(MGMT_TOKEN),
		Some(json!({"name": "alpha", "api_key": "sk-1"})),
	)
	.await;
	let project_id = created["id"].as_str().unwrap().to_string();
	let (token_a, _) = s
		.tokens
		.generate(&project_id, None, None)
		.await
		.unwrap();
	let (token_b, _) = s
		.tokens
		.generate(&project_id, None, None)
		.await
		.unwrap();

	let (status, _) = call(
		&s.router,
		"DELETE",
		&format!("/manage/projects/{project_id}"),
		Some(MGMT_TOKEN),
		None,
	)
	.await;
	assert_eq!(status, StatusCode::NO_CONTENT);

	for token in [&token_a, &token_b] {
		let row = s.store.get_token(&token::lookup_key(token)).await.unwrap();
		assert!(!row.is_active);
	}

	tokio::time::sleep(Duration::from_millis(100)).await;
	let audit = s.store.recent_audit(10).await.unwrap();
	assert!(audit.iter().any(|r| r.action == "project.deactivate"));
}

#[tokio::test]
async fn cache_purge_exact_and_prefix() {
	let s = surface();
	for p in ["/v1/models", "/v1/models/alpha", "/v2/other"] {
		let key = RequestKey {
			method: "GET",
			host: "api.example.com",
			path: p,
			query: None,
		};
		s.cache
			.store(
				key,
				&http::HeaderMap::new(),
				StatusCode::OK,
				&{
					let mut h = http::HeaderMap::new();
					h.insert(header::CACHE_CONTROL, "max-age=60".parse().unwrap());
					h
				},
				Bytes::from_static(b"{}"),
			)
			.unwrap();
	}

	let (status, body) = call(
		&s.router,
		"POST",
		"/manage/cache/purge",
		Some(MGMT_TOKEN),
		Some(json!({"method": "GET", "url": "https://api.example.com/v2/other"})),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["purged"], 1);

	let (_, body) = call(
		&s.router,
		"POST",
		"/manage/cache/purge",
		Some(MGMT_TOKEN),
		Some(json!({"method": "GET", "url": "https://api.example.com/v1/", "prefix": true})),
	)
	.await;
	assert_eq!(body["purged"], 2);
	assert!(s.cache.is_empty());
}
