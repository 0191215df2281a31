//! Shared harness: a real proxy listener wired to in-memory collaborators and
//! a wiremock upstream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use keygate::audit::Auditor;
use keygate::cache::{CacheConfig, MemoryHttpCache, SharedCache};
use keygate::client::{Client, ClientConfig};
use keygate::crypto::{AesFieldEncryptor, EncryptionKey, FieldEncryptor};
use keygate::events::memory::MemoryBus;
use keygate::http::Body;
use keygate::proxy::httpproxy::HTTPProxy;
use keygate::proxy::server::ProxyServer;
use keygate::proxy::{ApiConfig, ApiTable, ProxyInputs};
use keygate::signal::{self, ShutdownTrigger};
use keygate::store::memory::MemoryStore;
use keygate::store::{Project, ProjectStore, SharedStore};
use keygate::telemetry::metrics::Metrics;
use keygate::token::{TokenService, TokenServiceConfig};

pub const UPSTREAM_KEY: &str = "sk-upstream-secret";

pub struct Harness {
	pub addr: SocketAddr,
	pub store: SharedStore,
	pub tokens: TokenService,
	pub bus: Arc<MemoryBus>,
	pub cache: SharedCache,
	pub encryptor: Arc<dyn FieldEncryptor>,
	pub client: Client,
	#[allow(dead_code)]
	trigger: ShutdownTrigger,
}

pub async fn spawn_proxy(upstream_base: &str) -> Harness {
	spawn_proxy_with(upstream_base, CacheConfig::default(), 1024 * 1024).await
}

pub async fn spawn_proxy_with(
	upstream_base: &str,
	cache_cfg: CacheConfig,
	max_request_size: usize,
) -> Harness {
	let store: SharedStore = Arc::new(MemoryStore::new());
	let encryptor: Arc<dyn FieldEncryptor> =
		Arc::new(AesFieldEncryptor::new(EncryptionKey::generate()));
	let bus = Arc::new(MemoryBus::new(64));
	let cache: SharedCache = Arc::new(MemoryHttpCache::new(cache_cfg));
	let tokens = TokenService::new(
		store.clone(),
		TokenServiceConfig {
			bcrypt_cost: 4,
			..Default::default()
		},
	);
	let client = Client::new(&ClientConfig::default()).unwrap();

	let mut api = ApiConfig::openai_default();
	api.base_url = upstream_base.trim_end_matches('/').to_string();
	api.allowed_endpoints.push("/v1/stream".to_string());
	let apis = ApiTable {
		apis: std::collections::HashMap::from([("upstream".to_string(), api)]),
	};

	let (trigger, watcher) = signal::new();
	let inputs = Arc::new(ProxyInputs {
		apis,
		drain: trigger.watcher(),
		tokens: tokens.clone(),
		store: store.clone(),
		encryptor: encryptor.clone(),
		cache: cache.clone(),
		bus: bus.clone(),
		upstream: client.clone(),
		auditor: Auditor::new(store.clone()),
		metrics: Metrics::new(),
		max_request_size,
		max_response_buffer: 1024 * 1024,
	});

	let server = ProxyServer::bind(
		"127.0.0.1:0".parse().unwrap(),
		HTTPProxy::new(inputs),
		Duration::from_secs(5),
	)
	.await
	.unwrap();
	let addr = server.local_addr().unwrap();
	tokio::spawn(server.run(watcher));

	Harness {
		addr,
		store,
		tokens,
		bus,
		cache,
		encryptor,
		client,
		trigger,
	}
}

impl Harness {
	pub async fn create_project(&self, name: &str) -> String {
		let now = chrono::Utc::now();
		let project = Project {
			id: format!("proj-{name}"),
			name: name.to_string(),
			api_key_encrypted: self.encryptor.encrypt(UPSTREAM_KEY).unwrap(),
			is_active: true,
			created_at: now,
			updated_at: now,
			deactivated_at: None,
		};
		self.store.create_project(&project).await.unwrap();
		project.id
	}

	pub async fn mint_token(&self, project_id: &str, max_requests: Option<i64>) -> String {
		let (token, _) = self
			.tokens
			.generate(project_id, Some(chrono::Duration::minutes(10)), max_requests)
			.await
			.unwrap();
		token
	}

	pub async fn send(
		&self,
		method: &str,
		path: &str,
		bearer: Option<&str>,
		headers: &[(&str, &str)],
		body: &str,
	) -> (http::StatusCode, http::HeaderMap, Bytes) {
		let mut builder = http::Request::builder()
			.method(method)
			.uri(format!("http://{}{}", self.addr, path));
		if let Some(token) = bearer {
			builder = builder.header("authorization", format!("Bearer {token}"));
		}
		for (name, value) in headers {
			builder = builder.header(*name, *value);
		}
		let req = builder
			.body(Body::from(Bytes::from(body.to_string())))
			.unwrap();
		let resp = self.client.request(req).await.unwrap();
		let (parts, body) = resp.into_parts();
		let bytes = body.collect().await.unwrap().to_bytes();
		(parts.status, parts.headers, bytes)
	}
}
