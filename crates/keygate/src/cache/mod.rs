//! RFC-aware response cache with Vary-partitioned storage.
//!
//! Entries live under a two-level keyspace: the canonical request fingerprint
//! selects a Vary rule, and the rule plus the request's header values select
//! the stored variant. Authorization-sensitive serve rules and conditional
//! revalidation decisions live in [`policy`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

pub mod key;
pub mod policy;

pub use policy::{CacheControl, NoStoreReason};

use crate::http::x_headers;

/// Identity of a request for cache purposes.
#[derive(Debug, Clone, Copy)]
pub struct RequestKey<'a> {
	pub method: &'a str,
	pub host: &'a str,
	pub path: &'a str,
	pub query: Option<&'a str>,
}

impl RequestKey<'_> {
	fn primary(&self) -> String {
		key::primary_key(self.method, self.host, self.path, self.query)
	}
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub vary: Option<String>,
	pub stored_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
	pub etag: Option<String>,
	pub last_modified: Option<String>,
	pub size_bytes: usize,
}

#[derive(Debug, Clone)]
pub enum Lookup {
	Miss,
	Hit(CachedResponse),
	/// Fresh or stale entry that must be revalidated upstream before use.
	NeedsRevalidation(CachedResponse),
}

/// What the proxy stamps on the outgoing response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
	Hit,
	ConditionalHit,
	Miss,
	Stored,
	Bypass,
}

impl CacheOutcome {
	pub fn as_str(&self) -> &'static str {
		match self {
			CacheOutcome::Hit => "hit",
			CacheOutcome::ConditionalHit => "conditional-hit",
			CacheOutcome::Miss => "miss",
			CacheOutcome::Stored => "stored",
			CacheOutcome::Bypass => "bypass",
		}
	}

	/// RFC 9211 style Cache-Status value.
	fn cache_status(&self) -> &'static str {
		match self {
			CacheOutcome::Hit => "keygate; hit",
			CacheOutcome::ConditionalHit => "keygate; hit; detail=conditional",
			CacheOutcome::Miss => "keygate; fwd=miss",
			CacheOutcome::Stored => "keygate; fwd=miss; stored",
			CacheOutcome::Bypass => "keygate; fwd=bypass",
		}
	}
}

/// Stamp cache observability headers on a response.
pub fn apply_outcome_headers(headers: &mut HeaderMap, outcome: CacheOutcome, debug: Option<&str>) {
	headers.insert(
		x_headers::X_PROXY_CACHE,
		HeaderValue::from_static(outcome.as_str()),
	);
	headers.insert(
		x_headers::CACHE_STATUS,
		HeaderValue::from_static(outcome.cache_status()),
	);
	if let Some(reason) = debug
		&& let Ok(v) = HeaderValue::from_str(reason)
	{
		headers.insert(x_headers::X_CACHE_DEBUG, v);
	}
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
	pub max_object_bytes: usize,
	/// Applied when neither leg carries explicit freshness; zero disables
	/// default storage.
	pub default_ttl: Duration,
	pub max_entries: usize,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			max_object_bytes: 1024 * 1024,
			default_ttl: Duration::ZERO,
			max_entries: 10_000,
		}
	}
}

/// Cache capability as seen by the proxy and management surface.
pub trait HttpCache: Send + Sync {
	fn lookup(&self, req: RequestKey<'_>, request_headers: &HeaderMap) -> Lookup;
	/// Apply the store decision; returns the TTL used or the refusal reason.
	fn store(
		&self,
		req: RequestKey<'_>,
		request_headers: &HeaderMap,
		status: StatusCode,
		response_headers: &HeaderMap,
		body: Bytes,
	) -> Result<Duration, NoStoreReason>;
	/// Refresh freshness after a 304; returns the entry to serve.
	fn refresh(
		&self,
		req: RequestKey<'_>,
		request_headers: &HeaderMap,
		ttl: Option<Duration>,
	) -> Option<CachedResponse>;
	/// Exact purge; returns entries removed.
	fn purge(&self, method: &str, host: &str, path: &str, query: Option<&str>) -> usize;
	/// Purge every entry whose path starts with `path_prefix`.
	fn purge_prefix(&self, method: &str, host: &str, path_prefix: &str) -> usize;
	fn len(&self) -> usize;
	fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

pub type SharedCache = Arc<dyn HttpCache>;

struct VaryRule {
	vary: Option<String>,
	method: String,
	host: String,
	path: String,
}

/// In-memory cache: a rule map plus an entry map behind rw-locks, bounded by
/// entry count with expired-first eviction.
pub struct MemoryHttpCache {
	cfg: CacheConfig,
	rules: RwLock<HashMap<String, VaryRule>>,
	entries: RwLock<HashMap<String, CachedResponse>>,
}

impl MemoryHttpCache {
	pub fn new(cfg: CacheConfig) -> Self {
		Self {
			cfg,
			rules: RwLock::new(HashMap::new()),
			entries: RwLock::new(HashMap::new()),
		}
	}

	fn entry_key(&self, primary: &str, request_headers: &HeaderMap) -> Option<String> {
		let rules = self.rules.read();
		let rule = rules.get(primary)?;
		Some(match &rule.vary {
			Some(vary) => key::variant_key(primary, vary, request_headers),
			None => primary.to_string(),
		})
	}

	fn evict_if_full(&self, entries: &mut HashMap<String, CachedResponse>) {
		if entries.len() < self.cfg.max_entries {
			return;
		}
		let now = Utc::now();
		entries.retain(|_, e| e.expires_at > now);
		if entries.len() >= self.cfg.max_entries {
			// Still full; drop the oldest entry.
			if let Some(oldest) = entries
				.iter()
				.min_by_key(|(_, e)| e.stored_at)
				.map(|(k, _)| k.clone())
			{
				entries.remove(&oldest);
			}
		}
	}
}

impl HttpCache for MemoryHttpCache {
	fn lookup(&self, req: RequestKey<'_>, request_headers: &HeaderMap) -> Lookup {
		let primary = req.primary();
		let Some(entry_key) = self.entry_key(&primary, request_headers) else {
			return Lookup::Miss;
		};
		let entry = {
			let entries = self.entries.read();
			match entries.get(&entry_key) {
				Some(e) => e.clone(),
				None => return Lookup::Miss,
			}
		};
		let now = Utc::now();
		if now >= entry.expires_at {
			self.entries.write().remove(&entry_key);
			return Lookup::Miss;
		}
		let request_has_authorization = request_headers.contains_key(header::AUTHORIZATION);
		let request_cc = CacheControl::parse(request_headers);
		let stored_cc = CacheControl::parse(&entry.headers);
		if !policy::may_serve_stored(request_has_authorization, &request_cc, &stored_cc) {
			return Lookup::Miss;
		}
		if policy::needs_revalidation(&request_cc) {
			return Lookup::NeedsRevalidation(entry);
		}
		Lookup::Hit(entry)
	}

	fn store(
		&self,
		req: RequestKey<'_>,
		request_headers: &HeaderMap,
		status: StatusCode,
		response_headers: &HeaderMap,
		body: Bytes,
	) -> Result<Duration, NoStoreReason> {
		let request_cc = CacheControl::parse(request_headers);
		let response_cc = CacheControl::parse(response_headers);
		let request_has_authorization = request_headers.contains_key(header::AUTHORIZATION);
		let ttl = policy::store_ttl(
			status.as_u16(),
			&request_cc,
			&response_cc,
			response_headers,
			request_has_authorization,
			body.len(),
			self.cfg.max_object_bytes,
			self.cfg.default_ttl,
		)?;

		let vary = response_headers
			.get(header::VARY)
			.and_then(|v| v.to_str().ok())
			.map(|v| v.trim().to_string())
			.filter(|v| !v.is_empty());

		let primary = req.primary();
		let entry_key = match &vary {
			Some(v) => key::variant_key(&primary, v, request_headers),
			None => primary.clone(),
		};
		let stored_at = Utc::now();
		// Absurd upstream TTLs saturate instead of overflowing.
		let expires_at = chrono::Duration::from_std(ttl)
			.ok()
			.and_then(|delta| stored_at.checked_add_signed(delta))
			.unwrap_or(DateTime::<Utc>::MAX_UTC);
		let entry = CachedResponse {
			status,
			headers: response_headers.clone(),
			size_bytes: body.len(),
			body,
			vary: vary.clone(),
			stored_at,
			expires_at,
			etag: response_headers
				.get(header::ETAG)
				.and_then(|v| v.to_str().ok())
				.map(String::from),
			last_modified: response_headers
				.get(header::LAST_MODIFIED)
				.and_then(|v| v.to_str().ok())
				.map(String::from),
		};

		// Replacing the rule may orphan variants stored under an older Vary;
		// they age out or fall to eviction.
		self.rules.write().insert(
			primary,
			VaryRule {
				vary,
				method: req.method.to_ascii_uppercase(),
				host: req.host.to_ascii_lowercase(),
				path: req.path.to_string(),
			},
		);
		let mut entries = self.entries.write();
		self.evict_if_full(&mut entries);
		entries.insert(entry_key, entry);
		Ok(ttl)
	}

	fn refresh(
		&self,
		req: RequestKey<'_>,
		request_headers: &HeaderMap,
		ttl: Option<Duration>,
	) -> Option<CachedResponse> {
		let primary = req.primary();
		let entry_key = self.entry_key(&primary, request_headers)?;
		let mut entries = self.entries.write();
		let entry = entries.get_mut(&entry_key)?;
		let now = Utc::now();
		let ttl = ttl.unwrap_or_else(|| {
			(entry.expires_at - entry.stored_at)
				.to_std()
				.unwrap_or(Duration::ZERO)
		});
		entry.stored_at = now;
		entry.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
		Some(entry.clone())
	}

	fn purge(&self, method: &str, host: &str, path: &str, query: Option<&str>) -> usize {
		let primary = key::primary_key(method, host, path, query);
		self.rules.write().remove(&primary);
		let mut entries = self.entries.write();
		let before = entries.len();
		entries.retain(|k, _| k != &primary && !k.starts_with(&format!("{primary}\u{0002}")));
		let removed = before - entries.len();
		debug!(removed, "cache purge");
		removed
	}

	fn purge_prefix(&self, method: &str, host: &str, path_prefix: &str) -> usize {
		let method = method.to_ascii_uppercase();
		let host = host.to_ascii_lowercase();
		let primaries: Vec<String> = {
			let rules = self.rules.read();
			rules
				.iter()
				.filter(|(_, r)| r.method == method && r.host == host && r.path.starts_with(path_prefix))
				.map(|(k, _)| k.clone())
				.collect()
		};
		let mut removed = 0;
		{
			let mut rules = self.rules.write();
			let mut entries = self.entries.write();
			for primary in &primaries {
				rules.remove(primary);
				let before = entries.len();
				entries.retain(|k, _| k != primary && !k.starts_with(&format!("{primary}\u{0002}")));
				removed += before - entries.len();
			}
		}
		debug!(removed, prefix = path_prefix, "cache prefix purge");
		removed
	}

	fn len(&self) -> usize {
		self.entries.read().len()
	}
}
