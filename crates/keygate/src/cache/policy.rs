//! RFC-facing cacheability and freshness decisions.

use std::time::Duration;

use http::{HeaderMap, header};

/// Statuses cacheable without explicit freshness directives.
const CACHEABLE_STATUSES: &[u16] = &[200, 203, 300, 301, 404, 410];

/// The subset of Cache-Control directives the proxy acts on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
	pub no_store: bool,
	pub no_cache: bool,
	pub private: bool,
	pub public: bool,
	pub max_age: Option<u64>,
	pub s_maxage: Option<u64>,
}

impl CacheControl {
	pub fn parse(headers: &HeaderMap) -> Self {
		let mut cc = CacheControl::default();
		for value in headers.get_all(header::CACHE_CONTROL) {
			let Ok(value) = value.to_str() else { continue };
			for directive in value.split(',') {
				let directive = directive.trim();
				let (name, arg) = match directive.split_once('=') {
					Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"'))),
					None => (directive, None),
				};
				match name.to_ascii_lowercase().as_str() {
					"no-store" => cc.no_store = true,
					"no-cache" => cc.no_cache = true,
					"private" => cc.private = true,
					"public" => cc.public = true,
					"max-age" => cc.max_age = arg.and_then(|a| a.parse().ok()),
					"s-maxage" => cc.s_maxage = arg.and_then(|a| a.parse().ok()),
					_ => {},
				}
			}
		}
		cc
	}
}

/// Why a response was not stored; rendered into `X-CACHE-DEBUG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoStoreReason {
	StatusNotCacheable,
	TooLarge,
	TtlZero,
	VaryStar,
	NoStore,
	Private,
	Streaming,
	ReadBodyError,
}

impl NoStoreReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			NoStoreReason::StatusNotCacheable => "status-not-cacheable",
			NoStoreReason::TooLarge => "too-large",
			NoStoreReason::TtlZero => "ttl-zero",
			NoStoreReason::VaryStar => "vary-star",
			NoStoreReason::NoStore => "no-store",
			NoStoreReason::Private => "private",
			NoStoreReason::Streaming => "streaming",
			NoStoreReason::ReadBodyError => "read-body-error",
		}
	}
}

/// Decide whether and for how long a buffered response may be stored.
///
/// `request_has_authorization` gates `private` responses; streaming and
/// oversized bodies are refused by the caller before buffering.
pub fn store_ttl(
	status: u16,
	request_cc: &CacheControl,
	response_cc: &CacheControl,
	response_headers: &HeaderMap,
	request_has_authorization: bool,
	body_len: usize,
	max_object_bytes: usize,
	default_ttl: Duration,
) -> Result<Duration, NoStoreReason> {
	if response_cc.no_store {
		return Err(NoStoreReason::NoStore);
	}
	if response_cc.private && request_has_authorization {
		return Err(NoStoreReason::Private);
	}
	if let Some(vary) = response_headers.get(header::VARY)
		&& vary.to_str().is_ok_and(|v| v.trim() == "*")
	{
		return Err(NoStoreReason::VaryStar);
	}
	if body_len > max_object_bytes {
		return Err(NoStoreReason::TooLarge);
	}

	let explicit_ttl = response_cc
		.s_maxage
		.or(response_cc.max_age)
		.or(request_cc.max_age.filter(|a| *a > 0));

	if !CACHEABLE_STATUSES.contains(&status) && explicit_ttl.is_none() {
		return Err(NoStoreReason::StatusNotCacheable);
	}

	let ttl = match explicit_ttl {
		Some(secs) => Duration::from_secs(secs),
		None => default_ttl,
	};
	if ttl.is_zero() {
		return Err(NoStoreReason::TtlZero);
	}
	Ok(ttl)
}

/// Whether a fresh stored entry may be served for this request.
///
/// Authorized requests only see shared-cacheable entries (`public` or a
/// positive `s-maxage`), or entries the client itself opted into caching via
/// its own request directives. A `private` stored entry is never served to an
/// authorized request.
pub fn may_serve_stored(
	request_has_authorization: bool,
	request_cc: &CacheControl,
	stored_response_cc: &CacheControl,
) -> bool {
	if !request_has_authorization {
		return true;
	}
	if stored_response_cc.private && !stored_response_cc.public {
		return false;
	}
	if stored_response_cc.public || stored_response_cc.s_maxage.is_some_and(|s| s > 0) {
		return true;
	}
	request_cc.public || request_cc.max_age.is_some_and(|a| a > 0)
}

/// Whether the client demands revalidation before a stored entry is used.
pub fn needs_revalidation(request_cc: &CacheControl) -> bool {
	request_cc.no_cache || request_cc.max_age == Some(0)
}

#[cfg(test)]
mod tests {
	use http::HeaderValue;

	use super::*;

	fn headers(cc: &str) -> HeaderMap {
		let mut h = HeaderMap::new();
		h.insert(header::CACHE_CONTROL, HeaderValue::from_str(cc).unwrap());
		h
	}

	#[test]
	fn parse_directives() {
		let cc = CacheControl::parse(&headers("public, max-age=60, s-maxage=\"120\""));
		assert!(cc.public);
		assert_eq!(cc.max_age, Some(60));
		assert_eq!(cc.s_maxage, Some(120));

		let cc = CacheControl::parse(&headers("no-cache, no-store, private"));
		assert!(cc.no_cache && cc.no_store && cc.private);
	}

	#[test]
	fn ttl_preference_order() {
		let none = CacheControl::default();
		let resp = CacheControl {
			max_age: Some(30),
			s_maxage: Some(90),
			..Default::default()
		};
		let ttl = store_ttl(200, &none, &resp, &HeaderMap::new(), false, 10, 100, Duration::ZERO)
			.unwrap();
		assert_eq!(ttl, Duration::from_secs(90));

		let resp = CacheControl {
			max_age: Some(30),
			..Default::default()
		};
		let ttl = store_ttl(200, &none, &resp, &HeaderMap::new(), false, 10, 100, Duration::ZERO)
			.unwrap();
		assert_eq!(ttl, Duration::from_secs(30));

		// Request-forced TTL applies when the response is silent.
		let req = CacheControl {
			max_age: Some(45),
			..Default::default()
		};
		let ttl = store_ttl(200, &req, &none, &HeaderMap::new(), false, 10, 100, Duration::ZERO)
			.unwrap();
		assert_eq!(ttl, Duration::from_secs(45));
	}

	#[test]
	fn zero_ttl_refused() {
		let none = CacheControl::default();
		assert_eq!(
			store_ttl(200, &none, &none, &HeaderMap::new(), false, 10, 100, Duration::ZERO),
			Err(NoStoreReason::TtlZero)
		);
	}

	#[test]
	fn uncacheable_status_needs_explicit_ttl() {
		let none = CacheControl::default();
		assert_eq!(
			store_ttl(500, &none, &none, &HeaderMap::new(), false, 10, 100, Duration::from_secs(60)),
			Err(NoStoreReason::StatusNotCacheable)
		);
		let resp = CacheControl {
			max_age: Some(5),
			..Default::default()
		};
		assert!(store_ttl(500, &none, &resp, &HeaderMap::new(), false, 10, 100, Duration::ZERO).is_ok());
	}

	#[test]
	fn vary_star_and_size_refused() {
		let none = CacheControl::default();
		let mut h = HeaderMap::new();
		h.insert(header::VARY, HeaderValue::from_static("*"));
		assert_eq!(
			store_ttl(200, &none, &none, &h, false, 10, 100, Duration::from_secs(60)),
			Err(NoStoreReason::VaryStar)
		);
		assert_eq!(
			store_ttl(200, &none, &none, &HeaderMap::new(), false, 101, 100, Duration::from_secs(60)),
			Err(NoStoreReason::TooLarge)
		);
	}

	#[test]
	fn private_depends_on_authorization() {
		let none = CacheControl::default();
		let private = CacheControl {
			private: true,
			max_age: Some(60),
			..Default::default()
		};
		assert_eq!(
			store_ttl(200, &none, &private, &HeaderMap::new(), true, 10, 100, Duration::ZERO),
			Err(NoStoreReason::Private)
		);
		assert!(store_ttl(200, &none, &private, &HeaderMap::new(), false, 10, 100, Duration::ZERO).is_ok());
	}

	#[test]
	fn authorized_serve_requires_public_or_smaxage() {
		let none = CacheControl::default();
		let private_stored = CacheControl {
			private: true,
			..Default::default()
		};
		assert!(!may_serve_stored(true, &none, &private_stored));
		assert!(may_serve_stored(false, &none, &private_stored));
		let public = CacheControl {
			public: true,
			..Default::default()
		};
		assert!(may_serve_stored(true, &none, &public));
		let smax = CacheControl {
			s_maxage: Some(60),
			..Default::default()
		};
		assert!(may_serve_stored(true, &none, &smax));
	}

	#[test]
	fn authorized_serve_honors_request_opt_in() {
		// The client that forced caching may read back what it cached.
		let forced = CacheControl {
			public: true,
			max_age: Some(60),
			..Default::default()
		};
		let plain_stored = CacheControl::default();
		assert!(may_serve_stored(true, &forced, &plain_stored));
		assert!(!may_serve_stored(true, &CacheControl::default(), &plain_stored));
		// But never a private entry.
		let private_stored = CacheControl {
			private: true,
			..Default::default()
		};
		assert!(!may_serve_stored(true, &forced, &private_stored));
	}

	#[test]
	fn revalidation_markers() {
		assert!(needs_revalidation(&CacheControl {
			no_cache: true,
			..Default::default()
		}));
		assert!(needs_revalidation(&CacheControl {
			max_age: Some(0),
			..Default::default()
		}));
		assert!(!needs_revalidation(&CacheControl::default()));
	}
}
