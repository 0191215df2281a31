//! Canonical cache key derivation.
//!
//! Primary key: `method \x01 host \x01 path \x01 canonical_query`. Query
//! canonicalization sorts parameter names lexicographically while preserving
//! the original order of repeated names. Vary-aware variants append
//! `\x02 name=value` pairs, sorted by header name.

use http::HeaderMap;

const FIELD_SEP: char = '\u{0001}';
const VARY_SEP: char = '\u{0002}';

pub fn primary_key(method: &str, host: &str, path: &str, query: Option<&str>) -> String {
	format!(
		"{}{FIELD_SEP}{}{FIELD_SEP}{}{FIELD_SEP}{}",
		method.to_ascii_uppercase(),
		host.to_ascii_lowercase(),
		path,
		canonicalize_query(query.unwrap_or(""))
	)
}

/// Stable sort on parameter name; repeated names keep arrival order.
pub fn canonicalize_query(query: &str) -> String {
	if query.is_empty() {
		return String::new();
	}
	let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
	params.sort_by_key(|p| p.split('=').next().unwrap_or(p).to_string());
	params.join("&")
}

/// Append the Vary dimension to a primary key. `vary` is the stored response's
/// Vary header value; values come from the incoming request.
pub fn variant_key(primary: &str, vary: &str, request_headers: &HeaderMap) -> String {
	let mut names: Vec<String> = vary
		.split(',')
		.map(|n| n.trim().to_ascii_lowercase())
		.filter(|n| !n.is_empty())
		.collect();
	names.sort();
	names.dedup();
	let mut key = primary.to_string();
	for name in names {
		let value = request_headers
			.get(&name)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("");
		key.push(VARY_SEP);
		key.push_str(&name);
		key.push('=');
		key.push_str(value);
	}
	key
}
