//! Prometheus metrics registry for the proxy and management surface.

use std::sync::Arc;

use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub method: String,
	pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum CacheResult {
	hit,
	conditional_hit,
	miss,
	stored,
	bypass,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
	pub result: CacheResult,
}

#[derive(Clone)]
pub struct Metrics {
	registry: Arc<Mutex<Registry>>,
	pub requests: Family<RequestLabels, Counter>,
	pub cache: Family<CacheLabels, Counter>,
	pub auth_failures: Counter,
	pub events_published: Counter,
	pub events_dropped: Counter,
}

impl Metrics {
	pub fn new() -> Self {
		let mut registry = Registry::with_prefix("keygate");
		let requests = Family::<RequestLabels, Counter>::default();
		registry.register("requests", "Proxied requests by method and status", requests.clone());
		let cache = Family::<CacheLabels, Counter>::default();
		registry.register("cache_lookups", "Cache lookups by result", cache.clone());
		let auth_failures = Counter::default();
		registry.register("auth_failures", "Rejected proxy authentications", auth_failures.clone());
		let events_published = Counter::default();
		registry.register("events_published", "Events accepted by the bus", events_published.clone());
		let events_dropped = Counter::default();
		registry.register("events_dropped", "Events lost before the bus", events_dropped.clone());
		Self {
			registry: Arc::new(Mutex::new(registry)),
			requests,
			cache,
			auth_failures,
			events_published,
			events_dropped,
		}
	}

	pub fn observe_request(&self, method: &str, status: u16) {
		self
			.requests
			.get_or_create(&RequestLabels {
				method: method.to_string(),
				status: status.to_string(),
			})
			.inc();
	}

	pub fn observe_cache(&self, result: CacheResult) {
		self.cache.get_or_create(&CacheLabels { result }).inc();
	}

	/// Text exposition for the management `/metrics` endpoint.
	pub fn encode(&self) -> String {
		let mut out = String::new();
		let registry = self.registry.lock();
		let _ = encode(&mut out, &registry);
		out
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encodes_observed_counters() {
		let metrics = Metrics::new();
		metrics.observe_request("POST", 200);
		metrics.observe_request("POST", 200);
		metrics.observe_cache(CacheResult::hit);
		metrics.auth_failures.inc();

		let out = metrics.encode();
		assert!(out.contains("keygate_requests_total"));
		assert!(out.contains("method=\"POST\""));
		assert!(out.contains("keygate_cache_lookups_total"));
		assert!(out.contains("keygate_auth_failures_total 1"));
	}
}
