//! Observability events and the bus they travel on.
//!
//! One event is published per proxied round trip, after the response has been
//! fully forwarded (or terminally failed). Publishing must never fail or slow
//! a client request beyond a bounded enqueue cost. Backends are enumerated:
//! in-memory (single process, at-most-once under overload) and Redis Streams
//! (durable, at-least-once with consumer groups).

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod redis;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
	#[error("bus closed")]
	Closed,
	#[error("serialization: {0}")]
	Serialization(String),
	#[error("backend: {0}")]
	Backend(String),
}

/// A single proxied HTTP round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
	pub request_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub correlation_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub project_id: Option<String>,
	pub method: String,
	pub path: String,
	pub status: u16,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_ip: Option<String>,
	#[serde(default)]
	pub request_headers: BTreeMap<String, String>,
	#[serde(default)]
	pub response_headers: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub request_body_b64: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response_body_b64: Option<String>,
	pub upstream_started_at: DateTime<Utc>,
	pub upstream_finished_at: DateTime<Utc>,
	pub received_at: DateTime<Utc>,
	pub completed_at: DateTime<Utc>,
	/// Monotonic per bus entry; assigned by the bus, used downstream for
	/// duplicate suppression.
	#[serde(default)]
	pub log_id: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BusStats {
	pub published: u64,
	pub dropped: u64,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

#[async_trait]
pub trait EventBus: Send + Sync {
	/// Enqueue an event. Bounded cost; overload drops instead of blocking.
	async fn publish(&self, event: Event) -> Result<(), BusError>;
	/// Lazy consumer-scoped stream. Closing the bus ends all streams after
	/// draining what was already accepted.
	async fn subscribe(&self) -> Result<EventStream, BusError>;
	fn stats(&self) -> BusStats;
	async fn close(&self);
	/// Entries currently retained by the backend (best effort).
	async fn stream_length(&self) -> Result<u64, BusError> {
		Ok(0)
	}
	/// Entries delivered but not yet acknowledged (best effort).
	async fn lag_count(&self) -> Result<u64, BusError> {
		Ok(0)
	}
}

pub type SharedBus = std::sync::Arc<dyn EventBus>;

#[cfg(test)]
pub(crate) fn test_event(request_id: &str) -> Event {
	let now = Utc::now();
	Event {
		request_id: request_id.to_string(),
		correlation_id: None,
		project_id: Some("p1".to_string()),
		method: "POST".to_string(),
		path: "/v1/chat/completions".to_string(),
		status: 200,
		client_ip: Some("127.0.0.1".to_string()),
		request_headers: BTreeMap::new(),
		response_headers: BTreeMap::new(),
		request_body_b64: None,
		response_body_b64: None,
		upstream_started_at: now,
		upstream_finished_at: now,
		received_at: now,
		completed_at: now,
		log_id: String::new(),
	}
}
