//! Event dispatcher: consumes the bus, transforms, batches and delivers to a
//! sink plugin with retry.
//!
//! A batch flushes when it is full, when `flush_interval` has elapsed since
//! its first item, or on shutdown. Transient sink errors retry with linear
//! backoff (`attempt × retry_backoff`); permanent errors drop the batch after
//! the initial attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

pub mod plugins;
pub mod transform;

use plugins::{BackendPlugin, Payload};

use crate::events::SharedBus;
use crate::signal::ShutdownWatcher;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	pub batch_size: usize,
	pub flush_interval: Duration,
	/// Retries after the initial attempt.
	pub retry_attempts: u32,
	pub retry_backoff: Duration,
	/// dropped/processed ratio over the rolling window above which health
	/// reports degraded.
	pub health_drop_threshold: f64,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			batch_size: 32,
			flush_interval: Duration::from_secs(5),
			retry_attempts: 3,
			retry_backoff: Duration::from_secs(1),
			health_drop_threshold: 0.1,
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
	pub processed: u64,
	pub dropped: u64,
	pub sent: u64,
	/// Events per second over the rolling window.
	pub processing_rate: f64,
	pub lag_count: u64,
	pub stream_length: u64,
	pub last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
	Healthy,
	Degraded,
}

const HEALTH_WINDOW: Duration = Duration::from_secs(60);

struct Window {
	started: Instant,
	processed_at_start: u64,
	dropped_at_start: u64,
}

struct Counters {
	processed: AtomicU64,
	dropped: AtomicU64,
	sent: AtomicU64,
	last_processed_at: Mutex<Option<DateTime<Utc>>>,
	window: Mutex<Window>,
}

pub struct Dispatcher {
	bus: SharedBus,
	plugin: Arc<dyn BackendPlugin>,
	cfg: DispatcherConfig,
	counters: Arc<Counters>,
}

impl Dispatcher {
	pub fn new(bus: SharedBus, plugin: Arc<dyn BackendPlugin>, cfg: DispatcherConfig) -> Self {
		Self {
			bus,
			plugin,
			cfg,
			counters: Arc::new(Counters {
				processed: AtomicU64::new(0),
				dropped: AtomicU64::new(0),
				sent: AtomicU64::new(0),
				last_processed_at: Mutex::new(None),
				window: Mutex::new(Window {
					started: Instant::now(),
					processed_at_start: 0,
					dropped_at_start: 0,
				}),
			}),
		}
	}

	/// Consume until shutdown or bus closure; the in-progress batch is
	/// flushed before returning.
	pub async fn run(&self, mut shutdown: ShutdownWatcher) -> Result<(), crate::events::BusError> {
		let mut stream = self.bus.subscribe().await?;
		info!(plugin = self.plugin.name(), "dispatcher started");
		let mut batch: Vec<Payload> = Vec::with_capacity(self.cfg.batch_size);
		// Armed when the batch is non-empty.
		let mut flush_at: Option<Instant> = None;

		loop {
			let deadline = flush_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
			tokio::select! {
				_ = shutdown.wait() => {
					self.flush(&mut batch, &mut shutdown).await;
					info!(plugin = self.plugin.name(), "dispatcher stopped");
					return Ok(());
				},
				_ = tokio::time::sleep_until(deadline.into()), if flush_at.is_some() => {
					self.flush(&mut batch, &mut shutdown).await;
					flush_at = None;
				},
				next = stream.next() => {
					let Some(event) = next else {
						self.flush(&mut batch, &mut shutdown).await;
						info!(plugin = self.plugin.name(), "bus closed; dispatcher exiting");
						return Ok(());
					};
					self.counters.processed.fetch_add(1, Ordering::Relaxed);
					match transform::transform(&event).await {
						Ok(Some(payload)) => {
							if batch.is_empty() {
								flush_at = Some(Instant::now() + self.cfg.flush_interval);
							}
							batch.push(payload);
							if batch.len() >= self.cfg.batch_size {
								self.flush(&mut batch, &mut shutdown).await;
								flush_at = None;
							}
						},
						Ok(None) => {
							debug!(request_id = %event.request_id, "event filtered");
						},
						Err(e) => {
							self.counters.dropped.fetch_add(1, Ordering::Relaxed);
							warn!(request_id = %event.request_id, error = %e, "transform failed; event dropped");
						},
					}
				},
			}
		}
	}

	async fn flush(&self, batch: &mut Vec<Payload>, shutdown: &mut ShutdownWatcher) {
		if batch.is_empty() {
			return;
		}
		let payloads = std::mem::take(batch);
		let count = payloads.len() as u64;
		let mut attempt: u32 = 0;
		loop {
			match self.plugin.send_events(&payloads).await {
				Ok(()) => {
					self.counters.sent.fetch_add(count, Ordering::Relaxed);
					*self.counters.last_processed_at.lock() = Some(Utc::now());
					debug!(plugin = self.plugin.name(), count, "batch delivered");
					return;
				},
				Err(e) if e.is_permanent() => {
					self.counters.dropped.fetch_add(count, Ordering::Relaxed);
					warn!(plugin = self.plugin.name(), count, error = %e, "permanent sink error; batch dropped");
					return;
				},
				Err(e) => {
					if attempt >= self.cfg.retry_attempts {
						self.counters.dropped.fetch_add(count, Ordering::Relaxed);
						warn!(plugin = self.plugin.name(), count, error = %e, "retries exhausted; batch dropped");
						return;
					}
					attempt += 1;
					let backoff = self.cfg.retry_backoff * attempt;
					debug!(plugin = self.plugin.name(), attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "sink error; retrying");
					tokio::select! {
						_ = tokio::time::sleep(backoff) => {},
						// A shutdown mid-backoff abandons the batch; durable
						// buses redeliver it.
						_ = shutdown.wait() => {
							self.counters.dropped.fetch_add(count, Ordering::Relaxed);
							warn!(plugin = self.plugin.name(), count, "shutdown during backoff; batch abandoned");
							return;
						},
					}
				},
			}
		}
	}

	pub async fn stats(&self) -> DispatcherStats {
		let processed = self.counters.processed.load(Ordering::Relaxed);
		let rate = {
			let mut window = self.counters.window.lock();
			let elapsed = window.started.elapsed();
			if elapsed >= HEALTH_WINDOW {
				window.started = Instant::now();
				window.processed_at_start = processed;
				window.dropped_at_start = self.counters.dropped.load(Ordering::Relaxed);
			}
			let elapsed = window.started.elapsed().as_secs_f64();
			if elapsed > 0.0 {
				(processed.saturating_sub(window.processed_at_start)) as f64 / elapsed
			} else {
				0.0
			}
		};
		DispatcherStats {
			processed,
			dropped: self.counters.dropped.load(Ordering::Relaxed),
			sent: self.counters.sent.load(Ordering::Relaxed),
			processing_rate: rate,
			lag_count: self.bus.lag_count().await.unwrap_or(0),
			stream_length: self.bus.stream_length().await.unwrap_or(0),
			last_processed_at: *self.counters.last_processed_at.lock(),
		}
	}

	pub fn health(&self) -> Health {
		let window = self.counters.window.lock();
		let processed = self
			.counters
			.processed
			.load(Ordering::Relaxed)
			.saturating_sub(window.processed_at_start);
		let dropped = self
			.counters
			.dropped
			.load(Ordering::Relaxed)
			.saturating_sub(window.dropped_at_start);
		if processed > 0 && dropped as f64 / processed as f64 > self.cfg.health_drop_threshold {
			Health::Degraded
		} else {
			Health::Healthy
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::VecDeque;
	use std::sync::Arc;

	use async_trait::async_trait;
	use parking_lot::Mutex;

	use super::plugins::PluginError;
	use super::*;
	use crate::events::memory::MemoryBus;
	use crate::events::{EventBus, test_event};
	use crate::signal;

	#[derive(Default)]
	struct MockPlugin {
		batches: Mutex<Vec<Vec<Payload>>>,
		attempts: Mutex<u64>,
		failures: Mutex<VecDeque<PluginError>>,
	}

	impl MockPlugin {
		fn failing_with(failures: Vec<PluginError>) -> Self {
			Self {
				failures: Mutex::new(failures.into()),
				..Default::default()
			}
		}
	}

	#[async_trait]
	impl BackendPlugin for MockPlugin {
		fn name(&self) -> &'static str {
			"mock"
		}

		async fn send_events(&self, payloads: &[Payload]) -> Result<(), PluginError> {
			*self.attempts.lock() += 1;
			if let Some(err) = self.failures.lock().pop_front() {
				return Err(err);
			}
			self.batches.lock().push(payloads.to_vec());
			Ok(())
		}
	}

	fn fast_config(batch_size: usize) -> DispatcherConfig {
		DispatcherConfig {
			batch_size,
			flush_interval: Duration::from_millis(20),
			retry_attempts: 2,
			retry_backoff: Duration::from_millis(5),
			health_drop_threshold: 0.1,
		}
	}

	async fn run_dispatcher(
		bus: Arc<MemoryBus>,
		plugin: Arc<MockPlugin>,
		cfg: DispatcherConfig,
		events: Vec<crate::events::Event>,
	) -> Dispatcher {
		let dispatcher = Dispatcher::new(bus.clone(), plugin, cfg);
		let (trigger, watcher) = signal::new();
		let d = Dispatcher {
			bus: dispatcher.bus.clone(),
			plugin: dispatcher.plugin.clone(),
			cfg: dispatcher.cfg.clone(),
			counters: dispatcher.counters.clone(),
		};
		let handle = tokio::spawn(async move { d.run(watcher).await });
		// Let the subscriber attach before publishing.
		tokio::time::sleep(Duration::from_millis(10)).await;
		for event in events {
			bus.publish(event).await.unwrap();
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
		trigger.shutdown();
		handle.await.unwrap().unwrap();
		dispatcher
	}

	#[tokio::test]
	async fn batches_by_size() {
		let bus = Arc::new(MemoryBus::new(64));
		let plugin = Arc::new(MockPlugin::default());
		let events = (0..5).map(|i| test_event(&format!("r{i}"))).collect();
		let dispatcher = run_dispatcher(bus, plugin.clone(), fast_config(2), events).await;

		let batches = plugin.batches.lock();
		let total: usize = batches.iter().map(Vec::len).sum();
		assert_eq!(total, 5);
		assert!(batches.iter().take(2).all(|b| b.len() == 2));
		let stats = dispatcher.stats().await;
		assert_eq!(stats.processed, 5);
		assert_eq!(stats.sent, 5);
		assert_eq!(stats.dropped, 0);
	}

	#[tokio::test]
	async fn permanent_error_attempts_once_and_drops() {
		let bus = Arc::new(MemoryBus::new(64));
		let plugin = Arc::new(MockPlugin::failing_with(vec![PluginError::Permanent(
			"bad request".to_string(),
		)]));
		let events = vec![test_event("r0"), test_event("r1")];
		let dispatcher = run_dispatcher(bus, plugin.clone(), fast_config(2), events).await;

		assert_eq!(*plugin.attempts.lock(), 1);
		let stats = dispatcher.stats().await;
		assert_eq!(stats.dropped, 2);
		assert_eq!(stats.sent, 0);
		assert_eq!(dispatcher.health(), Health::Degraded);
	}

	#[tokio::test]
	async fn transient_error_retries_then_succeeds() {
		let bus = Arc::new(MemoryBus::new(64));
		let plugin = Arc::new(MockPlugin::failing_with(vec![
			PluginError::Transient("503".to_string()),
			PluginError::Transient("503".to_string()),
		]));
		let events = vec![test_event("r0"), test_event("r1")];
		let dispatcher = run_dispatcher(bus, plugin.clone(), fast_config(2), events).await;

		assert_eq!(*plugin.attempts.lock(), 3);
		let stats = dispatcher.stats().await;
		assert_eq!(stats.sent, 2);
		assert_eq!(stats.dropped, 0);
		assert_eq!(dispatcher.health(), Health::Healthy);
	}

	#[tokio::test]
	async fn retries_exhausted_drops_batch() {
		let bus = Arc::new(MemoryBus::new(64));
		let plugin = Arc::new(MockPlugin::failing_with(vec![
			PluginError::Transient("503".to_string()),
			PluginError::Transient("503".to_string()),
			PluginError::Transient("503".to_string()),
		]));
		let events = vec![test_event("r0"), test_event("r1")];
		let dispatcher = run_dispatcher(bus, plugin.clone(), fast_config(2), events).await;

		// Initial attempt plus retry_attempts retries.
		assert_eq!(*plugin.attempts.lock(), 3);
		assert_eq!(dispatcher.stats().await.dropped, 2);
	}

	#[tokio::test]
	async fn interval_flushes_partial_batch() {
		let bus = Arc::new(MemoryBus::new(64));
		let plugin = Arc::new(MockPlugin::default());
		let events = vec![test_event("r0")];
		let dispatcher = run_dispatcher(bus, plugin.clone(), fast_config(100), events).await;

		assert_eq!(plugin.batches.lock().len(), 1);
		assert_eq!(dispatcher.stats().await.sent, 1);
	}

	#[tokio::test]
	async fn options_events_filtered_not_dropped() {
		let bus = Arc::new(MemoryBus::new(64));
		let plugin = Arc::new(MockPlugin::default());
		let mut preflight = test_event("r0");
		preflight.method = "OPTIONS".to_string();
		let dispatcher =
			run_dispatcher(bus, plugin.clone(), fast_config(2), vec![preflight, test_event("r1")]).await;

		let stats = dispatcher.stats().await;
		assert_eq!(stats.processed, 2);
		assert_eq!(stats.sent, 1);
		assert_eq!(stats.dropped, 0);
	}
}
