//! Durable event bus on Redis Streams with consumer groups.
//!
//! Wire format: each stream entry carries a single `data` field holding the
//! JSON-encoded event. Consumption is at-least-once: an entry is acknowledged
//! only after the downstream channel accepted it, so a crash mid-dispatch
//! leaves it pending for recovery or claim by a peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::streams::{
	StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamPendingReply,
	StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{BusError, BusStats, Event, EventBus, EventStream};
use crate::signal::{self, ShutdownTrigger, ShutdownWatcher};

#[derive(Debug, Clone)]
pub struct RedisBusConfig {
	/// e.g. `redis://127.0.0.1:6379/0`
	pub url: String,
	pub stream_key: String,
	pub group: String,
	pub consumer_name: String,
	/// `XADD ... MAXLEN ~ N` approximate retention cap.
	pub maxlen: usize,
	/// BLOCK timeout for the live read phase.
	pub block_timeout: Duration,
	/// Steal entries idle longer than this from crashed peers.
	pub claim_min_idle: Duration,
	pub read_count: usize,
	pub channel_buffer: usize,
}

impl RedisBusConfig {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			stream_key: "keygate:events".to_string(),
			group: "keygate-dispatchers".to_string(),
			consumer_name: format!("dispatcher-{}", uuid::Uuid::new_v4()),
			maxlen: 10_000,
			block_timeout: Duration::from_secs(5),
			claim_min_idle: Duration::from_secs(60),
			read_count: 64,
			channel_buffer: 256,
		}
	}
}

pub struct RedisStreamsBus {
	conn: MultiplexedConnection,
	cfg: RedisBusConfig,
	published: AtomicU64,
	dropped: AtomicU64,
	shutdown: ShutdownTrigger,
	watcher: ShutdownWatcher,
}

impl RedisStreamsBus {
	pub async fn connect(cfg: RedisBusConfig) -> Result<Self, BusError> {
		let client =
			redis::Client::open(cfg.url.as_str()).map_err(|e| BusError::Backend(e.to_string()))?;
		let conn = client
			.get_multiplexed_async_connection()
			.await
			.map_err(|e| BusError::Backend(e.to_string()))?;
		let (shutdown, watcher) = signal::new();
		info!(stream = %cfg.stream_key, group = %cfg.group, "redis streams bus connected");
		Ok(Self {
			conn,
			cfg,
			published: AtomicU64::new(0),
			dropped: AtomicU64::new(0),
			shutdown,
			watcher,
		})
	}

	async fn ensure_group(&self) -> Result<(), BusError> {
		let mut conn = self.conn.clone();
		let res: Result<String, redis::RedisError> = conn
			.xgroup_create_mkstream(&self.cfg.stream_key, &self.cfg.group, "0")
			.await;
		match res {
			Ok(_) => Ok(()),
			// Already exists is success; first subscriber wins the creation.
			Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
			Err(e) => Err(BusError::Backend(e.to_string())),
		}
	}
}

pub(crate) fn encode_entry(event: &Event) -> Result<String, BusError> {
	serde_json::to_string(event).map_err(|e| BusError::Serialization(e.to_string()))
}

pub(crate) fn decode_entry(entry: &StreamId) -> Result<Event, BusError> {
	let data: String = entry
		.get("data")
		.ok_or_else(|| BusError::Serialization("missing data field".to_string()))?;
	let mut event: Event =
		serde_json::from_str(&data).map_err(|e| BusError::Serialization(e.to_string()))?;
	event.log_id = entry.id.clone();
	Ok(event)
}

#[async_trait]
impl EventBus for RedisStreamsBus {
	async fn publish(&self, event: Event) -> Result<(), BusError> {
		if self.watcher.is_shutdown() {
			return Err(BusError::Closed);
		}
		let payload = encode_entry(&event)?;
		let mut conn = self.conn.clone();
		let res: Result<String, redis::RedisError> = conn
			.xadd_maxlen(
				&self.cfg.stream_key,
				StreamMaxlen::Approx(self.cfg.maxlen),
				"*",
				&[("data", payload.as_str())],
			)
			.await;
		match res {
			Ok(_) => {
				self.published.fetch_add(1, Ordering::Relaxed);
				Ok(())
			},
			Err(e) => {
				self.dropped.fetch_add(1, Ordering::Relaxed);
				Err(BusError::Backend(e.to_string()))
			},
		}
	}

	async fn subscribe(&self) -> Result<EventStream, BusError> {
		if self.watcher.is_shutdown() {
			return Err(BusError::Closed);
		}
		self.ensure_group().await?;
		let (tx, rx) = mpsc::channel(self.cfg.channel_buffer);
		let consumer = Consumer {
			conn: self.conn.clone(),
			cfg: self.cfg.clone(),
			tx,
		};
		let watcher = self.shutdown.watcher();
		tokio::spawn(consumer.run(watcher));
		Ok(ReceiverStream::new(rx).boxed())
	}

	fn stats(&self) -> BusStats {
		BusStats {
			published: self.published.load(Ordering::Relaxed),
			dropped: self.dropped.load(Ordering::Relaxed),
		}
	}

	async fn close(&self) {
		self.shutdown.shutdown();
	}

	async fn stream_length(&self) -> Result<u64, BusError> {
		let mut conn = self.conn.clone();
		conn
			.xlen(&self.cfg.stream_key)
			.await
			.map_err(|e| BusError::Backend(e.to_string()))
	}

	async fn lag_count(&self) -> Result<u64, BusError> {
		let mut conn = self.conn.clone();
		let reply: StreamPendingReply = conn
			.xpending(&self.cfg.stream_key, &self.cfg.group)
			.await
			.map_err(|e| BusError::Backend(e.to_string()))?;
		Ok(match reply {
			StreamPendingReply::Empty => 0,
			StreamPendingReply::Data(data) => data.count as u64,
		})
	}
}

struct Consumer {
	conn: MultiplexedConnection,
	cfg: RedisBusConfig,
	tx: mpsc::Sender<Event>,
}

impl Consumer {
	/// Three phases: recover own pending entries, read live traffic, and claim
	/// abandoned entries from crashed peers when the stream goes quiet.
	async fn run(mut self, mut shutdown: ShutdownWatcher) {
		if !self.recover().await {
			return;
		}
		loop {
			tokio::select! {
				_ = shutdown.wait() => {
					debug!(consumer = %self.cfg.consumer_name, "consumer stopped");
					return;
				},
				read = self.read_live() => {
					match read {
						Ok(entries) if !entries.is_empty() => {
							for entry in entries {
								if !self.dispatch(entry).await {
									return;
								}
							}
						},
						Ok(_) => {
							// Quiet stream; look for abandoned work.
							if !self.claim_stale().await {
								return;
							}
						},
						Err(e) => {
							warn!(error = %e, "live read failed; backing off");
							tokio::time::sleep(Duration::from_secs(1)).await;
						},
					}
				},
			}
		}
	}

	/// Phase 1: entries previously delivered to this consumer but never acked.
	async fn recover(&mut self) -> bool {
		loop {
			let opts = StreamReadOptions::default()
				.group(&self.cfg.group, &self.cfg.consumer_name)
				.count(self.cfg.read_count);
			let reply: Result<StreamReadReply, redis::RedisError> = self
				.conn
				.xread_options(&[&self.cfg.stream_key], &["0"], &opts)
				.await;
			let entries = match reply {
				Ok(r) => flatten(r),
				Err(e) => {
					warn!(error = %e, "pending recovery read failed");
					return true;
				},
			};
			if entries.is_empty() {
				return true;
			}
			debug!(count = entries.len(), "recovering pending entries");
			for entry in entries {
				if !self.dispatch(entry).await {
					return false;
				}
			}
		}
	}

	async fn read_live(&mut self) -> Result<Vec<StreamId>, redis::RedisError> {
		let opts = StreamReadOptions::default()
			.group(&self.cfg.group, &self.cfg.consumer_name)
			.count(self.cfg.read_count)
			.block(self.cfg.block_timeout.as_millis() as usize);
		let reply: StreamReadReply = self
			.conn
			.xread_options(&[&self.cfg.stream_key], &[">"], &opts)
			.await?;
		Ok(flatten(reply))
	}

	/// Phase 3: steal entries idle past `claim_min_idle` from other consumers.
	async fn claim_stale(&mut self) -> bool {
		let pending: StreamPendingCountReply = match self
			.conn
			.xpending_count(
				&self.cfg.stream_key,
				&self.cfg.group,
				"-",
				"+",
				self.cfg.read_count,
			)
			.await
		{
			Ok(p) => p,
			Err(e) => {
				warn!(error = %e, "xpending failed");
				return true;
			},
		};
		let min_idle_ms = self.cfg.claim_min_idle.as_millis() as usize;
		let stale: Vec<String> = pending
			.ids
			.into_iter()
			.filter(|p| p.consumer != self.cfg.consumer_name && p.last_delivered_ms >= min_idle_ms)
			.map(|p| p.id)
			.collect();
		if stale.is_empty() {
			return true;
		}
		let claimed: StreamClaimReply = match self
			.conn
			.xclaim(
				&self.cfg.stream_key,
				&self.cfg.group,
				&self.cfg.consumer_name,
				min_idle_ms,
				&stale,
			)
			.await
		{
			Ok(c) => c,
			Err(e) => {
				warn!(error = %e, "xclaim failed");
				return true;
			},
		};
		info!(count = claimed.ids.len(), "claimed stale entries from peers");
		for entry in claimed.ids {
			if !self.dispatch(entry).await {
				return false;
			}
		}
		true
	}

	/// Hand one entry downstream, acking only after it was accepted. Returns
	/// false when the downstream is gone (entry stays pending).
	async fn dispatch(&mut self, entry: StreamId) -> bool {
		let id = entry.id.clone();
		match decode_entry(&entry) {
			Ok(event) => {
				if self.tx.send(event).await.is_err() {
					debug!(id = %id, "downstream closed; leaving entry pending");
					return false;
				}
				self.ack(&id).await;
				true
			},
			Err(e) => {
				// Unparseable entries would wedge the stream head forever.
				warn!(id = %id, error = %e, "dropping invalid stream entry");
				self.ack(&id).await;
				true
			},
		}
	}

	async fn ack(&mut self, id: &str) {
		let res: Result<u64, redis::RedisError> = self
			.conn
			.xack(&self.cfg.stream_key, &self.cfg.group, &[id])
			.await;
		if let Err(e) = res {
			warn!(id = %id, error = %e, "xack failed; entry may be redelivered");
		}
	}
}

fn flatten(reply: StreamReadReply) -> Vec<StreamId> {
	reply.keys.into_iter().flat_map(|k| k.ids).collect()
}
