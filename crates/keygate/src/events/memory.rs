//! Single-process event bus over a bounded broadcast queue.
//!
//! Each subscriber sees its own bounded FIFO. A slow subscriber loses the
//! oldest entries (counted in `dropped`); the producer never blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::warn;

use super::{BusError, BusStats, Event, EventBus, EventStream};

pub const DEFAULT_BUFFER: usize = 1024;

pub struct MemoryBus {
	tx: broadcast::Sender<Event>,
	seq: AtomicU64,
	published: AtomicU64,
	dropped: Arc<AtomicU64>,
	closed: AtomicU64,
}

impl MemoryBus {
	pub fn new(buffer: usize) -> Self {
		let (tx, _) = broadcast::channel(buffer.max(1));
		Self {
			tx,
			seq: AtomicU64::new(0),
			published: AtomicU64::new(0),
			dropped: Arc::new(AtomicU64::new(0)),
			closed: AtomicU64::new(0),
		}
	}
}

impl Default for MemoryBus {
	fn default() -> Self {
		Self::new(DEFAULT_BUFFER)
	}
}

#[async_trait]
impl EventBus for MemoryBus {
	async fn publish(&self, mut event: Event) -> Result<(), BusError> {
		if self.closed.load(Ordering::Acquire) != 0 {
			return Err(BusError::Closed);
		}
		event.log_id = self.seq.fetch_add(1, Ordering::Relaxed).to_string();
		self.published.fetch_add(1, Ordering::Relaxed);
		if self.tx.send(event).is_err() {
			// No live subscriber; the entry is gone.
			self.dropped.fetch_add(1, Ordering::Relaxed);
		}
		Ok(())
	}

	async fn subscribe(&self) -> Result<EventStream, BusError> {
		if self.closed.load(Ordering::Acquire) != 0 {
			return Err(BusError::Closed);
		}
		let rx = self.tx.subscribe();
		let dropped = self.dropped.clone();
		let stream = futures::stream::unfold(rx, move |mut rx| {
			let dropped = dropped.clone();
			async move {
				loop {
					match rx.recv().await {
						Ok(event) => return Some((event, rx)),
						Err(broadcast::error::RecvError::Lagged(n)) => {
							dropped.fetch_add(n, Ordering::Relaxed);
							warn!(lost = n, "subscriber lagged; oldest events dropped");
						},
						Err(broadcast::error::RecvError::Closed) => return None,
					}
				}
			}
		});
		Ok(stream.boxed())
	}

	fn stats(&self) -> BusStats {
		BusStats {
			published: self.published.load(Ordering::Relaxed),
			dropped: self.dropped.load(Ordering::Relaxed),
		}
	}

	async fn close(&self) {
		self.closed.store(1, Ordering::Release);
	}

	async fn stream_length(&self) -> Result<u64, BusError> {
		Ok(self.tx.len() as u64)
	}
}
