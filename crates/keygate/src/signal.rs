//! Process-wide shutdown signalling: one trigger, many watchers.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct ShutdownTrigger {
	tx: Arc<watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct ShutdownWatcher {
	rx: watch::Receiver<bool>,
}

pub fn new() -> (ShutdownTrigger, ShutdownWatcher) {
	let (tx, rx) = watch::channel(false);
	(ShutdownTrigger { tx: Arc::new(tx) }, ShutdownWatcher { rx })
}

impl ShutdownTrigger {
	pub fn shutdown(&self) {
		let _ = self.tx.send(true);
	}

	pub fn watcher(&self) -> ShutdownWatcher {
		ShutdownWatcher {
			rx: self.tx.subscribe(),
		}
	}
}

impl ShutdownWatcher {
	/// Resolves once shutdown is triggered (immediately if it already was).
	pub async fn wait(&mut self) {
		while !*self.rx.borrow() {
			if self.rx.changed().await.is_err() {
				return;
			}
		}
	}

	pub fn is_shutdown(&self) -> bool {
		*self.rx.borrow()
	}
}
