//! keygate-dispatcher: standalone event consumer forwarding to a sink.

use keygate::dispatcher::Dispatcher;
use keygate::{signal, telemetry, Config};
use keygate_app::{build_bus, build_plugin, shutdown_signal};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config = Config::from_env()?;
	let _log_guard = telemetry::init_tracing(&config.log)?;

	let bus = build_bus(&config).await?;
	let plugin = build_plugin(&config)?;
	let dispatcher = Dispatcher::new(bus.clone(), plugin, config.dispatcher.clone());

	let (trigger, watcher) = signal::new();
	let run = tokio::spawn(async move { dispatcher.run(watcher).await });

	shutdown_signal().await;
	info!("shutdown requested");
	trigger.shutdown();
	run.await??;
	bus.close().await;
	Ok(())
}
