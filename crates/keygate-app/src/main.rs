//! keygate server: proxy listener, management listener, token sweeper.

use std::sync::Arc;

use keygate::audit::Auditor;
use keygate::cache::MemoryHttpCache;
use keygate::client::{Client, ClientConfig};
use keygate::management::{self, ManagementState};
use keygate::proxy::httpproxy::HTTPProxy;
use keygate::proxy::server::ProxyServer;
use keygate::proxy::ProxyInputs;
use keygate::telemetry::{self, metrics::Metrics};
use keygate::token::{TokenService, TokenServiceConfig};
use keygate::{signal, Config};
use keygate_app::{build_bus, build_encryptor, build_store, shutdown_signal};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config = Config::from_env()?;
	let _log_guard = telemetry::init_tracing(&config.log)?;

	let store = build_store(&config).await?;
	let encryptor = build_encryptor(&config)?;
	let bus = build_bus(&config).await?;
	let cache = Arc::new(MemoryHttpCache::new(config.cache.clone()));
	let metrics = Metrics::new();
	let auditor = Auditor::new(store.clone());
	let tokens = TokenService::new(
		store.clone(),
		TokenServiceConfig {
			sweep_interval: config.sweep_interval,
			sweep_batch: config.sweep_batch,
			..Default::default()
		},
	);
	let upstream = Client::new(&ClientConfig::default())?;

	let (trigger, watcher) = signal::new();
	let inputs = Arc::new(ProxyInputs {
		apis: config.apis.clone(),
		drain: trigger.watcher(),
		tokens: tokens.clone(),
		store: store.clone(),
		encryptor: encryptor.clone(),
		cache: cache.clone(),
		bus: bus.clone(),
		upstream,
		auditor: auditor.clone(),
		metrics: metrics.clone(),
		max_request_size: config.max_request_size,
		max_response_buffer: config.max_response_buffer,
	});

	let proxy = ProxyServer::bind(
		config.listen_addr,
		HTTPProxy::new(inputs),
		config.drain_deadline,
	)
	.await?;

	let management_state = Arc::new(ManagementState {
		store,
		tokens: tokens.clone(),
		cache,
		encryptor,
		auditor,
		metrics,
		management_token: config.management_token.clone(),
	});
	let management_task = tokio::spawn(management::serve(
		config.management_addr,
		management_state,
		trigger.watcher(),
	));

	// With the in-memory bus there is no separate dispatcher process to
	// consume events; run one in-process when a sink is configured.
	let dispatcher_task = match &config.plugin {
		Some(_) => {
			let dispatcher = keygate::dispatcher::Dispatcher::new(
				bus.clone(),
				keygate_app::build_plugin(&config)?,
				config.dispatcher.clone(),
			);
			let watcher = trigger.watcher();
			Some(tokio::spawn(async move { dispatcher.run(watcher).await }))
		},
		None => None,
	};

	let sweeper_tokens = tokens.clone();
	let sweeper_watcher = trigger.watcher();
	let sweeper_task = tokio::spawn(async move {
		sweeper_tokens.run_sweeper(sweeper_watcher).await;
	});

	let proxy_task = tokio::spawn(proxy.run(watcher));

	shutdown_signal().await;
	info!("shutdown requested");
	trigger.shutdown();

	proxy_task.await??;
	management_task.await??;
	let _ = sweeper_task.await;
	if let Some(task) = dispatcher_task {
		task.await??;
	}
	bus.close().await;
	info!("bye");
	Ok(())
}
