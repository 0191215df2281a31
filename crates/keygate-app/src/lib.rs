//! Shared wiring for the server and dispatcher binaries.

use std::sync::Arc;

use anyhow::Context;
use keygate::Config;
use keygate::client::{Client, ClientConfig};
use keygate::config::{EventBusKind, PluginKind};
use keygate::crypto::{AesFieldEncryptor, EncryptionKey, FieldEncryptor, NullEncryptor};
use keygate::dispatcher::plugins::{BackendPlugin, file::FilePlugin, helicone::HeliconePlugin, lunary::LunaryPlugin};
use keygate::events::memory::MemoryBus;
use keygate::events::redis::{RedisBusConfig, RedisStreamsBus};
use keygate::events::SharedBus;
use keygate::store::SharedStore;
use keygate::store::sqlite::SqliteStore;
use secrecy::SecretString;
use tracing::warn;

pub async fn build_store(config: &Config) -> anyhow::Result<SharedStore> {
	let store = SqliteStore::connect(&config.database_path)
		.await
		.with_context(|| format!("opening database {}", config.database_path))?;
	Ok(Arc::new(store))
}

pub fn build_encryptor(config: &Config) -> anyhow::Result<Arc<dyn FieldEncryptor>> {
	match &config.encryption_key {
		Some(raw) => {
			let key = EncryptionKey::from_base64(raw).context("parsing ENCRYPTION_KEY")?;
			Ok(Arc::new(AesFieldEncryptor::new(key)))
		},
		None if config.require_encryption_key => {
			anyhow::bail!("REQUIRE_ENCRYPTION_KEY is set but ENCRYPTION_KEY is missing")
		},
		None => {
			warn!("no ENCRYPTION_KEY configured; API keys will be stored unencrypted");
			Ok(Arc::new(NullEncryptor))
		},
	}
}

/// The operator must pick a bus; guessing one silently loses events.
pub async fn build_bus(config: &Config) -> anyhow::Result<SharedBus> {
	match config.event_bus {
		Some(EventBusKind::InMemory) => Ok(Arc::new(MemoryBus::default())),
		Some(EventBusKind::RedisStreams) => {
			let url = config
				.redis_url()
				.context("redis bus selected but REDIS_ADDR missing")?;
			let bus = RedisBusConfig::new(url);
			Ok(Arc::new(RedisStreamsBus::connect(bus).await?))
		},
		None => anyhow::bail!(
			"KEYGATE_EVENT_BUS must be set (in-memory, redis or redis-streams); refusing to guess"
		),
	}
}

pub fn build_plugin(config: &Config) -> anyhow::Result<Arc<dyn BackendPlugin>> {
	let plugin = config
		.plugin
		.as_ref()
		.context("DISPATCHER_PLUGIN must be set (file, lunary or helicone)")?;
	Ok(match plugin {
		PluginKind::File { path } => Arc::new(FilePlugin::new(path.clone())),
		PluginKind::Lunary { api_key } => {
			let client = Client::new(&ClientConfig::default())?;
			Arc::new(LunaryPlugin::new(
				client,
				SecretString::new(api_key.clone().into_boxed_str()),
				None,
			))
		},
		PluginKind::Helicone { api_key } => {
			let client = Client::new(&ClientConfig::default())?;
			Arc::new(HeliconePlugin::new(
				client,
				SecretString::new(api_key.clone().into_boxed_str()),
				None,
			))
		},
	})
}

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			},
			Err(_) => std::future::pending().await,
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
