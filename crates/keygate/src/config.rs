//! Environment-driven configuration.
//!
//! Everything the binaries need comes from the environment (plus an optional
//! YAML file for the API table). There is no implicit event-bus fallback: the
//! operator must pick a backend explicitly so events are never silently lost.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use secrecy::SecretString;

use crate::cache::CacheConfig;
use crate::dispatcher::DispatcherConfig;
use crate::proxy::ApiTable;
use crate::telemetry::{LogConfig, LogFormat};
use crate::token::{DEFAULT_SWEEP_BATCH, DEFAULT_SWEEP_INTERVAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBusKind {
	InMemory,
	RedisStreams,
}

impl std::str::FromStr for EventBusKind {
	type Err = anyhow::Error;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"in-memory" | "memory" => Ok(EventBusKind::InMemory),
			"redis" | "redis-streams" => Ok(EventBusKind::RedisStreams),
			other => anyhow::bail!(
				"unknown event bus {other:?} (expected in-memory, redis or redis-streams)"
			),
		}
	}
}

/// Which sink the dispatcher forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginKind {
	File { path: String },
	Lunary { api_key: String },
	Helicone { api_key: String },
}

#[derive(Debug, Clone)]
pub struct Config {
	pub listen_addr: SocketAddr,
	pub management_addr: SocketAddr,
	/// Path of the sqlite database file.
	pub database_path: String,
	pub management_token: SecretString,
	pub log: LogConfig,
	pub encryption_key: Option<String>,
	pub require_encryption_key: bool,
	/// None until the operator picks one; both binaries refuse to guess.
	pub event_bus: Option<EventBusKind>,
	pub redis_addr: Option<String>,
	pub redis_db: u32,
	pub apis: ApiTable,
	pub cache: CacheConfig,
	pub max_request_size: usize,
	pub max_response_buffer: usize,
	pub sweep_interval: Duration,
	pub sweep_batch: u32,
	pub drain_deadline: Duration,
	pub dispatcher: DispatcherConfig,
	pub plugin: Option<PluginKind>,
}

impl Config {
	pub fn from_env() -> anyhow::Result<Self> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
		let listen_addr = parse_or(&lookup, "LISTEN_ADDR", "127.0.0.1:8080")?;
		let management_addr = parse_or(&lookup, "MANAGEMENT_ADDR", "127.0.0.1:9090")?;

		let database_path = lookup("DATABASE_PATH")
			.or_else(|| {
				lookup("DATABASE_URL").map(|url| {
					url
						.trim_start_matches("sqlite://")
						.trim_start_matches("sqlite:")
						.to_string()
				})
			})
			.unwrap_or_else(|| "keygate.db".to_string());

		let management_token = SecretString::new(
			lookup("MANAGEMENT_TOKEN")
				.context("MANAGEMENT_TOKEN must be set")?
				.into_boxed_str(),
		);

		let log = LogConfig {
			level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
			format: lookup("LOG_FORMAT")
				.map(|f| f.parse())
				.transpose()?
				.unwrap_or(LogFormat::Console),
			file: lookup("LOG_FILE"),
		};

		let event_bus = lookup("KEYGATE_EVENT_BUS")
			.or_else(|| lookup("LLM_PROXY_EVENT_BUS"))
			.map(|v| v.parse::<EventBusKind>())
			.transpose()?;
		let redis_addr = lookup("REDIS_ADDR");
		let redis_db: u32 = parse_or(&lookup, "REDIS_DB", "0")?;
		if event_bus == Some(EventBusKind::RedisStreams) && redis_addr.is_none() {
			anyhow::bail!("REDIS_ADDR must be set when the redis event bus is selected");
		}

		let apis = match lookup("API_CONFIG_FILE") {
			Some(path) => {
				let raw = std::fs::read_to_string(&path)
					.with_context(|| format!("reading API config {path}"))?;
				ApiTable::from_yaml(&raw).with_context(|| format!("parsing API config {path}"))?
			},
			None => ApiTable::openai_default(),
		};

		let max_object_bytes: usize = parse_or(&lookup, "MAX_OBJECT_BYTES", "1048576")?;
		let cache = CacheConfig {
			max_object_bytes,
			default_ttl: Duration::from_secs(parse_or(&lookup, "DEFAULT_CACHE_TTL_SECS", "0")?),
			max_entries: parse_or(&lookup, "CACHE_MAX_ENTRIES", "10000")?,
		};
		let max_request_size: usize = parse_or(&lookup, "MAX_REQUEST_SIZE", "10485760")?;
		let max_response_buffer: usize = parse_or(
			&lookup,
			"MAX_RESPONSE_BUFFER",
			&max_object_bytes.max(4 * 1024 * 1024).to_string(),
		)?;

		let dispatcher = DispatcherConfig {
			batch_size: parse_or(&lookup, "DISPATCHER_BATCH_SIZE", "32")?,
			flush_interval: Duration::from_millis(parse_or(
				&lookup,
				"DISPATCHER_FLUSH_INTERVAL_MS",
				"5000",
			)?),
			retry_attempts: parse_or(&lookup, "DISPATCHER_RETRY_ATTEMPTS", "3")?,
			retry_backoff: Duration::from_millis(parse_or(
				&lookup,
				"DISPATCHER_RETRY_BACKOFF_MS",
				"1000",
			)?),
			health_drop_threshold: parse_or(&lookup, "DISPATCHER_HEALTH_DROP_THRESHOLD", "0.1")?,
		};

		let plugin = match lookup("DISPATCHER_PLUGIN").as_deref() {
			Some("file") => Some(PluginKind::File {
				path: lookup("FILE_PLUGIN_PATH").unwrap_or_else(|| "events.jsonl".to_string()),
			}),
			Some("lunary") => Some(PluginKind::Lunary {
				api_key: lookup("LUNARY_API_KEY").context("LUNARY_API_KEY must be set")?,
			}),
			Some("helicone") => Some(PluginKind::Helicone {
				api_key: lookup("HELICONE_API_KEY").context("HELICONE_API_KEY must be set")?,
			}),
			Some(other) => anyhow::bail!("unknown dispatcher plugin {other:?}"),
			None => None,
		};

		Ok(Config {
			listen_addr,
			management_addr,
			database_path,
			management_token,
			log,
			encryption_key: lookup("ENCRYPTION_KEY"),
			require_encryption_key: lookup("REQUIRE_ENCRYPTION_KEY")
				.is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes")),
			event_bus,
			redis_addr,
			redis_db,
			apis,
			cache,
			max_request_size,
			max_response_buffer,
			sweep_interval: Duration::from_secs(parse_or(
				&lookup,
				"TOKEN_SWEEP_INTERVAL_SECS",
				&DEFAULT_SWEEP_INTERVAL.as_secs().to_string(),
			)?),
			sweep_batch: parse_or(&lookup, "TOKEN_SWEEP_BATCH", &DEFAULT_SWEEP_BATCH.to_string())?,
			drain_deadline: Duration::from_secs(parse_or(&lookup, "DRAIN_DEADLINE_SECS", "30")?),
			dispatcher,
			plugin,
		})
	}

	pub fn redis_url(&self) -> Option<String> {
		self
			.redis_addr
			.as_ref()
			.map(|addr| format!("redis://{addr}/{}", self.redis_db))
	}
}

fn parse_or<T>(
	lookup: &impl Fn(&str) -> Option<String>,
	key: &str,
	default: &str,
) -> anyhow::Result<T>
where
	T: std::str::FromStr,
	T::Err: std::fmt::Display,
{
	let raw = lookup(key).unwrap_or_else(|| default.to_string());
	raw
		.parse::<T>()
		.map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}"))
}
