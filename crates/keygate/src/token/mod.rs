//! Withering bearer tokens: generation, validation, usage accounting,
//! revocation and expiry sweeping.
//!
//! Tokens are `kg_` + 40 alphanumeric chars from a CSPRNG. The store never
//! sees the plaintext: rows are keyed by hex(sha256(token)) with an optional
//! bcrypt verifier for slow-path confirmation. A size-bounded TTL cache sits
//! in front of the store on the hot path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use rand::RngExt as _;
use rand::distr::Alphanumeric;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::signal::ShutdownWatcher;
use crate::store::{SharedStore, StoreError, TokenRow};

/// Static namespace discriminator preceding the random suffix.
pub const TOKEN_PREFIX: &str = "kg_";
const TOKEN_RAND_LEN: usize = 40;

// Hot-path cache tuning. TTL bounds revocation visibility across instances.
const CACHE_TTL: Duration = Duration::from_secs(30);
const CACHE_CAP: u64 = 100_000;

// bcrypt operates on at most 72 input bytes; longer tokens are pre-hashed.
const BCRYPT_MAX_INPUT: usize = 72;

/// Default sweep cadence and per-run row cap.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_BATCH: u32 = 1000;

/// `first4…last4` rendering for logs, audit rows and API echoes. Applied to
/// tokens and API keys alike; the raw value must never be logged.
pub fn obfuscate(s: &str) -> String {
	if s.len() <= 8 {
		return "…".to_string();
	}
	format!("{}…{}", &s[..4], &s[s.len() - 4..])
}

/// Deterministic lookup key: 64 hex chars of sha256(token).
pub fn lookup_key(token: &str) -> String {
	hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
	#[error("token revoked")]
	Revoked,
	#[error("token expired")]
	Expired,
	#[error("rate limited")]
	RateLimited,
	#[error("token not found")]
	NotFound,
	#[error("project inactive")]
	ProjectInactive,
	#[error("invalid input: {0}")]
	InvalidInput(String),
	#[error("internal: {0}")]
	Internal(String),
}

impl From<StoreError> for TokenError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::NotFound => TokenError::NotFound,
			other => TokenError::Internal(other.to_string()),
		}
	}
}

pub type TokenData = TokenRow;

#[derive(Clone, Debug)]
pub struct TokenServiceConfig {
	/// Store a bcrypt verifier next to the lookup key and check it after a
	/// successful lookup match.
	pub bcrypt_verifier: bool,
	pub bcrypt_cost: u32,
	pub sweep_interval: Duration,
	pub sweep_batch: u32,
}

impl Default for TokenServiceConfig {
	fn default() -> Self {
		Self {
			bcrypt_verifier: true,
			bcrypt_cost: bcrypt::DEFAULT_COST,
			sweep_interval: DEFAULT_SWEEP_INTERVAL,
			sweep_batch: DEFAULT_SWEEP_BATCH,
		}
	}
}

/// Token lifecycle service. Rate-limit decisions made from the cache are
/// per-instance within the cache TTL; the store count is authoritative.
#[derive(Clone)]
pub struct TokenService {
	store: SharedStore,
	cache: Cache<String, TokenRow>,
	cfg: Arc<TokenServiceConfig>,
}

impl TokenService {
	pub fn new(store: SharedStore, cfg: TokenServiceConfig) -> Self {
		Self {
			store,
			cache: Cache::builder()
				.time_to_live(CACHE_TTL)
				.max_capacity(CACHE_CAP)
				.build(),
			cfg: Arc::new(cfg),
		}
	}

	/// Create a token for an active project. The plaintext is returned exactly
	/// once and never stored.
	pub async fn generate(
		&self,
		project_id: &str,
		duration: Option<chrono::Duration>,
		max_requests: Option<i64>,
	) -> Result<(String, Option<DateTime<Utc>>), TokenError> {
		if let Some(m) = max_requests
			&& m <= 0
		{
			return Err(TokenError::InvalidInput("max_requests must be positive".to_string()));
		}
		let project = self.store.get_project(project_id).await?;
		if !project.is_active {
			return Err(TokenError::ProjectInactive);
		}

		// Scoped so the non-Send rng is dropped before any await.
		let rand: String = {
			let mut rng = rand::rng();
			(0..TOKEN_RAND_LEN)
				.map(|_| rng.sample(Alphanumeric) as char)
				.collect()
		};
		let token = format!("{TOKEN_PREFIX}{rand}");
		let expires_at = duration.map(|d| Utc::now() + d);

		let verifier = if self.cfg.bcrypt_verifier {
			Some(
				bcrypt::hash(verifier_input(&token), self.cfg.bcrypt_cost)
					.map_err(|e| TokenError::Internal(e.to_string()))?,
			)
		} else {
			None
		};

		let row = TokenRow {
			lookup_key: lookup_key(&token),
			verifier,
			project_id: project_id.to_string(),
			expires_at,
			is_active: true,
			request_count: 0,
			max_requests,
			created_at: Utc::now(),
			last_used_at: None,
			deactivated_at: None,
		};
		self.store.insert_token(&row).await?;
		info!(
			project_id,
			token = %obfuscate(&token),
			expires_at = ?expires_at,
			max_requests,
			"token generated"
		);
		Ok((token, expires_at))
	}

	/// Validate a presented token. Verdict order: revoked, expired,
	/// rate-limited, valid. One store round trip on cache miss.
	pub async fn validate(&self, token: &str) -> Result<TokenData, TokenError> {
		let key = lookup_key(token);
		if let Some(cached) = self.cache.get(&key).await {
			match verdict(&cached, Utc::now()) {
				Ok(()) => return Ok(cached),
				// A crossing observed on a cached row invalidates it; the store
				// count decides.
				Err(TokenError::RateLimited) => self.cache.invalidate(&key).await,
				Err(e) => {
					self.cache.invalidate(&key).await;
					return Err(e);
				},
			}
		}

		let row = self.store.get_token(&key).await?;
		// The cache is keyed by sha256(token), so a hit already proves
		// possession; the bcrypt verifier only runs on the store path.
		if let Some(verifier) = &row.verifier {
			let ok = bcrypt::verify(verifier_input(token), verifier)
				.map_err(|e| TokenError::Internal(e.to_string()))?;
			if !ok {
				warn!(token = %obfuscate(token), "lookup key matched but verifier did not");
				return Err(TokenError::NotFound);
			}
		}
		verdict(&row, Utc::now())?;
		self.cache.insert(key, row.clone()).await;
		Ok(row)
	}

	/// Count one proxied use. Must be called only after `validate` returned
	/// valid and the upstream call was dispatched (success or not).
	pub async fn record_use(&self, token: &str) -> Result<(), TokenError> {
		self.record_use_by_key(&lookup_key(token)).await
	}

	pub async fn record_use_by_key(&self, key: &str) -> Result<(), TokenError> {
		let now = Utc::now();
		self.store.record_use(key, now).await?;
		if let Some(mut cached) = self.cache.get(key).await {
			cached.request_count += 1;
			cached.last_used_at = Some(now);
			self.cache.insert(key.to_string(), cached).await;
		}
		Ok(())
	}

	pub async fn revoke(&self, token: &str) -> Result<bool, TokenError> {
		self.revoke_by_key(&lookup_key(token)).await
	}

	pub async fn revoke_by_key(&self, key: &str) -> Result<bool, TokenError> {
		let revoked = self.store.revoke_token(key, Utc::now()).await?;
		self.cache.invalidate(key).await;
		if revoked {
			info!(token_key = %obfuscate(key), "token revoked");
		}
		Ok(revoked)
	}

	/// Revoke every token of a project (project deactivation cascade).
	pub async fn revoke_project(&self, project_id: &str) -> Result<u64, TokenError> {
		let count = self
			.store
			.revoke_project_tokens(project_id, Utc::now())
			.await?;
		// Cached rows for this project cannot be enumerated by key; drop
		// everything and let the next requests re-read through.
		self.cache.invalidate_all();
		info!(project_id, count, "project tokens revoked");
		Ok(count)
	}

	/// One bounded sweep pass; returns rows deleted.
	pub async fn sweep_expired(&self) -> Result<u64, TokenError> {
		let swept = self
			.store
			.sweep_expired(Utc::now(), self.cfg.sweep_batch)
			.await?;
		if swept > 0 {
			debug!(swept, "swept expired tokens");
		}
		Ok(swept)
	}

	/// Periodic sweeper; runs until shutdown.
	pub async fn run_sweeper(&self, mut shutdown: ShutdownWatcher) {
		let mut tick = tokio::time::interval(self.cfg.sweep_interval);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = tick.tick() => {
					if let Err(e) = self.sweep_expired().await {
						warn!(error = %e, "token sweep failed");
					}
				},
				_ = shutdown.wait() => {
					debug!("token sweeper stopped");
					return;
				},
			}
		}
	}
}

fn verifier_input(token: &str) -> String {
	if token.len() > BCRYPT_MAX_INPUT {
		lookup_key(token)
	} else {
		token.to_string()
	}
}

fn verdict(row: &TokenRow, now: DateTime<Utc>) -> Result<(), TokenError> {
	if !row.is_active {
		return Err(TokenError::Revoked);
	}
	if let Some(expires_at) = row.expires_at
		&& expires_at <= now
	{
		return Err(TokenError::Expired);
	}
	if let Some(max) = row.max_requests
		&& row.request_count >= max
	{
		return Err(TokenError::RateLimited);
	}
	Ok(())
}
