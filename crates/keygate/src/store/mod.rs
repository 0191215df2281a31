//! Persistent state: projects, tokens and audit events.
//!
//! Backends are capability traits so the proxy core never sees a SQL dialect.
//! The enumerated variants are the sqlite backend (sqlx) for durable
//! deployments and the in-memory backend for tests and throwaway instances.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod memory;
mod migrations;
pub mod sqlite;

pub use migrations::{MIGRATIONS, Migration};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("not found")]
	NotFound,
	#[error("conflict: {0}")]
	Conflict(String),
	#[error("invalid input: {0}")]
	InvalidInput(String),
	#[error("store error: {0}")]
	Internal(String),
}

impl From<sqlx::Error> for StoreError {
	fn from(e: sqlx::Error) -> Self {
		match e {
			sqlx::Error::RowNotFound => StoreError::NotFound,
			sqlx::Error::Database(db) if db.is_unique_violation() => {
				StoreError::Conflict(db.message().to_string())
			},
			other => StoreError::Internal(other.to_string()),
		}
	}
}

/// A tenant owning one upstream credential. The API key is stored only as
/// ciphertext (`enc:v1:` prefixed); plaintext never reaches the store.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Project {
	pub id: String,
	pub name: String,
	#[serde(skip_serializing)]
	pub api_key_encrypted: String,
	pub is_active: bool,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub deactivated_at: Option<DateTime<Utc>>,
}

/// A withering token row. The plaintext token is never stored; `lookup_key`
/// is hex(sha256(token)) and `verifier` an optional bcrypt hash for slow-path
/// confirmation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRow {
	pub lookup_key: String,
	pub verifier: Option<String>,
	pub project_id: String,
	pub expires_at: Option<DateTime<Utc>>,
	pub is_active: bool,
	pub request_count: i64,
	pub max_requests: Option<i64>,
	pub created_at: DateTime<Utc>,
	pub last_used_at: Option<DateTime<Utc>>,
	pub deactivated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
	Success,
	Failure,
	Denied,
	Error,
}

impl AuditOutcome {
	pub fn as_str(&self) -> &'static str {
		match self {
			AuditOutcome::Success => "success",
			AuditOutcome::Failure => "failure",
			AuditOutcome::Denied => "denied",
			AuditOutcome::Error => "error",
		}
	}
}

impl std::str::FromStr for AuditOutcome {
	type Err = StoreError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"success" => Ok(AuditOutcome::Success),
			"failure" => Ok(AuditOutcome::Failure),
			"denied" => Ok(AuditOutcome::Denied),
			"error" => Ok(AuditOutcome::Error),
			other => Err(StoreError::InvalidInput(format!("unknown outcome {other}"))),
		}
	}
}

/// Append-only record of a security-relevant action.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
	pub id: String,
	pub timestamp: DateTime<Utc>,
	pub action: String,
	pub actor: String,
	pub project_id: Option<String>,
	pub request_id: Option<String>,
	pub correlation_id: Option<String>,
	pub client_ip: Option<String>,
	pub method: Option<String>,
	pub path: Option<String>,
	pub outcome: AuditOutcome,
	pub reason: Option<String>,
	/// Obfuscated token reference, never the plaintext.
	pub token_id: Option<String>,
	pub metadata: serde_json::Value,
}

impl AuditRecord {
	pub fn new(action: impl Into<String>, actor: impl Into<String>, outcome: AuditOutcome) -> Self {
		AuditRecord {
			id: uuid::Uuid::new_v4().to_string(),
			timestamp: Utc::now(),
			action: action.into(),
			actor: actor.into(),
			project_id: None,
			request_id: None,
			correlation_id: None,
			client_ip: None,
			method: None,
			path: None,
			outcome,
			reason: None,
			token_id: None,
			metadata: serde_json::Value::Null,
		}
	}
}

/// Fields touched by a project update; `None` leaves the column unchanged.
#[derive(Debug, Default)]
pub struct ProjectUpdate {
	pub name: Option<String>,
	pub api_key_encrypted: Option<String>,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
	async fn create_project(&self, project: &Project) -> Result<(), StoreError>;
	async fn get_project(&self, id: &str) -> Result<Project, StoreError>;
	async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;
	async fn update_project(&self, id: &str, update: ProjectUpdate) -> Result<Project, StoreError>;
	/// Soft-deactivate; the caller is responsible for cascade-revoking tokens.
	async fn deactivate_project(&self, id: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
	async fn insert_token(&self, token: &TokenRow) -> Result<(), StoreError>;
	async fn get_token(&self, lookup_key: &str) -> Result<TokenRow, StoreError>;
	async fn list_tokens(&self, project_id: &str) -> Result<Vec<TokenRow>, StoreError>;
	/// Atomic `request_count += 1, last_used_at = now`.
	async fn record_use(&self, lookup_key: &str, now: DateTime<Utc>) -> Result<(), StoreError>;
	/// Returns false when the token was already inactive or absent.
	async fn revoke_token(&self, lookup_key: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;
	/// Bulk revoke; returns the number of rows transitioned to inactive.
	async fn revoke_project_tokens(
		&self,
		project_id: &str,
		now: DateTime<Utc>,
	) -> Result<u64, StoreError>;
	/// Physically delete rows that are both inactive and expired, up to `batch`.
	async fn sweep_expired(&self, now: DateTime<Utc>, batch: u32) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
	async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError>;
	/// Most recent records, newest first. Used by tests and operators.
	async fn recent_audit(&self, limit: u32) -> Result<Vec<AuditRecord>, StoreError>;
}

/// The full persistence capability the server wires together.
pub trait Store: ProjectStore + TokenStore + AuditStore {}
impl<T: ProjectStore + TokenStore + AuditStore> Store for T {}

pub type SharedStore = Arc<dyn Store>;
