//! sqlx-backed sqlite store.
//!
//! All queries use the runtime API with positional binds so the schema stays
//! in one place (the embedded migrations).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::{
	AuditRecord, AuditStore, MIGRATIONS, Project, ProjectStore, ProjectUpdate, StoreError, TokenRow,
	TokenStore,
};

#[derive(Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
}

impl SqliteStore {
	/// Open (creating if needed) the database at `path` and bring the schema
	/// up to date. `:memory:` is accepted for tests.
	pub async fn connect(path: &str) -> Result<Self, StoreError> {
		let opts = SqliteConnectOptions::new()
			.filename(path)
			.create_if_missing(true)
			.foreign_keys(true);
		let pool = SqlitePoolOptions::new()
			.max_connections(8)
			.connect_with(opts)
			.await?;
		let store = Self { pool };
		store.migrate_up().await?;
		Ok(store)
	}

	pub async fn in_memory() -> Result<Self, StoreError> {
		// A single connection keeps the in-memory database alive and shared.
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.connect("sqlite::memory:")
			.await?;
		let store = Self { pool };
		store.migrate_up().await?;
		Ok(store)
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	pub async fn migrate_up(&self) -> Result<(), StoreError> {
		sqlx::raw_sql(
			"CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, name TEXT NOT NULL, applied_at TEXT NOT NULL)",
		)
		.execute(&self.pool)
		.await?;
		let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations")
			.fetch_all(&self.pool)
			.await?;
		for m in MIGRATIONS {
			if applied.contains(&m.version) {
				continue;
			}
			let mut tx = self.pool.begin().await?;
			sqlx::raw_sql(m.up).execute(&mut *tx).await?;
			sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
				.bind(m.version)
				.bind(m.name)
				.bind(Utc::now())
				.execute(&mut *tx)
				.await?;
			tx.commit().await?;
			info!(version = m.version, name = m.name, "applied migration");
		}
		Ok(())
	}

	/// Roll back every applied migration, newest first.
	pub async fn migrate_down(&self) -> Result<(), StoreError> {
		let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version DESC")
			.fetch_all(&self.pool)
			.await?;
		for version in applied {
			let Some(m) = MIGRATIONS.iter().find(|m| m.version == version) else {
				return Err(StoreError::Internal(format!("unknown migration version {version}")));
			};
			let mut tx = self.pool.begin().await?;
			sqlx::raw_sql(m.down).execute(&mut *tx).await?;
			sqlx::query("DELETE FROM schema_migrations WHERE version = ?")
				.bind(m.version)
				.execute(&mut *tx)
				.await?;
			tx.commit().await?;
			debug!(version = m.version, name = m.name, "reverted migration");
		}
		Ok(())
	}
}

#[async_trait]
impl ProjectStore for SqliteStore {
	async fn create_project(&self, project: &Project) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO projects (id, name, api_key_encrypted, is_active, created_at, updated_at, deactivated_at)
			 VALUES (?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(&project.id)
		.bind(&project.name)
		.bind(&project.api_key_encrypted)
		.bind(project.is_active)
		.bind(project.created_at)
		.bind(project.updated_at)
		.bind(project.deactivated_at)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn get_project(&self, id: &str) -> Result<Project, StoreError> {
		let row = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
			.bind(id)
			.fetch_optional(&self.pool)
			.await?;
		row.ok_or(StoreError::NotFound)
	}

	async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
		Ok(
			sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY created_at")
				.fetch_all(&self.pool)
				.await?,
		)
	}

	async fn update_project(&self, id: &str, update: ProjectUpdate) -> Result<Project, StoreError> {
		let res = sqlx::query(
			"UPDATE projects SET
				name = COALESCE(?, name),
				api_key_encrypted = COALESCE(?, api_key_encrypted),
				updated_at = ?
			 WHERE id = ?",
		)
		.bind(update.name)
		.bind(update.api_key_encrypted)
		.bind(Utc::now())
		.bind(id)
		.execute(&self.pool)
		.await?;
		if res.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		self.get_project(id).await
	}

	async fn deactivate_project(&self, id: &str) -> Result<(), StoreError> {
		let now = Utc::now();
		let res = sqlx::query(
			"UPDATE projects SET is_active = 0, deactivated_at = ?, updated_at = ? WHERE id = ? AND is_active = 1",
		)
		.bind(now)
		.bind(now)
		.bind(id)
		.execute(&self.pool)
		.await?;
		if res.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}
}

#[async_trait]
impl TokenStore for SqliteStore {
	async fn insert_token(&self, token: &TokenRow) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO tokens (lookup_key, verifier, project_id, expires_at, is_active, request_count, max_requests, created_at, last_used_at, deactivated_at)
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(&token.lookup_key)
		.bind(&token.verifier)
		.bind(&token.project_id)
		.bind(token.expires_at)
		.bind(token.is_active)
		.bind(token.request_count)
		.bind(token.max_requests)
		.bind(token.created_at)
		.bind(token.last_used_at)
		.bind(token.deactivated_at)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn get_token(&self, lookup_key: &str) -> Result<TokenRow, StoreError> {
		let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE lookup_key = ?")
			.bind(lookup_key)
			.fetch_optional(&self.pool)
			.await?;
		row.ok_or(StoreError::NotFound)
	}

	async fn list_tokens(&self, project_id: &str) -> Result<Vec<TokenRow>, StoreError> {
		Ok(
			sqlx::query_as::<_, TokenRow>(
				"SELECT * FROM tokens WHERE project_id = ? ORDER BY created_at DESC",
			)
			.bind(project_id)
			.fetch_all(&self.pool)
			.await?,
		)
	}

	async fn record_use(&self, lookup_key: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
		let res = sqlx::query(
			"UPDATE tokens SET request_count = request_count + 1, last_used_at = ? WHERE lookup_key = ?",
		)
		.bind(now)
		.bind(lookup_key)
		.execute(&self.pool)
		.await?;
		if res.rows_affected() == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	async fn revoke_token(&self, lookup_key: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
		let res = sqlx::query(
			"UPDATE tokens SET is_active = 0, deactivated_at = ? WHERE lookup_key = ? AND is_active = 1",
		)
		.bind(now)
		.bind(lookup_key)
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected() > 0)
	}

	async fn revoke_project_tokens(
		&self,
		project_id: &str,
		now: DateTime<Utc>,
	) -> Result<u64, StoreError> {
		let res = sqlx::query(
			"UPDATE tokens SET is_active = 0, deactivated_at = ? WHERE project_id = ? AND is_active = 1",
		)
		.bind(now)
		.bind(project_id)
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected())
	}

	async fn sweep_expired(&self, now: DateTime<Utc>, batch: u32) -> Result<u64, StoreError> {
		let res = sqlx::query(
			"DELETE FROM tokens WHERE lookup_key IN (
				SELECT lookup_key FROM tokens
				WHERE is_active = 0 AND expires_at IS NOT NULL AND expires_at <= ?
				LIMIT ?
			)",
		)
		.bind(now)
		.bind(batch)
		.execute(&self.pool)
		.await?;
		Ok(res.rows_affected())
	}
}

#[async_trait]
impl AuditStore for SqliteStore {
	async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO audit_events (id, timestamp, action, actor, project_id, request_id, correlation_id, client_ip, method, path, outcome, reason, token_id, metadata)
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(&record.id)
		.bind(record.timestamp)
		.bind(&record.action)
		.bind(&record.actor)
		.bind(&record.project_id)
		.bind(&record.request_id)
		.bind(&record.correlation_id)
		.bind(&record.client_ip)
		.bind(&record.method)
		.bind(&record.path)
		.bind(record.outcome.as_str())
		.bind(&record.reason)
		.bind(&record.token_id)
		.bind(record.metadata.to_string())
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	async fn recent_audit(&self, limit: u32) -> Result<Vec<AuditRecord>, StoreError> {
		let rows = sqlx::query("SELECT * FROM audit_events ORDER BY timestamp DESC LIMIT ?")
			.bind(limit)
			.fetch_all(&self.pool)
			.await?;
		rows
			.into_iter()
			.map(|row| {
				let outcome: String = row.try_get("outcome").map_err(StoreError::from)?;
				let metadata: String = row.try_get("metadata").map_err(StoreError::from)?;
				Ok(AuditRecord {
					id: row.try_get("id").map_err(StoreError::from)?,
					timestamp: row.try_get("timestamp").map_err(StoreError::from)?,
					action: row.try_get("action").map_err(StoreError::from)?,
					actor: row.try_get("actor").map_err(StoreError::from)?,
					project_id: row.try_get("project_id").map_err(StoreError::from)?,
					request_id: row.try_get("request_id").map_err(StoreError::from)?,
					correlation_id: row.try_get("correlation_id").map_err(StoreError::from)?,
					client_ip: row.try_get("client_ip").map_err(StoreError::from)?,
					method: row.try_get("method").map_err(StoreError::from)?,
					path: row.try_get("path").map_err(StoreError::from)?,
					outcome: outcome.parse()?,
					reason: row.try_get("reason").map_err(StoreError::from)?,
					token_id: row.try_get("token_id").map_err(StoreError::from)?,
					metadata: serde_json::from_str(&metadata)
						.map_err(|e| StoreError::Internal(e.to_string()))?,
				})
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use chrono::Duration;

	use super::*;
	use crate::store::AuditOutcome;

	fn project(id: &str, name: &str) -> Project {
		let now = Utc::now();
		Project {
			id: id.to_string(),
			name: name.to_string(),
			api_key_encrypted: "enc:v1:AAAA".to_string(),
			is_active: true,
			created_at: now,
			updated_at: now,
			deactivated_at: None,
		}
	}

	fn token(lookup_key: &str, project_id: &str) -> TokenRow {
		TokenRow {
			lookup_key: lookup_key.to_string(),
			verifier: None,
			project_id: project_id.to_string(),
			expires_at: Some(Utc::now() + Duration::minutes(10)),
			is_active: true,
			request_count: 0,
			max_requests: None,
			created_at: Utc::now(),
			last_used_at: None,
			deactivated_at: None,
		}
	}

	#[tokio::test]
	async fn project_crud() {
		let store = SqliteStore::in_memory().await.unwrap();
		store.create_project(&project("p1", "one")).await.unwrap();
		assert!(matches!(
			store.create_project(&project("p2", "one")).await,
			Err(StoreError::Conflict(_))
		));
		let got = store.get_project("p1").await.unwrap();
		assert_eq!(got.name, "one");

		let updated = store
			.update_project(
				"p1",
				ProjectUpdate {
					name: Some("renamed".to_string()),
					api_key_encrypted: None,
				},
			)
			.await
			.unwrap();
		assert_eq!(updated.name, "renamed");
		assert_eq!(updated.api_key_encrypted, "enc:v1:AAAA");

		store.deactivate_project("p1").await.unwrap();
		let got = store.get_project("p1").await.unwrap();
		assert!(!got.is_active);
		assert!(got.deactivated_at.is_some());
		assert!(matches!(
			store.get_project("missing").await,
			Err(StoreError::NotFound)
		));
	}

	#[tokio::test]
	async fn token_lifecycle() {
		let store = SqliteStore::in_memory().await.unwrap();
		store.create_project(&project("p1", "one")).await.unwrap();
		store.insert_token(&token("aaa", "p1")).await.unwrap();
		store.insert_token(&token("bbb", "p1")).await.unwrap();

		let now = Utc::now();
		store.record_use("aaa", now).await.unwrap();
		store.record_use("aaa", now).await.unwrap();
		let got = store.get_token("aaa").await.unwrap();
		assert_eq!(got.request_count, 2);
		assert!(got.last_used_at.is_some());

		assert!(store.revoke_token("aaa", now).await.unwrap());
		assert!(!store.revoke_token("aaa", now).await.unwrap());

		assert_eq!(store.revoke_project_tokens("p1", now).await.unwrap(), 1);
		assert_eq!(store.list_tokens("p1").await.unwrap().len(), 2);
	}

	#[tokio::test]
	async fn sweep_removes_only_inactive_expired() {
		let store = SqliteStore::in_memory().await.unwrap();
		store.create_project(&project("p1", "one")).await.unwrap();

		let mut expired_revoked = token("dead", "p1");
		expired_revoked.expires_at = Some(Utc::now() - Duration::minutes(5));
		expired_revoked.is_active = false;
		store.insert_token(&expired_revoked).await.unwrap();

		let mut expired_active = token("expired", "p1");
		expired_active.expires_at = Some(Utc::now() - Duration::minutes(5));
		store.insert_token(&expired_active).await.unwrap();

		store.insert_token(&token("live", "p1")).await.unwrap();

		let swept = store.sweep_expired(Utc::now(), 100).await.unwrap();
		assert_eq!(swept, 1);
		assert!(matches!(store.get_token("dead").await, Err(StoreError::NotFound)));
		assert!(store.get_token("expired").await.is_ok());
		assert!(store.get_token("live").await.is_ok());
	}

	#[tokio::test]
	async fn audit_append_and_read() {
		let store = SqliteStore::in_memory().await.unwrap();
		let mut rec = AuditRecord::new("project.create", "management", AuditOutcome::Success);
		rec.project_id = Some("p1".to_string());
		rec.metadata = serde_json::json!({"name": "one"});
		store.append_audit(&rec).await.unwrap();

		let recent = store.recent_audit(10).await.unwrap();
		assert_eq!(recent.len(), 1);
		assert_eq!(recent[0].action, "project.create");
		assert_eq!(recent[0].outcome, AuditOutcome::Success);
		assert_eq!(recent[0].metadata["name"], "one");
	}

	#[tokio::test]
	async fn migrate_down_then_up_restores_schema() {
		let store = SqliteStore::in_memory().await.unwrap();
		store.migrate_down().await.unwrap();
		let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations")
			.fetch_all(store.pool())
			.await
			.unwrap();
		assert!(versions.is_empty());
		store.migrate_up().await.unwrap();
		store.create_project(&project("p1", "one")).await.unwrap();
		store.insert_token(&token("aaa", "p1")).await.unwrap();
	}
}
