//! In-memory store for tests and throwaway single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{
	AuditRecord, AuditStore, Project, ProjectStore, ProjectUpdate, StoreError, TokenRow, TokenStore,
};

#[derive(Default)]
pub struct MemoryStore {
	projects: RwLock<HashMap<String, Project>>,
	tokens: RwLock<HashMap<String, TokenRow>>,
	audit: RwLock<Vec<AuditRecord>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl ProjectStore for MemoryStore {
	async fn create_project(&self, project: &Project) -> Result<(), StoreError> {
		let mut projects = self.projects.write();
		if projects.contains_key(&project.id) {
			return Err(StoreError::Conflict(format!("project {} exists", project.id)));
		}
		if projects.values().any(|p| p.name == project.name) {
			return Err(StoreError::Conflict(format!("project name {} exists", project.name)));
		}
		projects.insert(project.id.clone(), project.clone());
		Ok(())
	}

	async fn get_project(&self, id: &str) -> Result<Project, StoreError> {
		self
			.projects
			.read()
			.get(id)
			.cloned()
			.ok_or(StoreError::NotFound)
	}

	async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
		let mut all: Vec<_> = self.projects.read().values().cloned().collect();
		all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		Ok(all)
	}

	async fn update_project(&self, id: &str, update: ProjectUpdate) -> Result<Project, StoreError> {
		let mut projects = self.projects.write();
		let project = projects.get_mut(id).ok_or(StoreError::NotFound)?;
		if let Some(name) = update.name {
			project.name = name;
		}
		if let Some(key) = update.api_key_encrypted {
			project.api_key_encrypted = key;
		}
		project.updated_at = Utc::now();
		Ok(project.clone())
	}

	async fn deactivate_project(&self, id: &str) -> Result<(), StoreError> {
		let mut projects = self.projects.write();
		let project = projects.get_mut(id).ok_or(StoreError::NotFound)?;
		if !project.is_active {
			return Err(StoreError::NotFound);
		}
		let now = Utc::now();
		project.is_active = false;
		project.deactivated_at = Some(now);
		project.updated_at = now;
		Ok(())
	}
}

#[async_trait]
impl TokenStore for MemoryStore {
	async fn insert_token(&self, token: &TokenRow) -> Result<(), StoreError> {
		let mut tokens = self.tokens.write();
		if tokens.contains_key(&token.lookup_key) {
			return Err(StoreError::Conflict("token exists".to_string()));
		}
		tokens.insert(token.lookup_key.clone(), token.clone());
		Ok(())
	}

	async fn get_token(&self, lookup_key: &str) -> Result<TokenRow, StoreError> {
		self
			.tokens
			.read()
			.get(lookup_key)
			.cloned()
			.ok_or(StoreError::NotFound)
	}

	async fn list_tokens(&self, project_id: &str) -> Result<Vec<TokenRow>, StoreError> {
		let mut all: Vec<_> = self
			.tokens
			.read()
			.values()
			.filter(|t| t.project_id == project_id)
			.cloned()
			.collect();
		all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
		Ok(all)
	}

	async fn record_use(&self, lookup_key: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
		let mut tokens = self.tokens.write();
		let token = tokens.get_mut(lookup_key).ok_or(StoreError::NotFound)?;
		token.request_count += 1;
		token.last_used_at = Some(now);
		Ok(())
	}

	async fn revoke_token(&self, lookup_key: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
		let mut tokens = self.tokens.write();
		let Some(token) = tokens.get_mut(lookup_key) else {
			return Ok(false);
		};
		if !token.is_active {
			return Ok(false);
		}
		token.is_active = false;
		token.deactivated_at = Some(now);
		Ok(true)
	}

	async fn revoke_project_tokens(
		&self,
		project_id: &str,
		now: DateTime<Utc>,
	) -> Result<u64, StoreError> {
		let mut count = 0;
		for token in self.tokens.write().values_mut() {
			if token.project_id == project_id && token.is_active {
				token.is_active = false;
				token.deactivated_at = Some(now);
				count += 1;
			}
		}
		Ok(count)
	}

	async fn sweep_expired(&self, now: DateTime<Utc>, batch: u32) -> Result<u64, StoreError> {
		let mut tokens = self.tokens.write();
		let victims: Vec<String> = tokens
			.values()
			.filter(|t| !t.is_active && t.expires_at.is_some_and(|e| e <= now))
			.take(batch as usize)
			.map(|t| t.lookup_key.clone())
			.collect();
		for key in &victims {
			tokens.remove(key);
		}
		Ok(victims.len() as u64)
	}
}

#[async_trait]
impl AuditStore for MemoryStore {
	async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
		self.audit.write().push(record.clone());
		Ok(())
	}

	async fn recent_audit(&self, limit: u32) -> Result<Vec<AuditRecord>, StoreError> {
		let audit = self.audit.read();
		Ok(audit.iter().rev().take(limit as usize).cloned().collect())
	}
}
