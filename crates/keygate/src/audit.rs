//! Audit trail: every security-relevant action lands in the store and in the
//! `audit` log target. Persistence is off the hot path; a failed write is
//! logged loudly but never fails the action that produced it.

use crate::store::{AuditRecord, SharedStore};

#[derive(Clone)]
pub struct Auditor {
	store: SharedStore,
}

impl Auditor {
	pub fn new(store: SharedStore) -> Self {
		Self { store }
	}

	pub fn record(&self, record: AuditRecord) {
		tracing::info!(
			target: "audit",
			action = %record.action,
			actor = %record.actor,
			outcome = record.outcome.as_str(),
			project_id = record.project_id.as_deref(),
			request_id = record.request_id.as_deref(),
			client_ip = record.client_ip.as_deref(),
			token_id = record.token_id.as_deref(),
			reason = record.reason.as_deref(),
		);
		let store = self.store.clone();
		tokio::spawn(async move {
			if let Err(e) = store.append_audit(&record).await {
				tracing::error!(target: "audit", action = %record.action, error = %e, "audit row write failed");
			}
		});
	}

	/// Synchronous variant for paths that must not lose the row (tests and
	/// shutdown).
	pub async fn record_sync(&self, record: AuditRecord) {
		tracing::info!(
			target: "audit",
			action = %record.action,
			actor = %record.actor,
			outcome = record.outcome.as_str(),
			"audit"
		);
		if let Err(e) = self.store.append_audit(&record).await {
			tracing::error!(target: "audit", action = %record.action, error = %e, "audit row write failed");
		}
	}
}
