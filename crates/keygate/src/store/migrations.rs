//! Embedded, ordered schema migrations for the sqlite backend.
//!
//! Each step carries an up and a down script and is applied inside its own
//! transaction; applied versions are recorded in `schema_migrations`.

pub struct Migration {
	pub version: i64,
	pub name: &'static str,
	pub up: &'static str,
	pub down: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
	Migration {
		version: 1,
		name: "projects",
		up: "CREATE TABLE projects (
			id TEXT PRIMARY KEY,
			name TEXT NOT NULL UNIQUE,
			api_key_encrypted TEXT NOT NULL,
			is_active INTEGER NOT NULL DEFAULT 1,
			created_at TEXT NOT NULL,
			updated_at TEXT NOT NULL,
			deactivated_at TEXT
		)",
		down: "DROP TABLE projects",
	},
	Migration {
		version: 2,
		name: "tokens",
		up: "CREATE TABLE tokens (
			lookup_key TEXT PRIMARY KEY,
			verifier TEXT,
			project_id TEXT NOT NULL REFERENCES projects(id),
			expires_at TEXT,
			is_active INTEGER NOT NULL DEFAULT 1,
			request_count INTEGER NOT NULL DEFAULT 0,
			max_requests INTEGER,
			created_at TEXT NOT NULL,
			last_used_at TEXT,
			deactivated_at TEXT
		)",
		down: "DROP TABLE tokens",
	},
	Migration {
		version: 3,
		name: "tokens_indexes",
		up: "CREATE INDEX idx_tokens_project_id ON tokens(project_id);
			CREATE INDEX idx_tokens_expires_at ON tokens(expires_at);
			CREATE INDEX idx_tokens_is_active ON tokens(is_active)",
		down: "DROP INDEX idx_tokens_project_id;
			DROP INDEX idx_tokens_expires_at;
			DROP INDEX idx_tokens_is_active",
	},
	Migration {
		version: 4,
		name: "audit_events",
		up: "CREATE TABLE audit_events (
			id TEXT PRIMARY KEY,
			timestamp TEXT NOT NULL,
			action TEXT NOT NULL,
			actor TEXT NOT NULL,
			project_id TEXT,
			request_id TEXT,
			correlation_id TEXT,
			client_ip TEXT,
			method TEXT,
			path TEXT,
			outcome TEXT NOT NULL CHECK (outcome IN ('success','failure','denied','error')),
			reason TEXT,
			token_id TEXT,
			metadata TEXT NOT NULL DEFAULT 'null'
		)",
		down: "DROP TABLE audit_events",
	},
	Migration {
		version: 5,
		name: "audit_events_indexes",
		up: "CREATE INDEX idx_audit_timestamp ON audit_events(timestamp);
			CREATE INDEX idx_audit_action ON audit_events(action);
			CREATE INDEX idx_audit_project_id ON audit_events(project_id);
			CREATE INDEX idx_audit_client_ip ON audit_events(client_ip);
			CREATE INDEX idx_audit_request_id ON audit_events(request_id);
			CREATE INDEX idx_audit_outcome ON audit_events(outcome);
			CREATE INDEX idx_audit_client_ip_action ON audit_events(client_ip, action)",
		down: "DROP INDEX idx_audit_timestamp;
			DROP INDEX idx_audit_action;
			DROP INDEX idx_audit_project_id;
			DROP INDEX idx_audit_client_ip;
			DROP INDEX idx_audit_request_id;
			DROP INDEX idx_audit_outcome;
			DROP INDEX idx_audit_client_ip_action",
	},
];
