//! Management surface: project and token CRUD, cache purge, health and
//! metrics. Separate listener from the proxy, guarded by a static bearer
//! token. JSON in, JSON out, `{"error": "..."}` envelope on failure.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::Auditor;
use crate::cache::SharedCache;
use crate::crypto::FieldEncryptor;
use crate::http::bearer_token;
use crate::signal::ShutdownWatcher;
use crate::store::{
	AuditOutcome, AuditRecord, Project, ProjectUpdate, SharedStore, StoreError,
};
use crate::telemetry::metrics::Metrics;
use crate::token::{TokenError, TokenService, obfuscate};

pub struct ManagementState {
	pub store: SharedStore,
	pub tokens: TokenService,
	pub cache: SharedCache,
	pub encryptor: Arc<dyn FieldEncryptor>,
	pub auditor: Auditor,
	pub metrics: Metrics,
	pub management_token: SecretString,
}

struct ApiError {
	status: StatusCode,
	message: String,
}

impl ApiError {
	fn new(status: StatusCode, message: impl Into<String>) -> Self {
		Self {
			status,
			message: message.into(),
		}
	}

	fn bad_request(message: impl Into<String>) -> Self {
		Self::new(StatusCode::BAD_REQUEST, message)
	}

	fn not_found() -> Self {
		Self::new(StatusCode::NOT_FOUND, "not found")
	}

	fn internal() -> Self {
		Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
	}
}

impl From<StoreError> for ApiError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::NotFound => ApiError::not_found(),
			StoreError::Conflict(msg) | StoreError::InvalidInput(msg) => ApiError::bad_request(msg),
			StoreError::Internal(_) => ApiError::internal(),
		}
	}
}

impl From<TokenError> for ApiError {
	fn from(e: TokenError) -> Self {
		match e {
			TokenError::NotFound => ApiError::not_found(),
			TokenError::ProjectInactive => ApiError::bad_request("project is not active"),
			TokenError::InvalidInput(msg) => ApiError::bad_request(msg),
			_ => ApiError::internal(),
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		(self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
	}
}

#[derive(Serialize)]
struct ProjectBody {
	id: String,
	name: String,
	/// Obfuscated; the full key is never echoed.
	api_key: String,
	is_active: bool,
	created_at: DateTime<Utc>,
	updated_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	deactivated_at: Option<DateTime<Utc>>,
}

impl ProjectBody {
	fn from_project(project: &Project, encryptor: &dyn FieldEncryptor) -> Self {
		let api_key = encryptor
			.decrypt(&project.api_key_encrypted)
			.map(|k| obfuscate(&k))
			.unwrap_or_else(|_| "…".to_string());
		Self {
			id: project.id.clone(),
			name: project.name.clone(),
			api_key,
			is_active: project.is_active,
			created_at: project.created_at,
			updated_at: project.updated_at,
			deactivated_at: project.deactivated_at,
		}
	}
}

#[derive(Deserialize)]
struct CreateProject {
	name: String,
	api_key: String,
}

#[derive(Deserialize)]
struct PatchProject {
	name: Option<String>,
	api_key: Option<String>,
}

#[derive(Deserialize)]
struct CreateToken {
	project_id: String,
	duration_minutes: i64,
	max_requests: Option<i64>,
}

#[derive(Serialize)]
struct CreatedToken {
	token: String,
	expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct TokenBody {
	lookup_key: String,
	project_id: String,
	is_active: bool,
	request_count: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	max_requests: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	expires_at: Option<DateTime<Utc>>,
	created_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	last_used_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ListTokens {
	project_id: String,
}

#[derive(Deserialize)]
struct PurgeRequest {
	method: String,
	url: String,
	#[serde(default)]
	prefix: bool,
}

#[derive(Serialize)]
struct PurgeResponse {
	purged: usize,
}

pub fn router(state: Arc<ManagementState>) -> Router {
	let guarded = Router::new()
		.route("/manage/projects", post(create_project).get(list_projects))
		.route(
			"/manage/projects/{id}",
			get(get_project).patch(patch_project).delete(delete_project),
		)
		.route("/manage/tokens", post(create_token).get(list_tokens))
		.route("/manage/tokens/{lookup_key}", axum::routing::delete(revoke_token))
		.route("/manage/cache/purge", post(purge_cache))
		.layer(middleware::from_fn_with_state(state.clone(), require_bearer))
		.with_state(state.clone());

	Router::new()
		.route("/healthz", get(healthz))
		.route("/metrics", get(metrics))
		.with_state(state)
		.merge(guarded)
}

pub async fn serve(
	addr: SocketAddr,
	state: Arc<ManagementState>,
	mut shutdown: ShutdownWatcher,
) -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind(addr).await?;
	info!(address = %listener.local_addr()?, "management listening");
	axum::serve(
		listener,
		router(state).into_make_service_with_connect_info::<SocketAddr>(),
	)
	.with_graceful_shutdown(async move { shutdown.wait().await })
	.await?;
	Ok(())
}

async fn require_bearer(
	State(state): State<Arc<ManagementState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	req: axum::extract::Request,
	next: Next,
) -> Response {
	let presented = bearer_token(req.headers());
	if presented != Some(state.management_token.expose_secret()) {
		let mut record = AuditRecord::new("management.auth", "management", AuditOutcome::Denied);
		record.client_ip = Some(peer.ip().to_string());
		record.method = Some(req.method().to_string());
		record.path = Some(req.uri().path().to_string());
		record.reason = Some("invalid management token".to_string());
		state.auditor.record(record);
		return ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized").into_response();
	}
	next.run(req).await
}

async fn healthz() -> impl IntoResponse {
	Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics(State(state): State<Arc<ManagementState>>) -> impl IntoResponse {
	(
		[(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
		state.metrics.encode(),
	)
}

fn audit(
	state: &ManagementState,
	peer: SocketAddr,
	action: &str,
	outcome: AuditOutcome,
	project_id: Option<String>,
	metadata: serde_json::Value,
) {
	let mut record = AuditRecord::new(action, "management", outcome);
	record.client_ip = Some(peer.ip().to_string());
	record.project_id = project_id;
	record.metadata = metadata;
	state.auditor.record(record);
}

async fn create_project(
	State(state): State<Arc<ManagementState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	Json(body): Json<CreateProject>,
) -> Result<impl IntoResponse, ApiError> {
	if body.name.trim().is_empty() {
		return Err(ApiError::bad_request("name must not be empty"));
	}
	if body.api_key.trim().is_empty() {
		return Err(ApiError::bad_request("api_key must not be empty"));
	}
	let api_key_encrypted = state
		.encryptor
		.encrypt(&body.api_key)
		.map_err(|_| ApiError::internal())?;
	let now = Utc::now();
	let project = Project {
		id: uuid::Uuid::new_v4().to_string(),
		name: body.name.trim().to_string(),
		api_key_encrypted,
		is_active: true,
		created_at: now,
		updated_at: now,
		deactivated_at: None,
	};
	state.store.create_project(&project).await?;
	audit(
		&state,
		peer,
		"project.create",
		AuditOutcome::Success,
		Some(project.id.clone()),
		serde_json::json!({ "name": project.name }),
	);
	Ok((
		StatusCode::CREATED,
		Json(ProjectBody::from_project(&project, state.encryptor.as_ref())),
	))
}

async fn list_projects(
	State(state): State<Arc<ManagementState>>,
) -> Result<impl IntoResponse, ApiError> {
	let projects = state.store.list_projects().await?;
	let bodies: Vec<ProjectBody> = projects
		.iter()
		.map(|p| ProjectBody::from_project(p, state.encryptor.as_ref()))
		.collect();
	Ok(Json(bodies))
}

async fn get_project(
	State(state): State<Arc<ManagementState>>,
	Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let project = state.store.get_project(&id).await?;
	Ok(Json(ProjectBody::from_project(&project, state.encryptor.as_ref())))
}

async fn patch_project(
	State(state): State<Arc<ManagementState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	Path(id): Path<String>,
	Json(body): Json<PatchProject>,
) -> Result<impl IntoResponse, ApiError> {
	if body.name.is_none() && body.api_key.is_none() {
		return Err(ApiError::bad_request("nothing to update"));
	}
	let api_key_encrypted = match &body.api_key {
		Some(key) if !key.trim().is_empty() => Some(
			state
				.encryptor
				.encrypt(key)
				.map_err(|_| ApiError::internal())?,
		),
		Some(_) => return Err(ApiError::bad_request("api_key must not be empty")),
		None => None,
	};
	let rotated = api_key_encrypted.is_some();
	let project = state
		.store
		.update_project(
			&id,
			ProjectUpdate {
				name: body.name,
				api_key_encrypted,
			},
		)
		.await?;
	audit(
		&state,
		peer,
		"project.update",
		AuditOutcome::Success,
		Some(id),
		serde_json::json!({ "rotated_key": rotated }),
	);
	Ok(Json(ProjectBody::from_project(&project, state.encryptor.as_ref())))
}

async fn delete_project(
	State(state): State<Arc<ManagementState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	state.store.deactivate_project(&id).await?;
	let revoked = state
		.tokens
		.revoke_project(&id)
		.await
		.map_err(ApiError::from)?;
	audit(
		&state,
		peer,
		"project.deactivate",
		AuditOutcome::Success,
		Some(id),
		serde_json::json!({ "tokens_revoked": revoked }),
	);
	Ok(StatusCode::NO_CONTENT)
}

async fn create_token(
	State(state): State<Arc<ManagementState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	Json(body): Json<CreateToken>,
) -> Result<impl IntoResponse, ApiError> {
	if body.duration_minutes <= 0 {
		return Err(ApiError::bad_request("duration_minutes must be positive"));
	}
	let (token, expires_at) = state
		.tokens
		.generate(
			&body.project_id,
			Some(chrono::Duration::minutes(body.duration_minutes)),
			body.max_requests,
		)
		.await?;
	let mut record = AuditRecord::new("token.create", "management", AuditOutcome::Success);
	record.client_ip = Some(peer.ip().to_string());
	record.project_id = Some(body.project_id.clone());
	record.token_id = Some(obfuscate(&token));
	record.metadata = serde_json::json!({ "max_requests": body.max_requests });
	state.auditor.record(record);
	// The plaintext leaves the process exactly here, exactly once.
	Ok((StatusCode::CREATED, Json(CreatedToken { token, expires_at })))
}

async fn list_tokens(
	State(state): State<Arc<ManagementState>>,
	Query(query): Query<ListTokens>,
) -> Result<impl IntoResponse, ApiError> {
	let tokens = state.store.list_tokens(&query.project_id).await?;
	let bodies: Vec<TokenBody> = tokens
		.into_iter()
		.map(|t| TokenBody {
			lookup_key: t.lookup_key,
			project_id: t.project_id,
			is_active: t.is_active,
			request_count: t.request_count,
			max_requests: t.max_requests,
			expires_at: t.expires_at,
			created_at: t.created_at,
			last_used_at: t.last_used_at,
		})
		.collect();
	Ok(Json(bodies))
}

async fn revoke_token(
	State(state): State<Arc<ManagementState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	Path(lookup_key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let revoked = state
		.tokens
		.revoke_by_key(&lookup_key)
		.await
		.map_err(ApiError::from)?;
	if !revoked {
		return Err(ApiError::not_found());
	}
	let mut record = AuditRecord::new("token.revoke", "management", AuditOutcome::Success);
	record.client_ip = Some(peer.ip().to_string());
	record.token_id = Some(obfuscate(&lookup_key));
	state.auditor.record(record);
	Ok(StatusCode::NO_CONTENT)
}

async fn purge_cache(
	State(state): State<Arc<ManagementState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	Json(body): Json<PurgeRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let uri: axum::http::Uri = body
		.url
		.parse()
		.map_err(|_| ApiError::bad_request("invalid url"))?;
	// Keep the port so purges line up with keys derived from base URLs that
	// carry one.
	let host = uri
		.authority()
		.map(|a| a.as_str())
		.ok_or_else(|| ApiError::bad_request("url must be absolute"))?;
	let purged = if body.prefix {
		state.cache.purge_prefix(&body.method, host, uri.path())
	} else {
		state
			.cache
			.purge(&body.method, host, uri.path(), uri.query())
	};
	audit(
		&state,
		peer,
		"cache.purge",
		AuditOutcome::Success,
		None,
		serde_json::json!({ "url": body.url, "prefix": body.prefix, "purged": purged }),
	);
	Ok(Json(PurgeResponse { purged }))
}
