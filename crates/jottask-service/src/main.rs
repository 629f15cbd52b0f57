use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use jottask_api::logging::LoggingConfig;
use jottask_api::{
    ActionResolution, JottaskApi, MigrateResult, SchemaStatus, API_CONTRACT_VERSION,
};
use jottask_core::dates::parse_date;
use jottask_core::{
    ActionToken, Contact, CoreError, Identity, NewTask, PendingAction, ProjectId, ProjectProgress,
    ProjectWithProgress, Task, TaskDigest, TaskId, TaskStatus, UserId,
};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const USER_HEADER: &str = "x-jottask-user";

#[derive(Debug, Clone)]
struct ServiceState {
    api: JottaskApi,
    service_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MigrateRequest {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct TaskStatusRequest {
    status: TaskStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UserQuery {
    user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TaskListQuery {
    user_id: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DigestQuery {
    user_id: Option<String>,
    today: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "jottask-service")]
#[command(about = "HTTP service for the Jottask task and notification store")]
struct Args {
    #[arg(long, env = "JOTTASK_DB", default_value = "./jottask.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "JOTTASK_BIND", default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// Bearer key that authenticates the service identity.
    #[arg(long, env = "JOTTASK_SERVICE_KEY", hide_env_values = true)]
    service_key: Option<String>,
    #[arg(long, env = "JOTTASK_LOG_LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long, env = "JOTTASK_LOG_FORMAT", default_value = "pretty")]
    log_format: String,
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<CoreError>() {
            Some(CoreError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(CoreError::InvalidTransition { .. } | CoreError::Expired(_)) => {
                StatusCode::CONFLICT
            }
            Some(CoreError::AccessDenied { .. }) => StatusCode::FORBIDDEN,
            Some(CoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Some(CoreError::Credentials(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %format!("{err:#}"), "request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl From<CoreError> for ServiceError {
    fn from(err: CoreError) -> Self {
        Self::from(anyhow::Error::from(err))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    /// Resolve the caller from the bearer service key or the owner header.
    fn caller(&self, headers: &HeaderMap) -> Result<Identity, ServiceError> {
        if let Some(value) = headers.get(AUTHORIZATION) {
            let presented = value
                .to_str()
                .ok()
                .and_then(|raw| raw.strip_prefix("Bearer "))
                .map(str::trim);
            return match (presented, self.service_key.as_deref()) {
                (Some(presented), Some(expected))
                    if !expected.is_empty() && presented == expected =>
                {
                    Ok(Identity::Service)
                }
                _ => Err(ServiceError::unauthorized("invalid service key")),
            };
        }

        if let Some(value) = headers.get(USER_HEADER) {
            let user_id = value
                .to_str()
                .ok()
                .and_then(|raw| raw.parse::<UserId>().ok())
                .ok_or_else(|| ServiceError::unauthorized("malformed X-Jottask-User header"))?;
            return Ok(Identity::Owner(user_id));
        }

        Err(ServiceError::unauthorized(
            "missing credentials: send a bearer service key or X-Jottask-User",
        ))
    }
}

fn require_service(identity: Identity) -> Result<(), ServiceError> {
    if identity.is_service() {
        return Ok(());
    }
    Err(ServiceError::new(StatusCode::FORBIDDEN, "service identity required"))
}

/// Owners default to themselves; the service must name the account.
fn target_user(identity: Identity, requested: Option<&str>) -> Result<UserId, ServiceError> {
    match (requested, identity) {
        (Some(raw), _) => Ok(raw.parse::<UserId>()?),
        (None, Identity::Owner(user_id)) => Ok(user_id),
        (None, Identity::Service) => {
            Err(ServiceError::new(StatusCode::BAD_REQUEST, "user_id query parameter is required"))
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/actions/:token", get(action_show))
        .route("/v1/actions/:token/approve", post(action_approve))
        .route("/v1/actions/:token/reject", post(action_reject))
        .route("/v1/tasks", get(task_list).post(task_create))
        .route("/v1/tasks/digest", get(task_digest))
        .route("/v1/tasks/:id/status", post(task_set_status))
        .route("/v1/projects", get(project_list))
        .route("/v1/projects/:id/progress", get(project_progress))
        .route("/v1/contacts", get(contact_list))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    LoggingConfig::new(args.log_level.clone(), args.log_format.clone()).init()?;
    if args.service_key.as_deref().map_or(true, str::is_empty) {
        tracing::warn!("no service key configured; only owner and token requests are accepted");
    }

    let state = ServiceState {
        api: JottaskApi::new(args.db.clone()),
        service_key: args.service_key,
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "jottask service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    require_service(state.caller(&headers)?)?;
    Ok(Json(envelope(state.api.schema_status()?)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    require_service(state.caller(&headers)?)?;
    let result = state.api.migrate(request.dry_run)?;
    tracing::info!(
        dry_run = request.dry_run,
        planned = ?result.would_apply_versions,
        "migrate requested"
    );
    Ok(Json(envelope(result)))
}

// Action links carry the token as the capability, so they run as the service.

async fn action_show(
    State(state): State<ServiceState>,
    Path(token): Path<String>,
) -> Result<Json<ServiceEnvelope<PendingAction>>, ServiceError> {
    let token = ActionToken::parse(&token)?;
    Ok(Json(envelope(state.api.get_pending_action(Identity::Service, &token)?)))
}

async fn action_approve(
    State(state): State<ServiceState>,
    Path(token): Path<String>,
) -> Result<Json<ServiceEnvelope<ActionResolution>>, ServiceError> {
    let token = ActionToken::parse(&token)?;
    Ok(Json(envelope(state.api.approve_pending_action(Identity::Service, &token)?)))
}

async fn action_reject(
    State(state): State<ServiceState>,
    Path(token): Path<String>,
) -> Result<Json<ServiceEnvelope<PendingAction>>, ServiceError> {
    let token = ActionToken::parse(&token)?;
    Ok(Json(envelope(state.api.reject_pending_action(Identity::Service, &token)?)))
}

async fn task_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<ServiceEnvelope<Vec<Task>>>, ServiceError> {
    let identity = state.caller(&headers)?;
    let user_id = target_user(identity, query.user_id.as_deref())?;
    let status = match query.status.as_deref() {
        Some(raw) => Some(TaskStatus::parse(raw).ok_or_else(|| {
            ServiceError::new(StatusCode::BAD_REQUEST, format!("unknown task status `{raw}`"))
        })?),
        None => None,
    };
    Ok(Json(envelope(state.api.list_tasks(identity, user_id, status)?)))
}

async fn task_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(task): Json<NewTask>,
) -> Result<(StatusCode, Json<ServiceEnvelope<Task>>), ServiceError> {
    let identity = state.caller(&headers)?;
    let task = state.api.create_task(identity, &task)?;
    Ok((StatusCode::CREATED, Json(envelope(task))))
}

async fn task_set_status(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<TaskStatusRequest>,
) -> Result<Json<ServiceEnvelope<Task>>, ServiceError> {
    let identity = state.caller(&headers)?;
    let task_id = id.parse::<TaskId>()?;
    Ok(Json(envelope(state.api.set_task_status(identity, task_id, request.status)?)))
}

async fn task_digest(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<DigestQuery>,
) -> Result<Json<ServiceEnvelope<TaskDigest>>, ServiceError> {
    let identity = state.caller(&headers)?;
    let user_id = target_user(identity, query.user_id.as_deref())?;
    let today = query.today.as_deref().map(parse_date).transpose()?;
    Ok(Json(envelope(state.api.task_digest(identity, user_id, today)?)))
}

async fn project_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
) -> Result<Json<ServiceEnvelope<Vec<ProjectWithProgress>>>, ServiceError> {
    let identity = state.caller(&headers)?;
    let user_id = target_user(identity, query.user_id.as_deref())?;
    Ok(Json(envelope(state.api.list_projects(identity, user_id)?)))
}

async fn project_progress(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<ProjectProgress>>, ServiceError> {
    let identity = state.caller(&headers)?;
    let project_id = id.parse::<ProjectId>()?;
    Ok(Json(envelope(state.api.project_progress(identity, project_id)?)))
}

async fn contact_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
) -> Result<Json<ServiceEnvelope<Vec<Contact>>>, ServiceError> {
    let identity = state.caller(&headers)?;
    let user_id = target_user(identity, query.user_id.as_deref())?;
    Ok(Json(envelope(state.api.list_contacts(identity, user_id)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use jottask_core::{
        ActionKind, ActionPayload, NewPendingAction, NewProject, NewProjectItem, NewUser, User,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    const TEST_KEY: &str = "test-service-key";

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("jottask-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state(db_path: PathBuf) -> ServiceState {
        ServiceState {
            api: JottaskApi::new(db_path),
            service_key: Some(TEST_KEY.to_string()),
        }
    }

    fn mk_user(state: &ServiceState, email: &str) -> User {
        let user = NewUser {
            id: None,
            email: email.to_string(),
            full_name: None,
            company_name: None,
            timezone: None,
        };
        match state.api.create_user(Identity::Service, &user) {
            Ok(user) => user,
            Err(err) => panic!("failed to create user: {err}"),
        }
    }

    fn request(
        method: &str,
        uri: &str,
        caller: Option<(&str, String)>,
        body: Option<Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().uri(uri).method(method);
        if let Some((name, value)) = caller {
            builder = builder.header(name, value);
        }
        let body = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        builder
            .body(body)
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn as_owner(user: &User) -> Option<(&'static str, String)> {
        Some((USER_HEADER, user.id.to_string()))
    }

    fn as_service() -> Option<(&'static str, String)> {
        Some(("authorization", format!("Bearer {TEST_KEY}")))
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(test_state(unique_temp_db_path()));
        let (status, value) = send(&router, request("GET", "/v1/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
        assert_eq!(value["api_contract_version"], API_CONTRACT_VERSION);
        assert_eq!(value["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn requests_without_identity_are_rejected() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let (status, value) = send(&router, request("GET", "/v1/tasks", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);

        let wrong_key = Some(("authorization", "Bearer nope".to_string()));
        let (status, _) = send(&router, request("GET", "/v1/tasks", wrong_key, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn db_routes_are_service_only() {
        let db_path = unique_temp_db_path();
        let state = test_state(db_path.clone());
        let user = mk_user(&state, "owner@example.com");
        let router = app(state);

        let body = Some(serde_json::json!({ "dry_run": true }));
        let (status, _) =
            send(&router, request("POST", "/v1/db/migrate", as_owner(&user), body.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, value) =
            send(&router, request("POST", "/v1/db/migrate", as_service(), body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["dry_run"], true);

        let (status, value) =
            send(&router, request("POST", "/v1/db/schema-version", as_service(), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["data"]["current_version"], value["data"]["target_version"]);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn owner_task_flow_maps_errors_to_statuses() {
        let db_path = unique_temp_db_path();
        let state = test_state(db_path.clone());
        let owner = mk_user(&state, "owner@example.com");
        let other = mk_user(&state, "other@example.com");
        let router = app(state);

        let new_task = serde_json::json!({
            "user_id": owner.id.to_string(),
            "title": "Send quote",
            "due_date": "2026-04-10"
        });
        let (status, created) =
            send(&router, request("POST", "/v1/tasks", as_owner(&owner), Some(new_task))).await;
        assert_eq!(status, StatusCode::CREATED);
        let task_id = created["data"]["id"].as_str().unwrap_or_default().to_string();
        assert_eq!(created["data"]["status"], "pending");

        let blank = serde_json::json!({ "user_id": owner.id.to_string(), "title": "  " });
        let (status, _) =
            send(&router, request("POST", "/v1/tasks", as_owner(&owner), Some(blank))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let foreign = serde_json::json!({ "user_id": owner.id.to_string(), "title": "Sneaky" });
        let (status, _) =
            send(&router, request("POST", "/v1/tasks", as_owner(&other), Some(foreign))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let uri = "/v1/tasks/digest?today=2026-04-10";
        let (status, digest) = send(&router, request("GET", uri, as_owner(&owner), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(digest["data"]["due_today"].as_array().map(Vec::len), Some(1));

        let status_uri = format!("/v1/tasks/{task_id}/status");
        let completed = Some(serde_json::json!({ "status": "completed" }));
        let (status, _) =
            send(&router, request("POST", &status_uri, as_owner(&other), completed.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, done) =
            send(&router, request("POST", &status_uri, as_owner(&owner), completed)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(done["data"]["status"], "completed");

        let cancelled = Some(serde_json::json!({ "status": "cancelled" }));
        let (status, _) =
            send(&router, request("POST", &status_uri, as_owner(&owner), cancelled)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, listed) =
            send(&router, request("GET", "/v1/tasks?status=pending", as_owner(&owner), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["data"].as_array().map(Vec::len), Some(0));

        let (status, _) = send(&router, request("GET", "/v1/tasks", as_service(), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn token_links_approve_once() {
        let db_path = unique_temp_db_path();
        let state = test_state(db_path.clone());
        let owner = mk_user(&state, "owner@example.com");
        let action = match state.api.create_pending_action(
            Identity::Service,
            &NewPendingAction {
                user_id: Some(owner.id),
                payload: ActionPayload::new(ActionKind::CreateTask, "Ring back Jane"),
                expires_in_days: None,
            },
        ) {
            Ok(action) => action,
            Err(err) => panic!("failed to create pending action: {err}"),
        };
        let router = app(state);
        let base = format!("/v1/actions/{}", action.token);

        let (status, shown) = send(&router, request("GET", &base, None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(shown["data"]["status"], "pending");

        let approve = format!("{base}/approve");
        let (status, resolved) = send(&router, request("POST", &approve, None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resolved["data"]["action"]["status"], "approved");
        assert_eq!(resolved["data"]["follow_up_task"]["title"], "Ring back Jane");

        let (status, _) = send(&router, request("POST", &approve, None, None)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let reject = format!("{base}/reject");
        let (status, _) = send(&router, request("POST", &reject, None, None)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) =
            send(&router, request("GET", "/v1/actions/not-a-real-token", None, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn project_progress_and_contacts_are_scoped() {
        let db_path = unique_temp_db_path();
        let state = test_state(db_path.clone());
        let owner = mk_user(&state, "owner@example.com");
        let other = mk_user(&state, "other@example.com");
        let owner_id = Identity::Owner(owner.id);
        let project = match state.api.create_project(
            owner_id,
            &NewProject {
                user_id: owner.id,
                name: "Kitchen reno".to_string(),
                color: None,
            },
        ) {
            Ok(project) => project,
            Err(err) => panic!("failed to create project: {err}"),
        };
        for title in ["Demo", "Tiling", "Paint"] {
            let item = NewProjectItem {
                project_id: project.id,
                title: title.to_string(),
                display_order: None,
            };
            let item = match state.api.add_project_item(owner_id, &item) {
                Ok(item) => item,
                Err(err) => panic!("failed to add item: {err}"),
            };
            if title == "Demo" {
                if let Err(err) = state.api.set_project_item_completed(owner_id, item.id, true) {
                    panic!("failed to complete item: {err}");
                }
            }
        }
        let router = app(state);

        let uri = format!("/v1/projects/{}/progress", project.id);
        let (status, progress) = send(&router, request("GET", &uri, as_owner(&owner), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(progress["data"]["percent"], 33);

        let (status, _) = send(&router, request("GET", &uri, as_owner(&other), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, projects) =
            send(&router, request("GET", "/v1/projects", as_owner(&other), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(projects["data"].as_array().map(Vec::len), Some(0));

        let contacts_uri = format!("/v1/contacts?user_id={}", owner.id);
        let (status, contacts) =
            send(&router, request("GET", &contacts_uri, as_service(), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(contacts["data"].as_array().map(Vec::len), Some(0));

        let _ = std::fs::remove_file(&db_path);
    }
}
