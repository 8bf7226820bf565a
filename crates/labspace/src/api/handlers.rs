//! Session management handlers and the app traffic fallback.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, Path, State, WebSocketUpgrade},
    http::{HeaderMap, Request, StatusCode, header},
    response::{AppendHeaders, IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::proxy::{
    access_code_cookie, access_code_from_headers, clear_access_code_cookie, route_to_app,
    route_to_app_ws,
};
use crate::session::{
    AppType, CommandOutput, DeleteStatus, Session, SessionDescriptor, UserIdentity,
    VolumeRequest,
};

use super::error::{ApiError, ApiResult};
use super::state::{AppState, CurrentUser};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Optional display fields for the caller.
#[derive(Debug, Default, Deserialize)]
pub struct UserProfile {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LaunchSessionRequest {
    pub project: String,
    pub app_type: String,
    #[serde(default)]
    pub volumes: Vec<VolumeRequest>,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

#[derive(Debug, Deserialize)]
pub struct ImportSessionRequest {
    pub project: String,
    pub app_type: String,
    pub image: String,
    #[serde(default)]
    pub volumes: Vec<VolumeRequest>,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_expect_json")]
    pub expect_json: bool,
}

pub(crate) fn default_branch() -> String {
    "master".to_string()
}

/// Commands talk to the in-container agent unless told otherwise.
pub(crate) fn default_expect_json() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    #[serde(default = "default_branch")]
    pub branch: String,
}

/// Output of a command run in a session; `null` when the command could not
/// be run.
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub output: Option<CommandOutput>,
}

#[derive(Debug, Serialize)]
pub struct CommitResponse {
    pub body: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub status: DeleteStatus,
}

#[derive(Debug, Serialize)]
pub struct SuspendResponse {
    pub status: &'static str,
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub removed: Vec<String>,
}

pub(crate) fn identity_with_profile(user: &CurrentUser, profile: Option<UserProfile>) -> UserIdentity {
    let mut identity = user.0.clone();
    if let Some(profile) = profile {
        identity.name = profile.name.filter(|n| !n.is_empty());
        identity.email = profile.email.filter(|e| !e.is_empty());
    }
    identity
}

pub(crate) fn validate_project(project: &str) -> ApiResult<()> {
    if project.trim().is_empty() {
        return Err(ApiError::bad_request("project cannot be empty"));
    }
    Ok(())
}

/// Session named by `access_code`, provided the caller owns it.
pub(crate) fn owned_session(
    state: &AppState,
    user: &CurrentUser,
    access_code: &str,
) -> ApiResult<Arc<Session>> {
    let session = state
        .registry
        .get_session_by_code(access_code)
        .ok_or_else(|| ApiError::not_found(format!("session {}", access_code)))?;
    if session.owner().id != user.id() {
        warn!(
            user = user.id(),
            access_code, "Session access by non-owner refused"
        );
        return Err(ApiError::forbidden("session belongs to another user"));
    }
    Ok(session)
}

fn with_cookie(access_code: &str, descriptor: SessionDescriptor) -> Response {
    (
        AppendHeaders([(header::SET_COOKIE, access_code_cookie(access_code))]),
        Json(descriptor),
    )
        .into_response()
}

/// Launch (or reuse) the caller's session for a project and app, and bind
/// the browser to it.
#[instrument(skip(state, user, request), fields(user = user.id()))]
pub async fn launch_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<LaunchSessionRequest>,
) -> ApiResult<Response> {
    validate_project(&request.project)?;
    let app_type: AppType = request.app_type.parse()?;
    let volumes = VolumeRequest::resolve(request.volumes);
    let identity = identity_with_profile(&user, request.user);

    let session = state
        .registry
        .launch_session(&identity, &request.project, app_type, volumes)
        .await?;
    info!(
        access_code = session.access_code(),
        app_type = %app_type,
        project = %request.project,
        "Session launched"
    );
    Ok(with_cookie(session.access_code(), session.descriptor()))
}

/// Start a session from a previously suspended image.
#[instrument(skip(state, user, request), fields(user = user.id()))]
pub async fn import_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<ImportSessionRequest>,
) -> ApiResult<Response> {
    validate_project(&request.project)?;
    let app_type: AppType = request.app_type.parse()?;
    let volumes = VolumeRequest::resolve(request.volumes);
    let identity = identity_with_profile(&user, request.user);

    let session = state
        .registry
        .import_session(&identity, &request.project, app_type, volumes, &request.image)
        .await?;
    info!(
        access_code = session.access_code(),
        image = %request.image,
        "Session imported"
    );
    Ok(with_cookie(session.access_code(), session.descriptor()))
}

/// List the caller's sessions.
#[instrument(skip(state, user))]
pub async fn list_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Json<Vec<SessionDescriptor>> {
    let sessions: Vec<SessionDescriptor> = state
        .registry
        .get_user_sessions(user.id())
        .iter()
        .map(|session| session.descriptor())
        .collect();
    info!(count = sessions.len(), "Listed sessions");
    Json(sessions)
}

pub async fn get_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(access_code): Path<String>,
) -> ApiResult<Json<SessionDescriptor>> {
    let session = owned_session(&state, &user, &access_code)?;
    Ok(Json(session.descriptor()))
}

#[instrument(skip(state, user))]
pub async fn delete_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(access_code): Path<String>,
) -> ApiResult<Response> {
    owned_session(&state, &user, &access_code)?;
    let status = state.registry.delete_session(&access_code).await?;
    info!(%access_code, ?status, "Session deleted");

    Ok((
        AppendHeaders([(header::SET_COOKIE, clear_access_code_cookie())]),
        Json(DeleteResponse { status }),
    )
        .into_response())
}

pub async fn exec_command(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(access_code): Path<String>,
    Json(request): Json<ExecRequest>,
) -> ApiResult<Json<CommandResponse>> {
    if request.argv.is_empty() {
        return Err(ApiError::bad_request("argv cannot be empty"));
    }
    let session = owned_session(&state, &user, &access_code)?;
    let env: Vec<(String, String)> = request.env.into_iter().collect();

    let output = session
        .run_command(&request.argv, &env, request.expect_json)
        .await;
    Ok(Json(CommandResponse { output }))
}

pub async fn commit_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(access_code): Path<String>,
    Json(request): Json<CommitRequest>,
) -> ApiResult<Json<CommitResponse>> {
    let session = owned_session(&state, &user, &access_code)?;
    let body = session.commit(&request.branch).await;
    Ok(Json(CommitResponse { body }))
}

pub async fn copy_docs(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(access_code): Path<String>,
) -> ApiResult<Json<CommandResponse>> {
    let session = owned_session(&state, &user, &access_code)?;
    let output = session.copy_uploaded_docs().await;
    Ok(Json(CommandResponse { output }))
}

/// Commit the session to its suspended image and delete it, in the
/// background.
#[instrument(skip(state, user))]
pub async fn suspend_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(access_code): Path<String>,
) -> ApiResult<(StatusCode, Json<SuspendResponse>)> {
    let session = owned_session(&state, &user, &access_code)?;
    let image = session.suspended_image_ref();

    let registry = state.registry.clone();
    tokio::spawn(async move {
        if session.export_to_image().await.is_none() {
            warn!(
                access_code = session.access_code(),
                "Suspend export failed, deleting anyway"
            );
        }
        if let Err(e) = registry.delete_session(session.access_code()).await {
            warn!(
                access_code = session.access_code(),
                error = %e,
                "Suspend delete failed"
            );
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SuspendResponse {
            status: "suspending",
            image,
        }),
    ))
}

pub async fn reconcile(State(state): State<AppState>) -> ApiResult<Json<ReconcileResponse>> {
    let removed = state.registry.reconcile().await?;
    Ok(Json(ReconcileResponse { removed }))
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

fn no_session() -> Response {
    ApiError::not_found("no session for this request").into_response()
}

/// Everything that is not an API route is app traffic for the session named
/// by the access-code cookie.
pub async fn app_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    if !is_websocket_upgrade(req.headers()) {
        return route_to_app(&state.registry, req)
            .await
            .unwrap_or_else(no_session);
    }

    let (mut parts, _body) = req.into_parts();
    let Some(access_code) = access_code_from_headers(&parts.headers) else {
        return no_session();
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let cookie = parts
        .headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    route_to_app_ws(&state.registry, &access_code, ws, path_and_query, cookie)
        .unwrap_or_else(no_session)
}
