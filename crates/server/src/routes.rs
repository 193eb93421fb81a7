use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use server_api::page_limit;
use shared::{
    domain::{ChannelId, ServerId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChannelSummary, CreateChannelRequest, CreateServerRequest, MessagePayload,
        RegisterRequest, SendMessageRequest, ServerSummary, TokenRequest, TokenResponse,
        UpdateProfileRequest, UserProfile,
    },
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::error;

use crate::{auth::AuthUser, ws::ws_handler, AppState};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

type HttpResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<u32>,
    before: Option<i64>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/register", post(register))
        .route("/token", post(issue_token))
        .route("/users/me", get(current_user).patch(update_profile))
        .route("/servers", get(list_servers).post(create_server))
        .route("/servers/all", get(list_all_servers))
        .route("/servers/:server_id", delete(delete_server))
        .route("/servers/:server_id/join", post(join_server))
        .route(
            "/servers/:server_id/channels",
            get(list_channels).post(create_channel),
        )
        .route("/invites/:invite_code/join", post(join_by_invite))
        .route(
            "/channels/:channel_id/messages",
            get(list_messages).post(send_message),
        )
        .route("/ws/:user_id", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn failure(err: ApiError) -> (StatusCode, Json<ApiError>) {
    if err.code == ErrorCode::Internal {
        error!(message = %err.message, "request failed");
    }
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state
        .api
        .storage
        .health_check()
        .await
        .map(|_| "ok")
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> HttpResult<UserProfile> {
    server_api::register(&state.api, &req.username, &req.password)
        .await
        .map(Json)
        .map_err(failure)
}

async fn issue_token(
    State(state): State<Arc<AppState>>,
    Form(req): Form<TokenRequest>,
) -> HttpResult<TokenResponse> {
    server_api::issue_token(&state.api, &req.username, &req.password)
        .await
        .map(Json)
        .map_err(failure)
}

async fn current_user(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
) -> HttpResult<UserProfile> {
    server_api::current_user(&state.api, me.user_id)
        .await
        .map(Json)
        .map_err(failure)
}

async fn update_profile(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Json(req): Json<UpdateProfileRequest>,
) -> HttpResult<UserProfile> {
    server_api::update_profile(&state.api, me.user_id, &req.username)
        .await
        .map(Json)
        .map_err(failure)
}

async fn list_servers(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
) -> HttpResult<Vec<ServerSummary>> {
    server_api::list_servers(&state.api, me.user_id)
        .await
        .map(Json)
        .map_err(failure)
}

async fn list_all_servers(
    State(state): State<Arc<AppState>>,
    AuthUser(_me): AuthUser,
) -> HttpResult<Vec<ServerSummary>> {
    server_api::list_all_servers(&state.api)
        .await
        .map(Json)
        .map_err(failure)
}

async fn create_server(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Json(req): Json<CreateServerRequest>,
) -> HttpResult<ServerSummary> {
    server_api::create_server(&state.api, me.user_id, &req.name)
        .await
        .map(Json)
        .map_err(failure)
}

async fn delete_server(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Path(server_id): Path<i64>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    server_api::delete_server(&state.api, me.user_id, ServerId(server_id))
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure)
}

async fn join_server(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Path(server_id): Path<i64>,
) -> HttpResult<ServerSummary> {
    server_api::join_server(&state.api, me.user_id, ServerId(server_id))
        .await
        .map(Json)
        .map_err(failure)
}

async fn join_by_invite(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Path(invite_code): Path<String>,
) -> HttpResult<ServerSummary> {
    server_api::join_by_invite(&state.api, me.user_id, &invite_code)
        .await
        .map(Json)
        .map_err(failure)
}

async fn list_channels(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Path(server_id): Path<i64>,
) -> HttpResult<Vec<ChannelSummary>> {
    server_api::list_channels(&state.api, me.user_id, ServerId(server_id))
        .await
        .map(Json)
        .map_err(failure)
}

async fn create_channel(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Path(server_id): Path<i64>,
    Json(req): Json<CreateChannelRequest>,
) -> HttpResult<ChannelSummary> {
    server_api::create_channel(&state.api, me.user_id, ServerId(server_id), &req.name)
        .await
        .map(Json)
        .map_err(failure)
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Path(channel_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> HttpResult<Vec<MessagePayload>> {
    let limit = page_limit(q.limit, state.history_page_limit);
    server_api::list_messages(
        &state.api,
        me.user_id,
        ChannelId(channel_id),
        limit,
        q.before,
    )
    .await
    .map(Json)
    .map_err(failure)
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Path(channel_id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> HttpResult<MessagePayload> {
    let draft =
        server_api::prepare_message(&state.api, me.user_id, ChannelId(channel_id), &req.content)
            .await
            .map_err(failure)?;
    let _writer = state.broadcast.channel_writer(draft.channel_id).await;
    let posted = server_api::append_message(&state.api, draft)
        .await
        .map_err(failure)?;
    state
        .broadcast
        .on_message_created(posted.server_id, &posted.message)
        .await;
    Ok(Json(posted.message))
}

#[cfg(test)]
#[path = "tests/routes_tests.rs"]
mod tests;
