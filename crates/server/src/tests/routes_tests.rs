use super::*;
use axum::{
    body::{self, Body},
    http::{header, Request, Response},
};
use serde::de::DeserializeOwned;
use storage::Storage;
use tower::ServiceExt;

use crate::config::Settings;

async fn test_app() -> (Router, Arc<AppState>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let state = AppState::new(storage, &Settings::default());
    (build_router(state.clone()), state)
}

async fn read_json<T: DeserializeOwned>(response: Response<Body>) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

fn get_request(uri: &str, token: &str) -> Request<Body> {
    Request::get(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request")
}

async fn signup(app: &Router, username: &str) -> (UserProfile, String) {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/register",
            None,
            serde_json::json!({ "username": username, "password": "pw" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let profile: UserProfile = read_json(response).await;

    let form = Request::post("/token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(format!("username={username}&password=pw")))
        .expect("request");
    let response = app.clone().oneshot(form).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let token: TokenResponse = read_json(response).await;
    assert_eq!(token.token_type, "bearer");
    (profile, token.access_token)
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _state) = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn protected_routes_require_a_valid_bearer_token() {
    let (app, _state) = test_app().await;
    let request = Request::get("/users/me")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let err: ApiError = read_json(response).await;
    assert_eq!(err.code, ErrorCode::Unauthorized);

    let response = app
        .oneshot(get_request("/users/me", "garbage"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_password_is_unauthorized() {
    let (app, _state) = test_app().await;
    signup(&app, "alice").await;
    let form = Request::post("/token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("username=alice&password=nope"))
        .expect("request");
    let response = app.oneshot(form).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn me_and_profile_update() {
    let (app, _state) = test_app().await;
    let (alice, token) = signup(&app, "alice").await;
    signup(&app, "bob").await;

    let response = app
        .clone()
        .oneshot(get_request("/users/me", &token))
        .await
        .expect("response");
    let me: UserProfile = read_json(response).await;
    assert_eq!(me, alice);

    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/users/me",
            Some(&token),
            serde_json::json!({ "username": "bob" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .oneshot(json_request(
            "PATCH",
            "/users/me",
            Some(&token),
            serde_json::json!({ "username": "alicia" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let renamed: UserProfile = read_json(response).await;
    assert_eq!(renamed.username, "alicia");
}

#[tokio::test]
async fn server_channel_and_message_flow() {
    let (app, _state) = test_app().await;
    let (_alice, alice_token) = signup(&app, "alice").await;
    let (_bob, bob_token) = signup(&app, "bob").await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/servers",
            Some(&alice_token),
            serde_json::json!({ "name": "devs" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let server: ServerSummary = read_json(response).await;
    let server_id = server.server_id.0;

    let response = app
        .clone()
        .oneshot(get_request(&format!("/servers/{server_id}/channels"), &bob_token))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/servers/{server_id}/join"),
            Some(&bob_token),
            serde_json::json!({}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/servers/{server_id}/channels"),
            Some(&bob_token),
            serde_json::json!({ "name": "random" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(get_request(&format!("/servers/{server_id}/channels"), &bob_token))
        .await
        .expect("response");
    let channels: Vec<ChannelSummary> = read_json(response).await;
    assert_eq!(channels[0].name, "general");
    let channel_id = channels[0].channel_id.0;

    for text in ["one", "two", "three"] {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/channels/{channel_id}/messages"),
                Some(&bob_token),
                serde_json::json!({ "content": text }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(get_request(
            &format!("/channels/{channel_id}/messages?limit=2"),
            &alice_token,
        ))
        .await
        .expect("response");
    let page: Vec<MessagePayload> = read_json(response).await;
    let seqs: Vec<i64> = page.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![3, 2]);
    assert_eq!(page[0].sender.username, "bob");

    let response = app
        .oneshot(get_request(
            &format!("/channels/{channel_id}/messages?before=2"),
            &alice_token,
        ))
        .await
        .expect("response");
    let older: Vec<MessagePayload> = read_json(response).await;
    assert_eq!(older.len(), 1);
    assert_eq!(older[0].content, "one");
}

#[tokio::test]
async fn posting_to_unknown_channels_leaves_no_writer_locks() {
    let (app, state) = test_app().await;
    let (_alice, alice_token) = signup(&app, "alice").await;

    for channel_id in 1000..1100 {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/channels/{channel_id}/messages"),
                Some(&alice_token),
                serde_json::json!({ "content": "hello?" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    assert_eq!(state.broadcast.active_writers(), 0);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/servers",
            Some(&alice_token),
            serde_json::json!({ "name": "devs" }),
        ))
        .await
        .expect("response");
    let server: ServerSummary = read_json(response).await;
    let response = app
        .clone()
        .oneshot(get_request(
            &format!("/servers/{}/channels", server.server_id.0),
            &alice_token,
        ))
        .await
        .expect("response");
    let channels: Vec<ChannelSummary> = read_json(response).await;
    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/channels/{}/messages", channels[0].channel_id.0),
            Some(&alice_token),
            serde_json::json!({ "content": "hi" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.broadcast.active_writers(), 0);
}

#[tokio::test]
async fn invite_join_and_owner_only_delete() {
    let (app, _state) = test_app().await;
    let (_alice, alice_token) = signup(&app, "alice").await;
    let (_bob, bob_token) = signup(&app, "bob").await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/servers",
            Some(&alice_token),
            serde_json::json!({ "name": "devs" }),
        ))
        .await
        .expect("response");
    let server: ServerSummary = read_json(response).await;
    let invite = server.invite_code.clone().expect("invite");

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/invites/{invite}/join"),
            Some(&bob_token),
            serde_json::json!({}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get_request("/servers/all", &bob_token))
        .await
        .expect("response");
    let all: Vec<ServerSummary> = read_json(response).await;
    assert!(all.iter().all(|s| s.invite_code.is_none()));

    let delete_as = |token: &str| {
        Request::delete(format!("/servers/{}", server.server_id.0))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request")
    };
    let response = app
        .clone()
        .oneshot(delete_as(&bob_token))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = app
        .clone()
        .oneshot(delete_as(&alice_token))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(get_request("/servers", &bob_token))
        .await
        .expect("response");
    let mine: Vec<ServerSummary> = read_json(response).await;
    assert!(mine.is_empty());
}

#[tokio::test]
async fn posting_fans_out_to_registered_members() {
    let (app, state) = test_app().await;
    let (alice, alice_token) = signup(&app, "alice").await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/servers",
            Some(&alice_token),
            serde_json::json!({ "name": "devs" }),
        ))
        .await
        .expect("response");
    let server: ServerSummary = read_json(response).await;
    let channel = state
        .api
        .storage
        .list_channels_for_server(server.server_id)
        .await
        .expect("channels")[0]
        .channel_id;

    let (handle, mut peer) = state.registry.open(alice.user_id, 8);
    state.registry.register(handle).await;

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/channels/{}/messages", channel.0),
            Some(&alice_token),
            serde_json::json!({ "content": "hello" }),
        ))
        .await
        .expect("response");
    let posted: MessagePayload = read_json(response).await;

    match peer.outbound.recv().await {
        Some(shared::protocol::ServerEvent::NewMessage { message }) => {
            assert_eq!(message, posted)
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn error_codes_map_to_http_statuses() {
    assert_eq!(status_for(ErrorCode::Unauthorized), StatusCode::UNAUTHORIZED);
    assert_eq!(status_for(ErrorCode::Forbidden), StatusCode::FORBIDDEN);
    assert_eq!(status_for(ErrorCode::NotFound), StatusCode::NOT_FOUND);
    assert_eq!(status_for(ErrorCode::Validation), StatusCode::BAD_REQUEST);
    assert_eq!(status_for(ErrorCode::Conflict), StatusCode::CONFLICT);
    assert_eq!(
        status_for(ErrorCode::Internal),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}
