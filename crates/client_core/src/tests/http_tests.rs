use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{http::StatusCode as AxumStatus, routing::get, Json, Router};
use shared::{domain::UserId, error::ErrorCode};

use crate::store::{MemorySessionStore, PersistedSession};

async fn stub(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

fn rejection(status: AxumStatus, code: ErrorCode) -> (AxumStatus, Json<ApiError>) {
    (status, Json(ApiError::new(code, "stub says no")))
}

fn persisted() -> PersistedSession {
    PersistedSession {
        token: "stale".into(),
        user: UserProfile {
            user_id: UserId(1),
            username: "alice".into(),
        },
    }
}

#[tokio::test]
async fn unauthorized_clears_session_and_is_not_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new().route(
        "/users/me",
        get(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                rejection(AxumStatus::UNAUTHORIZED, ErrorCode::Unauthorized)
            }
        }),
    );
    let url = stub(router).await;

    let store = Arc::new(MemorySessionStore::new());
    store.save(&persisted()).await.expect("save");
    let client = ApiClient::new(&url, Duration::from_secs(5), store.clone()).expect("client");
    client.set_token(Some("stale".into())).await;

    let err = client.me().await.expect_err("must fail");
    assert!(matches!(err, ClientError::AuthFailure(ref message) if message == "stub says no"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(client.token().await.is_none());
    assert!(store.load().await.expect("load").is_none());

    let err = client.me().await.expect_err("no token left");
    assert!(matches!(err, ClientError::NotLoggedIn));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn other_statuses_map_without_touching_the_session() {
    let router = Router::new()
        .route(
            "/servers",
            get(|| async { rejection(AxumStatus::FORBIDDEN, ErrorCode::Forbidden) }),
        )
        .route(
            "/servers/all",
            get(|| async { rejection(AxumStatus::INTERNAL_SERVER_ERROR, ErrorCode::Internal) }),
        )
        .route(
            "/servers/9/channels",
            get(|| async { rejection(AxumStatus::NOT_FOUND, ErrorCode::NotFound) }),
        )
        .route(
            "/users/me",
            get(|| async { rejection(AxumStatus::CONFLICT, ErrorCode::Conflict) }),
        );
    let url = stub(router).await;

    let store = Arc::new(MemorySessionStore::new());
    store.save(&persisted()).await.expect("save");
    let client = ApiClient::new(&url, Duration::from_secs(5), store.clone()).expect("client");
    client.set_token(Some("fine".into())).await;

    assert!(matches!(client.list_servers().await, Err(ClientError::Forbidden(_))));
    assert!(matches!(
        client.list_channels(ServerId(9)).await,
        Err(ClientError::NotFound(_))
    ));
    assert!(matches!(client.me().await, Err(ClientError::Rejected(_))));
    let err = client.list_all_servers().await.expect_err("500");
    assert!(err.is_retriable());

    assert_eq!(client.token().await.as_deref(), Some("fine"));
    assert!(store.load().await.expect("load").is_some());
}

#[tokio::test]
async fn slow_responses_surface_as_timeouts() {
    let router = Router::new().route(
        "/servers",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Json(Vec::<ServerSummary>::new())
        }),
    );
    let url = stub(router).await;
    let client = ApiClient::new(
        &url,
        Duration::from_millis(200),
        Arc::new(MemorySessionStore::new()),
    )
    .expect("client");
    client.set_token(Some("t".into())).await;

    let err = client.list_servers().await.expect_err("timeout");
    assert!(matches!(err, ClientError::Timeout(d) if d == Duration::from_millis(200)));
}

#[tokio::test]
async fn unreachable_server_is_a_transport_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = ApiClient::new(
        &format!("http://{addr}/"),
        Duration::from_secs(2),
        Arc::new(MemorySessionStore::new()),
    )
    .expect("client");
    assert_eq!(client.server_url(), format!("http://{addr}"));
    let err = client.register("alice", "pw").await.expect_err("refused");
    assert!(matches!(err, ClientError::TransportFailure(_)));
}
