use std::{future::Future, sync::Arc, time::Duration};

use client_core::{
    ClientConfig, ClientError, ClientEvent, ClientHandle, MemorySessionStore, PersistedSession,
    RealtimeClient, ReconnectPolicy, SessionStore, ViewState,
};
use server::{build_router, config::Settings, registry::CloseReason, AppState};
use shared::{
    domain::ChannelSeq,
    protocol::UserProfile,
    session::{DisconnectReason, SessionState},
};
use storage::Storage;
use tokio::sync::broadcast;

async fn start_server(settings: Settings) -> (String, Arc<AppState>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let state = AppState::new(storage, &settings);
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), state)
}

fn config(server_url: &str) -> ClientConfig {
    ClientConfig {
        history_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            jitter_ratio: 0.0,
        },
        ..ClientConfig::new(server_url)
    }
}

fn new_client(server_url: &str) -> Arc<RealtimeClient> {
    RealtimeClient::new(config(server_url), Arc::new(MemorySessionStore::new())).expect("client")
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_active(client: &Arc<RealtimeClient>) {
    eventually("active session", || async move {
        client.session_state().await == SessionState::Active
    })
    .await;
}

async fn wait_watermark(client: &Arc<RealtimeClient>, seq: ChannelSeq) -> ViewState {
    eventually(&format!("watermark {seq}"), || async move {
        client.view().await.and_then(|view| view.watermark) == Some(seq)
    })
    .await;
    client.view().await.expect("view")
}

fn seqs(view: &ViewState) -> Vec<ChannelSeq> {
    view.messages.iter().map(|m| m.seq).collect()
}

fn assert_unique_ids(view: &ViewState) {
    let mut ids: Vec<_> = view.messages.iter().map(|m| m.message_id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), view.messages.len(), "duplicate message in view");
}

fn drain(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// alice owns a server, bob joined it, both view `general`.
async fn two_members(server_url: &str) -> (Arc<RealtimeClient>, Arc<RealtimeClient>, UserProfile) {
    let alice = new_client(server_url);
    let alice_profile = alice.register("alice", "pw").await.expect("alice");
    let server = alice.create_server("devs").await.expect("server");
    alice.select_server(server.server_id).await.expect("select");
    wait_active(&alice).await;
    wait_watermark_none(&alice).await;

    let bob = new_client(server_url);
    bob.register("bob", "pw").await.expect("bob");
    bob.join_server(server.server_id).await.expect("join");
    bob.select_server(server.server_id).await.expect("select");
    wait_active(&bob).await;
    (alice, bob, alice_profile)
}

async fn wait_watermark_none(client: &Arc<RealtimeClient>) {
    eventually("empty view", || async move {
        client
            .view()
            .await
            .is_some_and(|view| view.messages.is_empty())
    })
    .await;
}

#[tokio::test]
async fn members_see_each_other_and_own_messages_exactly_once() {
    let (server_url, _state) = start_server(Settings::default()).await;
    let (alice, bob, _) = two_members(&server_url).await;

    let from_bob = bob.send_message("hi alice").await.expect("send");
    let view = wait_watermark(&alice, 1).await;
    assert_eq!(view.messages[0].message_id, from_bob.message_id);

    let own = alice.send_message("hi bob").await.expect("send");
    assert_eq!(own.seq, 2);
    wait_watermark(&alice, 2).await;
    // Leave room for the live copy of the own message to arrive.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let view = alice.view().await.expect("view");
    assert_eq!(seqs(&view), vec![1, 2]);
    assert_unique_ids(&view);

    let view = wait_watermark(&bob, 2).await;
    assert_eq!(view.messages[1].content, "hi bob");
}

#[tokio::test]
async fn reconnect_recovers_message_created_while_disconnected() {
    let (server_url, state) = start_server(Settings::default()).await;
    let (alice, bob, alice_profile) = two_members(&server_url).await;

    for n in 1..=5 {
        bob.send_message(&format!("m{n}")).await.expect("send");
    }
    wait_watermark(&alice, 5).await;

    let mut events = alice.subscribe_events();
    let connection = state
        .registry
        .lookup(alice_profile.user_id)
        .await
        .expect("alice connected")
        .id;
    assert!(
        state
            .registry
            .evict(alice_profile.user_id, connection, CloseReason::SlowConsumer)
            .await
    );
    let sixth = bob.send_message("m6").await.expect("send");

    let view = wait_watermark(&alice, 6).await;
    wait_active(&alice).await;
    assert_eq!(view.messages.last().map(|m| m.message_id), Some(sixth.message_id));

    bob.send_message("m7").await.expect("send");
    let view = wait_watermark(&alice, 7).await;
    assert_eq!(seqs(&view), (1..=7).collect::<Vec<_>>());
    assert_unique_ids(&view);

    let seen = drain(&mut events);
    assert!(seen.iter().any(|event| matches!(
        event,
        ClientEvent::SessionStateChanged {
            state: SessionState::Disconnected,
            reason: Some(DisconnectReason::SlowConsumer),
        }
    )));
}

#[tokio::test]
async fn second_login_supersedes_first_client() {
    let (server_url, state) = start_server(Settings::default()).await;
    let first = new_client(&server_url);
    first.register("alice", "pw").await.expect("register");
    wait_active(&first).await;
    let mut events = first.subscribe_events();

    let second = new_client(&server_url);
    second.login("alice", "pw").await.expect("login");
    wait_active(&second).await;

    let first_ref = &first;
    eventually("first client to drop", || async move {
        first_ref.session_state().await == SessionState::Disconnected
    })
    .await;
    // No reconnect after being superseded.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(first.session_state().await, SessionState::Disconnected);
    assert_eq!(second.session_state().await, SessionState::Active);
    assert_eq!(state.registry.connected_count().await, 1);

    let seen = drain(&mut events);
    assert!(seen.iter().any(|event| matches!(
        event,
        ClientEvent::SessionStateChanged {
            reason: Some(DisconnectReason::Superseded),
            ..
        }
    )));
}

#[tokio::test]
async fn expired_token_is_an_auth_failure_that_clears_the_session() {
    let settings = Settings {
        token_ttl_seconds: -60,
        ..Settings::default()
    };
    let (server_url, _state) = start_server(settings).await;
    let store = Arc::new(MemorySessionStore::new());
    let client = RealtimeClient::new(config(&server_url), store.clone()).expect("client");
    let mut events = client.subscribe_events();

    let err = client.register("alice", "pw").await.expect_err("expired");
    assert!(matches!(err, ClientError::AuthFailure(_)));
    assert_eq!(client.current_user().await, None);
    assert!(store.load().await.expect("load").is_none());
    assert_eq!(client.session_state().await, SessionState::Disconnected);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ClientEvent::SessionInvalidated)));
}

#[tokio::test]
async fn restore_with_rejected_token_clears_the_store() {
    let (server_url, _state) = start_server(Settings::default()).await;
    let registered = new_client(&server_url);
    let user = registered.register("alice", "pw").await.expect("register");

    let store = Arc::new(MemorySessionStore::new());
    store
        .save(&PersistedSession {
            token: "forged".into(),
            user,
        })
        .await
        .expect("save");
    let client = RealtimeClient::new(config(&server_url), store.clone()).expect("client");

    let err = client.restore().await.expect_err("rejected");
    assert!(err.is_auth_failure());
    assert!(store.load().await.expect("load").is_none());
}

#[tokio::test]
async fn restore_resumes_a_persisted_session() {
    let (server_url, _state) = start_server(Settings::default()).await;
    let store = Arc::new(MemorySessionStore::new());
    let first = RealtimeClient::new(config(&server_url), store.clone()).expect("client");
    let user = first.register("alice", "pw").await.expect("register");
    first.logout().await.expect("logout");
    assert!(store.load().await.expect("load").is_none());

    first.login("alice", "pw").await.expect("login");
    let saved = store.load().await.expect("load").expect("saved session");
    assert_eq!(saved.user, user);

    let resumed = RealtimeClient::new(config(&server_url), store.clone()).expect("client");
    assert_eq!(resumed.restore().await.expect("restore"), Some(user));
    wait_active(&resumed).await;
}

#[tokio::test]
async fn switching_channels_rebuilds_the_view_and_filters_events() {
    let (server_url, _state) = start_server(Settings::default()).await;
    let (alice, bob, _) = two_members(&server_url).await;

    bob.send_message("in general").await.expect("send");
    wait_watermark(&alice, 1).await;

    let servers = alice.list_servers().await.expect("servers");
    let random = alice
        .create_channel(servers[0].server_id, "random")
        .await
        .expect("channel");
    alice.select_channel(random.channel_id).await.expect("select");
    let (alice_ref, random_id) = (&alice, random.channel_id);
    eventually("random view", || async move {
        alice_ref
            .view()
            .await
            .is_some_and(|view| view.channel_id == random_id)
    })
    .await;

    bob.send_message("still general").await.expect("send");
    alice.send_message("in random").await.expect("send");
    let view = wait_watermark(&alice, 1).await;
    assert_eq!(view.channel_id, random.channel_id);
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].content, "in random");

    let general = alice
        .fetch_messages(bob.view().await.expect("bob view").channel_id, 10, None)
        .await
        .expect("history");
    assert_eq!(general.len(), 2);
    assert_eq!(general[0].content, "still general");
}
