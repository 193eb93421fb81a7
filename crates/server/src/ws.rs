//! Server half of the live transport: one task per WebSocket, driven through
//! the shared session state machine.

use std::{borrow::Cow, sync::Arc};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{close_code, ClientFrame, ServerEvent, UserProfile},
    session::{DisconnectReason, SessionMachine},
};
use tracing::{debug, info, warn};

use crate::{auth::bearer_token, routes::failure, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    token: Option<String>,
}

enum HandshakeFailure {
    Timeout,
    Rejected(String),
    Transport,
}

/// Authenticates before the upgrade when a token is supplied in the
/// `Authorization` header or `?token=`; otherwise the socket has to send an
/// `authenticate` frame within the handshake window.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let user_id = UserId(user_id);
    let token = bearer_token(&headers)
        .map(str::to_owned)
        .or(q.token);

    let pre_authenticated = match token {
        Some(token) => match authorize(&state, &token, user_id).await {
            Ok(profile) => Some(profile),
            Err(err) => {
                warn!(user_id = user_id.0, code = ?err.code, "rejected live transport upgrade");
                return failure(err).into_response();
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| run_connection(state, socket, user_id, pre_authenticated))
}

async fn authorize(
    state: &AppState,
    token: &str,
    path_user: UserId,
) -> Result<UserProfile, ApiError> {
    let profile = server_api::authenticate_token(&state.api, token).await?;
    if profile.user_id != path_user {
        return Err(ApiError::forbidden("token does not belong to this user"));
    }
    Ok(profile)
}

async fn run_connection(
    state: Arc<AppState>,
    socket: WebSocket,
    user_id: UserId,
    pre_authenticated: Option<UserProfile>,
) {
    let mut session = SessionMachine::new();
    if let Err(err) = session.begin_connect() {
        debug!(user_id = user_id.0, %err, "unexpected session transition");
    }
    let (mut sink, mut stream) = socket.split();

    let profile = match pre_authenticated {
        Some(profile) => profile,
        None => match await_authentication(&state, &mut stream, user_id).await {
            Ok(profile) => profile,
            Err(failure) => {
                let (code, reason, disconnect) = match failure {
                    HandshakeFailure::Timeout => (
                        close_code::HANDSHAKE_TIMEOUT,
                        "handshake timeout".to_string(),
                        DisconnectReason::HandshakeTimeout,
                    ),
                    HandshakeFailure::Rejected(message) => (
                        close_code::UNAUTHORIZED,
                        message,
                        DisconnectReason::AuthFailure,
                    ),
                    HandshakeFailure::Transport => {
                        session.disconnect(DisconnectReason::TransportFailure);
                        return;
                    }
                };
                session.disconnect(disconnect);
                info!(user_id = user_id.0, code, %reason, "live transport handshake failed");
                send_close(&mut sink, code, reason).await;
                return;
            }
        },
    };

    if let Err(err) = session.authenticated() {
        debug!(user_id = user_id.0, %err, "unexpected session transition");
        return;
    }
    let (handle, mut peer) = state
        .registry
        .open(profile.user_id, state.outbound_queue_capacity);
    let connection_id = handle.id;
    state.registry.register(handle).await;

    // Anything appended after registration lands in the outbound queue, so
    // the client may fetch history once it has seen `ready`.
    let ready = ServerEvent::Ready {
        user_id: profile.user_id,
    };
    let delivered = match serde_json::to_string(&ready) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(error) => {
            warn!(%error, "failed to encode ready event");
            false
        }
    };
    if !delivered {
        session.disconnect(DisconnectReason::TransportFailure);
        state.registry.unregister(user_id, connection_id).await;
        return;
    }
    if let Err(err) = session.activate() {
        debug!(user_id = user_id.0, %err, "unexpected session transition");
    }
    info!(
        user_id = user_id.0,
        connection = connection_id.0,
        "live session active"
    );

    let reason = loop {
        tokio::select! {
            event = peer.outbound.recv() => {
                let Some(event) = event else {
                    break DisconnectReason::TransportFailure;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(%error, "failed to encode server event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break DisconnectReason::TransportFailure;
                }
            }
            closed = &mut peer.close => {
                let Ok(reason) = closed else {
                    break DisconnectReason::Cancelled;
                };
                send_close(&mut sink, reason.close_code(), reason.as_str().to_string()).await;
                break reason.into();
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                    break DisconnectReason::TransportFailure;
                }
                Some(Ok(Message::Text(text))) => {
                    debug!(user_id = user_id.0, len = text.len(), "ignoring client frame on active session");
                }
                Some(Ok(_)) => {}
            },
        }
    };

    session.disconnect(reason);
    state.registry.unregister(user_id, connection_id).await;
    info!(
        user_id = user_id.0,
        connection = connection_id.0,
        reason = ?reason,
        "live session closed"
    );
}

async fn await_authentication(
    state: &AppState,
    stream: &mut SplitStream<WebSocket>,
    user_id: UserId,
) -> Result<UserProfile, HandshakeFailure> {
    let first_frame = async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return Err(HandshakeFailure::Transport)
                }
                Some(Ok(_)) => continue,
            }
        }
    };
    let text = tokio::time::timeout(state.handshake_timeout, first_frame)
        .await
        .map_err(|_| HandshakeFailure::Timeout)??;

    let ClientFrame::Authenticate { token } = serde_json::from_str::<ClientFrame>(&text)
        .map_err(|_| HandshakeFailure::Rejected("expected authenticate frame".to_string()))?;
    authorize(state, &token, user_id)
        .await
        .map_err(|err| HandshakeFailure::Rejected(err.message))
}

async fn send_close(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: String) {
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(reason),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}
