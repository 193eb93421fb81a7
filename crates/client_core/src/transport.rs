//! Client half of the live transport.

use std::time::Duration;

use anyhow::anyhow;
use futures::{Stream, StreamExt};
use shared::{
    domain::UserId,
    protocol::{close_code, ServerEvent},
    session::DisconnectReason,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self, client::IntoClientRequest, http::HeaderValue, protocol::CloseFrame, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, ClientResult};

pub type LiveStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What one inbound frame means to the session driver.
#[derive(Debug)]
pub enum LiveFrame {
    Event(ServerEvent),
    Closed(DisconnectReason),
    /// Control or undecodable frame; nothing to do.
    Skip,
}

/// `http://host[/base]` becomes `ws://host[/base]/ws/{user_id}`.
pub fn live_url(server_url: &str, user_id: UserId) -> ClientResult<Url> {
    let mut url = Url::parse(server_url)
        .map_err(|err| anyhow!("invalid server url {server_url}: {err}"))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(anyhow!("unsupported server url scheme {other}").into()),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot derive live transport url from {server_url}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("server url cannot be a base: {server_url}"))?
        .pop_if_empty()
        .push("ws")
        .push(&user_id.0.to_string());
    url.set_query(None);
    Ok(url)
}

/// Opens the socket with the token in the `Authorization` header, so the
/// server authenticates before upgrading.
pub async fn connect_live(
    server_url: &str,
    user_id: UserId,
    token: &str,
    timeout: Duration,
) -> ClientResult<LiveStream> {
    let url = live_url(server_url, user_id)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| ClientError::TransportFailure(err.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| ClientError::AuthFailure("token is not a valid header value".into()))?;
    request.headers_mut().insert("authorization", bearer);

    debug!(url = %url, "opening live transport");
    match tokio::time::timeout(timeout, connect_async(request)).await {
        Err(_) => Err(ClientError::Timeout(timeout)),
        Ok(Ok((stream, _))) => Ok(stream),
        Ok(Err(err)) => Err(map_connect_error(err)),
    }
}

fn map_connect_error(err: tungstenite::Error) -> ClientError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                ClientError::AuthFailure(format!("live transport rejected with {status}"))
            } else {
                ClientError::TransportFailure(format!("live transport rejected with {status}"))
            }
        }
        other => ClientError::TransportFailure(other.to_string()),
    }
}

pub fn classify_close(frame: Option<&CloseFrame<'_>>) -> DisconnectReason {
    match frame.map(|frame| u16::from(frame.code)) {
        Some(close_code::SUPERSEDED) => DisconnectReason::Superseded,
        Some(close_code::UNAUTHORIZED) => DisconnectReason::AuthFailure,
        Some(close_code::SLOW_CONSUMER) => DisconnectReason::SlowConsumer,
        Some(close_code::HANDSHAKE_TIMEOUT) => DisconnectReason::HandshakeTimeout,
        _ => DisconnectReason::TransportFailure,
    }
}

pub fn decode_frame(message: Message) -> LiveFrame {
    match message {
        Message::Text(text) => match serde_json::from_str::<ServerEvent>(&text) {
            Ok(event) => LiveFrame::Event(event),
            Err(error) => {
                warn!(%error, "ignoring undecodable server event");
                LiveFrame::Skip
            }
        },
        Message::Close(frame) => LiveFrame::Closed(classify_close(frame.as_ref())),
        _ => LiveFrame::Skip,
    }
}

/// Reads frames until the server's `ready`. Nothing is pushed before it, so
/// any other event here is dropped.
pub async fn await_ready<S>(reader: &mut S) -> Result<UserId, DisconnectReason>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = reader.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, "live transport failed before ready");
                return Err(DisconnectReason::TransportFailure);
            }
        };
        match decode_frame(message) {
            LiveFrame::Event(ServerEvent::Ready { user_id }) => return Ok(user_id),
            LiveFrame::Event(event) => debug!(?event, "event before ready"),
            LiveFrame::Closed(reason) => return Err(reason),
            LiveFrame::Skip => {}
        }
    }
    Err(DisconnectReason::TransportFailure)
}
