//! REST half of the client. Every response passes through one status
//! interceptor; a 401 clears the stored session before the error is returned
//! and is never retried.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChannelId, ChannelSeq, ServerId},
    error::ApiError,
    protocol::{
        ChannelSummary, CreateChannelRequest, CreateServerRequest, MessagePayload,
        RegisterRequest, SendMessageRequest, ServerSummary, TokenResponse,
        UpdateProfileRequest, UserProfile,
    },
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    error::{ClientError, ClientResult},
    store::SessionStore,
};

pub struct ApiClient {
    http: Client,
    server_url: String,
    request_timeout: Duration,
    token: RwLock<Option<String>>,
    store: Arc<dyn SessionStore>,
}

impl ApiClient {
    pub fn new(
        server_url: &str,
        request_timeout: Duration,
        store: Arc<dyn SessionStore>,
    ) -> ClientResult<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
            request_timeout,
            token: RwLock::new(None),
            store,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    /// Drops the token and the persisted session.
    pub async fn invalidate(&self) {
        self.token.write().await.take();
        if let Err(error) = self.store.clear().await {
            warn!(%error, "failed to clear persisted session");
        }
    }

    pub async fn register(&self, username: &str, password: &str) -> ClientResult<UserProfile> {
        let request = self.http.post(self.url("/register")).json(&RegisterRequest {
            username: username.to_string(),
            password: password.to_string(),
        });
        self.send_json(request, false).await
    }

    pub async fn login(&self, username: &str, password: &str) -> ClientResult<TokenResponse> {
        let request = self
            .http
            .post(self.url("/token"))
            .form(&[("username", username), ("password", password)]);
        self.send_json(request, false).await
    }

    pub async fn me(&self) -> ClientResult<UserProfile> {
        self.send_json(self.http.get(self.url("/users/me")), true).await
    }

    pub async fn update_profile(&self, username: &str) -> ClientResult<UserProfile> {
        let request = self.http.patch(self.url("/users/me")).json(&UpdateProfileRequest {
            username: username.to_string(),
        });
        self.send_json(request, true).await
    }

    pub async fn list_servers(&self) -> ClientResult<Vec<ServerSummary>> {
        self.send_json(self.http.get(self.url("/servers")), true).await
    }

    pub async fn list_all_servers(&self) -> ClientResult<Vec<ServerSummary>> {
        self.send_json(self.http.get(self.url("/servers/all")), true).await
    }

    pub async fn create_server(&self, name: &str) -> ClientResult<ServerSummary> {
        let request = self.http.post(self.url("/servers")).json(&CreateServerRequest {
            name: name.to_string(),
        });
        self.send_json(request, true).await
    }

    pub async fn join_server(&self, server_id: ServerId) -> ClientResult<ServerSummary> {
        let path = format!("/servers/{}/join", server_id.0);
        self.send_json(self.http.post(self.url(&path)), true).await
    }

    pub async fn join_by_invite(&self, invite_code: &str) -> ClientResult<ServerSummary> {
        let mut url = reqwest::Url::parse(&self.url("/invites"))
            .context("invalid server url")?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("server url cannot be a base"))?
            .push(invite_code)
            .push("join");
        self.send_json(self.http.post(url), true).await
    }

    pub async fn delete_server(&self, server_id: ServerId) -> ClientResult<()> {
        let path = format!("/servers/{}", server_id.0);
        self.send(self.http.delete(self.url(&path)), true).await?;
        Ok(())
    }

    pub async fn list_channels(&self, server_id: ServerId) -> ClientResult<Vec<ChannelSummary>> {
        let path = format!("/servers/{}/channels", server_id.0);
        self.send_json(self.http.get(self.url(&path)), true).await
    }

    pub async fn create_channel(
        &self,
        server_id: ServerId,
        name: &str,
    ) -> ClientResult<ChannelSummary> {
        let path = format!("/servers/{}/channels", server_id.0);
        let request = self.http.post(self.url(&path)).json(&CreateChannelRequest {
            name: name.to_string(),
        });
        self.send_json(request, true).await
    }

    /// Newest-first page of at most `limit` messages older than `before`.
    pub async fn list_messages(
        &self,
        channel_id: ChannelId,
        limit: Option<u32>,
        before: Option<ChannelSeq>,
    ) -> ClientResult<Vec<MessagePayload>> {
        let path = format!("/channels/{}/messages", channel_id.0);
        let mut request = self.http.get(self.url(&path));
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        if let Some(before) = before {
            request = request.query(&[("before", before)]);
        }
        self.send_json(request, true).await
    }

    pub async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &str,
    ) -> ClientResult<MessagePayload> {
        let path = format!("/channels/{}/messages", channel_id.0);
        let request = self.http.post(self.url(&path)).json(&SendMessageRequest {
            content: content.to_string(),
        });
        self.send_json(request, true).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        authenticated: bool,
    ) -> ClientResult<T> {
        let response = self.send(request, authenticated).await?;
        response
            .json()
            .await
            .map_err(|err| ClientError::TransportFailure(format!("invalid response body: {err}")))
    }

    async fn send(&self, request: RequestBuilder, authenticated: bool) -> ClientResult<Response> {
        let request = if authenticated {
            let token = self.token().await.ok_or(ClientError::NotLoggedIn)?;
            request.bearer_auth(token)
        } else {
            request
        };

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ClientError::Timeout(self.request_timeout)
            } else {
                ClientError::TransportFailure(err.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<ApiError>().await {
            Ok(body) => body.message,
            Err(_) => status.to_string(),
        };
        Err(self.intercept(status, message).await)
    }

    async fn intercept(&self, status: StatusCode, message: String) -> ClientError {
        match status {
            StatusCode::UNAUTHORIZED => {
                info!(%message, "server rejected credentials; clearing session");
                self.invalidate().await;
                ClientError::AuthFailure(message)
            }
            StatusCode::FORBIDDEN => ClientError::Forbidden(message),
            StatusCode::NOT_FOUND => ClientError::NotFound(message),
            status if status.is_server_error() => {
                ClientError::TransportFailure(format!("{status}: {message}"))
            }
            _ => ClientError::Rejected(message),
        }
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
