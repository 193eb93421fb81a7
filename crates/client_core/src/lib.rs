use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{ChannelId, ChannelSeq, ServerId},
    protocol::{ChannelSummary, MessagePayload, ServerEvent, ServerSummary, UserProfile},
    session::{DisconnectReason, SessionMachine, SessionState},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod backoff;
pub mod error;
pub mod http;
pub mod reconciler;
pub mod store;
pub mod transport;

pub use backoff::{Backoff, ReconnectPolicy};
pub use error::{ClientError, ClientResult};
pub use http::ApiClient;
pub use reconciler::{ApplyOutcome, LoadOutcome, LoadTicket, ViewReconciler, ViewState};
pub use store::{FileSessionStore, MemorySessionStore, PersistedSession, SessionStore};

use transport::{await_ready, connect_live, decode_frame, LiveFrame};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// Page size of the history snapshot loaded on channel selection.
    pub history_limit: u32,
    pub history_timeout: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            history_limit: 50,
            history_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    SessionStateChanged {
        state: SessionState,
        reason: Option<DisconnectReason>,
    },
    /// The selected channel's view was rebuilt from a history snapshot.
    ViewReset(ViewState),
    MessagesAppended {
        channel_id: ChannelId,
        messages: Vec<MessagePayload>,
    },
    /// A history load for the channel is in flight; the view is not current.
    ViewStale { channel_id: ChannelId },
    /// The server rejected the stored credentials. Log in again.
    SessionInvalidated,
    Error(String),
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    /// Resumes a persisted session, if any.
    async fn restore(&self) -> ClientResult<Option<UserProfile>>;
    async fn register(&self, username: &str, password: &str) -> ClientResult<UserProfile>;
    async fn login(&self, username: &str, password: &str) -> ClientResult<UserProfile>;
    async fn logout(&self) -> ClientResult<()>;
    async fn current_user(&self) -> Option<UserProfile>;
    async fn update_profile(&self, username: &str) -> ClientResult<UserProfile>;
    async fn list_servers(&self) -> ClientResult<Vec<ServerSummary>>;
    async fn list_all_servers(&self) -> ClientResult<Vec<ServerSummary>>;
    async fn create_server(&self, name: &str) -> ClientResult<ServerSummary>;
    async fn join_server(&self, server_id: ServerId) -> ClientResult<ServerSummary>;
    async fn join_with_invite(&self, invite_code: &str) -> ClientResult<ServerSummary>;
    async fn delete_server(&self, server_id: ServerId) -> ClientResult<()>;
    async fn list_channels(&self, server_id: ServerId) -> ClientResult<Vec<ChannelSummary>>;
    async fn create_channel(&self, server_id: ServerId, name: &str)
        -> ClientResult<ChannelSummary>;
    /// Lists the server's channels and selects the first one.
    async fn select_server(&self, server_id: ServerId) -> ClientResult<Vec<ChannelSummary>>;
    async fn select_channel(&self, channel_id: ChannelId) -> ClientResult<()>;
    /// Pages older history without touching the live view.
    async fn fetch_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
        before: Option<ChannelSeq>,
    ) -> ClientResult<Vec<MessagePayload>>;
    async fn send_message(&self, content: &str) -> ClientResult<MessagePayload>;
    async fn view(&self) -> Option<ViewState>;
    async fn session_state(&self) -> SessionState;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

pub struct RealtimeClient {
    config: ClientConfig,
    api: ApiClient,
    inner: Mutex<RealtimeClientState>,
    events: broadcast::Sender<ClientEvent>,
}

struct RealtimeClientState {
    user: Option<UserProfile>,
    selected_server: Option<ServerId>,
    reconciler: ViewReconciler,
    session_state: SessionState,
    driver: Option<JoinHandle<()>>,
    /// Bumped whenever the driver is replaced; stale drivers stop publishing.
    driver_generation: u64,
    /// History results for the connected driver, if any.
    reloads: Option<mpsc::Sender<Reload>>,
}

struct Reload {
    ticket: LoadTicket,
    result: ClientResult<Vec<MessagePayload>>,
}

impl RealtimeClientState {
    fn stop_driver(&mut self) {
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }
        self.driver_generation += 1;
        self.reloads = None;
    }

    fn clear(&mut self) {
        self.stop_driver();
        self.user = None;
        self.selected_server = None;
        self.reconciler.reset();
        self.session_state = SessionState::Disconnected;
    }
}

impl RealtimeClient {
    pub fn new(config: ClientConfig, store: Arc<dyn SessionStore>) -> ClientResult<Arc<Self>> {
        let api = ApiClient::new(&config.server_url, config.request_timeout, store)?;
        let (events, _) = broadcast::channel(1024);
        Ok(Arc::new(Self {
            config,
            api,
            inner: Mutex::new(RealtimeClientState {
                user: None,
                selected_server: None,
                reconciler: ViewReconciler::new(),
                session_state: SessionState::Disconnected,
                driver: None,
                driver_generation: 0,
                reloads: None,
            }),
            events,
        }))
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Runs the auth interceptor's client-wide half: any auth failure drops
    /// the live session along with the token.
    async fn guard<T>(&self, result: ClientResult<T>) -> ClientResult<T> {
        if let Err(err) = &result {
            if err.is_auth_failure() {
                self.invalidate_session(None).await;
            }
        }
        result
    }

    async fn invalidate_session(&self, from_driver: Option<u64>) {
        self.api.invalidate().await;
        {
            let mut guard = self.inner.lock().await;
            if from_driver.is_some_and(|generation| generation == guard.driver_generation) {
                // Called from the driver itself; it returns right after.
                guard.driver.take();
            }
            guard.clear();
        }
        warn!("session invalidated; login required");
        self.emit(ClientEvent::SessionInvalidated);
        self.emit(ClientEvent::SessionStateChanged {
            state: SessionState::Disconnected,
            reason: Some(DisconnectReason::AuthFailure),
        });
    }

    async fn establish(self: &Arc<Self>, token: String, user: UserProfile) -> ClientResult<()> {
        self.api
            .store()
            .save(&PersistedSession {
                token: token.clone(),
                user: user.clone(),
            })
            .await
            .context("failed to persist session")?;
        self.api.set_token(Some(token)).await;
        {
            let mut guard = self.inner.lock().await;
            guard.clear();
            guard.user = Some(user);
        }
        self.start_driver().await;
        Ok(())
    }

    async fn start_driver(self: &Arc<Self>) {
        let mut guard = self.inner.lock().await;
        guard.stop_driver();
        let generation = guard.driver_generation;
        let client = Arc::clone(self);
        guard.driver = Some(tokio::spawn(client.drive(generation)));
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().await.driver_generation == generation
    }

    async fn publish_state(&self, generation: u64, session: &SessionMachine) {
        {
            let mut guard = self.inner.lock().await;
            if guard.driver_generation != generation {
                return;
            }
            guard.session_state = session.state();
            // Emitted under the lock so nothing follows a logout's event.
            debug!(state = ?session.state(), reason = ?session.disconnect_reason(), "session state changed");
            self.emit(ClientEvent::SessionStateChanged {
                state: session.state(),
                reason: session.disconnect_reason(),
            });
        }
    }

    /// One live session per login: connect, reconcile, and reconnect with
    /// backoff until a non-retriable disconnect.
    async fn drive(self: Arc<Self>, generation: u64) {
        let mut backoff = Backoff::new(self.config.reconnect.clone());
        loop {
            let reason = self.run_session(generation, &mut backoff).await;
            if !self.is_current(generation).await {
                return;
            }
            match reason {
                DisconnectReason::AuthFailure => {
                    self.invalidate_session(Some(generation)).await;
                    return;
                }
                reason if reason.should_reconnect() => {
                    let delay = backoff.next_delay();
                    info!(
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        reason = ?reason,
                        "live session lost; reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
                reason => {
                    info!(reason = ?reason, "live session ended");
                    let mut guard = self.inner.lock().await;
                    if guard.driver_generation == generation {
                        guard.driver.take();
                        guard.reloads = None;
                    }
                    return;
                }
            }
        }
    }

    async fn run_session(
        self: &Arc<Self>,
        generation: u64,
        backoff: &mut Backoff,
    ) -> DisconnectReason {
        let mut session = SessionMachine::new();
        if let Err(err) = session.begin_connect() {
            debug!(%err, "unexpected session transition");
        }
        self.publish_state(generation, &session).await;

        let user_id = match self.inner.lock().await.user.as_ref() {
            Some(user) => user.user_id,
            None => return DisconnectReason::Logout,
        };
        let Some(token) = self.api.token().await else {
            return DisconnectReason::Logout;
        };

        let stream = match connect_live(
            self.api.server_url(),
            user_id,
            &token,
            self.config.connect_timeout,
        )
        .await
        {
            Ok(stream) => stream,
            Err(err) => {
                let reason = if err.is_auth_failure() {
                    DisconnectReason::AuthFailure
                } else {
                    DisconnectReason::TransportFailure
                };
                warn!(user_id = user_id.0, error = %err, "live transport connect failed");
                session.disconnect(reason);
                self.publish_state(generation, &session).await;
                return reason;
            }
        };

        // The write half stays alive so the socket is not half-closed.
        let (_sink, mut reader) = stream.split();
        let ready = tokio::time::timeout(self.config.connect_timeout, await_ready(&mut reader)).await;
        if let Err(reason) = ready.unwrap_or(Err(DisconnectReason::TransportFailure)) {
            warn!(user_id = user_id.0, reason = ?reason, "live session ended before ready");
            session.disconnect(reason);
            self.publish_state(generation, &session).await;
            return reason;
        }
        if let Err(err) = session.authenticated() {
            debug!(%err, "unexpected session transition");
        }
        self.publish_state(generation, &session).await;

        let (reload_tx, mut reload_rx) = mpsc::channel(8);
        let initial_load = {
            let mut guard = self.inner.lock().await;
            if guard.driver_generation != generation {
                return DisconnectReason::Cancelled;
            }
            guard.reloads = Some(reload_tx.clone());
            guard
                .reconciler
                .selected_channel()
                .map(|channel_id| guard.reconciler.begin_load(channel_id))
        };
        match initial_load {
            Some(ticket) => {
                self.emit(ClientEvent::ViewStale {
                    channel_id: ticket.channel_id,
                });
                self.spawn_reload(ticket, reload_tx.clone());
            }
            None => self.activate(generation, &mut session, backoff).await,
        }

        let reason = loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(message)) => match decode_frame(message) {
                        LiveFrame::Event(event) => self.on_live_event(event, &reload_tx).await,
                        LiveFrame::Closed(reason) => break reason,
                        LiveFrame::Skip => {}
                    },
                    Some(Err(error)) => {
                        debug!(%error, "live transport receive failed");
                        break DisconnectReason::TransportFailure;
                    }
                    None => break DisconnectReason::TransportFailure,
                },
                Some(reload) = reload_rx.recv() => {
                    if let Err(reason) = self
                        .on_reload(reload, &reload_tx, generation, &mut session, backoff)
                        .await
                    {
                        break reason;
                    }
                }
            }
        };

        {
            let mut guard = self.inner.lock().await;
            if guard.driver_generation == generation {
                guard.reloads = None;
            }
        }
        session.disconnect(reason);
        self.publish_state(generation, &session).await;
        reason
    }

    async fn activate(&self, generation: u64, session: &mut SessionMachine, backoff: &mut Backoff) {
        if session.activate().is_ok() {
            backoff.reset();
            self.publish_state(generation, session).await;
        }
    }

    fn spawn_reload(self: &Arc<Self>, ticket: LoadTicket, results: mpsc::Sender<Reload>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let timeout = client.config.history_timeout;
            let fetch = client.api.list_messages(
                ticket.channel_id,
                Some(client.config.history_limit),
                None,
            );
            let result = match tokio::time::timeout(timeout, fetch).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(timeout)),
            };
            let _ = results.send(Reload { ticket, result }).await;
        });
    }

    async fn on_live_event(self: &Arc<Self>, event: ServerEvent, reloads: &mpsc::Sender<Reload>) {
        if let ServerEvent::Error(err) = &event {
            warn!(code = ?err.code, message = %err.message, "server reported an error");
            self.emit(ClientEvent::Error(err.message.clone()));
            return;
        }
        let outcome = self.inner.lock().await.reconciler.apply_live_event(&event);
        match outcome {
            ApplyOutcome::Appended(messages) => self.emit_appended(messages),
            ApplyOutcome::Stale(ticket) => {
                info!(channel_id = ticket.channel_id.0, "gap in live stream; reloading history");
                self.emit(ClientEvent::ViewStale {
                    channel_id: ticket.channel_id,
                });
                self.spawn_reload(ticket, reloads.clone());
            }
            ApplyOutcome::Duplicate
            | ApplyOutcome::Buffered
            | ApplyOutcome::Held
            | ApplyOutcome::Ignored => {}
        }
    }

    async fn on_reload(
        self: &Arc<Self>,
        reload: Reload,
        reloads: &mpsc::Sender<Reload>,
        generation: u64,
        session: &mut SessionMachine,
        backoff: &mut Backoff,
    ) -> Result<(), DisconnectReason> {
        let Reload { ticket, result } = reload;
        let history = match result {
            Ok(history) => history,
            Err(err) if err.is_auth_failure() => return Err(DisconnectReason::AuthFailure),
            Err(err) => {
                let current =
                    self.inner.lock().await.reconciler.pending_load() == Some(ticket);
                if !current {
                    return Ok(());
                }
                if err.is_retriable() {
                    warn!(channel_id = ticket.channel_id.0, error = %err, "history load failed");
                    return Err(DisconnectReason::TransportFailure);
                }
                warn!(channel_id = ticket.channel_id.0, error = %err, "channel is not readable");
                self.inner.lock().await.reconciler.reset();
                self.emit(ClientEvent::Error(format!(
                    "failed to load channel {}: {err}",
                    ticket.channel_id
                )));
                self.activate(generation, session, backoff).await;
                return Ok(());
            }
        };

        let outcome = self
            .inner
            .lock()
            .await
            .reconciler
            .complete_load(ticket, history);
        match outcome {
            LoadOutcome::Ready(view) => {
                debug!(
                    channel_id = view.channel_id.0,
                    watermark = ?view.watermark,
                    "history loaded"
                );
                self.emit(ClientEvent::ViewReset(view));
                self.activate(generation, session, backoff).await;
            }
            LoadOutcome::Stale(next) => {
                self.emit(ClientEvent::ViewStale {
                    channel_id: next.channel_id,
                });
                self.spawn_reload(next, reloads.clone());
            }
            LoadOutcome::Ignored => {}
        }
        Ok(())
    }

    fn emit_appended(&self, messages: Vec<MessagePayload>) {
        if let Some(first) = messages.first() {
            let channel_id = first.channel_id;
            self.emit(ClientEvent::MessagesAppended {
                channel_id,
                messages,
            });
        }
    }
}

#[async_trait]
impl ClientHandle for Arc<RealtimeClient> {
    async fn restore(&self) -> ClientResult<Option<UserProfile>> {
        let Some(saved) = self.api.store().load().await? else {
            return Ok(None);
        };
        self.api.set_token(Some(saved.token.clone())).await;
        let user = match self.api.me().await {
            Ok(user) => user,
            Err(err) if err.is_retriable() => {
                warn!(error = %err, "server unreachable; resuming with cached profile");
                saved.user
            }
            Err(err) => return self.guard(Err(err)).await,
        };
        self.establish(saved.token, user.clone()).await?;
        info!(user_id = user.user_id.0, "session restored");
        Ok(Some(user))
    }

    async fn register(&self, username: &str, password: &str) -> ClientResult<UserProfile> {
        self.guard(self.api.register(username, password).await).await?;
        self.login(username, password).await
    }

    async fn login(&self, username: &str, password: &str) -> ClientResult<UserProfile> {
        let token = self.guard(self.api.login(username, password).await).await?;
        self.api.set_token(Some(token.access_token.clone())).await;
        let user = self.guard(self.api.me().await).await?;
        self.establish(token.access_token, user.clone()).await?;
        info!(user_id = user.user_id.0, "logged in");
        Ok(user)
    }

    async fn logout(&self) -> ClientResult<()> {
        self.inner.lock().await.clear();
        self.api.set_token(None).await;
        self.api
            .store()
            .clear()
            .await
            .context("failed to clear persisted session")?;
        info!("logged out");
        self.emit(ClientEvent::SessionStateChanged {
            state: SessionState::Disconnected,
            reason: Some(DisconnectReason::Logout),
        });
        Ok(())
    }

    async fn current_user(&self) -> Option<UserProfile> {
        self.inner.lock().await.user.clone()
    }

    async fn update_profile(&self, username: &str) -> ClientResult<UserProfile> {
        let user = self.guard(self.api.update_profile(username).await).await?;
        if let Some(token) = self.api.token().await {
            self.api
                .store()
                .save(&PersistedSession {
                    token,
                    user: user.clone(),
                })
                .await
                .context("failed to persist session")?;
        }
        self.inner.lock().await.user = Some(user.clone());
        Ok(user)
    }

    async fn list_servers(&self) -> ClientResult<Vec<ServerSummary>> {
        self.guard(self.api.list_servers().await).await
    }

    async fn list_all_servers(&self) -> ClientResult<Vec<ServerSummary>> {
        self.guard(self.api.list_all_servers().await).await
    }

    async fn create_server(&self, name: &str) -> ClientResult<ServerSummary> {
        self.guard(self.api.create_server(name).await).await
    }

    async fn join_server(&self, server_id: ServerId) -> ClientResult<ServerSummary> {
        self.guard(self.api.join_server(server_id).await).await
    }

    async fn join_with_invite(&self, invite_code: &str) -> ClientResult<ServerSummary> {
        self.guard(self.api.join_by_invite(invite_code).await).await
    }

    async fn delete_server(&self, server_id: ServerId) -> ClientResult<()> {
        self.guard(self.api.delete_server(server_id).await).await?;
        let mut guard = self.inner.lock().await;
        if guard.selected_server == Some(server_id) {
            guard.selected_server = None;
            guard.reconciler.reset();
        }
        Ok(())
    }

    async fn list_channels(&self, server_id: ServerId) -> ClientResult<Vec<ChannelSummary>> {
        self.guard(self.api.list_channels(server_id).await).await
    }

    async fn create_channel(
        &self,
        server_id: ServerId,
        name: &str,
    ) -> ClientResult<ChannelSummary> {
        self.guard(self.api.create_channel(server_id, name).await).await
    }

    async fn select_server(&self, server_id: ServerId) -> ClientResult<Vec<ChannelSummary>> {
        let channels = self.list_channels(server_id).await?;
        self.inner.lock().await.selected_server = Some(server_id);
        if let Some(first) = channels.first() {
            self.select_channel(first.channel_id).await?;
        }
        Ok(channels)
    }

    async fn select_channel(&self, channel_id: ChannelId) -> ClientResult<()> {
        let reload = {
            let mut guard = self.inner.lock().await;
            if guard.user.is_none() {
                return Err(ClientError::NotLoggedIn);
            }
            let ticket = guard.reconciler.begin_load(channel_id);
            match (&guard.reloads, guard.session_state) {
                (Some(reloads), SessionState::Active) => Some((ticket, reloads.clone())),
                _ => None,
            }
        };
        self.emit(ClientEvent::ViewStale { channel_id });
        match reload {
            Some((ticket, reloads)) => self.spawn_reload(ticket, reloads),
            None => {
                info!(channel_id = channel_id.0, "channel switch while not active; restarting live session");
                self.start_driver().await;
            }
        }
        Ok(())
    }

    async fn fetch_messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
        before: Option<ChannelSeq>,
    ) -> ClientResult<Vec<MessagePayload>> {
        self.guard(self.api.list_messages(channel_id, Some(limit), before).await)
            .await
    }

    async fn send_message(&self, content: &str) -> ClientResult<MessagePayload> {
        let channel_id = self
            .inner
            .lock()
            .await
            .reconciler
            .selected_channel()
            .ok_or(ClientError::NoChannelSelected)?;
        let message = self
            .guard(self.api.send_message(channel_id, content).await)
            .await?;
        let outcome = self
            .inner
            .lock()
            .await
            .reconciler
            .apply_own_message(message.clone());
        if let ApplyOutcome::Appended(messages) = outcome {
            self.emit_appended(messages);
        }
        Ok(message)
    }

    async fn view(&self) -> Option<ViewState> {
        self.inner.lock().await.reconciler.view().cloned()
    }

    async fn session_state(&self) -> SessionState {
        self.inner.lock().await.session_state
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
