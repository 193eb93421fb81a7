//! Connection Registry: at most one live transport per user.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use shared::{
    domain::UserId,
    protocol::{close_code, ServerEvent},
    session::DisconnectReason,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Why the registry asked a connection task to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Superseded,
    SlowConsumer,
}

impl CloseReason {
    pub fn close_code(self) -> u16 {
        match self {
            Self::Superseded => close_code::SUPERSEDED,
            Self::SlowConsumer => close_code::SLOW_CONSUMER,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Superseded => "superseded",
            Self::SlowConsumer => "slow consumer",
        }
    }
}

impl From<CloseReason> for DisconnectReason {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Superseded => DisconnectReason::Superseded,
            CloseReason::SlowConsumer => DisconnectReason::SlowConsumer,
        }
    }
}

/// Registry-side half of a connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    outbound: mpsc::Sender<ServerEvent>,
    closer: oneshot::Sender<CloseReason>,
}

/// Task-side half of a connection: the outbound queue and the close signal.
#[derive(Debug)]
pub struct ConnectionPeer {
    pub outbound: mpsc::Receiver<ServerEvent>,
    pub close: oneshot::Receiver<CloseReason>,
}

/// Cloneable enqueue endpoint returned by [`ConnectionRegistry::lookup`].
#[derive(Debug, Clone)]
pub struct OutboundSender {
    pub id: ConnectionId,
    sender: mpsc::Sender<ServerEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    Full,
    Closed,
}

impl OutboundSender {
    /// Non-blocking enqueue.
    pub fn try_enqueue(&self, event: ServerEvent) -> Result<(), EnqueueError> {
        self.sender.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<UserId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the channels for a new connection. Nothing is registered
    /// until [`register`](Self::register) is called with the handle.
    pub fn open(
        &self,
        user_id: UserId,
        queue_capacity: usize,
    ) -> (ConnectionHandle, ConnectionPeer) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let (close_tx, close_rx) = oneshot::channel();
        (
            ConnectionHandle {
                id,
                user_id,
                outbound: outbound_tx,
                closer: close_tx,
            },
            ConnectionPeer {
                outbound: outbound_rx,
                close: close_rx,
            },
        )
    }

    /// Installs `handle` as the user's live connection. A previous connection
    /// is told to close as superseded and its id is returned.
    pub async fn register(&self, handle: ConnectionHandle) -> Option<ConnectionId> {
        let user_id = handle.user_id;
        let new_id = handle.id;
        let previous = {
            let mut connections = self.connections.lock().await;
            connections.insert(user_id, handle)
        };

        let superseded = previous.map(|old| {
            let old_id = old.id;
            let _ = old.closer.send(CloseReason::Superseded);
            old_id
        });
        match superseded {
            Some(old_id) => info!(
                user_id = user_id.0,
                old_connection = old_id.0,
                new_connection = new_id.0,
                "connection superseded"
            ),
            None => debug!(
                user_id = user_id.0,
                connection = new_id.0,
                "connection registered"
            ),
        }
        superseded
    }

    /// Removes the user's connection only if it is still `connection_id`.
    pub async fn unregister(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let mut connections = self.connections.lock().await;
        if !is_current(&connections, user_id, connection_id) {
            return false;
        }
        connections.remove(&user_id);
        debug!(
            user_id = user_id.0,
            connection = connection_id.0,
            "connection unregistered"
        );
        true
    }

    pub async fn lookup(&self, user_id: UserId) -> Option<OutboundSender> {
        let connections = self.connections.lock().await;
        connections.get(&user_id).map(|handle| OutboundSender {
            id: handle.id,
            sender: handle.outbound.clone(),
        })
    }

    /// Removes the connection and signals its task to close with `reason`.
    pub async fn evict(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        reason: CloseReason,
    ) -> bool {
        let removed = {
            let mut connections = self.connections.lock().await;
            if is_current(&connections, user_id, connection_id) {
                connections.remove(&user_id)
            } else {
                None
            }
        };
        let Some(handle) = removed else {
            return false;
        };
        info!(
            user_id = user_id.0,
            connection = connection_id.0,
            reason = reason.as_str(),
            "evicting connection"
        );
        let _ = handle.closer.send(reason);
        true
    }

    pub async fn connected_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

fn is_current(
    connections: &HashMap<UserId, ConnectionHandle>,
    user_id: UserId,
    connection_id: ConnectionId,
) -> bool {
    connections
        .get(&user_id)
        .is_some_and(|handle| handle.id == connection_id)
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
