//! Broadcast Engine: fans a newly appended message out to every live member
//! of the message's server.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use async_trait::async_trait;
use shared::{
    domain::{ChannelId, ServerId, UserId},
    protocol::{MessagePayload, ServerEvent},
};
use storage::Storage;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::registry::{CloseReason, ConnectionRegistry, EnqueueError};

#[async_trait]
pub trait MembershipIndex: Send + Sync {
    async fn member_ids(&self, server_id: ServerId) -> anyhow::Result<Vec<UserId>>;
}

#[async_trait]
impl MembershipIndex for Storage {
    async fn member_ids(&self, server_id: ServerId) -> anyhow::Result<Vec<UserId>> {
        Storage::member_ids(self, server_id).await
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub offline: usize,
    pub evicted: usize,
}

type WriterLocks = Arc<StdMutex<HashMap<ChannelId, Arc<Mutex<()>>>>>;

/// Exclusive append + fan-out right for one channel. The channel's entry is
/// dropped from the lock table once no writer holds or awaits it.
pub struct ChannelWriter {
    channel_id: ChannelId,
    writers: WriterLocks,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the table, one in our guard.
        if writers
            .get(&self.channel_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 2)
        {
            writers.remove(&self.channel_id);
        }
    }
}

pub struct BroadcastEngine {
    registry: Arc<ConnectionRegistry>,
    membership: Arc<dyn MembershipIndex>,
    writers: WriterLocks,
}

impl BroadcastEngine {
    pub fn new(registry: Arc<ConnectionRegistry>, membership: Arc<dyn MembershipIndex>) -> Self {
        Self {
            registry,
            membership,
            writers: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Serializes append + fan-out for one channel. Hold the guard from
    /// before the append until [`on_message_created`](Self::on_message_created)
    /// returns so enqueue order matches append order.
    ///
    /// Take it only after the poster's membership has been checked.
    pub async fn channel_writer(&self, channel_id: ChannelId) -> ChannelWriter {
        let lock = {
            let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
            writers.entry(channel_id).or_default().clone()
        };
        ChannelWriter {
            channel_id,
            writers: Arc::clone(&self.writers),
            _guard: lock.lock_owned().await,
        }
    }

    /// Channels with a writer holding or awaiting the lock.
    pub fn active_writers(&self) -> usize {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Enqueues `new_message` for every member with a live connection,
    /// the sender included. Never blocks on a recipient and never fails: a
    /// recipient whose queue is full is disconnected instead.
    pub async fn on_message_created(&self, server_id: ServerId, message: &MessagePayload) -> FanOut {
        let mut fan_out = FanOut::default();
        let members = match self.membership.member_ids(server_id).await {
            Ok(members) => members,
            Err(error) => {
                warn!(
                    server_id = server_id.0,
                    message_id = message.message_id.0,
                    %error,
                    "membership lookup failed; message not fanned out"
                );
                return fan_out;
            }
        };

        for user_id in members {
            let Some(connection) = self.registry.lookup(user_id).await else {
                fan_out.offline += 1;
                continue;
            };
            let event = ServerEvent::NewMessage {
                message: message.clone(),
            };
            match connection.try_enqueue(event) {
                Ok(()) => fan_out.delivered += 1,
                Err(EnqueueError::Full) => {
                    warn!(
                        user_id = user_id.0,
                        channel_id = message.channel_id.0,
                        "outbound queue full; disconnecting slow consumer"
                    );
                    self.registry
                        .evict(user_id, connection.id, CloseReason::SlowConsumer)
                        .await;
                    fan_out.evicted += 1;
                }
                Err(EnqueueError::Closed) => fan_out.offline += 1,
            }
        }

        debug!(
            server_id = server_id.0,
            channel_id = message.channel_id.0,
            seq = message.seq,
            delivered = fan_out.delivered,
            offline = fan_out.offline,
            evicted = fan_out.evicted,
            "message fanned out"
        );
        fan_out
    }
}

#[cfg(test)]
#[path = "tests/broadcast_tests.rs"]
mod tests;
