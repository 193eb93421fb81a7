//! Folds a bounded history snapshot and the live event stream into one
//! ordered, duplicate-free message sequence for the selected channel.
//!
//! Messages are ordered by their per-channel `seq`. The watermark is the
//! highest `seq` known to be contiguous with the loaded history; the next
//! acceptable live message is always `watermark + 1` (or `1` for an empty
//! channel). Anything further ahead is a gap and forces a reload.

use std::collections::BTreeMap;

use shared::{
    domain::{ChannelId, ChannelSeq},
    protocol::{MessagePayload, ServerEvent},
};

/// Identifies one history load. Results for any other ticket are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    pub channel_id: ChannelId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewState {
    pub channel_id: ChannelId,
    /// Chronological, strictly increasing by `seq`.
    pub messages: Vec<MessagePayload>,
    pub watermark: Option<ChannelSeq>,
}

impl ViewState {
    fn next_seq(&self) -> ChannelSeq {
        self.watermark.map_or(1, |w| w + 1)
    }

    fn push(&mut self, message: MessagePayload) {
        self.watermark = Some(message.seq);
        self.messages.push(message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Messages appended to the view, in order.
    Appended(Vec<MessagePayload>),
    Duplicate,
    /// Kept until the pending history load completes.
    Buffered,
    /// Own message ahead of the watermark, kept until the gap fills.
    Held,
    /// Not for the selected channel, or not a message event.
    Ignored,
    /// A gap was detected; the view needs the history load for this ticket.
    Stale(LoadTicket),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Ready(ViewState),
    Stale(LoadTicket),
    /// The ticket is no longer current.
    Ignored,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Loading {
        ticket: LoadTicket,
        buffered: BTreeMap<ChannelSeq, MessagePayload>,
    },
    Ready(ViewState),
}

#[derive(Debug)]
pub struct ViewReconciler {
    phase: Phase,
    generation: u64,
    held: BTreeMap<ChannelSeq, MessagePayload>,
}

impl Default for ViewReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewReconciler {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            generation: 0,
            held: BTreeMap::new(),
        }
    }

    pub fn selected_channel(&self) -> Option<ChannelId> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Loading { ticket, .. } => Some(ticket.channel_id),
            Phase::Ready(view) => Some(view.channel_id),
        }
    }

    pub fn view(&self) -> Option<&ViewState> {
        match &self.phase {
            Phase::Ready(view) => Some(view),
            _ => None,
        }
    }

    pub fn pending_load(&self) -> Option<LoadTicket> {
        match &self.phase {
            Phase::Loading { ticket, .. } => Some(*ticket),
            _ => None,
        }
    }

    /// Discards the current view and starts loading `channel_id`.
    pub fn begin_load(&mut self, channel_id: ChannelId) -> LoadTicket {
        self.held.clear();
        self.restart(channel_id, BTreeMap::new())
    }

    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.held.clear();
    }

    /// Installs a newest-first history page for `ticket`, then replays
    /// whatever arrived while it was in flight.
    pub fn complete_load(
        &mut self,
        ticket: LoadTicket,
        newest_first: Vec<MessagePayload>,
    ) -> LoadOutcome {
        let buffered = match &mut self.phase {
            Phase::Loading {
                ticket: current,
                buffered,
            } if *current == ticket => std::mem::take(buffered),
            _ => return LoadOutcome::Ignored,
        };

        let mut history: Vec<MessagePayload> = newest_first
            .into_iter()
            .filter(|m| m.channel_id == ticket.channel_id)
            .collect();
        history.sort_by_key(|m| m.seq);
        history.dedup_by_key(|m| m.seq);

        let mut view = ViewState {
            channel_id: ticket.channel_id,
            watermark: history.last().map(|m| m.seq),
            messages: history,
        };

        let mut pending = buffered;
        pending.append(&mut self.held);
        for (seq, message) in pending {
            if view.watermark.is_some_and(|w| seq <= w) {
                continue;
            }
            if seq == view.next_seq() {
                view.push(message);
            } else {
                self.held.insert(seq, message);
            }
        }

        if let Some((&first_seq, _)) = self.held.iter().next() {
            if first_seq != view.next_seq() {
                let carry = std::mem::take(&mut self.held);
                return LoadOutcome::Stale(self.restart(ticket.channel_id, carry));
            }
        }

        self.phase = Phase::Ready(view.clone());
        LoadOutcome::Ready(view)
    }

    pub fn apply_live_event(&mut self, event: &ServerEvent) -> ApplyOutcome {
        let ServerEvent::NewMessage { message } = event else {
            return ApplyOutcome::Ignored;
        };
        self.apply(message.clone(), false)
    }

    /// Merges the server's response to our own send. Unlike a live event, an
    /// own message ahead of the watermark is held rather than treated as a
    /// gap: the live transport delivers everything before it first.
    pub fn apply_own_message(&mut self, message: MessagePayload) -> ApplyOutcome {
        self.apply(message, true)
    }

    fn apply(&mut self, message: MessagePayload, own: bool) -> ApplyOutcome {
        if self.selected_channel() != Some(message.channel_id) {
            return ApplyOutcome::Ignored;
        }

        match &mut self.phase {
            Phase::Idle => ApplyOutcome::Ignored,
            Phase::Loading { buffered, .. } => {
                if buffered.contains_key(&message.seq) {
                    ApplyOutcome::Duplicate
                } else {
                    buffered.insert(message.seq, message);
                    ApplyOutcome::Buffered
                }
            }
            Phase::Ready(view) => {
                let expected = view.next_seq();
                if message.seq < expected {
                    return ApplyOutcome::Duplicate;
                }
                if message.seq == expected {
                    let mut appended = vec![message.clone()];
                    view.push(message);
                    while let Some(next) = self.held.remove(&view.next_seq()) {
                        appended.push(next.clone());
                        view.push(next);
                    }
                    return ApplyOutcome::Appended(appended);
                }
                if own {
                    if self.held.contains_key(&message.seq) {
                        return ApplyOutcome::Duplicate;
                    }
                    self.held.insert(message.seq, message);
                    return ApplyOutcome::Held;
                }

                let channel_id = view.channel_id;
                let mut carry = std::mem::take(&mut self.held);
                carry.insert(message.seq, message);
                ApplyOutcome::Stale(self.restart(channel_id, carry))
            }
        }
    }

    fn restart(
        &mut self,
        channel_id: ChannelId,
        buffered: BTreeMap<ChannelSeq, MessagePayload>,
    ) -> LoadTicket {
        self.generation += 1;
        let ticket = LoadTicket {
            channel_id,
            generation: self.generation,
        };
        self.phase = Phase::Loading { ticket, buffered };
        ticket
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
