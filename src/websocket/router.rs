//! Topic bindings and dispatch of decoded table frames.
//!
//! Bindings are keyed by channel (`spot/depth`), never by filter: one callback per
//! channel. Unsubscribing leaves the entry in place with no callback so a quick
//! resubscribe does not churn the map. Callbacks always run after the map lock
//! has been released.

use crate::websocket::book::DepthUpdate;
use crate::websocket::codec::{channel_of, ChannelEvent, ErrorEvent, EventKind, SubscriptionTopic, TableFrame};
use log::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Receives every table payload for one channel.
pub type TableCallback = Arc<dyn Fn(TableMessage) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthAction {
    Partial,
    Update,
    /// At least one instrument in the frame failed to apply; its book was
    /// discarded and will reappear with the next snapshot.
    Corrupt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthFrame {
    pub table: String,
    pub action: DepthAction,
    pub data: Vec<DepthUpdate>,
    /// Instruments whose book was discarded while applying this frame.
    pub corrupted: Vec<String>,
}

/// Payload delivered to a channel's callback.
#[derive(Debug, Clone, PartialEq)]
pub enum TableMessage {
    /// A depth table maintained by the order book engine.
    Depth(DepthFrame),
    /// Any other table, passed through undecoded.
    Data(TableFrame),
}

impl TableMessage {
    pub fn table(&self) -> &str {
        match self {
            TableMessage::Depth(frame) => &frame.table,
            TableMessage::Data(frame) => &frame.table,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, TableMessage::Depth(frame) if frame.action == DepthAction::Corrupt)
    }
}

#[derive(Default)]
struct Binding {
    callback: Option<TableCallback>,
    confirmed: bool,
    topics: BTreeSet<SubscriptionTopic>,
}

#[derive(Default)]
pub struct SubscriptionRouter {
    bindings: Mutex<HashMap<String, Binding>>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Binding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `callback` for the channel of every topic. A channel that was
    /// already bound keeps its earlier topics but gets the new callback, and is
    /// unconfirmed until the exchange acknowledges again.
    pub fn bind(&self, topics: &[SubscriptionTopic], callback: TableCallback) {
        let mut bindings = self.lock();
        for topic in topics {
            let binding = bindings.entry(topic.channel.clone()).or_default();
            binding.callback = Some(Arc::clone(&callback));
            binding.confirmed = false;
            binding.topics.insert(topic.clone());
        }
    }

    /// Clears the channel's callback and topics. The confirmation flag is left
    /// for the unsubscribe acknowledgement to reset. Returns whether a callback
    /// was bound.
    pub fn unbind(&self, topic: &SubscriptionTopic) -> bool {
        let mut bindings = self.lock();
        match bindings.get_mut(&topic.channel) {
            Some(binding) => {
                binding.topics.clear();
                binding.callback.take().is_some()
            }
            None => false,
        }
    }

    /// Bookkeeping for subscribe/unsubscribe acknowledgements. No callback runs.
    pub fn handle_event(&self, event: &ChannelEvent) {
        let Some(channel) = event.channel.as_deref().map(channel_of) else {
            return;
        };
        let confirmed = match event.event {
            EventKind::Subscribe => true,
            EventKind::Unsubscribe => false,
            EventKind::Login => return,
        };
        let mut bindings = self.lock();
        match bindings.get_mut(channel) {
            Some(binding) => binding.confirmed = confirmed,
            None => debug!("Acknowledgement for unknown channel {}", channel),
        }
    }

    /// Errors naming a channel mark it unconfirmed.
    pub fn handle_error(&self, error: &ErrorEvent) {
        if let Some(channel) = error.channel.as_deref().map(channel_of) {
            if let Some(binding) = self.lock().get_mut(channel) {
                binding.confirmed = false;
            }
        }
    }

    /// Invokes the callback bound to the message's table. Unbound tables are
    /// dropped silently. Returns whether a callback ran.
    pub fn dispatch(&self, message: TableMessage) -> bool {
        let callback = self
            .lock()
            .get(message.table())
            .and_then(|binding| binding.callback.clone());
        match callback {
            Some(callback) => {
                callback(message);
                true
            }
            None => {
                trace!("No callback bound for table {}, dropping frame", message.table());
                false
            }
        }
    }

    pub fn is_confirmed(&self, channel: &str) -> bool {
        self.lock()
            .get(channel_of(channel))
            .map(|binding| binding.confirmed)
            .unwrap_or(false)
    }

    pub fn is_bound(&self, channel: &str) -> bool {
        self.lock()
            .get(channel_of(channel))
            .map(|binding| binding.callback.is_some())
            .unwrap_or(false)
    }

    /// Topics of every channel that still has a callback, for resubscription.
    pub fn active_topics(&self) -> Vec<SubscriptionTopic> {
        let bindings = self.lock();
        let mut topics: Vec<SubscriptionTopic> = bindings
            .values()
            .filter(|binding| binding.callback.is_some())
            .flat_map(|binding| binding.topics.iter().cloned())
            .collect();
        topics.sort();
        topics
    }

    /// A new connection starts with nothing acknowledged.
    pub fn reset_confirmations(&self) {
        for binding in self.lock().values_mut() {
            binding.confirmed = false;
        }
    }
}
