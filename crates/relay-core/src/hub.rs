//! Broadcast hub: the live set of connected subscribers.

use crate::message::{ConnectionId, ServerEvent};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub type Subscriber = mpsc::UnboundedSender<ServerEvent>;

/// Subscribers keyed by connection id.
///
/// A broadcast holds the read lock for the whole delivery pass, so a join
/// racing with it either lands before (and receives the event) or after (and
/// does not). Sends on unbounded channels never block, which keeps that pass
/// short.
#[derive(Default)]
pub struct BroadcastHub {
    subscribers: RwLock<HashMap<ConnectionId, Subscriber>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Joining twice with the same id keeps the first
    /// registration; returns whether this call added it.
    pub fn join(&self, id: ConnectionId, sender: Subscriber) -> bool {
        let mut subs = self.subscribers.write();
        if subs.contains_key(&id) {
            return false;
        }
        info!(connection_id = %id, "subscriber joined");
        subs.insert(id, sender);
        true
    }

    /// Deregister. Unknown ids are ignored.
    pub fn leave(&self, id: &ConnectionId) -> bool {
        let removed = self.subscribers.write().remove(id).is_some();
        if removed {
            info!(connection_id = %id, "subscriber left");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.subscribers.read().contains_key(id)
    }

    /// Deliver `payload` to every subscriber. A failed delivery does not stop
    /// the others; the stale subscriber is removed afterwards. Returns the
    /// number of successful deliveries.
    pub fn broadcast_all(&self, payload: &str) -> usize {
        let event = ServerEvent::ChatMessage(payload.to_string());
        let mut stale = Vec::new();
        let delivered = {
            let subs = self.subscribers.read();
            let mut delivered = 0;
            for (id, tx) in subs.iter() {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    stale.push(id.clone());
                }
            }
            delivered
        };

        if !stale.is_empty() {
            let mut subs = self.subscribers.write();
            for id in &stale {
                subs.remove(id);
                debug!(connection_id = %id, "dropped stale subscriber");
            }
        }
        delivered
    }

    /// Deliver an event to one connection only.
    pub fn send_to(&self, id: &ConnectionId, event: ServerEvent) -> bool {
        let sent = match self.subscribers.read().get(id) {
            Some(tx) => tx.send(event).is_ok(),
            None => return false,
        };
        if !sent {
            self.leave(id);
        }
        sent
    }

    /// Drop every subscriber channel. Writers see their receiver close and
    /// shut the socket.
    pub fn close_all(&self) -> usize {
        let mut subs = self.subscribers.write();
        let n = subs.len();
        subs.clear();
        n
    }
}
