//! Delivery Engine
//!
//! Fans a published message out to the subscribers matched by the
//! [`SubscriptionStore`]. Live subscribers get the message written to their
//! connection at `min(published QoS, granted QoS)`; subscribers without a
//! live connection get it queued in their stored session. Retained
//! messages are kept in the [`RetainedStore`] and replayed to new
//! subscriptions.

mod retained;

pub use retained::RetainedStore;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::connection::{ActivityCounter, Connection, ConnectionTable, Delivery, SendError};
use crate::message::Message;
use crate::protocol::QoS;
use crate::session::SessionStore;
use crate::topic::SubscriptionStore;


/// Result of one fan-out
#[derive(Debug, Default)]
pub struct FanOut {
    /// Handed to a live connection
    pub delivered: usize,
    /// QoS 0 copies discarded at a backed-up writer
    pub dropped: usize,
    /// Queued in an offline session
    pub queued: usize,
    /// Live connections whose transport failed during the fan-out
    pub faulted: Vec<Arc<Connection>>,
}

impl FanOut {
    pub fn matched(&self) -> usize {
        self.delivered + self.queued + self.dropped
    }
}

pub struct DeliveryEngine {
    subscriptions: Arc<SubscriptionStore>,
    sessions: Arc<SessionStore>,
    retained: Arc<RetainedStore>,
    connections: Arc<ConnectionTable>,
    activity: ActivityCounter,
}

impl DeliveryEngine {
    pub fn new(
        subscriptions: Arc<SubscriptionStore>,
        sessions: Arc<SessionStore>,
        retained: Arc<RetainedStore>,
        connections: Arc<ConnectionTable>,
    ) -> Self {
        Self {
            subscriptions,
            sessions,
            retained,
            connections,
            activity: ActivityCounter::new(),
        }
    }

    pub fn retained(&self) -> &Arc<RetainedStore> {
        &self.retained
    }

    /// Route one message to every matching subscriber.
    ///
    /// The retained store is updated first, whether or not anyone matches.
    /// Writes never wait on a subscriber: a backed-up one gets QoS 0 copies
    /// dropped and QoS 1/2 copies parked. A failing subscriber never aborts
    /// the fan-out; it is reported in [`FanOut::faulted`] for the caller to
    /// close.
    pub async fn publish(&self, message: Message) -> FanOut {
        let _active = self.activity.enter();
        let mut fan_out = FanOut::default();

        if message.retain {
            self.retained.update(&message);
        }

        let matches = self.subscriptions.matches(&message.topic);
        trace!(topic = %message.topic, subscribers = matches.len(), "Fan-out");

        for sub in matches {
            let outgoing = message.for_delivery(message.qos.min(sub.qos), false);

            let Some(conn) = self.connections.live(&sub.client_id) else {
                if self.sessions.enqueue(&sub.client_id, outgoing) {
                    fan_out.queued += 1;
                }
                continue;
            };

            match conn.deliver(outgoing.clone()) {
                Ok(Delivery::Dropped) => fan_out.dropped += 1,
                Ok(_) => fan_out.delivered += 1,
                Err(SendError::Closed) => {
                    // closing persistent sessions were already saved
                    if self.sessions.enqueue(&sub.client_id, outgoing) {
                        fan_out.queued += 1;
                    }
                }
                Err(e) => {
                    warn!(client_id = %sub.client_id, "Delivery failed: {}", e);
                    fan_out.faulted.push(conn);
                }
            }
        }

        fan_out
    }

    /// Replay retained messages matching a just-granted filter to one
    /// client, at `min(retained QoS, granted)` with the retain flag set.
    pub async fn publish_retained(
        &self,
        filter: &str,
        client_id: &str,
        granted: QoS,
    ) -> Result<usize, SendError> {
        let _active = self.activity.enter();
        let Some(conn) = self.connections.live(client_id) else {
            return Ok(0);
        };

        let retained = self.retained.matching(filter);
        for message in &retained {
            conn.deliver(message.for_delivery(message.qos.min(granted), true))?;
        }
        if !retained.is_empty() {
            debug!(client_id = %client_id, filter = %filter, count = retained.len(), "Sent retained messages");
        }
        Ok(retained.len())
    }

    /// Resume a persistent session on its new live connection: unfinished
    /// exchanges first, then queued messages in enqueue order, whether they
    /// were queued in the store or parked on the connection.
    pub async fn publish_session(&self, client_id: &str) -> Result<usize, SendError> {
        let _active = self.activity.enter();
        let Some(conn) = self.connections.live(client_id) else {
            return Ok(0);
        };

        // messages that reached the store while the connection was binding
        // are older than anything parked on it
        let pending = self.sessions.take_outgoing(client_id);
        let written = match conn.resume(pending.clone()) {
            Ok(written) => written,
            Err(SendError::Closed) => {
                // closed before folding anything in; keep them for the next session
                self.sessions.requeue_front(client_id, pending);
                return Err(SendError::Closed);
            }
            // folded in, so the close snapshot carries them
            Err(e) => return Err(e),
        };

        debug!(client_id = %client_id, written, "Session resumed");
        Ok(written)
    }

    /// True when no publish operation is writing to any connection
    pub fn is_quiescent(&self) -> bool {
        self.activity.is_idle()
    }

    /// Wait, bounded, until [`Self::is_quiescent`]
    pub async fn wait_quiescent(&self, timeout: Duration) -> bool {
        self.activity.wait_idle(timeout).await
    }
}
