//! MQTT Session Management
//!
//! A [`Session`] is the per-client-id state that outlives a single
//! connection when the client connects with clean session = false:
//! its subscriptions, messages queued while it was offline, and the
//! QoS 1/2 exchanges that were still in progress.

mod store;

pub use store::SessionStore;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::message::Message;
use crate::protocol::QoS;
use crate::topic::Subscription;

#[cfg(test)]
mod tests;

/// Delivery state of one outgoing QoS 1/2 message.
///
/// QoS 1: `Pending -> Sent -> (PUBACK) removed`.
/// QoS 2: `Pending -> Sent -> Received -> Released -> (PUBCOMP) removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Handed to the connection, not yet written
    Pending,
    /// PUBLISH written, waiting for PUBACK / PUBREC
    Sent,
    /// PUBREC received, PUBREL not yet written
    Received,
    /// PUBREL written, waiting for PUBCOMP
    Released,
}

impl DeliveryState {
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryState::Pending => 0,
            DeliveryState::Sent => 1,
            DeliveryState::Received => 2,
            DeliveryState::Released => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DeliveryState::Pending),
            1 => Some(DeliveryState::Sent),
            2 => Some(DeliveryState::Received),
            3 => Some(DeliveryState::Released),
            _ => None,
        }
    }

    /// Whether the next packet to (re)send for this entry is PUBREL
    pub fn awaiting_pubcomp(self) -> bool {
        matches!(self, DeliveryState::Received | DeliveryState::Released)
    }
}

/// Tracks one in-progress QoS 1/2 delivery to one subscriber
#[derive(Debug, Clone)]
pub struct InflightEntry {
    /// Packet identifier
    pub packet_id: u16,
    /// Receiving client
    pub client_id: Arc<str>,
    /// Message as delivered (QoS already downgraded)
    pub message: Message,
    /// Handshake state
    pub state: DeliveryState,
    /// Last (re)transmission
    pub sent_at: Instant,
    /// Number of retransmissions
    pub retries: u32,
    /// Insertion order, used to replay in the original order
    seq: u64,
}

/// Client session
#[derive(Debug, Clone)]
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Subscriptions captured when the session was saved
    pub subscriptions: Vec<Subscription>,
    /// Messages waiting for delivery, in enqueue order
    pub outgoing: VecDeque<Message>,
    /// Outgoing QoS 1/2 exchanges keyed by packet id
    pub inflight: HashMap<u16, InflightEntry>,
    /// Incoming QoS 2 messages waiting for PUBREL
    pub incoming: HashMap<u16, Message>,
    next_packet_id: u16,
    next_seq: u64,
}

impl Session {
    pub fn new(client_id: Arc<str>) -> Self {
        Self {
            client_id,
            subscriptions: Vec::new(),
            outgoing: VecDeque::new(),
            inflight: HashMap::new(),
            incoming: HashMap::new(),
            next_packet_id: 1,
            next_seq: 0,
        }
    }

    /// Get next available packet identifier
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.inflight.contains_key(&id) {
                return id;
            }
        }
    }

    /// Queue a message for later delivery.
    ///
    /// With a non-zero `max`, the oldest message is dropped when the queue
    /// is full; returns false in that case.
    pub fn queue_message(&mut self, message: Message, max: usize) -> bool {
        let mut kept_all = true;
        if max > 0 && self.outgoing.len() >= max {
            self.outgoing.pop_front();
            kept_all = false;
        }
        self.outgoing.push_back(message);
        kept_all
    }

    /// Get and remove queued messages
    pub fn take_outgoing(&mut self) -> VecDeque<Message> {
        std::mem::take(&mut self.outgoing)
    }

    /// Start tracking an outgoing QoS 1/2 message; returns its packet id
    pub fn track(&mut self, message: Message) -> u16 {
        let packet_id = self.next_packet_id();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.inflight.insert(
            packet_id,
            InflightEntry {
                packet_id,
                client_id: self.client_id.clone(),
                message,
                state: DeliveryState::Pending,
                sent_at: Instant::now(),
                retries: 0,
                seq,
            },
        );
        packet_id
    }

    /// Record a successful write of the entry's current packet
    pub fn mark_sent(&mut self, packet_id: u16) {
        if let Some(entry) = self.inflight.get_mut(&packet_id) {
            entry.state = match entry.state {
                DeliveryState::Pending => DeliveryState::Sent,
                DeliveryState::Received => DeliveryState::Released,
                other => other,
            };
            entry.sent_at = Instant::now();
        }
    }

    /// PUBACK: completes a QoS 1 delivery
    pub fn acknowledge(&mut self, packet_id: u16) -> Option<InflightEntry> {
        match self.inflight.get(&packet_id) {
            Some(entry) if entry.message.qos == QoS::AtLeastOnce => {
                self.inflight.remove(&packet_id)
            }
            _ => None,
        }
    }

    /// PUBREC: moves a QoS 2 delivery to `Received`.
    ///
    /// Returns false if no QoS 2 exchange is known for the id.
    pub fn receive(&mut self, packet_id: u16) -> bool {
        match self.inflight.get_mut(&packet_id) {
            Some(entry) if entry.message.qos == QoS::ExactlyOnce => {
                if !entry.state.awaiting_pubcomp() {
                    entry.state = DeliveryState::Received;
                }
                true
            }
            _ => false,
        }
    }

    /// PUBCOMP: completes a QoS 2 delivery
    pub fn complete(&mut self, packet_id: u16) -> Option<InflightEntry> {
        match self.inflight.get(&packet_id) {
            Some(entry) if entry.state.awaiting_pubcomp() => self.inflight.remove(&packet_id),
            _ => None,
        }
    }

    /// Inflight entries in the order they were first handed out
    pub fn inflight_in_order(&self) -> Vec<InflightEntry> {
        let mut entries: Vec<_> = self.inflight.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Entries not acknowledged within `interval`; bumps their retry count
    pub fn due_for_retry(&mut self, interval: Duration) -> Vec<InflightEntry> {
        let now = Instant::now();
        let mut due: Vec<InflightEntry> = self
            .inflight
            .values_mut()
            .filter(|e| now.duration_since(e.sent_at) >= interval)
            .map(|e| {
                e.retries += 1;
                e.sent_at = now;
                e.clone()
            })
            .collect();
        due.sort_by_key(|e| e.seq);
        due
    }

    /// Store an incoming QoS 2 message; returns false if the id was already held
    pub fn store_incoming(&mut self, packet_id: u16, message: Message) -> bool {
        if self.incoming.contains_key(&packet_id) {
            return false;
        }
        self.incoming.insert(packet_id, message);
        true
    }

    /// PUBREL from the publisher: releases the stored incoming message
    pub fn release_incoming(&mut self, packet_id: u16) -> Option<Message> {
        self.incoming.remove(&packet_id)
    }

    /// Fold a previously stored session into this one.
    ///
    /// Stored queued messages go ahead of anything queued here, and stored
    /// inflight entries keep their packet ids and states.
    pub fn adopt(&mut self, stored: Session) {
        let restored = stored.inflight_in_order();
        let parked = std::mem::take(&mut self.outgoing);
        self.outgoing = stored.outgoing;
        self.outgoing.extend(parked);

        let base = self.next_seq;
        self.next_seq = base + restored.len() as u64;
        for (i, mut entry) in restored.into_iter().enumerate() {
            entry.seq = base + i as u64;
            entry.client_id = self.client_id.clone();
            self.inflight.insert(entry.packet_id, entry);
        }
        self.incoming.extend(stored.incoming);
        self.next_packet_id = self.next_packet_id.max(stored.next_packet_id);
        self.subscriptions = stored.subscriptions;
    }

    /// Rebuild an inflight entry from storage
    pub(crate) fn restore_inflight(
        &mut self,
        packet_id: u16,
        message: Message,
        state: DeliveryState,
        retries: u32,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.inflight.insert(
            packet_id,
            InflightEntry {
                packet_id,
                client_id: self.client_id.clone(),
                message,
                state,
                sent_at: Instant::now(),
                retries,
                seq,
            },
        );
    }

    pub(crate) fn peek_next_packet_id(&self) -> u16 {
        self.next_packet_id
    }

    pub(crate) fn set_next_packet_id(&mut self, id: u16) {
        self.next_packet_id = if id == 0 { 1 } else { id };
    }
}
