//! Connection state and the transport seam
//!
//! A [`Connection`] is one accepted transport endpoint. The transport itself
//! sits behind the [`Outbound`] trait: a per-connection writer queue that the
//! broker fills without waiting, drained by the embedding transport. Every
//! write happens under the connection's session lock, so packet order on the
//! queue matches the session's view, and every write path is counted by the
//! connection's [`ActivityCounter`] so the close routine can wait for them.

mod activity;
mod table;

pub use activity::{ActivityCounter, ActivityGuard};
pub use table::ConnectionTable;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::message::Message;
use crate::protocol::{Packet, ProtocolError, ProtocolVersion, PubRel};
use crate::session::{DeliveryState, InflightEntry, Session};

#[cfg(test)]
mod tests;

/// Error when writing to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The connection is closing or closed; nothing was written
    Closed,
    /// The writer queue is full; nothing was written
    Full,
    /// The transport failed
    Transport(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed => write!(f, "connection closed"),
            SendError::Full => write!(f, "writer queue full"),
            SendError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Transport(String),
    Protocol(ProtocolError),
    Timeout,
    Closed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Transport(e) => write!(f, "Transport error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<SendError> for ConnectionError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Closed => ConnectionError::Closed,
            // a client that stops reading its own acks is treated as lost
            SendError::Full => ConnectionError::Transport("writer queue full".to_string()),
            SendError::Transport(e) => ConnectionError::Transport(e),
        }
    }
}

/// Outward half of a transport channel: the connection's writer queue.
///
/// Implementations must not wait for the peer. A backed-up writer answers
/// [`SendError::Full`] so that one slow client never stalls the task
/// publishing to it.
pub trait Outbound: Send + Sync {
    /// Queue one packet for the writer
    fn send(&self, packet: Packet) -> Result<(), SendError>;

    /// Release the transport; later sends fail with [`SendError::Closed`]
    fn close(&self);
}

/// In-memory [`Outbound`] over a bounded tokio channel.
///
/// The receiving half is the peer's writer: a dropped receiver reads as a
/// transport failure, a full channel as [`SendError::Full`].
pub struct ChannelOutbound {
    tx: Mutex<Option<mpsc::Sender<Packet>>>,
}

impl ChannelOutbound {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl Outbound for ChannelOutbound {
    fn send(&self, packet: Packet) -> Result<(), SendError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(SendError::Closed)?;
        tx.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Transport("peer dropped the channel".to_string()),
        })
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

/// Negotiated CONNECT parameters
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_id: Arc<str>,
    pub version: ProtocolVersion,
    pub clean_session: bool,
    pub keep_alive: u16,
}

/// Per-connection delivery limits
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Outgoing QoS 1/2 messages awaiting acknowledgment (0 = unlimited)
    pub max_inflight: u16,
    /// Messages parked while the inflight window is full (0 = unlimited)
    pub max_queued: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_inflight: 32,
            max_queued: 1000,
        }
    }
}

/// Outcome of handing a message to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the writer
    Sent,
    /// Held in the connection's session until it can be written
    Parked,
    /// QoS 0 message discarded because the writer queue is full
    Dropped,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One live transport endpoint
pub struct Connection {
    id: u64,
    outbound: Arc<dyn Outbound>,
    limits: ConnectionLimits,
    info: RwLock<Option<ClientInfo>>,
    will: Mutex<Option<Message>>,
    connected: AtomicBool,
    /// Only flipped while holding the session lock
    closing: AtomicBool,
    session: Mutex<Session>,
    activity: ActivityCounter,
    closed_tx: watch::Sender<bool>,
}

impl Connection {
    pub fn new(outbound: Arc<dyn Outbound>, limits: ConnectionLimits) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            outbound,
            limits,
            info: RwLock::new(None),
            will: Mutex::new(None),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            session: Mutex::new(Session::new(Arc::from(""))),
            activity: ActivityCounter::new(),
            closed_tx,
        }
    }

    /// Transport identifier, unique per process
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> Option<ClientInfo> {
        self.info.read().clone()
    }

    pub fn client_id(&self) -> Option<Arc<str>> {
        self.info.read().as_ref().map(|i| i.client_id.clone())
    }

    /// Clean session = false
    pub fn is_persistent(&self) -> bool {
        self.info
            .read()
            .as_ref()
            .map(|i| !i.clean_session)
            .unwrap_or(false)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn activity(&self) -> &ActivityCounter {
        &self.activity
    }

    /// Bind the accepted CONNECT to this connection.
    ///
    /// A resumed session is folded into the live one: its queued messages
    /// become parked here and its inflight entries keep their ids.
    pub fn attach(&self, info: ClientInfo, will: Option<Message>, resumed: Option<Session>) {
        {
            let mut session = self.session.lock();
            session.client_id = info.client_id.clone();
            if let Some(stored) = resumed {
                session.adopt(stored);
            }
        }
        *self.will.lock() = will;
        *self.info.write() = Some(info);
    }

    /// CONNACK accepted went out; deliveries may now be written
    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub fn take_will(&self) -> Option<Message> {
        self.will.lock().take()
    }

    /// Flip the connection into closing.
    ///
    /// Returns false if another caller already did. For a persistent
    /// session, `on_snapshot` receives the session state (parked messages
    /// moved out) while no delivery can interleave; every delivery after
    /// this point fails with [`SendError::Closed`].
    pub fn begin_close<F>(&self, on_snapshot: F) -> bool
    where
        F: FnOnce(Session),
    {
        let mut session = self.session.lock();
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.is_persistent() {
            let mut snapshot = session.clone();
            snapshot.outgoing = session.take_outgoing();
            on_snapshot(snapshot);
        }
        true
    }

    /// Signal that the close routine finished
    pub fn mark_closed(&self) {
        self.closed_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Watch that flips to true once the connection is closed
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.closed();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn close_transport(&self) {
        self.outbound.close();
    }

    /// Queue a control packet (CONNACK, SUBACK, ...)
    pub fn send_packet(&self, packet: Packet) -> Result<(), SendError> {
        let _active = self.activity.enter();
        let _session = self.session.lock();
        trace!(conn = self.id, packet = packet.name(), "Sending packet");
        self.outbound.send(packet)
    }

    /// Hand one message to this connection.
    ///
    /// QoS 1/2 messages get a packet id and an inflight entry. Messages are
    /// parked instead of written while the connection is not yet connected,
    /// while the inflight window is full, while earlier messages are still
    /// parked, or (QoS 1/2) while the writer queue is full. A QoS 0 message
    /// that meets a full writer queue is dropped.
    pub fn deliver(&self, message: Message) -> Result<Delivery, SendError> {
        let _active = self.activity.enter();
        let mut session = self.session.lock();
        if self.is_closing() {
            return Err(SendError::Closed);
        }

        let must_park = !self.is_connected()
            || !session.outgoing.is_empty()
            || (message.qos.is_acknowledged() && self.window_full(&session));
        if must_park {
            if !session.queue_message(message, self.limits.max_queued) {
                warn!(
                    client_id = %session.client_id,
                    max = self.limits.max_queued,
                    "Parked queue full, dropped oldest message"
                );
            }
            return Ok(Delivery::Parked);
        }

        let delivery = self.offer(&mut session, message)?;
        if delivery != Delivery::Sent {
            debug!(client_id = %session.client_id, outcome = ?delivery, "Writer queue full");
        }
        Ok(delivery)
    }

    /// PUBACK from the client
    pub fn on_puback(&self, packet_id: u16) -> Result<bool, SendError> {
        let _active = self.activity.enter();
        let mut session = self.session.lock();
        let known = session.acknowledge(packet_id).is_some();
        if !known {
            debug!(conn = self.id, packet_id, "PUBACK for unknown packet id");
        }
        self.drain_parked(&mut session)?;
        Ok(known)
    }

    /// PUBREC from the client; always answered with PUBREL.
    ///
    /// With the writer queue full the PUBREL is left to the retry ticker.
    pub fn on_pubrec(&self, packet_id: u16) -> Result<bool, SendError> {
        let _active = self.activity.enter();
        let mut session = self.session.lock();
        let known = session.receive(packet_id);
        match self.outbound.send(Packet::PubRel(PubRel::new(packet_id))) {
            Ok(()) if known => session.mark_sent(packet_id),
            Ok(()) | Err(SendError::Full) => {}
            Err(e) => return Err(e),
        }
        Ok(known)
    }

    /// PUBCOMP from the client
    pub fn on_pubcomp(&self, packet_id: u16) -> Result<bool, SendError> {
        let _active = self.activity.enter();
        let mut session = self.session.lock();
        let known = session.complete(packet_id).is_some();
        self.drain_parked(&mut session)?;
        Ok(known)
    }

    /// Hold an incoming QoS 2 message until PUBREL; false if already held
    pub fn store_incoming(&self, packet_id: u16, message: Message) -> bool {
        self.session.lock().store_incoming(packet_id, message)
    }

    pub fn release_incoming(&self, packet_id: u16) -> Option<Message> {
        self.session.lock().release_incoming(packet_id)
    }

    /// Resend inflight entries unacknowledged for `interval`, then write
    /// whatever is parked.
    ///
    /// Returns the number of inflight packets written.
    pub fn retry(&self, interval: Duration) -> Result<usize, SendError> {
        let _active = self.activity.enter();
        let mut session = self.session.lock();
        if self.is_closing() || !self.is_connected() {
            return Ok(0);
        }

        let mut written = 0;
        for entry in session.due_for_retry(interval) {
            debug!(
                conn = self.id,
                packet_id = entry.packet_id,
                retries = entry.retries,
                "Retrying unacknowledged message"
            );
            let dup = entry.state != DeliveryState::Pending;
            if !self.resend(&mut session, &entry, dup)? {
                return Ok(written);
            }
            written += 1;
        }
        self.drain_parked(&mut session)?;
        Ok(written)
    }

    /// Resume delivery after CONNACK.
    ///
    /// `pending` (messages that reached the session store while this
    /// connection was binding) goes ahead of anything parked here. Then every
    /// inflight entry is resent in its original order and the parked queue is
    /// written. Returns the number of packets written.
    pub fn resume(&self, pending: VecDeque<Message>) -> Result<usize, SendError> {
        let _active = self.activity.enter();
        let mut session = self.session.lock();
        if self.is_closing() {
            return Err(SendError::Closed);
        }
        if !pending.is_empty() {
            let parked = std::mem::replace(&mut session.outgoing, pending);
            session.outgoing.extend(parked);
        }

        let mut written = 0;
        for entry in session.inflight_in_order() {
            if !self.resend(&mut session, &entry, true)? {
                return Ok(written);
            }
            written += 1;
        }
        Ok(written + self.drain_parked(&mut session)?)
    }

    /// Copy of the live session
    pub fn snapshot(&self) -> Session {
        self.session.lock().clone()
    }

    pub fn inflight_count(&self) -> usize {
        self.session.lock().inflight.len()
    }

    pub fn parked_count(&self) -> usize {
        self.session.lock().outgoing.len()
    }

    fn window_full(&self, session: &Session) -> bool {
        self.limits.max_inflight > 0 && session.inflight.len() >= self.limits.max_inflight as usize
    }

    /// Put one publish on the writer queue. On a full queue a QoS 1/2
    /// message goes back to the head of the parked queue, untracked.
    fn offer(&self, session: &mut Session, message: Message) -> Result<Delivery, SendError> {
        let packet_id = message
            .qos
            .is_acknowledged()
            .then(|| session.track(message.clone()));
        let publish = message.to_publish(packet_id);

        match self.outbound.send(Packet::Publish(publish)) {
            Ok(()) => {
                if let Some(packet_id) = packet_id {
                    session.mark_sent(packet_id);
                }
                Ok(Delivery::Sent)
            }
            Err(SendError::Full) => match packet_id {
                Some(packet_id) => {
                    session.inflight.remove(&packet_id);
                    session.outgoing.push_front(message);
                    Ok(Delivery::Parked)
                }
                None => Ok(Delivery::Dropped),
            },
            Err(e) => Err(e),
        }
    }

    /// Resend one inflight entry; Ok(false) when the writer queue is full
    fn resend(
        &self,
        session: &mut Session,
        entry: &InflightEntry,
        dup: bool,
    ) -> Result<bool, SendError> {
        let packet = if entry.state.awaiting_pubcomp() {
            Packet::PubRel(PubRel::new(entry.packet_id))
        } else {
            let mut message = entry.message.clone();
            message.dup = dup;
            Packet::Publish(message.to_publish(Some(entry.packet_id)))
        };
        match self.outbound.send(packet) {
            Ok(()) => {
                session.mark_sent(entry.packet_id);
                Ok(true)
            }
            Err(SendError::Full) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write parked messages while the inflight window and the writer queue
    /// have room; returns how many were written
    fn drain_parked(&self, session: &mut Session) -> Result<usize, SendError> {
        let mut written = 0;
        if self.is_closing() || !self.is_connected() {
            return Ok(written);
        }
        while let Some(front) = session.outgoing.front() {
            if front.qos.is_acknowledged() && self.window_full(session) {
                break;
            }
            let Some(message) = session.outgoing.pop_front() else {
                break;
            };
            if self.offer(session, message)? != Delivery::Sent {
                break;
            }
            written += 1;
        }
        Ok(written)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("client_id", &self.client_id())
            .field("connected", &self.is_connected())
            .field("closing", &self.is_closing())
            .finish()
    }
}
