//! MQTT Broker Core
//!
//! The [`Broker`] owns the live connection table and wires each
//! connection's packets into the session store, the subscription registry
//! and the delivery engine. Transports plug in through
//! [`Broker::accept`] + [`Broker::serve`].

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;
#[cfg(test)]
mod tests;

pub use disconnect::CloseReason;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::auth::AccessGate;
use crate::config::Config;
use crate::connection::{
    ChannelOutbound, Connection, ConnectionError, ConnectionLimits, ConnectionTable, Outbound,
};
use crate::delivery::{DeliveryEngine, FanOut, RetainedStore};
use crate::message::Message;
use crate::persistence::{self, PersistenceManager};
use crate::protocol::{Packet, ProtocolError, ProtocolVersion, QoS};
use crate::session::SessionStore;
use crate::topic::SubscriptionStore;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum live client connections (0 = unlimited)
    pub max_connections: usize,
    /// Outgoing QoS 1/2 window per connection
    pub max_inflight: u16,
    /// Queued messages per session
    pub max_queued_messages: usize,
    /// Resend interval for unacknowledged messages
    pub retry_interval: Duration,
    /// Bound on waiting for in-flight writes when closing
    pub close_timeout: Duration,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
    /// Outbound channel capacity for [`Broker::accept_channel`]
    pub outbound_capacity: usize,
    /// Grant ceiling for subscriptions
    pub max_qos: QoS,
    /// Whether retained messages are stored
    pub retain_available: bool,
    /// Maximum client id length for MQTT v3.1
    pub max_client_id_len_v31: usize,
    /// Maximum topic levels (0 = unlimited)
    pub max_topic_levels: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_inflight: 32,
            max_queued_messages: 1000,
            retry_interval: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            outbound_capacity: 1024,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            max_client_id_len_v31: 23,
            max_topic_levels: 0,
        }
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_connections: config.limits.max_connections,
            max_inflight: config.limits.max_inflight,
            max_queued_messages: config.limits.max_queued_messages,
            retry_interval: config.limits.retry_interval,
            close_timeout: config.limits.close_timeout,
            connect_timeout: config.limits.connect_timeout,
            outbound_capacity: config.limits.outbound_capacity,
            max_qos: QoS::from_u8(config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: config.mqtt.retain_available,
            max_client_id_len_v31: config.mqtt.max_client_id_len_v31,
            max_topic_levels: config.mqtt.max_topic_levels,
        }
    }
}

/// Broker events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Client connected
    ClientConnected {
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
        session_present: bool,
    },
    /// Client disconnected
    ClientDisconnected { client_id: Arc<str>, graceful: bool },
    /// Message published
    MessagePublished {
        topic: Arc<str>,
        qos: QoS,
        retain: bool,
        subscribers: usize,
    },
}

/// Decides the QoS granted for one SUBSCRIBE entry
pub trait GrantPolicy: Send + Sync {
    fn grant(&self, client_id: &str, filter: &str, requested: QoS) -> QoS;
}

/// Grants the requested QoS, capped at a ceiling
#[derive(Debug, Clone, Copy)]
pub struct MaxQosGrant(pub QoS);

impl GrantPolicy for MaxQosGrant {
    fn grant(&self, _client_id: &str, _filter: &str, requested: QoS) -> QoS {
        requested.min(self.0)
    }
}

/// Packet-level callbacks a connection driver invokes on the broker
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// One decoded packet from an established connection
    async fn on_packet(&self, conn: &Arc<Connection>, packet: Packet)
        -> Result<(), ConnectionError>;

    /// The transport went away without DISCONNECT
    async fn on_connection_lost(&self, conn: &Arc<Connection>);
}

/// The MQTT Broker
#[derive(Clone)]
pub struct Broker {
    config: Arc<BrokerConfig>,
    connections: Arc<ConnectionTable>,
    subscriptions: Arc<SubscriptionStore>,
    sessions: Arc<SessionStore>,
    engine: Arc<DeliveryEngine>,
    gate: AccessGate,
    grants: Arc<dyn GrantPolicy>,
    persistence: Option<Arc<PersistenceManager>>,
    events: broadcast::Sender<BrokerEvent>,
    /// Serializes CONNECT handling per client id
    client_locks: Arc<DashMap<Arc<str>, Arc<tokio::sync::Mutex<()>>>>,
}

/// Builder for [`Broker`]
pub struct BrokerBuilder {
    config: BrokerConfig,
    gate: AccessGate,
    grants: Option<Arc<dyn GrantPolicy>>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl BrokerBuilder {
    pub fn access_gate(mut self, gate: AccessGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn grant_policy(mut self, grants: Arc<dyn GrantPolicy>) -> Self {
        self.grants = Some(grants);
        self
    }

    pub fn persistence(mut self, persistence: Arc<PersistenceManager>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn build(self) -> Broker {
        let (events, _) = broadcast::channel(1024);

        let mut sessions = SessionStore::new(self.config.max_queued_messages);
        let mut retained = RetainedStore::new();
        if let Some(ref p) = self.persistence {
            sessions = sessions.with_persistence(p.clone());
            retained = retained.with_persistence(p.clone());
        }

        let connections = Arc::new(ConnectionTable::new());
        let subscriptions = Arc::new(SubscriptionStore::new());
        let sessions = Arc::new(sessions);
        let engine = Arc::new(DeliveryEngine::new(
            subscriptions.clone(),
            sessions.clone(),
            Arc::new(retained),
            connections.clone(),
        ));
        let grants = self
            .grants
            .unwrap_or_else(|| Arc::new(MaxQosGrant(self.config.max_qos)) as Arc<dyn GrantPolicy>);

        Broker {
            config: Arc::new(self.config),
            connections,
            subscriptions,
            sessions,
            engine,
            gate: self.gate,
            grants,
            persistence: self.persistence,
            events,
            client_locks: Arc::new(DashMap::new()),
        }
    }
}

impl Broker {
    /// Create a broker with an open access gate and no persistence
    pub fn new(config: BrokerConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder {
            config,
            gate: AccessGate::open(),
            grants: None,
            persistence: None,
        }
    }

    /// Build a broker from loaded configuration.
    ///
    /// Opens the persistence backend when enabled, so this must run inside
    /// a tokio runtime.
    pub fn from_config(config: &Config) -> persistence::Result<Self> {
        let mut builder =
            Self::builder(BrokerConfig::from(config)).access_gate(AccessGate::from_config(&config.auth));
        if let Some(p) = PersistenceManager::from_config(&config.persistence)? {
            builder = builder.persistence(p);
        }
        Ok(builder.build())
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Register a new transport endpoint
    pub fn accept(&self, outbound: Arc<dyn Outbound>) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(
            outbound,
            ConnectionLimits {
                max_inflight: self.config.max_inflight,
                max_queued: self.config.max_queued_messages,
            },
        ));
        debug!(conn = conn.id(), "Accepted connection");
        self.connections.insert(conn.clone());
        conn
    }

    /// [`Self::accept`] over an in-memory channel; the receiver is the
    /// peer's read side
    pub fn accept_channel(&self) -> (Arc<Connection>, mpsc::Receiver<Packet>) {
        let (outbound, rx) = ChannelOutbound::new(self.config.outbound_capacity);
        (self.accept(Arc::new(outbound)), rx)
    }

    /// Drive one connection until it is closed.
    ///
    /// The first packet must be CONNECT and arrive within the connect
    /// timeout. A closed inbound channel counts as connection loss.
    pub async fn serve(
        &self,
        conn: Arc<Connection>,
        mut inbound: mpsc::Receiver<Packet>,
    ) -> Result<(), ConnectionError> {
        let first = match timeout(self.config.connect_timeout, inbound.recv()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                self.close(&conn, CloseReason::Lost).await;
                return Err(ConnectionError::Closed);
            }
            Err(_) => {
                debug!(conn = conn.id(), "Connect timeout");
                self.close(&conn, CloseReason::Lost).await;
                return Err(ConnectionError::Timeout);
            }
        };

        let Packet::Connect(connect) = first else {
            debug!(conn = conn.id(), packet = first.name(), "First packet was not CONNECT");
            self.close(&conn, CloseReason::Lost).await;
            return Err(ProtocolError::ProtocolViolation("first packet must be CONNECT").into());
        };

        if !self.handle_connect(&conn, *connect).await? {
            return Ok(());
        }

        self.run_connected(&conn, inbound).await
    }

    async fn run_connected(
        &self,
        conn: &Arc<Connection>,
        mut inbound: mpsc::Receiver<Packet>,
    ) -> Result<(), ConnectionError> {
        let keep_alive_secs = conn.info().map(|i| i.keep_alive).unwrap_or(0);
        // 1.5x keep alive, 0 disables
        let keep_alive = (keep_alive_secs > 0)
            .then(|| Duration::from_millis(keep_alive_secs as u64 * 1500));
        let mut keep_alive_deadline =
            tokio::time::Instant::now() + keep_alive.unwrap_or(Duration::ZERO);

        let retry_interval = self.config.retry_interval.max(Duration::from_millis(1));
        let mut retry_ticker = tokio::time::interval(retry_interval);
        // skip the immediate first tick
        retry_ticker.tick().await;

        let mut closed = conn.closed();
        if *closed.borrow_and_update() {
            return Ok(());
        }

        loop {
            tokio::select! {
                packet = inbound.recv() => {
                    let Some(packet) = packet else {
                        debug!(conn = conn.id(), "Inbound channel closed");
                        self.on_connection_lost(conn).await;
                        return Ok(());
                    };
                    if let Some(keep_alive) = keep_alive {
                        keep_alive_deadline = tokio::time::Instant::now() + keep_alive;
                    }
                    if let Err(e) = self.on_packet(conn, packet).await {
                        if matches!(e, ConnectionError::Closed) {
                            debug!(conn = conn.id(), "Connection closed while handling packet");
                        } else {
                            warn!(client_id = ?conn.client_id(), "Closing connection: {}", e);
                        }
                        self.on_connection_lost(conn).await;
                        return Err(e);
                    }
                    if conn.is_closing() {
                        return Ok(());
                    }
                }

                _ = closed.changed() => {
                    debug!(conn = conn.id(), "Connection closed by broker");
                    return Ok(());
                }

                _ = retry_ticker.tick() => {
                    if let Err(e) = conn.retry(retry_interval) {
                        self.on_connection_lost(conn).await;
                        return Err(e.into());
                    }
                }

                _ = tokio::time::sleep_until(keep_alive_deadline), if keep_alive.is_some() => {
                    info!(
                        client_id = ?conn.client_id(),
                        keep_alive = keep_alive_secs,
                        "Keep alive timeout, disconnecting"
                    );
                    self.on_connection_lost(conn).await;
                    return Err(ProtocolError::KeepAliveTimeout.into());
                }
            }
        }
    }

    /// Publish a message on behalf of the server
    pub async fn publish(&self, message: Message) -> FanOut {
        self.route(message).await
    }

    /// Load persisted sessions and retained messages.
    ///
    /// Stored subscriptions go back into the registry so that messages for
    /// offline clients are queued again. Returns (sessions, retained).
    pub async fn restore(&self) -> persistence::Result<(usize, usize)> {
        let Some(ref p) = self.persistence else {
            return Ok((0, 0));
        };
        let loaded = p.load_all().await?;

        let retained = self.engine.retained().restore(loaded.retained);
        let sessions = self.sessions.restore(loaded.sessions);
        for session in &sessions {
            for sub in &session.subscriptions {
                self.subscriptions.subscribe(sub.clone());
            }
        }

        info!(
            sessions = sessions.len(),
            retained, "Restored persisted state"
        );
        Ok((sessions.len(), retained))
    }

    /// Close every connection (wills are not published), then flush
    /// persistence
    pub async fn shutdown(&self) {
        info!(connections = self.connections.len(), "Shutting down broker");
        for conn in self.connections.all() {
            self.close(&conn, CloseReason::Shutdown).await;
        }
        if !self.engine.wait_quiescent(self.config.close_timeout).await {
            warn!("Publishes still in flight at shutdown");
        }
        if let Some(ref p) = self.persistence {
            if let Err(e) = p.shutdown().await {
                error!("Persistence shutdown failed: {}", e);
            }
        }
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Live connection for a client id
    pub fn connection(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.connections.live(client_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.client_count()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.count()
    }

    pub fn retained_count(&self) -> usize {
        self.engine.retained().len()
    }

    /// True when no publish operation is writing to any connection
    pub fn is_quiescent(&self) -> bool {
        self.engine.is_quiescent()
    }

    pub(crate) fn emit(&self, event: BrokerEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    /// Run the close routine on its own task
    pub(crate) fn spawn_close(&self, conn: Arc<Connection>, reason: CloseReason) {
        let broker = self.clone();
        tokio::spawn(async move {
            broker.close(&conn, reason).await;
        });
    }
}

#[async_trait]
impl ProtocolHandler for Broker {
    async fn on_packet(
        &self,
        conn: &Arc<Connection>,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ProtocolError::ProtocolViolation("duplicate CONNECT").into()),
            Packet::Publish(publish) => self.handle_publish(conn, publish).await,
            Packet::PubAck(ack) => self.handle_puback(conn, ack).await,
            Packet::PubRec(rec) => self.handle_pubrec(conn, rec).await,
            Packet::PubRel(rel) => self.handle_pubrel(conn, rel).await,
            Packet::PubComp(comp) => self.handle_pubcomp(conn, comp).await,
            Packet::Subscribe(subscribe) => self.handle_subscribe(conn, subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(conn, unsubscribe).await,
            Packet::PingReq => Ok(conn.send_packet(Packet::PingResp)?),
            Packet::Disconnect => {
                debug!(client_id = ?conn.client_id(), "DISCONNECT");
                self.close(conn, CloseReason::Graceful).await;
                Ok(())
            }
            other => {
                warn!(
                    client_id = ?conn.client_id(),
                    packet = other.name(),
                    "Unexpected packet from client"
                );
                Ok(())
            }
        }
    }

    async fn on_connection_lost(&self, conn: &Arc<Connection>) {
        self.close(conn, CloseReason::Lost).await;
    }
}
