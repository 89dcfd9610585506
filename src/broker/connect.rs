//! CONNECT packet handling

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Broker, BrokerEvent, CloseReason};
use crate::connection::{ClientInfo, Connection, ConnectionError};
use crate::message::Message;
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Packet, ProtocolVersion};
use crate::session::Session;

impl Broker {
    /// Validate a CONNECT; the first failing check decides the code.
    ///
    /// Order: protocol level, v3.1 client id length, empty client id
    /// without clean session, credentials.
    pub(crate) async fn connect_return_code(&self, connect: &Connect) -> ConnectReturnCode {
        let Some(version) = ProtocolVersion::from_u8(connect.protocol_level) else {
            return ConnectReturnCode::UnacceptableProtocolVersion;
        };
        if version == ProtocolVersion::V31
            && connect.client_id.len() > self.config.max_client_id_len_v31
        {
            return ConnectReturnCode::IdentifierRejected;
        }
        if connect.client_id.is_empty() && !connect.clean_session {
            return ConnectReturnCode::IdentifierRejected;
        }

        match self
            .gate
            .authenticate(connect.username.as_deref(), connect.password.as_deref())
            .await
        {
            Ok(true) => ConnectReturnCode::Accepted,
            Ok(false) => ConnectReturnCode::BadUsernameOrPassword,
            Err(e) => {
                warn!(username = ?connect.username, "Authentication failed: {}", e);
                ConnectReturnCode::ServerUnavailable
            }
        }
    }

    /// Handle CONNECT. Returns whether the connection was accepted.
    pub(crate) async fn handle_connect(
        &self,
        conn: &Arc<Connection>,
        connect: Connect,
    ) -> Result<bool, ConnectionError> {
        let code = self.connect_return_code(&connect).await;
        if !code.is_accepted() {
            info!(client_id = %connect.client_id, code = %code, "Connection refused");
            return self.refuse(conn, code).await;
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            Arc::from(Uuid::new_v4().to_string())
        } else {
            Arc::from(connect.client_id.as_str())
        };
        debug!(conn = conn.id(), client_id = %client_id, "CONNECT");

        let lock = self
            .client_locks
            .entry(client_id.clone())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.establish(conn, connect, client_id.clone()).await
        };
        drop(lock);
        self.client_locks
            .remove_if(&client_id, |_, lock| Arc::strong_count(lock) == 1);

        if result.is_err() {
            self.close(conn, CloseReason::Lost).await;
        }
        result
    }

    async fn refuse(
        &self,
        conn: &Arc<Connection>,
        code: ConnectReturnCode,
    ) -> Result<bool, ConnectionError> {
        let connack = ConnAck {
            session_present: false,
            return_code: code,
        };
        if let Err(e) = conn.send_packet(Packet::ConnAck(connack)) {
            debug!(conn = conn.id(), "Could not deliver CONNACK refusal: {}", e);
        }
        self.close(conn, CloseReason::Rejected).await;
        Ok(false)
    }

    /// Accepted CONNECT, serialized per client id
    async fn establish(
        &self,
        conn: &Arc<Connection>,
        connect: Connect,
        client_id: Arc<str>,
    ) -> Result<bool, ConnectionError> {
        let version =
            ProtocolVersion::from_u8(connect.protocol_level).unwrap_or(ProtocolVersion::V311);

        let takeover = self.connections.is_bound(&client_id);
        if !takeover
            && self.config.max_connections > 0
            && self.connections.client_count() >= self.config.max_connections
        {
            warn!(
                client_id = %client_id,
                max = self.config.max_connections,
                "Max connections reached"
            );
            return self.refuse(conn, ConnectReturnCode::ServerUnavailable).await;
        }

        // at most one live connection per client id
        if let Some(existing) = self.connections.live(&client_id) {
            if existing.id() != conn.id() {
                info!(client_id = %client_id, "Client id already connected, closing previous connection");
                self.close(&existing, CloseReason::Evicted).await;
            }
        }

        let mut session_present = false;
        let resumed = if connect.clean_session {
            self.sessions.clear(&client_id);
            self.subscriptions.unsubscribe_all(&client_id);
            None
        } else {
            match self.sessions.get(&client_id) {
                Some(mut stored) => {
                    // the queue stays in the store until publish_session folds
                    // it in after the bind, ahead of anything parked meanwhile
                    stored.outgoing.clear();
                    session_present = version.supports_session_present();
                    Some(stored)
                }
                None => {
                    self.sessions
                        .save(&client_id, Session::new(client_id.clone()), Vec::new());
                    None
                }
            }
        };
        let reinstated = resumed
            .as_ref()
            .map(|s| s.subscriptions.clone())
            .unwrap_or_default();

        conn.attach(
            ClientInfo {
                client_id: client_id.clone(),
                version,
                clean_session: connect.clean_session,
                keep_alive: connect.keep_alive,
            },
            connect.will.as_ref().map(Message::from),
            resumed,
        );
        self.connections.bind_client(client_id.clone(), conn.clone());

        let connack = ConnAck {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        };
        conn.send_packet(Packet::ConnAck(connack))?;
        conn.mark_connected();

        info!(
            client_id = %client_id,
            protocol = ?version,
            clean_session = connect.clean_session,
            session_present,
            "Client connected"
        );
        self.emit(BrokerEvent::ClientConnected {
            client_id: client_id.clone(),
            protocol_version: version,
            session_present,
        });

        for sub in &reinstated {
            self.subscriptions.subscribe(sub.clone());
        }

        // unfinished exchanges, then queued and parked messages
        self.engine.publish_session(&client_id).await?;

        for sub in &reinstated {
            self.engine
                .publish_retained(&sub.filter, &client_id, sub.qos)
                .await?;
        }

        Ok(true)
    }
}
