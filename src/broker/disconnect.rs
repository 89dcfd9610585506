//! Connection close routine

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Broker, BrokerEvent};
use crate::connection::Connection;

/// Why a connection is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent DISCONNECT
    Graceful,
    /// Transport error, keep-alive expiry or protocol violation
    Lost,
    /// Another connection took over the client id
    Evicted,
    /// Broker shutdown
    Shutdown,
    /// CONNECT was refused
    Rejected,
}

impl CloseReason {
    /// Whether the will message is published
    pub fn publishes_will(self) -> bool {
        matches!(self, CloseReason::Lost | CloseReason::Evicted)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Graceful => "graceful",
            CloseReason::Lost => "lost",
            CloseReason::Evicted => "evicted",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl Broker {
    /// Close a connection. Idempotent: later callers wait for the first
    /// one to finish.
    ///
    /// Steps: save a persistent session, publish the will, wait (bounded)
    /// for writes in flight, unbind the client id, close the transport.
    ///
    /// The session is saved in the same step that marks the connection
    /// closing, before the will goes out. Anything routed to the client from
    /// then on, its own will included, is queued behind the saved state
    /// instead of being written to a connection that is going away.
    pub(crate) async fn close(&self, conn: &Arc<Connection>, reason: CloseReason) {
        let client_id = conn.client_id();

        let first = conn.begin_close(|mut snapshot| {
            if let Some(ref client_id) = client_id {
                // queued in the store but not folded into this connection yet
                let mut queued = self.sessions.take_outgoing(client_id);
                queued.append(&mut snapshot.outgoing);
                snapshot.outgoing = queued;
                let subscriptions = self.subscriptions.subscriptions_of(client_id);
                self.sessions.save(client_id, snapshot, subscriptions);
            }
        });
        if !first {
            conn.wait_closed().await;
            return;
        }
        debug!(conn = conn.id(), client_id = ?client_id, reason = %reason, "Closing connection");

        let connected = conn.is_connected();
        let will = conn.take_will();
        if let Some(will) = will {
            if connected && reason.publishes_will() {
                debug!(client_id = ?client_id, topic = %will.topic, "Publishing will message");
                self.route(will).await;
            }
        }

        if !conn
            .activity()
            .wait_idle(self.config.close_timeout)
            .await
        {
            warn!(client_id = ?client_id, "Writes still in flight at close");
        }

        if let Some(ref client_id) = client_id {
            if self.connections.unbind_client_if(client_id, conn.id()) && !conn.is_persistent() {
                self.subscriptions.unsubscribe_all(client_id);
            }
        }

        conn.close_transport();
        self.connections.remove(conn.id());
        conn.mark_closed();

        if connected {
            if let Some(client_id) = client_id {
                info!(client_id = %client_id, reason = %reason, "Client disconnected");
                self.emit(BrokerEvent::ClientDisconnected {
                    client_id,
                    graceful: reason == CloseReason::Graceful,
                });
            }
        }
    }
}
