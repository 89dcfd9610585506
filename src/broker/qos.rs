//! Acknowledgements for messages the broker sent

use std::sync::Arc;

use tracing::debug;

use super::Broker;
use crate::connection::{Connection, ConnectionError};
use crate::protocol::{PubAck, PubComp, PubRec};

impl Broker {
    pub(crate) async fn handle_puback(
        &self,
        conn: &Arc<Connection>,
        puback: PubAck,
    ) -> Result<(), ConnectionError> {
        if !conn.on_puback(puback.packet_id)? {
            debug!(client_id = ?conn.client_id(), packet_id = puback.packet_id, "PUBACK for unknown packet id");
        }
        Ok(())
    }

    pub(crate) async fn handle_pubrec(
        &self,
        conn: &Arc<Connection>,
        pubrec: PubRec,
    ) -> Result<(), ConnectionError> {
        if !conn.on_pubrec(pubrec.packet_id)? {
            debug!(client_id = ?conn.client_id(), packet_id = pubrec.packet_id, "PUBREC for unknown packet id");
        }
        Ok(())
    }

    pub(crate) async fn handle_pubcomp(
        &self,
        conn: &Arc<Connection>,
        pubcomp: PubComp,
    ) -> Result<(), ConnectionError> {
        if !conn.on_pubcomp(pubcomp.packet_id)? {
            debug!(client_id = ?conn.client_id(), packet_id = pubcomp.packet_id, "PUBCOMP for unknown packet id");
        }
        Ok(())
    }
}
