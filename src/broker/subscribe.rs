//! SUBSCRIBE / UNSUBSCRIBE handling

use std::sync::Arc;

use tracing::debug;

use super::Broker;
use crate::connection::{Connection, ConnectionError};
use crate::protocol::{
    Packet, ProtocolError, ProtocolVersion, QoS, SubAck, SubAckReturnCode, Subscribe, UnsubAck,
    Unsubscribe,
};
use crate::topic::{validate_topic_filter, Subscription};

impl Broker {
    /// Register each filter, answer SUBACK, then replay retained messages
    /// for the granted filters.
    ///
    /// An invalid filter fails only its own entry on 3.1.1; 3.1 has no
    /// failure code, so the connection is closed.
    pub(crate) async fn handle_subscribe(
        &self,
        conn: &Arc<Connection>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let Some(info) = conn.info() else {
            return Err(ProtocolError::UnexpectedPacket("SUBSCRIBE").into());
        };
        let client_id = info.client_id;

        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut granted: Vec<(Arc<str>, QoS)> = Vec::with_capacity(subscribe.filters.len());

        for request in subscribe.filters {
            if let Err(reason) = validate_topic_filter(&request.filter, self.config.max_topic_levels) {
                if info.version == ProtocolVersion::V31 {
                    return Err(ProtocolError::InvalidTopicFilter(reason).into());
                }
                debug!(client_id = %client_id, filter = %request.filter, "Rejected filter: {}", reason);
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            let qos = self.grants.grant(&client_id, &request.filter, request.qos);
            let filter: Arc<str> = Arc::from(request.filter);
            self.subscriptions
                .subscribe(Subscription::new(client_id.clone(), filter.clone(), qos));
            debug!(client_id = %client_id, filter = %filter, qos = ?qos, "Subscribed");

            return_codes.push(SubAckReturnCode::Success(qos));
            granted.push((filter, qos));
        }

        conn.send_packet(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))?;

        for (filter, qos) in granted {
            self.engine
                .publish_retained(&filter, &client_id, qos)
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_unsubscribe(
        &self,
        conn: &Arc<Connection>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        let Some(client_id) = conn.client_id() else {
            return Err(ProtocolError::UnexpectedPacket("UNSUBSCRIBE").into());
        };

        for filter in &unsubscribe.filters {
            if self.subscriptions.unsubscribe(filter, &client_id) {
                debug!(client_id = %client_id, filter = %filter, "Unsubscribed");
            }
        }

        conn.send_packet(Packet::UnsubAck(UnsubAck::new(unsubscribe.packet_id)))?;
        Ok(())
    }
}
