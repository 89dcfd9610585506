//! Inbound PUBLISH handling and message routing

use std::sync::Arc;

use tracing::{debug, trace};

use super::{Broker, BrokerEvent, CloseReason};
use crate::connection::{Connection, ConnectionError};
use crate::delivery::FanOut;
use crate::message::Message;
use crate::protocol::{Packet, ProtocolError, PubAck, PubComp, PubRec, PubRel, Publish, QoS};
use crate::topic::validate_topic_name;

impl Broker {
    /// Hand a message to the delivery engine; connections whose transport
    /// failed during fan-out are closed in the background.
    pub(crate) async fn route(&self, message: Message) -> FanOut {
        let topic = message.topic.clone();
        let qos = message.qos;
        let retain = message.retain;

        let fan_out = self.engine.publish(message).await;
        for conn in &fan_out.faulted {
            self.spawn_close(conn.clone(), CloseReason::Lost);
        }

        trace!(
            topic = %topic,
            delivered = fan_out.delivered,
            queued = fan_out.queued,
            "Routed message"
        );
        self.emit(BrokerEvent::MessagePublished {
            topic,
            qos,
            retain,
            subscribers: fan_out.matched(),
        });
        fan_out
    }

    pub(crate) async fn handle_publish(
        &self,
        conn: &Arc<Connection>,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        validate_topic_name(&publish.topic, self.config.max_topic_levels)
            .map_err(ProtocolError::InvalidTopicName)?;

        let packet_id = publish.packet_id;
        let mut message = Message::from(publish);
        if !self.config.retain_available {
            message.retain = false;
        }

        match message.qos {
            QoS::AtMostOnce => {
                self.route(message).await;
            }
            QoS::AtLeastOnce => {
                let packet_id = packet_id.ok_or(ProtocolError::MissingPacketId)?;
                self.route(message).await;
                conn.send_packet(Packet::PubAck(PubAck::new(packet_id)))?;
            }
            QoS::ExactlyOnce => {
                let packet_id = packet_id.ok_or(ProtocolError::MissingPacketId)?;
                // routed on PUBREL; a resend before that is not stored again
                if !conn.store_incoming(packet_id, message) {
                    debug!(client_id = ?conn.client_id(), packet_id, "Duplicate QoS 2 publish");
                }
                conn.send_packet(Packet::PubRec(PubRec::new(packet_id)))?;
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_pubrel(
        &self,
        conn: &Arc<Connection>,
        pubrel: PubRel,
    ) -> Result<(), ConnectionError> {
        if let Some(message) = conn.release_incoming(pubrel.packet_id) {
            self.route(message).await;
        }
        conn.send_packet(Packet::PubComp(PubComp::new(pubrel.packet_id)))?;
        Ok(())
    }
}
