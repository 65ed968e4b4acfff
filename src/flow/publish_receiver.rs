use std::sync::Arc;

use tracing::debug;

use super::PublishDispatcher;
use super::publish_sender::PublishAcknowledger;
use crate::packet::{Packet, Publish, PublishAck, PublishComplete, PublishReceived, QoS};
use crate::session::{
    PendingAcknowledgement, PendingAcknowledgementKind, PendingMessageStatus, SessionRepository,
};
use crate::transport::PacketChannel;
use crate::utils::error::{MqttError, Result};

/// Inbound publishes and the receiver side of the QoS 2 handshake.
#[derive(Clone)]
pub struct PublishReceiverFlow {
    sessions: SessionRepository,
    acks: PublishAcknowledger,
    maximum_qos: QoS,
    dispatcher: Arc<dyn PublishDispatcher>,
}

impl std::fmt::Debug for PublishReceiverFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishReceiverFlow")
            .field("maximum_qos", &self.maximum_qos)
            .finish_non_exhaustive()
    }
}

impl PublishReceiverFlow {
    pub fn new(
        sessions: SessionRepository,
        acks: PublishAcknowledger,
        maximum_qos: QoS,
        dispatcher: Arc<dyn PublishDispatcher>,
    ) -> Self {
        Self {
            sessions,
            acks,
            maximum_qos,
            dispatcher,
        }
    }

    pub fn execute(&self, client_id: &str, packet: Packet, channel: &PacketChannel) -> Result<()> {
        match packet {
            Packet::Publish(publish) => self.receive(client_id, publish, channel),
            Packet::PublishRelease(release) => {
                let pending = PendingAcknowledgement::new(
                    release.packet_id,
                    PendingAcknowledgementKind::PublishReceived,
                );
                self.sessions.modify(client_id, |session| {
                    session.remove_pending_acknowledgement(&pending)
                })?;
                channel.send(&PublishComplete::new(release.packet_id).into())
            }
            _ => Ok(()),
        }
    }

    fn receive(&self, client_id: &str, publish: Publish, channel: &PacketChannel) -> Result<()> {
        if publish.packet_id.is_some() != (publish.qos != QoS::AtMostOnce) {
            return Err(MqttError::ProtocolViolation(format!(
                "{:?} PUBLISH with packet id {:?}",
                publish.qos, publish.packet_id
            )));
        }

        let qos = publish.qos.min(self.maximum_qos);
        let packet_id = publish.packet_id.unwrap_or_default();

        if qos == QoS::ExactlyOnce {
            let pending =
                PendingAcknowledgement::new(packet_id, PendingAcknowledgementKind::PublishReceived);
            if self.sessions.get(client_id)?.has_pending_acknowledgement(&pending) {
                debug!("{client_id}: publish {packet_id} already received, acknowledging again");
                return channel.send(&PublishReceived::new(packet_id).into());
            }
        }

        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => channel.send(&PublishAck::new(packet_id).into())?,
            QoS::ExactlyOnce => self.acks.send_ack(
                client_id,
                PublishReceived::new(packet_id).into(),
                channel,
                PendingMessageStatus::PendingToSend,
            )?,
        }

        let delivered = Publish {
            qos,
            packet_id: if qos == QoS::AtMostOnce {
                None
            } else {
                publish.packet_id
            },
            duplicate: publish.duplicate && qos != QoS::AtMostOnce,
            ..publish
        };
        self.dispatcher.dispatch(client_id, delivered)
    }
}
