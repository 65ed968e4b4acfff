use std::time::Duration;

use tracing::{debug, warn};

use super::ack_monitor::send_and_await;
use crate::packet::{Packet, PacketType, Publish, PublishRelease, QoS};
use crate::session::{
    PendingAcknowledgement, PendingAcknowledgementKind, PendingMessage, PendingMessageStatus,
    SessionRepository,
};
use crate::transport::PacketChannel;
use crate::utils::error::{MqttError, Result};

/// Sends the QoS 2 acknowledgements of both sides of the handshake.
///
/// PUBREC and PUBREL are recorded in the session before they go out and are
/// retransmitted until the packet that completes that step arrives.
#[derive(Debug, Clone)]
pub struct PublishAcknowledger {
    sessions: SessionRepository,
    wait_timeout: Duration,
}

impl PublishAcknowledger {
    pub fn new(sessions: SessionRepository, wait_timeout: Duration) -> Self {
        Self {
            sessions,
            wait_timeout,
        }
    }

    /// Sends `ack`. PUBACK and PUBCOMP are sent once; PUBREC and PUBREL get a
    /// background task that resends them until PUBREL or PUBCOMP arrives.
    pub fn send_ack(
        &self,
        client_id: &str,
        ack: Packet,
        channel: &PacketChannel,
        status: PendingMessageStatus,
    ) -> Result<()> {
        let Some(pending) = PendingAcknowledgement::from_packet(&ack) else {
            return channel.send(&ack);
        };

        if status == PendingMessageStatus::PendingToSend {
            self.sessions
                .modify(client_id, |session| session.add_pending_acknowledgement(pending))?;
        }
        if !channel.is_connected() {
            return Ok(());
        }

        let channel = channel.clone();
        let client_id = client_id.to_string();
        let wait_timeout = self.wait_timeout;
        tokio::spawn(async move {
            let awaited = pending.awaited_reply();
            match send_and_await(&channel, &ack, &ack, awaited, pending.packet_id, wait_timeout)
                .await
            {
                Ok(_) => debug!("{client_id}: {awaited:?} {} arrived", pending.packet_id),
                Err(MqttError::NotConnected) => {
                    debug!("{client_id}: stopped waiting for {awaited:?} {}", pending.packet_id)
                }
                Err(e) => warn!("{client_id}: sending {:?} failed: {e}", ack.packet_type()),
            }
        });
        Ok(())
    }
}

/// Outbound publishes and the sender side of their acknowledgements.
#[derive(Debug, Clone)]
pub struct PublishSenderFlow {
    sessions: SessionRepository,
    acks: PublishAcknowledger,
    wait_timeout: Duration,
}

impl PublishSenderFlow {
    pub fn new(sessions: SessionRepository, wait_timeout: Duration) -> Self {
        Self {
            acks: PublishAcknowledger::new(sessions.clone(), wait_timeout),
            sessions,
            wait_timeout,
        }
    }

    pub fn acknowledger(&self) -> &PublishAcknowledger {
        &self.acks
    }

    /// Delivers `publish` to the peer of `channel`.
    ///
    /// QoS 0 goes out at once or is parked as `PendingToSend` while
    /// disconnected. QoS 1 and 2 are recorded as `PendingToAcknowledge` first
    /// (unless the record already exists, which `status` tells), then sent and
    /// retransmitted with the duplicate flag until PUBACK or PUBREC arrives.
    /// The rest of the QoS 2 handshake runs through [`Self::execute`].
    pub async fn send_publish(
        &self,
        client_id: &str,
        publish: Publish,
        channel: &PacketChannel,
        status: PendingMessageStatus,
    ) -> Result<()> {
        if publish.qos == QoS::AtMostOnce {
            if channel.is_connected() {
                return channel.send(&publish.into());
            }
            let pending = PendingMessage::from_publish(&publish, PendingMessageStatus::PendingToSend);
            return self
                .sessions
                .modify(client_id, |session| session.add_pending_message(pending));
        }

        let packet_id = publish.packet_id.ok_or_else(|| {
            MqttError::ProtocolViolation(format!("{:?} PUBLISH without a packet id", publish.qos))
        })?;
        if status == PendingMessageStatus::PendingToSend {
            let pending =
                PendingMessage::from_publish(&publish, PendingMessageStatus::PendingToAcknowledge);
            self.sessions
                .modify(client_id, |session| session.add_pending_message(pending))?;
        }
        if !channel.is_connected() {
            debug!("{client_id}: offline, publish {packet_id} waits for the next connect");
            return Ok(());
        }

        let expected = match publish.qos {
            QoS::AtLeastOnce => PacketType::PublishAck,
            _ => PacketType::PublishReceived,
        };
        let retry: Packet = publish.clone().with_duplicate(true).into();
        send_and_await(
            channel,
            &publish.into(),
            &retry,
            expected,
            packet_id,
            self.wait_timeout,
        )
        .await?;
        Ok(())
    }

    /// Handles PUBACK, PUBREC and PUBCOMP for publishes this side sent.
    pub fn execute(&self, client_id: &str, packet: &Packet, channel: &PacketChannel) -> Result<()> {
        match packet {
            Packet::PublishAck(ack) => {
                self.sessions.modify(client_id, |session| {
                    session.remove_pending_message(Some(ack.packet_id))
                })?;
            }
            Packet::PublishReceived(ack) => {
                self.sessions.modify(client_id, |session| {
                    session.remove_pending_message(Some(ack.packet_id))
                })?;
                self.acks.send_ack(
                    client_id,
                    PublishRelease::new(ack.packet_id).into(),
                    channel,
                    PendingMessageStatus::PendingToSend,
                )?;
            }
            Packet::PublishComplete(ack) => {
                let pending = PendingAcknowledgement::new(
                    ack.packet_id,
                    PendingAcknowledgementKind::PublishRelease,
                );
                self.sessions.modify(client_id, |session| {
                    session.remove_pending_acknowledgement(&pending)
                })?;
            }
            _ => {}
        }
        Ok(())
    }
}
