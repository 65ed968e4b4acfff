use std::sync::Arc;

use tracing::{debug, info, warn};

use super::publish_sender::PublishSenderFlow;
use crate::packet::{Connect, ConnectAck, ConnectReturnCode, Publish, QoS};
use crate::persistence::Repository;
use crate::session::{ClientSession, ConnectionWill, PendingMessageStatus, SessionRepository};
use crate::transport::PacketChannel;
use crate::utils::error::{MqttError, Result};

/// Decides whether a client may connect with the given credentials.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, client_id: &str, username: Option<&str>, password: Option<&str>)
    -> bool;
}

/// Resends everything the session of `client_id` still has in flight.
///
/// Messages never sent are taken out of the session and go through a fresh
/// send, which records them again. Messages already sent are resent as they
/// are, and the QoS 2 acks this side owes are emitted again. Returns how many
/// publishes and acks were resent.
pub(crate) fn replay_session(
    client_id: &str,
    sessions: &SessionRepository,
    sender: &PublishSenderFlow,
    channel: &PacketChannel,
) -> Result<(usize, usize)> {
    let (unsent, session) = sessions.modify(client_id, |session| {
        let (unsent, sent) = session
            .pending_messages
            .drain(..)
            .partition::<Vec<_>, _>(|message| message.status == PendingMessageStatus::PendingToSend);
        session.pending_messages = sent;
        (unsent, session.clone())
    })?;
    channel.reserve_packet_ids(
        unsent
            .iter()
            .chain(&session.pending_messages)
            .filter_map(|message| message.packet_id)
            .chain(session.pending_acknowledgements.iter().map(|ack| ack.packet_id)),
    );

    let mut publishes = 0;
    for message in unsent {
        let mut publish = message.to_publish();
        if publish.qos != QoS::AtMostOnce && publish.packet_id.is_none() {
            publish.packet_id = Some(channel.next_packet_id());
        }
        spawn_publish(client_id, publish, sender, channel, PendingMessageStatus::PendingToSend);
        publishes += 1;
    }
    for message in &session.pending_messages {
        spawn_publish(
            client_id,
            message.to_publish(),
            sender,
            channel,
            PendingMessageStatus::PendingToAcknowledge,
        );
        publishes += 1;
    }
    for pending in &session.pending_acknowledgements {
        sender.acknowledger().send_ack(
            client_id,
            pending.to_packet(),
            channel,
            PendingMessageStatus::PendingToAcknowledge,
        )?;
    }

    Ok((publishes, session.pending_acknowledgements.len()))
}

fn spawn_publish(
    client_id: &str,
    publish: Publish,
    sender: &PublishSenderFlow,
    channel: &PacketChannel,
    status: PendingMessageStatus,
) {
    let sender = sender.clone();
    let channel = channel.clone();
    let client_id = client_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = sender.send_publish(&client_id, publish, &channel, status).await {
            debug!("{client_id}: replayed publish not completed: {e}");
        }
    });
}

/// Broker side of the CONNECT handshake.
#[derive(Clone)]
pub struct ServerConnectFlow {
    sessions: SessionRepository,
    wills: Arc<dyn Repository<ConnectionWill>>,
    sender: PublishSenderFlow,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl std::fmt::Debug for ServerConnectFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnectFlow")
            .field("authenticator", &self.authenticator.is_some())
            .finish_non_exhaustive()
    }
}

impl ServerConnectFlow {
    pub fn new(
        sessions: SessionRepository,
        wills: Arc<dyn Repository<ConnectionWill>>,
        sender: PublishSenderFlow,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        Self {
            sessions,
            wills,
            sender,
            authenticator,
        }
    }

    /// Accepts `connect` for `client_id` (already substituted when the client
    /// sent an empty one). Refusals come back as
    /// [`MqttError::ConnectionRefused`] and nothing is sent.
    pub fn execute(&self, client_id: &str, connect: &Connect, channel: &PacketChannel) -> Result<()> {
        if let Some(authenticator) = &self.authenticator {
            let accepted = authenticator.authenticate(
                client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            );
            if !accepted {
                warn!("{client_id}: bad user name or password");
                return Err(MqttError::ConnectionRefused(
                    ConnectReturnCode::BadUserNameOrPassword,
                ));
            }
        }

        let session_present = if connect.clean_session {
            self.sessions.delete(client_id)?;
            self.sessions.create(ClientSession::new(client_id, true))?;
            false
        } else {
            match self.sessions.read(client_id)? {
                Some(session) if !session.clean => true,
                _ => {
                    self.sessions.create(ClientSession::new(client_id, false))?;
                    false
                }
            }
        };

        match &connect.will {
            Some(will) => self
                .wills
                .create(ConnectionWill::new(client_id, will.clone()))?,
            None => self.wills.delete(client_id)?,
        }

        channel.send(&ConnectAck::new(ConnectReturnCode::Accepted, session_present).into())?;
        info!("{client_id} connected (session present: {session_present})");

        let (publishes, acks) = replay_session(client_id, &self.sessions, &self.sender, channel)?;
        if publishes + acks > 0 {
            debug!("{client_id}: resent {publishes} publishes and {acks} acknowledgements");
        }
        Ok(())
    }
}

/// Client side of the CONNECT handshake: resumes in-flight state once the
/// broker accepted the connection.
#[derive(Debug, Clone)]
pub struct ClientConnectFlow {
    sessions: SessionRepository,
    sender: PublishSenderFlow,
}

impl ClientConnectFlow {
    pub fn new(sessions: SessionRepository, sender: PublishSenderFlow) -> Self {
        Self { sessions, sender }
    }

    pub fn execute(&self, client_id: &str, ack: &ConnectAck, channel: &PacketChannel) -> Result<()> {
        if ack.return_code != ConnectReturnCode::Accepted {
            return Ok(());
        }
        let (publishes, acks) = replay_session(client_id, &self.sessions, &self.sender, channel)?;
        if publishes + acks > 0 {
            debug!("{client_id}: resent {publishes} publishes and {acks} acknowledgements");
        }
        Ok(())
    }
}
