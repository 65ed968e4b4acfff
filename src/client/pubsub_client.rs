use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::listener::ClientPacketListener;
use super::message::{ApplicationMessage, Credentials, SessionState};
use crate::codec::PacketCodec;
use crate::config::ProtocolSettings;
use crate::flow::{ClientFlows, PublishDispatcher};
use crate::packet::{
    Connect, ConnectReturnCode, Packet, Publish, QoS, Subscribe, SubscribeReturnCode,
    TopicSubscription, Unsubscribe, Will,
};
use crate::session::{ClientSession, PendingMessageStatus, SessionRepository};
use crate::topic::MqttTopicEvaluator;
use crate::transport::{ByteChannel, PacketChannel, PacketReader};
use crate::utils::error::{MqttError, Result};

const MESSAGE_CAPACITY: usize = 1024;

/// Hands accepted publishes to the application message stream.
struct MessageDispatcher {
    messages: broadcast::Sender<ApplicationMessage>,
}

impl PublishDispatcher for MessageDispatcher {
    fn dispatch(&self, client_id: &str, publish: Publish) -> Result<()> {
        trace!("{client_id}: message on {}", publish.topic);
        // nobody listening is fine
        let _ = self.messages.send(publish.into());
        Ok(())
    }
}

/// MQTT client bound to one byte channel.
///
/// The client's session lives in the given [`SessionRepository`], so a new
/// client over a new channel with the same repository resumes whatever the
/// previous one left in flight.
pub struct MqttClient {
    client_id: String,
    settings: ProtocolSettings,
    channel: PacketChannel,
    reader: Mutex<Option<PacketReader>>,
    flows: ClientFlows,
    sessions: SessionRepository,
    messages: broadcast::Sender<ApplicationMessage>,
    connected: AtomicBool,
    clean_session: AtomicBool,
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.client_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl MqttClient {
    pub fn new(
        client_id: impl Into<String>,
        channel: ByteChannel,
        settings: &ProtocolSettings,
        sessions: SessionRepository,
    ) -> Result<Self> {
        settings.validate()?;
        let topics = Arc::new(MqttTopicEvaluator::new(
            settings.allow_wildcards_in_topic_filters,
        ));
        let codec = Arc::new(PacketCodec::new(topics, settings.client_id_max_length));
        let (channel, reader) = PacketChannel::open(channel, codec);
        let (messages, _) = broadcast::channel(MESSAGE_CAPACITY);
        let dispatcher = Arc::new(MessageDispatcher {
            messages: messages.clone(),
        });

        Ok(Self {
            client_id: client_id.into(),
            settings: settings.clone(),
            channel,
            reader: Mutex::new(Some(reader)),
            flows: ClientFlows::new(sessions.clone(), settings, dispatcher),
            sessions,
            messages,
            connected: AtomicBool::new(false),
            clean_session: AtomicBool::new(true),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Opens the MQTT session. Fails with [`MqttError::ConnectionRefused`]
    /// when the broker refuses and with [`MqttError::Timeout`] when no
    /// CONNACK arrives within the connection timeout.
    pub async fn connect(
        &self,
        credentials: Option<Credentials>,
        will: Option<Will>,
        clean_session: bool,
    ) -> Result<SessionState> {
        let Some(reader) = self.reader.lock().take() else {
            return Err(MqttError::ProtocolViolation(
                "CONNECT was already sent on this channel".to_string(),
            ));
        };

        if clean_session {
            self.sessions.delete(&self.client_id)?;
            self.sessions
                .create(ClientSession::new(&self.client_id, true))?;
        } else if self.sessions.read(&self.client_id)?.is_none() {
            self.sessions
                .create(ClientSession::new(&self.client_id, false))?;
        }
        self.clean_session.store(clean_session, Ordering::SeqCst);

        let mut connect = Connect::new(&self.client_id, clean_session);
        connect.keep_alive = self.settings.keep_alive_secs;
        connect.will = will;
        if let Some(credentials) = credentials {
            connect.username = Some(credentials.username);
            connect.password = credentials.password;
        }

        let inbound = self.channel.subscribe();
        let listener = ClientPacketListener::new(
            &self.client_id,
            self.flows.clone(),
            self.settings.keep_alive_secs,
        );
        let packets = self.channel.clone();
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.listen(reader, packets).await {
                debug!("{client_id}: connection ended: {e}");
            }
        });

        self.channel.send(&connect.into())?;
        let ack = self
            .await_reply(inbound, "CONNACK", |packet| match packet {
                Packet::ConnectAck(ack) => Some(ack),
                _ => None,
            })
            .await
            .inspect_err(|_| self.channel.close())?;

        if ack.return_code != ConnectReturnCode::Accepted {
            warn!("{}: connection refused: {:?}", self.client_id, ack.return_code);
            return Err(MqttError::ConnectionRefused(ack.return_code));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("{} connected (session present: {})", self.client_id, ack.session_present);
        Ok(if ack.session_present {
            SessionState::SessionPresent
        } else {
            SessionState::CleanSession
        })
    }

    /// Subscribes to `subscriptions` and returns the broker's return code for
    /// each of them, in order.
    pub async fn subscribe(
        &self,
        subscriptions: Vec<TopicSubscription>,
    ) -> Result<Vec<SubscribeReturnCode>> {
        self.ensure_connected()?;
        let packet_id = self.channel.next_packet_id();
        let inbound = self.channel.subscribe();
        self.channel.send(
            &Subscribe {
                packet_id,
                subscriptions,
            }
            .into(),
        )?;
        self.await_reply(inbound, "SUBACK", |packet| match packet {
            Packet::SubscribeAck(ack) if ack.packet_id == packet_id => Some(ack.return_codes),
            _ => None,
        })
        .await
    }

    pub async fn unsubscribe(&self, topics: Vec<String>) -> Result<()> {
        self.ensure_connected()?;
        let packet_id = self.channel.next_packet_id();
        let inbound = self.channel.subscribe();
        self.channel
            .send(&Unsubscribe { packet_id, topics }.into())?;
        self.await_reply(inbound, "UNSUBACK", |packet| match packet {
            Packet::UnsubscribeAck(ack) if ack.packet_id == packet_id => Some(()),
            _ => None,
        })
        .await
    }

    /// Publishes `message`. Resolves once the broker acknowledged it (PUBACK
    /// for QoS 1, PUBREC for QoS 2) or right away for QoS 0.
    pub async fn publish(&self, message: ApplicationMessage, qos: QoS, retain: bool) -> Result<()> {
        self.ensure_connected()?;
        let packet_id = (qos != QoS::AtMostOnce).then(|| self.channel.next_packet_id());
        let publish =
            Publish::new(message.topic, qos, packet_id, message.payload).with_retain(retain);
        self.flows
            .sender
            .send_publish(
                &self.client_id,
                publish,
                &self.channel,
                PendingMessageStatus::PendingToSend,
            )
            .await
    }

    /// Sends DISCONNECT and closes the channel. A clean session is dropped.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.channel.send(&Packet::Disconnect) {
            debug!("{}: DISCONNECT not sent: {e}", self.client_id);
        }
        self.channel.close();
        if self.clean_session.load(Ordering::SeqCst) {
            self.sessions.delete(&self.client_id)?;
        }
        info!("{} disconnected", self.client_id);
        Ok(())
    }

    /// Messages received from now on. Subscribe to this before subscribing to
    /// topics so retained messages are not missed.
    pub fn messages(&self) -> broadcast::Receiver<ApplicationMessage> {
        self.messages.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.channel.is_connected()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MqttError::NotConnected)
        }
    }

    /// Waits for the first inbound packet `reply` accepts, within the
    /// connection timeout.
    async fn await_reply<T>(
        &self,
        mut inbound: broadcast::Receiver<Packet>,
        what: &str,
        mut reply: impl FnMut(Packet) -> Option<T>,
    ) -> Result<T> {
        let wait = async {
            loop {
                tokio::select! {
                    biased;
                    received = inbound.recv() => match received {
                        Ok(packet) => {
                            if let Some(found) = reply(packet) {
                                return Ok(found);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("{}: waiting for {what} skipped {skipped} packets", self.client_id);
                        }
                        Err(RecvError::Closed) => return Err(MqttError::NotConnected),
                    },
                    _ = self.channel.closed() => return Err(MqttError::NotConnected),
                }
            }
        };
        timeout(self.settings.connection_timeout(), wait)
            .await
            .map_err(|_| MqttError::Timeout(format!("no {what} received")))?
            .inspect_err(|e| {
                if e.is_fatal() {
                    self.channel.close();
                }
            })
    }
}
