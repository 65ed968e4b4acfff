use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::connections::ConnectionRegistry;
use crate::flow::{PublishDispatcher, PublishSenderFlow};
use crate::packet::{Publish, QoS};
use crate::persistence::Repository;
use crate::session::{PendingMessage, PendingMessageStatus, RetainedMessage, SessionRepository};
use crate::topic::TopicEvaluator;
use crate::utils::error::{MqttError, Result};

/// Delivers publishes accepted by the broker to every matching session.
#[derive(Clone)]
pub struct MessageRouter {
    sessions: SessionRepository,
    retained: Arc<dyn Repository<RetainedMessage>>,
    topics: Arc<dyn TopicEvaluator>,
    connections: ConnectionRegistry,
    sender: PublishSenderFlow,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl MessageRouter {
    pub fn new(
        sessions: SessionRepository,
        retained: Arc<dyn Repository<RetainedMessage>>,
        topics: Arc<dyn TopicEvaluator>,
        connections: ConnectionRegistry,
        sender: PublishSenderFlow,
    ) -> Self {
        Self {
            sessions,
            retained,
            topics,
            connections,
            sender,
        }
    }

    /// Stores or clears the retained message of the topic, then hands a copy
    /// of `publish` to every session subscribed to it. Returns how many
    /// sessions were served.
    ///
    /// Each copy goes out at the lower of the publish QoS and the best
    /// matching subscription. Connected clients get it right away; persistent
    /// sessions of disconnected clients keep QoS 1 and 2 copies until they
    /// reconnect. Everything else is dropped.
    pub fn route(&self, publish: &Publish) -> Result<usize> {
        if !self.topics.is_valid_topic_name(&publish.topic) {
            return Err(MqttError::ProtocolViolation(format!(
                "cannot route to invalid topic {:?}",
                publish.topic
            )));
        }
        if publish.retain {
            self.retain(publish)?;
        }

        let mut served = 0;
        for session in self.sessions.read_all()? {
            let mut best = None;
            for subscription in &session.subscriptions {
                match self.topics.matches(&publish.topic, &subscription.topic_filter) {
                    Ok(true) => best = best.max(Some(subscription.maximum_qos)),
                    Ok(false) => {}
                    Err(e) => warn!(
                        "{}: skipping subscription {:?}: {e}",
                        session.client_id, subscription.topic_filter
                    ),
                }
            }
            let Some(subscription_qos) = best else {
                continue;
            };

            let mut outgoing = Publish::new(
                publish.topic.clone(),
                publish.qos.min(subscription_qos),
                None,
                publish.payload.clone(),
            );
            let client_id = session.client_id;

            match self.connections.get(&client_id) {
                Some(channel) if channel.is_connected() => {
                    if outgoing.qos != QoS::AtMostOnce {
                        outgoing.packet_id = Some(channel.next_packet_id());
                    }
                    let sender = self.sender.clone();
                    tokio::spawn(async move {
                        if let Err(e) = sender
                            .send_publish(
                                &client_id,
                                outgoing,
                                &channel,
                                PendingMessageStatus::PendingToSend,
                            )
                            .await
                        {
                            debug!("{client_id}: delivery not completed: {e}");
                        }
                    });
                }
                _ if !session.clean && outgoing.qos != QoS::AtMostOnce => {
                    trace!("{client_id}: offline, queueing publish on {}", outgoing.topic);
                    let pending =
                        PendingMessage::from_publish(&outgoing, PendingMessageStatus::PendingToSend);
                    let queued = self
                        .sessions
                        .modify(&client_id, |session| session.add_pending_message(pending));
                    match queued {
                        Ok(()) => {}
                        // ended while routing
                        Err(MqttError::SessionNotFound(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                _ => {
                    trace!("{client_id}: offline, dropping publish on {}", outgoing.topic);
                    continue;
                }
            }
            served += 1;
        }
        Ok(served)
    }

    fn retain(&self, publish: &Publish) -> Result<()> {
        self.retained.delete(&publish.topic)?;
        if publish.payload.is_empty() {
            debug!("cleared retained message of {}", publish.topic);
            return Ok(());
        }
        self.retained.create(RetainedMessage::new(
            publish.topic.clone(),
            publish.qos,
            publish.payload.clone(),
        ))
    }
}

impl PublishDispatcher for MessageRouter {
    fn dispatch(&self, client_id: &str, publish: Publish) -> Result<()> {
        match self.route(&publish) {
            Ok(served) => {
                trace!("{client_id}: publish on {} served {served} sessions", publish.topic);
                Ok(())
            }
            Err(e) => {
                warn!("{client_id}: routing publish on {} failed: {e}", publish.topic);
                Err(e)
            }
        }
    }
}
