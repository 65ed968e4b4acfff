use std::sync::Arc;

use tracing::{debug, warn};

use super::publish_sender::PublishSenderFlow;
use crate::packet::{
    Publish, QoS, Subscribe, SubscribeAck, SubscribeReturnCode, Unsubscribe, UnsubscribeAck,
};
use crate::persistence::Repository;
use crate::session::{PendingMessageStatus, RetainedMessage, SessionRepository};
use crate::topic::TopicEvaluator;
use crate::transport::PacketChannel;
use crate::utils::error::Result;

/// Broker side of SUBSCRIBE.
#[derive(Clone)]
pub struct SubscribeFlow {
    sessions: SessionRepository,
    retained: Arc<dyn Repository<RetainedMessage>>,
    topics: Arc<dyn TopicEvaluator>,
    sender: PublishSenderFlow,
    maximum_qos: QoS,
}

impl std::fmt::Debug for SubscribeFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeFlow")
            .field("maximum_qos", &self.maximum_qos)
            .finish_non_exhaustive()
    }
}

impl SubscribeFlow {
    pub fn new(
        sessions: SessionRepository,
        retained: Arc<dyn Repository<RetainedMessage>>,
        topics: Arc<dyn TopicEvaluator>,
        sender: PublishSenderFlow,
        maximum_qos: QoS,
    ) -> Self {
        Self {
            sessions,
            retained,
            topics,
            sender,
            maximum_qos,
        }
    }

    /// Records the granted subscriptions, answers with one return code per
    /// filter and then delivers the retained messages they match.
    pub fn execute(
        &self,
        client_id: &str,
        subscribe: Subscribe,
        channel: &PacketChannel,
    ) -> Result<()> {
        let mut granted = Vec::new();
        let return_codes = self.sessions.modify(client_id, |session| {
            subscribe
                .subscriptions
                .iter()
                .map(|subscription| {
                    if !self.topics.is_valid_topic_filter(&subscription.topic_filter) {
                        warn!("{client_id}: invalid topic filter {:?}", subscription.topic_filter);
                        return SubscribeReturnCode::Failure;
                    }
                    let qos = subscription.maximum_qos.min(self.maximum_qos);
                    session.add_subscription(&subscription.topic_filter, qos);
                    granted.push((subscription.topic_filter.clone(), qos));
                    SubscribeReturnCode::granted(qos)
                })
                .collect::<Vec<_>>()
        })?;

        channel.send(
            &SubscribeAck {
                packet_id: subscribe.packet_id,
                return_codes,
            }
            .into(),
        )?;

        if !granted.is_empty() {
            self.deliver_retained(client_id, &granted, channel)?;
        }
        Ok(())
    }

    fn deliver_retained(
        &self,
        client_id: &str,
        granted: &[(String, QoS)],
        channel: &PacketChannel,
    ) -> Result<()> {
        for retained in self.retained.read_all()? {
            if !self.topics.is_valid_topic_name(&retained.topic) {
                warn!("skipping retained message stored under invalid topic {:?}", retained.topic);
                continue;
            }
            let mut best = None;
            for (filter, qos) in granted {
                if self.topics.matches(&retained.topic, filter)? {
                    best = best.max(Some(*qos));
                }
            }
            let Some(subscription_qos) = best else {
                continue;
            };

            let qos = retained.qos.min(subscription_qos);
            let packet_id = (qos != QoS::AtMostOnce).then(|| channel.next_packet_id());
            let publish = Publish::new(retained.topic, qos, packet_id, retained.payload)
                .with_retain(true);
            debug!("{client_id}: delivering retained message on {}", publish.topic);

            let sender = self.sender.clone();
            let channel = channel.clone();
            let client_id = client_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = sender
                    .send_publish(&client_id, publish, &channel, PendingMessageStatus::PendingToSend)
                    .await
                {
                    debug!("{client_id}: retained delivery not completed: {e}");
                }
            });
        }
        Ok(())
    }
}

/// Broker side of UNSUBSCRIBE.
#[derive(Debug, Clone)]
pub struct UnsubscribeFlow {
    sessions: SessionRepository,
}

impl UnsubscribeFlow {
    pub fn new(sessions: SessionRepository) -> Self {
        Self { sessions }
    }

    pub fn execute(
        &self,
        client_id: &str,
        unsubscribe: Unsubscribe,
        channel: &PacketChannel,
    ) -> Result<()> {
        self.sessions.modify(client_id, |session| {
            for topic in &unsubscribe.topics {
                session.remove_subscription(topic);
            }
        })?;
        channel.send(&UnsubscribeAck::new(unsubscribe.packet_id).into())
    }
}
