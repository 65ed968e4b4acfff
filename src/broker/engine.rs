//! Broker engine
//!
//! The [`Broker`] owns what every connection shares: the stores, the
//! connection registry and the message router. Each accepted channel gets its
//! own [`ServerPacketListener`] task; failures stay inside that task and only
//! end the one connection.

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connections::ConnectionRegistry;
use super::listener::ServerPacketListener;
use super::router::MessageRouter;
use crate::codec::PacketCodec;
use crate::config::ProtocolSettings;
use crate::flow::{Authenticator, PublishSenderFlow, ServerFlows};
use crate::packet::Publish;
use crate::persistence::RepositoryProvider;
use crate::topic::{MqttTopicEvaluator, TopicEvaluator};
use crate::transport::{ByteChannel, ChannelState};
use crate::utils::error::{MqttError, Result};

#[derive(Debug, Clone)]
pub struct Broker {
    settings: ProtocolSettings,
    codec: Arc<PacketCodec>,
    topics: Arc<MqttTopicEvaluator>,
    repositories: RepositoryProvider,
    connections: ConnectionRegistry,
    router: Arc<MessageRouter>,
    flows: ServerFlows,
    tasks: Arc<Mutex<Vec<(ChannelState, JoinHandle<()>)>>>,
    running: Arc<watch::Sender<bool>>,
}

impl Broker {
    /// Builds a broker over `repositories`. Without an authenticator every
    /// client is accepted.
    pub fn new(
        settings: ProtocolSettings,
        repositories: RepositoryProvider,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Result<Self> {
        settings.validate()?;

        let topics = Arc::new(MqttTopicEvaluator::new(
            settings.allow_wildcards_in_topic_filters,
        ));
        let codec = Arc::new(PacketCodec::new(
            topics.clone(),
            settings.client_id_max_length,
        ));
        let connections = ConnectionRegistry::new();
        let sender = PublishSenderFlow::new(repositories.sessions.clone(), settings.wait_timeout());
        let router = Arc::new(MessageRouter::new(
            repositories.sessions.clone(),
            repositories.retained.clone(),
            topics.clone(),
            connections.clone(),
            sender.clone(),
        ));
        let flows = ServerFlows::new(
            &repositories,
            &settings,
            topics.clone(),
            sender,
            router.clone(),
            authenticator,
        );
        let (running, _) = watch::channel(true);

        Ok(Self {
            settings,
            codec,
            topics,
            repositories,
            connections,
            router,
            flows,
            tasks: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(running),
        })
    }

    /// Serves `channel` in a background task until it disconnects.
    pub fn accept(&self, channel: ByteChannel) {
        if !self.is_running() {
            debug!("broker stopped, rejecting {}", channel.peer());
            channel.close();
            return;
        }

        let state = channel.sender().state().clone();
        let listener = ServerPacketListener::new(
            self.settings.clone(),
            self.codec.clone(),
            self.flows.clone(),
            self.connections.clone(),
            self.router.clone(),
            self.repositories.clone(),
        );
        let task = tokio::spawn(async move {
            // the listener logs how the connection ended
            let _ = listener.listen(channel).await;
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, task)| !task.is_finished());
        tasks.push((state, task));
    }

    /// Accepts TCP connections until [`Self::stop`] is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("broker listening on {}", listener.local_addr()?);
        let mut running = self.running.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => {
                        debug!("accepted connection from {address}");
                        self.accept(ByteChannel::tcp(stream));
                    }
                    Err(e) => warn!("failed to accept a connection: {e}"),
                },
                _ = running.wait_for(|running| !*running) => {
                    info!("broker no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }

    /// Publishes on behalf of the broker itself. Returns how many sessions
    /// the message was handed to.
    pub fn publish(&self, publish: Publish) -> Result<usize> {
        if !self.topics.is_valid_topic_name(&publish.topic) {
            return Err(MqttError::ProtocolViolation(format!(
                "invalid topic name {:?}",
                publish.topic
            )));
        }
        self.router.route(&publish)
    }

    /// Client ids with a live connection, sorted.
    pub fn active_clients(&self) -> Vec<String> {
        self.connections.client_ids()
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Stops accepting, closes every connection and waits for their
    /// listeners to finish.
    pub async fn stop(&self) {
        self.running.send_replace(false);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        let tasks = tasks.into_iter().map(|(state, task)| {
            state.close();
            task
        });
        join_all(tasks).await;
        info!("broker stopped ({count} connection tasks joined)");
    }
}
