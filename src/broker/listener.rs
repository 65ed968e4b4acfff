use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connections::{Connection, ConnectionRegistry};
use super::router::MessageRouter;
use crate::codec::PacketCodec;
use crate::config::ProtocolSettings;
use crate::flow::{FlowWorker, ServerFlows, keep_alive_limit};
use crate::packet::{Connect, ConnectAck, Packet};
use crate::persistence::{Repository, RepositoryProvider};
use crate::transport::{ByteChannel, PacketChannel, PacketReader};
use crate::utils::error::{MqttError, Result};

const ANONYMOUS_PREFIX: &str = "anonymous";

/// Id given to a client that connected with an empty one.
pub fn anonymous_client_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{ANONYMOUS_PREFIX}{}", &suffix[..10])
}

/// Drives one broker connection from CONNECT to teardown.
pub struct ServerPacketListener {
    settings: ProtocolSettings,
    codec: Arc<PacketCodec>,
    flows: ServerFlows,
    connections: ConnectionRegistry,
    router: Arc<MessageRouter>,
    repositories: RepositoryProvider,
}

impl ServerPacketListener {
    pub fn new(
        settings: ProtocolSettings,
        codec: Arc<PacketCodec>,
        flows: ServerFlows,
        connections: ConnectionRegistry,
        router: Arc<MessageRouter>,
        repositories: RepositoryProvider,
    ) -> Self {
        Self {
            settings,
            codec,
            flows,
            connections,
            router,
            repositories,
        }
    }

    /// Serves `channel` until it disconnects. The result tells how the
    /// connection ended; `Ok` only after a DISCONNECT.
    pub async fn listen(self, channel: ByteChannel) -> Result<()> {
        let peer = channel.peer().to_string();
        let (packets, mut reader) = PacketChannel::open(channel, self.codec.clone());

        let connect = match self.accept(&packets, &mut reader).await {
            Ok(connect) => connect,
            Err(e) => {
                warn!("{peer}: connection refused: {e}");
                refuse(&packets, &e);
                packets.close();
                return Err(e);
            }
        };
        let client_id = if connect.client_id.is_empty() {
            anonymous_client_id()
        } else {
            connect.client_id.clone()
        };

        let connection = Connection::new(packets.clone());
        let connection_id = connection.id;
        let previous = {
            let _handover = self.connections.handover();
            self.flows
                .connect
                .execute(&client_id, &connect, &packets)
                .map(|()| self.connections.register(&client_id, connection))
        };
        let previous = match previous {
            Ok(previous) => previous,
            Err(e) => {
                warn!("{client_id}: connection refused: {e}");
                refuse(&packets, &e);
                packets.close();
                return Err(e);
            }
        };
        if let Some(previous) = previous {
            info!("{client_id}: new connection from {peer} replaces the previous one");
            previous.channel.close();
        }

        let worker = {
            let flows = self.flows.clone();
            FlowWorker::spawn(&client_id, packets.clone(), move |client_id, packet, channel| {
                flows.execute(client_id, packet, channel)
            })
        };
        let limit = keep_alive_limit(connect.keep_alive);
        let read = dispatch(&mut reader, &packets, &worker, limit).await;
        if read.is_err() {
            packets.close();
        }
        let worked = worker.finish().await;
        packets.close();

        let outcome = match (read, worked) {
            (Ok(()), worked) => worked,
            (Err(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
        };
        match &outcome {
            Ok(()) => info!("{client_id} disconnected"),
            Err(e) => info!("{client_id}: connection lost: {e}"),
        }

        if let Err(e) = self.teardown(&client_id, connection_id, &connect, outcome.is_ok()) {
            warn!("{client_id}: teardown failed: {e}");
        }
        outcome
    }

    async fn accept(&self, packets: &PacketChannel, reader: &mut PacketReader) -> Result<Connect> {
        let first = reader
            .next_within(Some(self.settings.connection_timeout()))
            .await
            .map_err(|e| match e {
                MqttError::Timeout(_) => MqttError::Timeout("no CONNECT received".to_string()),
                other => other,
            })?;
        match first {
            Some(Packet::Connect(connect)) => {
                packets.publish_inbound(Packet::Connect(connect.clone()));
                Ok(connect)
            }
            Some(other) => Err(MqttError::ProtocolViolation(format!(
                "expected CONNECT as the first packet, got {:?}",
                other.packet_type()
            ))),
            None => Err(MqttError::NotConnected),
        }
    }

    /// Publishes the will of a connection that failed and drops clean
    /// sessions. Skipped when a newer connection took the client id over.
    fn teardown(
        &self,
        client_id: &str,
        connection_id: Uuid,
        connect: &Connect,
        graceful: bool,
    ) -> Result<()> {
        let _handover = self.connections.handover();
        if !self.connections.remove(client_id, connection_id) {
            debug!("{client_id}: taken over, leaving session and will alone");
            return Ok(());
        }

        let will = if graceful {
            None
        } else {
            self.repositories.wills.read(client_id)?
        };
        if let Some(will) = will {
            self.repositories.wills.delete(client_id)?;
            info!("{client_id}: publishing will on {}", will.will.topic);
            if let Err(e) = self.router.route(&will.to_publish()) {
                warn!("{client_id}: will not published: {e}");
            }
        }
        if connect.clean_session {
            self.repositories.sessions.delete(client_id)?;
        }
        Ok(())
    }
}

/// Reads packets until DISCONNECT or failure, handing each to the worker.
async fn dispatch(
    reader: &mut PacketReader,
    packets: &PacketChannel,
    worker: &FlowWorker,
    limit: Option<Duration>,
) -> Result<()> {
    loop {
        match reader.next_within(limit).await? {
            None => return Err(MqttError::NotConnected),
            Some(Packet::Connect(_)) => {
                return Err(MqttError::ProtocolViolation(
                    "second CONNECT on the same connection".to_string(),
                ));
            }
            Some(Packet::Disconnect) => return worker.submit(Packet::Disconnect),
            Some(packet) => {
                packets.publish_inbound(packet.clone());
                worker.submit(packet)?;
            }
        }
    }
}

/// Answers a refused CONNECT with the matching CONNACK.
fn refuse(packets: &PacketChannel, error: &MqttError) {
    if let MqttError::ConnectionRefused(code) = error {
        let _ = packets.send(&ConnectAck::new(*code, false).into());
    }
}
