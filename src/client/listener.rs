use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, trace};

use crate::flow::{ClientFlows, FlowWorker, keep_alive_limit};
use crate::packet::{ConnectReturnCode, Packet};
use crate::transport::{PacketChannel, PacketReader};
use crate::utils::error::{MqttError, Result};

/// Drives the client end of a connection: waits for CONNACK, then feeds
/// every inbound packet to the client flows and keeps the connection alive.
pub struct ClientPacketListener {
    client_id: String,
    flows: ClientFlows,
    keep_alive_secs: u16,
}

impl ClientPacketListener {
    pub fn new(client_id: impl Into<String>, flows: ClientFlows, keep_alive_secs: u16) -> Self {
        Self {
            client_id: client_id.into(),
            flows,
            keep_alive_secs,
        }
    }

    /// Runs until the channel closes. Every inbound packet is published on
    /// `packets` before its flow runs, so pending requests see their reply.
    pub async fn listen(self, mut reader: PacketReader, packets: PacketChannel) -> Result<()> {
        let client_id = self.client_id.clone();
        let ack = match reader.next_within(None).await {
            Ok(Some(Packet::ConnectAck(ack))) => ack,
            Ok(Some(other)) => {
                packets.close();
                return Err(MqttError::ProtocolViolation(format!(
                    "expected CONNACK as the first packet, got {:?}",
                    other.packet_type()
                )));
            }
            Ok(None) => return Err(MqttError::NotConnected),
            Err(e) => {
                packets.close();
                return Err(e);
            }
        };
        packets.publish_inbound(ack.into());
        if ack.return_code != ConnectReturnCode::Accepted {
            packets.close();
            return Err(MqttError::ConnectionRefused(ack.return_code));
        }

        let worker = {
            let flows = self.flows.clone();
            FlowWorker::spawn(&client_id, packets.clone(), move |client_id, packet, channel| {
                flows.execute(client_id, packet, channel)
            })
        };
        // the connect flow resumes whatever the session still has in flight
        worker.submit(ack.into())?;

        let pinger = (self.keep_alive_secs > 0).then(|| {
            spawn_pinger(
                packets.clone(),
                Duration::from_secs(u64::from(self.keep_alive_secs)),
            )
        });

        let limit = keep_alive_limit(self.keep_alive_secs);
        let read = dispatch(&mut reader, &packets, &worker, limit).await;
        packets.close();
        if let Some(pinger) = pinger {
            pinger.abort();
        }
        let worked = worker.finish().await;
        debug!("{client_id}: listener stopped");
        read.and(worked)
    }
}

async fn dispatch(
    reader: &mut PacketReader,
    packets: &PacketChannel,
    worker: &FlowWorker,
    limit: Option<Duration>,
) -> Result<()> {
    loop {
        match reader.next_within(limit).await? {
            None => return Ok(()),
            Some(Packet::ConnectAck(_)) => {
                return Err(MqttError::ProtocolViolation(
                    "second CONNACK on the same connection".to_string(),
                ));
            }
            Some(packet) => {
                trace!("received {:?}", packet.packet_type());
                packets.publish_inbound(packet.clone());
                worker.submit(packet)?;
            }
        }
    }
}

/// Sends PINGREQ every `period` until the channel closes.
fn spawn_pinger(packets: PacketChannel, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    if packets.send(&Packet::PingRequest).is_err() {
                        return;
                    }
                }
                _ = packets.closed() => return,
            }
        }
    })
}
