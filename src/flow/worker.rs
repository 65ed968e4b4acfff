use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::packet::Packet;
use crate::transport::PacketChannel;
use crate::utils::error::{MqttError, Result};

/// Runs the flows of one connection one packet at a time, in arrival order.
///
/// The first failing flow closes the channel and stops the worker; packets
/// queued behind it are dropped.
#[derive(Debug)]
pub(crate) struct FlowWorker {
    queue: mpsc::UnboundedSender<Packet>,
    task: JoinHandle<Result<()>>,
}

impl FlowWorker {
    pub(crate) fn spawn<F>(client_id: &str, channel: PacketChannel, execute: F) -> Self
    where
        F: Fn(&str, Packet, &PacketChannel) -> Result<()> + Send + 'static,
    {
        let (queue, mut packets) = mpsc::unbounded_channel::<Packet>();
        let client_id = client_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(packet) = packets.recv().await {
                let packet_type = packet.packet_type();
                if let Err(e) = execute(&client_id, packet, &channel) {
                    warn!("{client_id}: {packet_type:?} failed: {e}");
                    channel.close();
                    return Err(e);
                }
            }
            Ok(())
        });
        Self { queue, task }
    }

    pub(crate) fn submit(&self, packet: Packet) -> Result<()> {
        self.queue.send(packet).map_err(|_| MqttError::NotConnected)
    }

    /// Lets the worker drain what is queued and returns how it ended.
    pub(crate) async fn finish(self) -> Result<()> {
        drop(self.queue);
        self.task
            .await
            .map_err(|e| MqttError::Internal(format!("flow worker stopped: {e}")))?
    }
}
