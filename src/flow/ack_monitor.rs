use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use crate::packet::{Packet, PacketType};
use crate::transport::PacketChannel;
use crate::utils::error::{MqttError, Result};

/// Sends `packet` and waits for the `expected` reply carrying `packet_id`.
///
/// Every `wait_timeout` without that reply `retry` is sent again while the
/// channel is connected. Only the reply ends the wait; a closed channel fails
/// it with [`MqttError::NotConnected`] so no timer outlives its connection.
pub(crate) async fn send_and_await(
    channel: &PacketChannel,
    packet: &Packet,
    retry: &Packet,
    expected: PacketType,
    packet_id: u16,
    wait_timeout: Duration,
) -> Result<Packet> {
    // subscribe before sending so a fast reply cannot be missed
    let mut inbound = channel.subscribe();
    channel.send(packet)?;

    let mut retries = interval_at(Instant::now() + wait_timeout, wait_timeout);
    retries.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = inbound.recv() => match received {
                Ok(reply) if reply.is_reply(expected, packet_id) => return Ok(reply),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("waiting for {expected:?} {packet_id} skipped {skipped} packets");
                }
                Err(RecvError::Closed) => return Err(MqttError::NotConnected),
            },
            _ = retries.tick() => {
                if channel.is_connected() {
                    debug!("no {expected:?} for packet {packet_id}, sending again");
                    channel.send(retry)?;
                }
            }
            _ = channel.closed() => return Err(MqttError::NotConnected),
        }
    }
}
