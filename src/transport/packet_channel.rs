use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::trace;

use crate::codec::PacketCodec;
use crate::packet::Packet;
use crate::session::PacketIdProvider;
use crate::transport::buffer::PacketBuffer;
use crate::transport::channel::{ByteChannel, ByteSender};
use crate::utils::error::{MqttError, Result};

const INBOUND_CAPACITY: usize = 256;

/// Packet level view of a connection, shared by the flows.
///
/// Outbound packets are encoded and written straight to the byte channel.
/// Inbound packets are published by the connection's listener so that flows
/// waiting for a reply can observe them.
#[derive(Debug, Clone)]
pub struct PacketChannel {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    sender: ByteSender,
    codec: Arc<PacketCodec>,
    inbound: broadcast::Sender<Packet>,
    packet_ids: PacketIdProvider,
}

impl PacketChannel {
    /// Splits `channel` into the shared sending half and the reader owned by
    /// the connection's listener.
    pub fn open(channel: ByteChannel, codec: Arc<PacketCodec>) -> (PacketChannel, PacketReader) {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let packets = PacketChannel {
            inner: Arc::new(Inner {
                sender: channel.sender(),
                codec: codec.clone(),
                inbound,
                packet_ids: PacketIdProvider::new(),
            }),
        };
        let reader = PacketReader {
            channel,
            codec,
            buffer: PacketBuffer::new(),
            ready: VecDeque::new(),
        };
        (packets, reader)
    }

    pub fn send(&self, packet: &Packet) -> Result<()> {
        let bytes = self.inner.codec.encode(packet)?;
        trace!("sending {:?} ({} bytes)", packet.packet_type(), bytes.len());
        self.inner.sender.send(bytes)
    }

    /// Receives every inbound packet published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.inner.inbound.subscribe()
    }

    pub(crate) fn publish_inbound(&self, packet: Packet) {
        // no receivers simply means nobody is waiting for a reply
        let _ = self.inner.inbound.send(packet);
    }

    pub fn next_packet_id(&self) -> u16 {
        self.inner.packet_ids.next_id()
    }

    /// Keeps the ids of a resumed session out of future allocations.
    pub fn reserve_packet_ids(&self, in_use: impl IntoIterator<Item = u16>) {
        self.inner.packet_ids.advance_past(in_use);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.sender.is_connected()
    }

    pub fn close(&self) {
        self.inner.sender.state().close();
    }

    pub async fn closed(&self) {
        self.inner.sender.state().closed().await
    }
}

/// Turns the inbound byte stream of a connection into decoded packets.
#[derive(Debug)]
pub struct PacketReader {
    channel: ByteChannel,
    codec: Arc<PacketCodec>,
    buffer: PacketBuffer,
    ready: VecDeque<Vec<u8>>,
}

impl PacketReader {
    /// Next decoded packet. `None` once the channel is closed; a decode error
    /// leaves the reader in an undefined state and must end the connection.
    pub async fn next(&mut self) -> Option<Result<Packet>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(self.codec.decode(&frame));
            }
            let chunk = self.channel.receive().await?;
            match self.buffer.try_get_packets(&chunk) {
                Ok(frames) => self.ready.extend(frames),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Like [`Self::next`], but fails with [`MqttError::Timeout`] when nothing
    /// arrives within `limit`. `Ok(None)` means the channel closed.
    pub async fn next_within(&mut self, limit: Option<Duration>) -> Result<Option<Packet>> {
        let next = match limit {
            Some(limit) => timeout(limit, self.next()).await.map_err(|_| {
                MqttError::Timeout(format!("nothing received for {}ms", limit.as_millis()))
            })?,
            None => self.next().await,
        };
        next.transpose()
    }
}
