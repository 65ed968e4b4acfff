//! Reassembles whole MQTT frames out of arbitrary byte chunks.

use crate::codec::RemainingLength;
use crate::utils::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    AwaitingFirstByte,
    ReadingRemainingLength,
    ReadingBody { remaining: usize },
    PacketReady,
}

/// Incremental frame parser for one connection.
///
/// Not shared between tasks: each connection reader owns its buffer.
#[derive(Debug)]
pub struct PacketBuffer {
    state: BufferState,
    length: RemainingLength,
    current: Vec<u8>,
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self {
            state: BufferState::AwaitingFirstByte,
            length: RemainingLength::default(),
            current: Vec::new(),
        }
    }

    /// Feeds `chunk` and returns every frame it completed, in arrival order.
    ///
    /// An empty vector means no frame is complete yet; the partial frame is
    /// kept for the next call.
    pub fn try_get_packets(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut packets = Vec::new();

        for byte in chunk {
            self.push(*byte)?;
            if self.state == BufferState::PacketReady {
                packets.push(std::mem::take(&mut self.current));
                self.reset();
            }
        }
        Ok(packets)
    }

    /// Whether a partial frame is waiting for more bytes.
    pub fn is_partial(&self) -> bool {
        !self.current.is_empty()
    }

    fn push(&mut self, byte: u8) -> Result<()> {
        self.current.push(byte);
        self.state = match self.state {
            BufferState::AwaitingFirstByte => BufferState::ReadingRemainingLength,
            BufferState::ReadingRemainingLength => match self.length.push(byte)? {
                Some(0) => BufferState::PacketReady,
                Some(remaining) => BufferState::ReadingBody { remaining },
                None => BufferState::ReadingRemainingLength,
            },
            BufferState::ReadingBody { remaining: 1 } => BufferState::PacketReady,
            BufferState::ReadingBody { remaining } => BufferState::ReadingBody {
                remaining: remaining - 1,
            },
            // reset() always runs before the next byte
            BufferState::PacketReady => BufferState::PacketReady,
        };
        Ok(())
    }

    fn reset(&mut self) {
        self.state = BufferState::AwaitingFirstByte;
        self.length = RemainingLength::default();
    }
}
