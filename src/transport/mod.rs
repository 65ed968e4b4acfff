//! The `transport` module moves bytes and packets between peers.
//!
//! [`ByteChannel`] is the raw duplex stream, [`PacketBuffer`] cuts its chunks
//! into frames, and [`PacketChannel`]/[`PacketReader`] put the codec on top so
//! the rest of the crate only deals in [`crate::packet::Packet`] values.

pub mod buffer;
pub mod channel;
pub mod packet_channel;

pub use buffer::PacketBuffer;
pub use channel::{ByteChannel, ByteSender, ChannelState};
pub use packet_channel::{PacketChannel, PacketReader};

#[cfg(test)]
mod tests;
