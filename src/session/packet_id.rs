use std::sync::Arc;

use parking_lot::Mutex;

/// Hands out packet identifiers 1..=65535, wrapping back to 1. Clones share
/// the same counter.
#[derive(Debug, Clone, Default)]
pub struct PacketIdProvider {
    last: Arc<Mutex<u16>>,
}

impl PacketIdProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the counter past every id in `in_use`, so ids still held by a
    /// resumed session are not handed out again.
    pub fn advance_past(&self, in_use: impl IntoIterator<Item = u16>) {
        let mut last = self.last.lock();
        if let Some(highest) = in_use.into_iter().max() {
            *last = (*last).max(highest);
        }
    }

    pub fn next_id(&self) -> u16 {
        let mut last = self.last.lock();
        *last = if *last == u16::MAX { 1 } else { *last + 1 };
        *last
    }
}
