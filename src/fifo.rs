use heapless::Deque;

use crate::{
    buffer_store::CanHandle,
    config::{CAN_BUFFER_DEPTH, MESSAGE_BUFFER_DEPTH},
    message::MessageHandle,
};

/// First-in first-out queue of buffer handles. The capacity matches the store
/// the handles come from, so pushing a handle fresh from that store can only
/// fail if the same handle is queued twice.
#[derive(Debug)]
pub struct BufferFifo<H, const N: usize> {
    queue: Deque<H, N>,
}

impl<H, const N: usize> Default for BufferFifo<H, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H, const N: usize> BufferFifo<H, N> {
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
        }
    }

    /// Appends `handle`, handing it back if the queue is full.
    pub fn push(&mut self, handle: H) -> Result<(), H> {
        self.queue.push_back(handle)
    }

    pub fn pop(&mut self) -> Option<H> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn count(&self) -> usize {
        self.queue.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &H> {
        self.queue.iter()
    }
}

/// Outbound CAN frames, drained one per main loop pass.
pub type CanTxFifo = BufferFifo<CanHandle, CAN_BUFFER_DEPTH>;

/// Complete OpenLCB messages, inbound (ingress) or waiting to be segmented
/// (egress).
pub type MessageFifo = BufferFifo<MessageHandle, MESSAGE_BUFFER_DEPTH>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_order() {
        let mut fifo = BufferFifo::<u8, 3>::new();

        assert!(fifo.is_empty());
        assert_eq!(fifo.push(1), Ok(()));
        assert_eq!(fifo.push(2), Ok(()));
        assert_eq!(fifo.push(3), Ok(()));
        assert_eq!(fifo.push(4), Err(4));
        assert!(fifo.is_full());
        assert_eq!(fifo.count(), 3);

        assert_eq!(fifo.pop(), Some(1));
        assert_eq!(fifo.push(4), Ok(()));
        assert_eq!(fifo.iter().copied().collect::<heapless::Vec<u8, 3>>(), [2, 3, 4]);

        assert_eq!(fifo.pop(), Some(2));
        assert_eq!(fifo.pop(), Some(3));
        assert_eq!(fifo.pop(), Some(4));
        assert_eq!(fifo.pop(), None);
        assert!(fifo.is_empty());
    }
}
