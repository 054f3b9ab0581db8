//! Fixed-capacity pools for CAN frames and OpenLCB messages.

use crate::{
    config::{
        BASIC_BUFFER_DEPTH, CAN_BUFFER_DEPTH, DATAGRAM_BUFFER_DEPTH, LEN_MESSAGE_BYTES_BASIC,
        LEN_MESSAGE_BYTES_DATAGRAM, LEN_MESSAGE_BYTES_SNIP, SNIP_BUFFER_DEPTH,
    },
    frame::CanFrame,
    message::{Message, MessageHandle, MessageMut, MessageRef, PayloadType},
};

#[cfg(feature = "stream")]
use crate::config::{LEN_MESSAGE_BYTES_STREAM, STREAM_BUFFER_DEPTH};

/// A pool of `N` entries, each either free or allocated.
#[derive(Debug)]
pub struct Pool<T, const N: usize> {
    slots: [T; N],
    allocated: [bool; N],
    allocated_count: usize,
    max_allocated: usize,
}

impl<T: Default, const N: usize> Default for Pool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default, const N: usize> Pool<T, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| T::default()),
            allocated: [false; N],
            allocated_count: 0,
            max_allocated: 0,
        }
    }

    /// Claims the first free entry, reset to its default value.
    pub fn allocate(&mut self) -> Option<usize> {
        let index = self.allocated.iter().position(|allocated| !allocated)?;

        self.slots[index] = T::default();
        self.allocated[index] = true;
        self.allocated_count += 1;
        self.max_allocated = self.max_allocated.max(self.allocated_count);

        Some(index)
    }

    /// Returns an entry to the pool. Freeing an entry that is already free
    /// (or out of range) does nothing.
    pub fn free(&mut self, index: usize) {
        if let Some(allocated) = self.allocated.get_mut(index) {
            if *allocated {
                *allocated = false;
                self.allocated_count = self.allocated_count.saturating_sub(1);
            }
        }
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        self.allocated.get(index).copied().unwrap_or(false)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.is_allocated(index).then(|| &self.slots[index])
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if self.is_allocated(index) {
            Some(&mut self.slots[index])
        } else {
            None
        }
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated_count
    }

    /// Highest `allocated_count` seen since creation or the last
    /// [`clear_max`](Self::clear_max).
    pub fn max_allocated(&self) -> usize {
        self.max_allocated
    }

    /// Restarts peak tracking from the current allocation level.
    pub fn clear_max(&mut self) {
        self.max_allocated = self.allocated_count;
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

/// Refers to one frame inside a [`CanBufferStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanHandle(u8);

/// Pool of raw CAN frames waiting in the transmit FIFO.
#[derive(Debug, Default)]
pub struct CanBufferStore {
    pool: Pool<CanFrame, CAN_BUFFER_DEPTH>,
}

impl CanBufferStore {
    pub fn new() -> Self {
        Self { pool: Pool::new() }
    }

    pub fn allocate(&mut self) -> Option<CanHandle> {
        self.pool.allocate().map(|index| CanHandle(index as u8))
    }

    /// Allocates a buffer and stores `frame` in it.
    pub fn allocate_with(&mut self, frame: CanFrame) -> Option<CanHandle> {
        let handle = self.allocate()?;

        if let Some(slot) = self.get_mut(handle) {
            *slot = frame;
        }

        Some(handle)
    }

    pub fn free(&mut self, handle: CanHandle) {
        self.pool.free(handle.0 as usize)
    }

    pub fn get(&self, handle: CanHandle) -> Option<&CanFrame> {
        self.pool.get(handle.0 as usize)
    }

    pub fn get_mut(&mut self, handle: CanHandle) -> Option<&mut CanFrame> {
        self.pool.get_mut(handle.0 as usize)
    }

    pub fn allocated_count(&self) -> usize {
        self.pool.allocated_count()
    }

    pub fn max_allocated(&self) -> usize {
        self.pool.max_allocated()
    }

    pub fn clear_max(&mut self) {
        self.pool.clear_max()
    }
}

/// Allocation statistics of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolStats {
    pub allocated: usize,
    pub max_allocated: usize,
    pub capacity: usize,
}

impl<T: Default, const N: usize> From<&Pool<T, N>> for PoolStats {
    fn from(pool: &Pool<T, N>) -> Self {
        Self {
            allocated: pool.allocated_count(),
            max_allocated: pool.max_allocated(),
            capacity: N,
        }
    }
}

/// Pools of OpenLCB messages, one per [`PayloadType`].
#[derive(Debug, Default)]
pub struct OpenLcbBufferStore {
    basic: Pool<Message<LEN_MESSAGE_BYTES_BASIC>, BASIC_BUFFER_DEPTH>,
    datagram: Pool<Message<LEN_MESSAGE_BYTES_DATAGRAM>, DATAGRAM_BUFFER_DEPTH>,
    snip: Pool<Message<LEN_MESSAGE_BYTES_SNIP>, SNIP_BUFFER_DEPTH>,
    #[cfg(feature = "stream")]
    stream: Pool<Message<LEN_MESSAGE_BYTES_STREAM>, STREAM_BUFFER_DEPTH>,
}

macro_rules! with_pool {
    ($store:expr, $payload_type:expr, $pool:ident => $body:expr, $otherwise:expr) => {
        match $payload_type {
            PayloadType::Basic => {
                let $pool = &mut $store.basic;
                $body
            }
            PayloadType::Datagram => {
                let $pool = &mut $store.datagram;
                $body
            }
            PayloadType::Snip => {
                let $pool = &mut $store.snip;
                $body
            }
            #[cfg(feature = "stream")]
            PayloadType::Stream => {
                let $pool = &mut $store.stream;
                $body
            }
            #[cfg(not(feature = "stream"))]
            PayloadType::Stream => $otherwise,
        }
    };
}

macro_rules! with_pool_ref {
    ($store:expr, $payload_type:expr, $pool:ident => $body:expr, $otherwise:expr) => {
        match $payload_type {
            PayloadType::Basic => {
                let $pool = &$store.basic;
                $body
            }
            PayloadType::Datagram => {
                let $pool = &$store.datagram;
                $body
            }
            PayloadType::Snip => {
                let $pool = &$store.snip;
                $body
            }
            #[cfg(feature = "stream")]
            PayloadType::Stream => {
                let $pool = &$store.stream;
                $body
            }
            #[cfg(not(feature = "stream"))]
            PayloadType::Stream => $otherwise,
        }
    };
}

impl OpenLcbBufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a zeroed message of the given type, or `None` when that pool is
    /// exhausted.
    pub fn allocate(&mut self, payload_type: PayloadType) -> Option<MessageHandle> {
        let index = with_pool!(self, payload_type, pool => {
            let index = pool.allocate()?;

            if let Some(message) = pool.get_mut(index) {
                message.header.payload_type = payload_type;
                message.header.state.allocated = true;
            }

            index
        }, return None);

        Some(MessageHandle {
            payload_type,
            index: index as u8,
        })
    }

    /// Returns a message to its pool. Already free handles are ignored.
    pub fn free(&mut self, handle: MessageHandle) {
        let index = handle.index as usize;

        with_pool!(self, handle.payload_type, pool => {
            if let Some(message) = pool.get_mut(index) {
                message.header.state.allocated = false;
                message.header.state.in_process = false;
            }
            pool.free(index)
        }, ())
    }

    pub fn get(&self, handle: MessageHandle) -> Option<MessageRef<'_>> {
        let index = handle.index as usize;

        with_pool_ref!(self, handle.payload_type, pool => pool.get(index).map(Message::view), None)
    }

    pub fn get_mut(&mut self, handle: MessageHandle) -> Option<MessageMut<'_>> {
        let index = handle.index as usize;

        with_pool!(self, handle.payload_type, pool => pool.get_mut(index).map(Message::view_mut), None)
    }

    pub fn stats(&self, payload_type: PayloadType) -> PoolStats {
        with_pool_ref!(self, payload_type, pool => PoolStats::from(pool), PoolStats::default())
    }

    pub fn allocated_count(&self, payload_type: PayloadType) -> usize {
        self.stats(payload_type).allocated
    }

    pub fn max_allocated(&self, payload_type: PayloadType) -> usize {
        self.stats(payload_type).max_allocated
    }

    /// Allocated messages across every pool.
    pub fn total_allocated(&self) -> usize {
        [
            PayloadType::Basic,
            PayloadType::Datagram,
            PayloadType::Snip,
            PayloadType::Stream,
        ]
        .iter()
        .map(|payload_type| self.allocated_count(*payload_type))
        .sum()
    }

    pub fn clear_max(&mut self) {
        self.basic.clear_max();
        self.datagram.clear_max();
        self.snip.clear_max();
        #[cfg(feature = "stream")]
        self.stream.clear_max();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_counts_allocations() {
        let mut pool = Pool::<u32, 3>::new();

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(pool.allocate(), None);
        assert_eq!(pool.allocated_count(), 3);
        assert_eq!(pool.max_allocated(), 3);

        pool.free(b);
        assert_eq!(pool.allocated_count(), 2);
        assert_eq!(pool.max_allocated(), 3);

        // the freed slot is reused first
        assert_eq!(pool.allocate(), Some(1));
    }

    #[test]
    fn free_is_idempotent() {
        let mut pool = Pool::<u32, 2>::new();

        let a = pool.allocate().unwrap();
        pool.free(a);
        pool.free(a);
        pool.free(17);
        assert_eq!(pool.allocated_count(), 0);
        assert_eq!(pool.get(a), None);
    }

    #[test]
    fn allocation_zeroes_the_entry() {
        let mut pool = Pool::<u32, 1>::new();

        let a = pool.allocate().unwrap();
        *pool.get_mut(a).unwrap() = 42;
        pool.free(a);

        let a = pool.allocate().unwrap();
        assert_eq!(pool.get(a), Some(&0));
    }

    #[test]
    fn clear_max_keeps_invariant() {
        let mut pool = Pool::<u8, 4>::new();

        let a = pool.allocate().unwrap();
        pool.allocate().unwrap();
        pool.free(a);
        pool.clear_max();
        assert_eq!(pool.max_allocated(), 1);
        assert!(pool.max_allocated() >= pool.allocated_count());
    }

    #[test]
    fn can_store() {
        let mut store = CanBufferStore::new();

        let frame = CanFrame::reserve_id(0xAAA);
        let handle = store.allocate_with(frame).unwrap();
        assert_eq!(store.get(handle), Some(&frame));

        for _ in 1..CAN_BUFFER_DEPTH {
            assert!(store.allocate().is_some());
        }
        assert_eq!(store.allocate(), None);
        assert_eq!(store.allocated_count(), CAN_BUFFER_DEPTH);

        store.free(handle);
        store.free(handle);
        assert_eq!(store.allocated_count(), CAN_BUFFER_DEPTH - 1);
    }

    #[test]
    fn message_store_tracks_types_separately() {
        let mut store = OpenLcbBufferStore::new();

        let basic = store.allocate(PayloadType::Basic).unwrap();
        let datagram = store.allocate(PayloadType::Datagram).unwrap();

        assert_eq!(store.get(basic).unwrap().capacity(), LEN_MESSAGE_BYTES_BASIC);
        assert_eq!(store.get(datagram).unwrap().capacity(), LEN_MESSAGE_BYTES_DATAGRAM);
        assert!(store.get(datagram).unwrap().header.state.allocated);
        assert_eq!(store.get(datagram).unwrap().header.payload_type, PayloadType::Datagram);

        for _ in 1..DATAGRAM_BUFFER_DEPTH {
            assert!(store.allocate(PayloadType::Datagram).is_some());
        }
        assert_eq!(store.allocate(PayloadType::Datagram), None);
        assert!(store.allocate(PayloadType::Snip).is_some());

        assert_eq!(store.allocated_count(PayloadType::Datagram), DATAGRAM_BUFFER_DEPTH);
        assert_eq!(store.total_allocated(), DATAGRAM_BUFFER_DEPTH + 2);

        store.free(basic);
        store.free(basic);
        assert!(store.get(basic).is_none());
        assert_eq!(store.allocated_count(PayloadType::Basic), 0);
        assert_eq!(store.max_allocated(PayloadType::Basic), 1);
    }

    #[cfg(not(feature = "stream"))]
    #[test]
    fn stream_pool_is_absent_without_feature() {
        let mut store = OpenLcbBufferStore::new();

        assert_eq!(store.allocate(PayloadType::Stream), None);
        assert_eq!(store.stats(PayloadType::Stream), PoolStats::default());
    }
}
