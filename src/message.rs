use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    config::{
        LEN_MESSAGE_BYTES_BASIC, LEN_MESSAGE_BYTES_DATAGRAM, LEN_MESSAGE_BYTES_SNIP,
        LEN_MESSAGE_BYTES_STREAM,
    },
    defines::MTI_MASK_DEST_ADDRESS_PRESENT,
};

/// Size class of an OpenLCB message buffer. Each class has its own pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PayloadType {
    #[default]
    Basic = 0,
    Datagram = 1,
    Snip = 2,
    Stream = 3,
}

impl PayloadType {
    /// Maximum number of payload bytes a buffer of this type holds.
    pub const fn capacity(&self) -> usize {
        match self {
            Self::Basic => LEN_MESSAGE_BYTES_BASIC,
            Self::Datagram => LEN_MESSAGE_BYTES_DATAGRAM,
            Self::Snip => LEN_MESSAGE_BYTES_SNIP,
            Self::Stream => LEN_MESSAGE_BYTES_STREAM,
        }
    }
}

/// Refers to one message buffer inside an
/// [`OpenLcbBufferStore`](crate::OpenLcbBufferStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MessageHandle {
    pub(crate) payload_type: PayloadType,
    pub(crate) index: u8,
}

impl MessageHandle {
    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MessageState {
    pub allocated: bool,
    /// Set while the message is being assembled from multiple frames
    pub in_process: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MessageHeader {
    pub mti: u16,
    pub source_alias: u16,
    pub source_node_id: u64,
    pub dest_alias: u16,
    pub dest_node_id: u64,
    pub payload_count: u16,
    pub payload_type: PayloadType,
    pub timer_ticks: u8,
    pub state: MessageState,
}

impl MessageHeader {
    pub fn is_addressed(&self) -> bool {
        self.mti & MTI_MASK_DEST_ADDRESS_PRESENT != 0
    }
}

/// Storage for one message with a payload of `N` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<const N: usize> {
    pub header: MessageHeader,
    pub(crate) payload: [u8; N],
}

impl<const N: usize> Default for Message<N> {
    fn default() -> Self {
        Self {
            header: MessageHeader::default(),
            payload: [0; N],
        }
    }
}

impl<const N: usize> Message<N> {
    pub fn view(&self) -> MessageRef<'_> {
        MessageRef {
            header: &self.header,
            payload: &self.payload,
        }
    }

    pub fn view_mut(&mut self) -> MessageMut<'_> {
        MessageMut {
            header: &mut self.header,
            payload: &mut self.payload,
        }
    }
}

/// Borrowed view of a message regardless of its payload type.
#[derive(Debug, Clone, Copy)]
pub struct MessageRef<'a> {
    pub header: &'a MessageHeader,
    payload: &'a [u8],
}

impl<'a> MessageRef<'a> {
    /// The valid part of the payload
    pub fn payload(&self) -> &'a [u8] {
        let count = (self.header.payload_count as usize).min(self.payload.len());

        &self.payload[..count]
    }

    pub fn capacity(&self) -> usize {
        self.payload.len()
    }

    pub fn count_nulls(&self) -> usize {
        self.payload().iter().filter(|byte| **byte == 0).count()
    }

    pub fn word(&self, offset: usize) -> Option<u16> {
        let bytes = self.payload().get(offset..offset + 2)?;

        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn node_id(&self, offset: usize) -> Option<u64> {
        let bytes = self.payload().get(offset..offset + 6)?;

        Some(bytes.iter().fold(0u64, |id, byte| (id << 8) | *byte as u64))
    }

    pub fn event_id(&self) -> Option<u64> {
        let bytes = self.payload().get(..8)?;

        Some(bytes.iter().fold(0u64, |id, byte| (id << 8) | *byte as u64))
    }
}

/// Mutable view of a message regardless of its payload type.
#[derive(Debug)]
pub struct MessageMut<'a> {
    pub header: &'a mut MessageHeader,
    payload: &'a mut [u8],
}

impl MessageMut<'_> {
    pub fn view(&self) -> MessageRef<'_> {
        MessageRef {
            header: &*self.header,
            payload: &*self.payload,
        }
    }

    pub fn capacity(&self) -> usize {
        self.payload.len()
    }

    /// Fills the addressing part of the header, leaving the payload empty.
    pub fn load(
        &mut self,
        mti: u16,
        source_alias: u16,
        source_node_id: u64,
        dest_alias: u16,
        dest_node_id: u64,
    ) {
        self.header.mti = mti;
        self.header.source_alias = source_alias;
        self.header.source_node_id = source_node_id;
        self.header.dest_alias = dest_alias;
        self.header.dest_node_id = dest_node_id;
        self.header.payload_count = 0;
        self.header.timer_ticks = 0;
    }

    /// Appends `data` to the payload, clamped at capacity. Returns the number
    /// of bytes that were actually copied.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let start = (self.header.payload_count as usize).min(self.payload.len());
        let count = data.len().min(self.payload.len() - start);

        self.payload[start..start + count].copy_from_slice(&data[..count]);
        self.header.payload_count = (start + count) as u16;

        count
    }

    /// Replaces the payload with `data`, clamped at capacity.
    pub fn set_payload(&mut self, data: &[u8]) -> usize {
        self.header.payload_count = 0;
        self.append(data)
    }

    pub fn append_word(&mut self, word: u16) -> usize {
        self.append(&word.to_be_bytes())
    }

    pub fn append_node_id(&mut self, node_id: u64) -> usize {
        self.append(&node_id.to_be_bytes()[2..])
    }

    pub fn append_event_id(&mut self, event_id: u64) -> usize {
        self.append(&event_id.to_be_bytes())
    }

    pub fn clear_payload(&mut self) {
        self.payload.fill(0);
        self.header.payload_count = 0;
    }
}
