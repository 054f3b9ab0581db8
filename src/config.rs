//! Compile-time sizing of every pool and table in the stack.
//!
//! Nothing in the crate allocates at runtime, so these constants bound the
//! worst case memory footprint.

/// Number of raw CAN frames that can be queued for transmission.
pub const CAN_BUFFER_DEPTH: usize = 10;

pub const BASIC_BUFFER_DEPTH: usize = 32;
pub const DATAGRAM_BUFFER_DEPTH: usize = 4;
pub const SNIP_BUFFER_DEPTH: usize = 4;
pub const STREAM_BUFFER_DEPTH: usize = 1;

/// Total OpenLCB message buffers across every payload type.
pub const MESSAGE_BUFFER_DEPTH: usize =
    BASIC_BUFFER_DEPTH + DATAGRAM_BUFFER_DEPTH + SNIP_BUFFER_DEPTH + STREAM_BUFFER_DEPTH;

pub const LEN_MESSAGE_BYTES_BASIC: usize = 16;
pub const LEN_MESSAGE_BYTES_DATAGRAM: usize = 72;
pub const LEN_MESSAGE_BYTES_SNIP: usize = 256;
pub const LEN_MESSAGE_BYTES_STREAM: usize = 512;

/// Number of virtual nodes hosted by one stack instance.
pub const NODE_BUFFER_DEPTH: usize = 4;

/// Alias mappings: one per hosted node.
pub const ALIAS_MAPPING_BUFFER_DEPTH: usize = NODE_BUFFER_DEPTH;

pub const MAX_PRODUCER_COUNT: usize = 32;
pub const MAX_CONSUMER_COUNT: usize = 32;

/// Independent enumeration cursors over the node registry.
pub const NODE_ENUMERATOR_KEYS: usize = 4;

/// 100 ms ticks to wait after CID4 before claiming an alias (strictly more
/// than 200 ms).
pub const LOGIN_WAIT_TICKS: u8 = 3;

/// 100 ms ticks before an incomplete multi-frame message is discarded.
pub const ASSEMBLY_TIMEOUT_TICKS: u8 = 30;
