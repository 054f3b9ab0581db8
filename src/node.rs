use heapless::Vec;

use crate::{
    config::{MAX_CONSUMER_COUNT, MAX_PRODUCER_COUNT, NODE_BUFFER_DEPTH, NODE_ENUMERATOR_KEYS},
    defines::{
        ADDRESS_SPACE_ALL, ADDRESS_SPACE_CONFIGURATION_DEFINITION_INFO,
        ADDRESS_SPACE_CONFIGURATION_MEMORY, NODE_ID_MASK,
    },
    message::{MessageHandle, MessageHeader},
};

/// Position of a node in the CAN login sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RunState {
    #[default]
    Init = 0,
    GenerateSeed = 1,
    GenerateAlias = 2,
    LoadCid07 = 3,
    LoadCid06 = 4,
    LoadCid05 = 5,
    LoadCid04 = 6,
    Wait200ms = 7,
    LoadRid = 8,
    LoadAmd = 9,
    LoadInitializationComplete = 10,
    LoadProducerEvents = 11,
    LoadConsumerEvents = 12,
    Run = 13,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeState {
    pub permitted: bool,
    pub initialized: bool,
    pub duplicate_id_detected: bool,
    pub firmware_upgrade_active: bool,
    pub resend_datagram: bool,
}

/// Last known state of an event, reported in Identified messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventStatus {
    #[default]
    Unknown,
    Set,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Event {
    pub id: u64,
    pub status: EventStatus,
}

/// A node's produced or consumed events plus the cursor used to announce
/// them one at a time after login.
#[derive(Debug, Clone, Default)]
pub struct EventList<const N: usize> {
    events: Vec<Event, N>,
    enumerator: usize,
}

impl<const N: usize> EventList<N> {
    pub const fn new() -> Self {
        Self {
            events: Vec::new(),
            enumerator: 0,
        }
    }

    /// Adds an event, returning false if the list is full.
    pub fn push(&mut self, id: u64) -> bool {
        self.events
            .push(Event {
                id,
                status: EventStatus::Unknown,
            })
            .is_ok()
    }

    pub fn position(&self, id: u64) -> Option<usize> {
        self.events.iter().position(|event| event.id == id)
    }

    pub fn set_status(&mut self, id: u64, status: EventStatus) -> bool {
        match self.events.iter_mut().find(|event| event.id == id) {
            Some(event) => {
                event.status = status;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Next event to announce, advancing the cursor. `None` once every event
    /// has been returned.
    pub fn next_to_enumerate(&mut self) -> Option<Event> {
        let event = self.events.get(self.enumerator).copied()?;
        self.enumerator += 1;

        Some(event)
    }

    pub fn reset_enumerator(&mut self) {
        self.enumerator = 0;
    }
}

/// Description of one configuration memory address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AddressSpace {
    pub present: bool,
    pub read_only: bool,
    pub low_address_valid: bool,
    pub address_space: u8,
    pub highest_address: u32,
    pub low_address: u32,
    pub description: &'static str,
}

/// Strings reported by Simple Node Information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SnipParameters {
    pub mfg_version: u8,
    pub name: &'static str,
    pub model: &'static str,
    pub hardware_version: &'static str,
    pub software_version: &'static str,
    pub user_version: u8,
}

/// Static description of a node supplied by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeParameters {
    pub snip: SnipParameters,
    /// Protocol Support Inquiry bits (`PSI_*`)
    pub protocol_support: u32,
    /// Consumed events generated as `(node_id << 16) + i`
    pub consumer_count_autocreate: u8,
    /// Produced events generated as `(node_id << 16) + i`
    pub producer_count_autocreate: u8,
    pub address_space_configuration_definition: AddressSpace,
    pub address_space_all: AddressSpace,
    pub address_space_config_memory: AddressSpace,
}

impl NodeParameters {
    pub const fn new(protocol_support: u32) -> Self {
        Self {
            snip: SnipParameters {
                mfg_version: 4,
                name: "",
                model: "",
                hardware_version: "",
                software_version: "",
                user_version: 2,
            },
            protocol_support,
            consumer_count_autocreate: 0,
            producer_count_autocreate: 0,
            address_space_configuration_definition: AddressSpace {
                present: false,
                read_only: true,
                low_address_valid: false,
                address_space: ADDRESS_SPACE_CONFIGURATION_DEFINITION_INFO,
                highest_address: 0,
                low_address: 0,
                description: "Configuration definition info",
            },
            address_space_all: AddressSpace {
                present: false,
                read_only: true,
                low_address_valid: false,
                address_space: ADDRESS_SPACE_ALL,
                highest_address: 0,
                low_address: 0,
                description: "All memory Info",
            },
            address_space_config_memory: AddressSpace {
                present: false,
                read_only: false,
                low_address_valid: false,
                address_space: ADDRESS_SPACE_CONFIGURATION_MEMORY,
                highest_address: 0,
                low_address: 0,
                description: "Configuration memory storage",
            },
        }
    }

    /// Looks up the descriptor for one of the three well-known spaces.
    pub fn address_space(&self, space: u8) -> Option<&AddressSpace> {
        match space {
            ADDRESS_SPACE_CONFIGURATION_DEFINITION_INFO => {
                Some(&self.address_space_configuration_definition)
            }
            ADDRESS_SPACE_ALL => Some(&self.address_space_all),
            ADDRESS_SPACE_CONFIGURATION_MEMORY => Some(&self.address_space_config_memory),
            _ => None,
        }
    }
}

/// A virtual OpenLCB node hosted on this bus interface.
#[derive(Debug, Clone)]
pub struct Node {
    id: u64,
    pub alias: u16,
    /// Alias held before the last conflict; the next one must differ
    pub previous_alias: u16,
    pub seed: u64,
    pub run_state: RunState,
    pub state: NodeState,
    pub timer_ticks: u8,
    pub producers: EventList<MAX_PRODUCER_COUNT>,
    pub consumers: EventList<MAX_CONSUMER_COUNT>,
    /// Kept until the datagram is acknowledged so it can be resent
    pub last_received_datagram: Option<MessageHandle>,
    parameters: &'static NodeParameters,
}

impl Node {
    fn new(id: u64, parameters: &'static NodeParameters) -> Self {
        let mut node = Self {
            id,
            alias: 0,
            previous_alias: 0,
            seed: 0,
            run_state: RunState::Init,
            state: NodeState::default(),
            timer_ticks: 0,
            producers: EventList::new(),
            consumers: EventList::new(),
            last_received_datagram: None,
            parameters,
        };

        let base = id << 16;
        for i in 0..parameters.consumer_count_autocreate as u64 {
            node.consumers.push(base + i);
        }
        for i in 0..parameters.producer_count_autocreate as u64 {
            node.producers.push(base + i);
        }

        node
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parameters(&self) -> &'static NodeParameters {
        self.parameters
    }

    pub fn is_permitted(&self) -> bool {
        self.state.permitted
    }

    pub fn is_addressed_by(&self, message: &MessageHeader) -> bool {
        self.alias != 0 && self.alias == message.dest_alias
    }

    /// Puts the node back to the start of alias allocation after a conflict.
    /// Returns the retained datagram, which the caller must free.
    pub fn reset_login(&mut self) -> Option<MessageHandle> {
        self.previous_alias = self.alias;
        self.alias = 0;
        self.state.permitted = false;
        self.state.initialized = false;
        self.state.duplicate_id_detected = false;
        self.state.firmware_upgrade_active = false;
        self.state.resend_datagram = false;
        self.run_state = RunState::GenerateSeed;
        self.producers.reset_enumerator();
        self.consumers.reset_enumerator();

        self.last_received_datagram.take()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeError {
    #[error("Tried to register a node id ({0:?}) outside of the valid range (1..=0xFFFFFFFFFFFF)")]
    InvalidNodeId(u64),
    #[error("A node with this id ({0:?}) is already registered")]
    DuplicateNodeId(u64),
    #[error("The node table is full")]
    TableFull,
}

/// Key selecting one of the independent enumeration cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EnumeratorKey(pub u8);

/// Cursor used by the main loop.
pub const MAIN_STATEMACHINE_ENUMERATOR_KEY: EnumeratorKey = EnumeratorKey(0);

/// All nodes hosted by a stack. Nodes are registered once and live as long
/// as the registry.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Vec<Node, NODE_BUFFER_DEPTH>,
    cursors: [usize; NODE_ENUMERATOR_KEYS],
}

impl NodeRegistry {
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            cursors: [0; NODE_ENUMERATOR_KEYS],
        }
    }

    pub fn register(
        &mut self,
        id: u64,
        parameters: &'static NodeParameters,
    ) -> Result<usize, NodeError> {
        if id == 0 || id > NODE_ID_MASK {
            return Err(NodeError::InvalidNodeId(id));
        }

        if self.nodes.iter().any(|node| node.id == id) {
            return Err(NodeError::DuplicateNodeId(id));
        }

        self.nodes
            .push(Node::new(id, parameters))
            .map_err(|_| NodeError::TableFull)?;

        Ok(self.nodes.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.nodes.get_mut(index)
    }

    /// Restarts the cursor for `key` and returns the index of the first node.
    pub fn first(&mut self, key: EnumeratorKey) -> Option<usize> {
        let cursor = self.cursors.get_mut(key.0 as usize)?;
        *cursor = 0;

        (!self.nodes.is_empty()).then_some(0)
    }

    /// Advances the cursor for `key`. `None` once every node was visited.
    pub fn next(&mut self, key: EnumeratorKey) -> Option<usize> {
        let cursor = self.cursors.get_mut(key.0 as usize)?;
        *cursor = (*cursor + 1).min(self.nodes.len());

        (*cursor < self.nodes.len()).then_some(*cursor)
    }

    /// Finds a permitted node by its current alias.
    pub fn find_by_alias(&self, alias: u16) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.state.permitted && node.alias == alias)
    }

    /// Finds a node by its current alias whether or not it is permitted yet.
    pub fn find_by_any_alias(&self, alias: u16) -> Option<usize> {
        if alias == 0 {
            return None;
        }

        self.nodes.iter().position(|node| node.alias == alias)
    }

    pub fn find_by_node_id(&self, id: u64) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.state.permitted && node.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    pub fn timer_tick(&mut self) {
        for node in self.nodes.iter_mut() {
            node.timer_ticks = node.timer_ticks.saturating_add(1);
        }
    }
}
