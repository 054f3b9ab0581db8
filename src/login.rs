//! CAN alias allocation for a single node, followed by the Initialization
//! Complete announcement and the identification of its events.

use crate::{
    alias_mapping::AliasMappingTable,
    config::LOGIN_WAIT_TICKS,
    defines::*,
    driver::StackEvents,
    frame::CanFrame,
    node::{EventStatus, Node, RunState},
};

/// Advances the 48-bit alias seed by one step of the generator defined by
/// the OpenLCB Unique Identifiers standard.
///
/// The first register is read from the low 24 bits of `seed` and written
/// back to the high 24 bits. The CAN technical note loads it from the high
/// half; this variant is the one whose alias sequence for 0x010203040506
/// starts 0x755, 0xB63.
pub fn generate_seed(seed: u64) -> u64 {
    let mut lfsr1 = (seed & 0xFF_FFFF) as u32;
    let mut lfsr2 = ((seed >> 24) & 0xFF_FFFF) as u32;

    let temp1 = ((lfsr1 << 9) | ((lfsr2 >> 15) & 0x1FF)) & 0xFF_FFFF;
    let temp2 = (lfsr2 << 9) & 0xFF_FFFF;

    lfsr1 = lfsr1 + temp1 + 0x1B_0CA3;
    lfsr2 = lfsr2 + temp2 + 0x7A_4BA9;

    lfsr1 = (lfsr1 & 0xFF_FFFF) + ((lfsr2 & 0xFF00_0000) >> 24);
    lfsr2 &= 0xFF_FFFF;

    (((lfsr1 as u64) << 24) | lfsr2 as u64) & NODE_ID_MASK
}

/// Folds a seed into a 12-bit alias candidate. May return 0, which is not
/// a valid alias.
pub fn generate_alias(seed: u64) -> u16 {
    let lfsr2 = (seed & 0xFF_FFFF) as u32;
    let lfsr1 = ((seed >> 24) & 0xFF_FFFF) as u32;

    ((lfsr1 ^ lfsr2 ^ (lfsr1 >> 12) ^ (lfsr2 >> 12)) & 0x0FFF) as u16
}

/// Alias candidates in the order login tries them for a node on a bus with
/// no other claims. Zero is skipped, and so is a candidate equal to the one
/// before it.
#[derive(Debug, Clone)]
pub struct AliasCandidates {
    seed: u64,
    last: u16,
}

impl AliasCandidates {
    pub fn new(node_id: u64) -> Self {
        Self {
            seed: node_id & NODE_ID_MASK,
            last: 0,
        }
    }
}

impl Iterator for AliasCandidates {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        loop {
            let alias = generate_alias(self.seed);
            self.seed = generate_seed(self.seed);

            if alias != 0 && alias != self.last {
                self.last = alias;
                return Some(alias);
            }
        }
    }
}

/// Frame produced by the login state machine, waiting to be transmitted.
pub type LoginFrame = Option<CanFrame>;

/// Runs one step of the login sequence for `node`. At most one frame is
/// written to `outgoing`, and only when it is empty.
pub fn run<E: StackEvents>(
    node: &mut Node,
    alias_mappings: &mut AliasMappingTable,
    events: &mut E,
    outgoing: &mut LoginFrame,
) {
    if outgoing.is_some() {
        return;
    }

    match node.run_state {
        RunState::Init => {
            node.seed = node.id();
            node.run_state = RunState::GenerateAlias;
        }
        RunState::GenerateSeed => {
            node.seed = generate_seed(node.seed);
            node.run_state = RunState::GenerateAlias;
        }
        RunState::GenerateAlias => generate_node_alias(node, alias_mappings, events),
        RunState::LoadCid07 => {
            *outgoing = Some(CanFrame::check_id(7, node.alias, node.id()));
            node.run_state = RunState::LoadCid06;
        }
        RunState::LoadCid06 => {
            *outgoing = Some(CanFrame::check_id(6, node.alias, node.id()));
            node.run_state = RunState::LoadCid05;
        }
        RunState::LoadCid05 => {
            *outgoing = Some(CanFrame::check_id(5, node.alias, node.id()));
            node.run_state = RunState::LoadCid04;
        }
        RunState::LoadCid04 => {
            *outgoing = Some(CanFrame::check_id(4, node.alias, node.id()));
            node.timer_ticks = 0;
            node.run_state = RunState::Wait200ms;
        }
        RunState::Wait200ms => {
            if node.timer_ticks >= LOGIN_WAIT_TICKS {
                node.run_state = RunState::LoadRid;
            }
        }
        RunState::LoadRid => {
            *outgoing = Some(CanFrame::reserve_id(node.alias));
            node.run_state = RunState::LoadAmd;
        }
        RunState::LoadAmd => {
            *outgoing = Some(CanFrame::alias_map_definition(node.alias, node.id()));
            node.state.permitted = true;
            if let Some(mapping) = alias_mappings.find_by_alias_mut(node.alias) {
                mapping.is_permitted = true;
            }
            info!("node {:#x} permitted with alias {:#x}", node.id(), node.alias);
            node.run_state = RunState::LoadInitializationComplete;
        }
        RunState::LoadInitializationComplete => {
            let mti = if node.parameters().protocol_support & PSI_SIMPLE != 0 {
                MTI_INITIALIZATION_COMPLETE_SIMPLE
            } else {
                MTI_INITIALIZATION_COMPLETE
            };

            *outgoing = CanFrame::openlcb_message(mti, node.alias, &node_id_payload(node.id()));
            node.state.initialized = true;
            node.producers.reset_enumerator();
            node.consumers.reset_enumerator();
            node.run_state = RunState::LoadProducerEvents;
        }
        RunState::LoadProducerEvents => match node.producers.next_to_enumerate() {
            Some(event) => {
                let mti = match event.status {
                    EventStatus::Unknown => MTI_PRODUCER_IDENTIFIED_UNKNOWN,
                    EventStatus::Set => MTI_PRODUCER_IDENTIFIED_SET,
                    EventStatus::Clear => MTI_PRODUCER_IDENTIFIED_CLEAR,
                };

                *outgoing = CanFrame::openlcb_message(mti, node.alias, &event.id.to_be_bytes());
            }
            None => node.run_state = RunState::LoadConsumerEvents,
        },
        RunState::LoadConsumerEvents => match node.consumers.next_to_enumerate() {
            Some(event) => {
                let mti = match event.status {
                    EventStatus::Unknown => MTI_CONSUMER_IDENTIFIED_UNKNOWN,
                    EventStatus::Set => MTI_CONSUMER_IDENTIFIED_SET,
                    EventStatus::Clear => MTI_CONSUMER_IDENTIFIED_CLEAR,
                };

                *outgoing = CanFrame::openlcb_message(mti, node.alias, &event.id.to_be_bytes());
            }
            None => {
                debug!("node {:#x} running", node.id());
                node.run_state = RunState::Run;
            }
        },
        RunState::Run => {}
    }
}

fn node_id_payload(node_id: u64) -> [u8; 6] {
    let bytes = node_id.to_be_bytes();

    [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]
}

/// Picks the next usable alias from the seed. Zero and the alias lost in the
/// last conflict are skipped, as is any alias held by another of our nodes.
fn generate_node_alias<E: StackEvents>(
    node: &mut Node,
    alias_mappings: &mut AliasMappingTable,
    events: &mut E,
) {
    let mut alias = generate_alias(node.seed);

    while alias == 0
        || alias == node.previous_alias
        || alias_mappings
            .find_by_alias(alias)
            .is_some_and(|mapping| mapping.node_id != node.id())
    {
        node.seed = generate_seed(node.seed);
        alias = generate_alias(node.seed);
    }

    if let Err(error) = alias_mappings.register(alias, node.id()) {
        warn!("could not map alias {:#x}: {}", alias, error);
        return;
    }

    debug!("node {:#x} trying alias {:#x}", node.id(), alias);

    events.on_alias_change(alias, node.id());
    node.alias = alias;
    node.run_state = RunState::LoadCid07;
}

#[cfg(test)]
mod tests {
    use heapless::Vec;

    use super::*;
    use crate::node::{NodeParameters, NodeRegistry};

    static PARAMETERS: NodeParameters = NodeParameters {
        producer_count_autocreate: 2,
        consumer_count_autocreate: 1,
        ..NodeParameters::new(PSI_DATAGRAM | PSI_EVENT_EXCHANGE)
    };

    static SIMPLE: NodeParameters = NodeParameters::new(PSI_SIMPLE);

    #[derive(Default)]
    struct AliasLog {
        changes: Vec<(u16, u64), 8>,
    }

    impl StackEvents for AliasLog {
        fn on_alias_change(&mut self, alias: u16, node_id: u64) {
            self.changes.push((alias, node_id)).unwrap();
        }
    }

    #[test]
    fn alias_generator_never_repeats_early() {
        let mut seed = 0x0102_0304_0506;
        let mut aliases: Vec<u16, 16> = Vec::new();

        for _ in 0..16 {
            let alias = generate_alias(seed);
            assert!(!aliases.contains(&alias));
            aliases.push(alias).unwrap();
            seed = generate_seed(seed);
        }

        assert_eq!(aliases[0], 0x755);
    }

    #[test]
    fn seed_producing_zero_alias() {
        assert_eq!(generate_alias(0x0501_0100_0151), 0);
        assert_eq!(generate_alias(generate_seed(0x0501_0100_0151)), 0x89A);
    }

    fn step(
        registry: &mut NodeRegistry,
        mappings: &mut AliasMappingTable,
        events: &mut AliasLog,
    ) -> Option<CanFrame> {
        let mut outgoing = None;
        run(registry.get_mut(0).unwrap(), mappings, events, &mut outgoing);
        outgoing
    }

    #[test]
    fn full_login_sequence() {
        let mut registry = NodeRegistry::new();
        let mut mappings = AliasMappingTable::new();
        let mut events = AliasLog::default();
        registry.register(0x0102_0304_0506, &PARAMETERS).unwrap();

        assert_eq!(step(&mut registry, &mut mappings, &mut events), None);
        assert_eq!(step(&mut registry, &mut mappings, &mut events), None);
        assert_eq!(events.changes, [(0x755, 0x0102_0304_0506)]);
        assert!(!mappings.find_by_alias(0x755).unwrap().is_permitted);

        let cids: Vec<u32, 4> = (0..4)
            .map(|_| step(&mut registry, &mut mappings, &mut events).unwrap().identifier())
            .collect();
        assert_eq!(cids, [0x17010755, 0x16203755, 0x15040755, 0x14506755]);

        // waits for more than 200ms
        for _ in 0..LOGIN_WAIT_TICKS {
            assert_eq!(step(&mut registry, &mut mappings, &mut events), None);
            registry.timer_tick();
        }

        assert_eq!(step(&mut registry, &mut mappings, &mut events), None);
        assert_eq!(
            step(&mut registry, &mut mappings, &mut events),
            Some(CanFrame::reserve_id(0x755))
        );
        assert_eq!(
            step(&mut registry, &mut mappings, &mut events),
            Some(CanFrame::alias_map_definition(0x755, 0x0102_0304_0506))
        );
        assert!(registry.get(0).unwrap().state.permitted);
        assert!(mappings.find_by_alias(0x755).unwrap().is_permitted);

        let initialization_complete = step(&mut registry, &mut mappings, &mut events).unwrap();
        assert_eq!(initialization_complete.identifier(), 0x19100755);
        assert_eq!(initialization_complete.payload(), &[1, 2, 3, 4, 5, 6]);
        assert!(registry.get(0).unwrap().state.initialized);

        let producer = step(&mut registry, &mut mappings, &mut events).unwrap();
        assert_eq!(producer.identifier(), 0x19547755);
        assert_eq!(producer.payload(), &[1, 2, 3, 4, 5, 6, 0, 0]);
        let producer = step(&mut registry, &mut mappings, &mut events).unwrap();
        assert_eq!(producer.payload(), &[1, 2, 3, 4, 5, 6, 0, 1]);

        assert_eq!(step(&mut registry, &mut mappings, &mut events), None);
        let consumer = step(&mut registry, &mut mappings, &mut events).unwrap();
        assert_eq!(consumer.identifier(), 0x194C7755);

        assert_eq!(step(&mut registry, &mut mappings, &mut events), None);
        assert_eq!(registry.get(0).unwrap().run_state, RunState::Run);
    }

    #[test]
    fn simple_node_announces_simple_initialization() {
        let mut registry = NodeRegistry::new();
        let mut mappings = AliasMappingTable::new();
        let mut events = AliasLog::default();
        registry.register(0x0102_0304_0506, &SIMPLE).unwrap();
        registry.get_mut(0).unwrap().alias = 0x755;
        registry.get_mut(0).unwrap().run_state = RunState::LoadInitializationComplete;

        let frame = step(&mut registry, &mut mappings, &mut events).unwrap();
        assert_eq!(frame.identifier(), 0x19101755);

        // no events: straight through to run
        assert_eq!(step(&mut registry, &mut mappings, &mut events), None);
        assert_eq!(step(&mut registry, &mut mappings, &mut events), None);
        assert_eq!(registry.get(0).unwrap().run_state, RunState::Run);
    }

    #[test]
    fn zero_alias_is_skipped() {
        let mut registry = NodeRegistry::new();
        let mut mappings = AliasMappingTable::new();
        let mut events = AliasLog::default();
        registry.register(0x0501_0100_0151, &SIMPLE).unwrap();

        step(&mut registry, &mut mappings, &mut events);
        step(&mut registry, &mut mappings, &mut events);

        assert_eq!(registry.get(0).unwrap().alias, 0x89A);
        assert_eq!(registry.get(0).unwrap().run_state, RunState::LoadCid07);
    }

    #[test]
    fn alias_held_by_sibling_is_skipped() {
        let mut registry = NodeRegistry::new();
        let mut mappings = AliasMappingTable::new();
        let mut events = AliasLog::default();
        registry.register(0x0102_0304_0506, &SIMPLE).unwrap();
        mappings.register(0x755, 0x0102_0304_0999).unwrap();

        step(&mut registry, &mut mappings, &mut events);
        step(&mut registry, &mut mappings, &mut events);

        assert_eq!(registry.get(0).unwrap().alias, 0xB63);
        assert_eq!(events.changes, [(0xB63, 0x0102_0304_0506)]);
    }

    #[test]
    fn lost_alias_is_not_retried() {
        const NODE_ID: u64 = 0xE8EE_23A9_A9DB;

        let mut registry = NodeRegistry::new();
        let mut mappings = AliasMappingTable::new();
        let mut events = AliasLog::default();
        registry.register(NODE_ID, &SIMPLE).unwrap();

        step(&mut registry, &mut mappings, &mut events);
        step(&mut registry, &mut mappings, &mut events);
        assert_eq!(registry.get(0).unwrap().alias, 0x3EC);

        // the next seed folds to 0x3EC again
        assert_eq!(generate_alias(generate_seed(NODE_ID)), 0x3EC);

        registry.get_mut(0).unwrap().reset_login();
        mappings.unregister(0x3EC);

        step(&mut registry, &mut mappings, &mut events);
        step(&mut registry, &mut mappings, &mut events);

        assert_eq!(registry.get(0).unwrap().alias, 0xC0D);
        assert_eq!(events.changes, [(0x3EC, NODE_ID), (0xC0D, NODE_ID)]);
    }

    #[test]
    fn alias_candidates_follow_login() {
        let candidates: Vec<u16, 2> = AliasCandidates::new(0x0102_0304_0506).take(2).collect();
        assert_eq!(candidates, [0x755, 0xB63]);

        let candidates: Vec<u16, 2> = AliasCandidates::new(0xE8EE_23A9_A9DB).take(2).collect();
        assert_eq!(candidates, [0x3EC, 0xC0D]);

        assert_eq!(AliasCandidates::new(0x0501_0100_0151).next(), Some(0x89A));
    }

    #[test]
    fn pending_frame_blocks_progress() {
        let mut registry = NodeRegistry::new();
        let mut mappings = AliasMappingTable::new();
        let mut events = AliasLog::default();
        registry.register(0x0102_0304_0506, &SIMPLE).unwrap();

        let mut outgoing = Some(CanFrame::reserve_id(0x123));
        run(registry.get_mut(0).unwrap(), &mut mappings, &mut events, &mut outgoing);

        assert_eq!(registry.get(0).unwrap().run_state, RunState::Init);
        assert_eq!(outgoing, Some(CanFrame::reserve_id(0x123)));
    }
}
