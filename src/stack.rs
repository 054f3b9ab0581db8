use crate::{
    alias_mapping::AliasMappingInfo,
    buffer_store::{CanHandle, PoolStats},
    driver::{CanDriver, NoLock, ResourceLock, StackEvents},
    frame::CanFrame,
    login::{self, LoginFrame},
    message::{MessageHandle, MessageMut, MessageRef, PayloadType},
    node::{Node, NodeError, NodeParameters, NodeRegistry, RunState, MAIN_STATEMACHINE_ENUMERATOR_KEY},
    resources::SharedResources,
    rx,
    tx::{self, FifoSink},
    defines::{MTI_DATAGRAM, MTI_STREAM_DATA},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackError {
    #[error("No free message buffer of type ({0:?})")]
    BufferUnavailable(PayloadType),
    #[error("The egress queue is full")]
    EgressFull,
    #[error("The message handle does not refer to an allocated message")]
    InvalidHandle,
    #[error("Node registration failed ({0:?})")]
    Node(#[from] NodeError),
}

/// Egress message being segmented into the CAN transmit FIFO.
#[derive(Debug, Clone, Copy)]
struct OutgoingMessage {
    handle: MessageHandle,
    start_index: usize,
    frames_sent: usize,
}

/// An OpenLCB CAN interface hosting one or more virtual nodes.
///
/// Received frames are passed in with [`receive_frame`](Self::receive_frame)
/// and the 100 ms time base with
/// [`timer_tick_100ms`](Self::timer_tick_100ms), typically from interrupt
/// handlers. [`run`](Self::run) is called from the main loop and does at
/// most one unit of work per call.
pub struct Stack<D, L = NoLock, E = ()> {
    driver: D,
    lock: L,
    events: E,
    resources: SharedResources,
    nodes: NodeRegistry,
    outgoing_can: Option<CanHandle>,
    login_frame: LoginFrame,
    outgoing_message: Option<OutgoingMessage>,
    current_node: Option<usize>,
}

impl<D: CanDriver> Stack<D> {
    /// Creates a stack without interrupt locking and without application hooks.
    pub fn with_driver(driver: D) -> Self {
        Self::new(driver, NoLock, ())
    }
}

impl<D: CanDriver, L: ResourceLock, E: StackEvents> Stack<D, L, E> {
    pub fn new(driver: D, lock: L, events: E) -> Self {
        Self {
            driver,
            lock,
            events,
            resources: SharedResources::new(),
            nodes: NodeRegistry::new(),
            outgoing_can: None,
            login_frame: None,
            outgoing_message: None,
            current_node: None,
        }
    }

    /// Adds a virtual node. It starts logging in on the next calls to
    /// [`run`](Self::run).
    pub fn register_node(
        &mut self,
        id: u64,
        parameters: &'static NodeParameters,
    ) -> Result<usize, StackError> {
        let index = self.nodes.register(id, parameters)?;
        info!("registered node {:#x}", id);

        Ok(index)
    }

    /* Interrupt context */

    /// Entry point for every frame received from the bus.
    pub fn receive_frame(&mut self, frame: &CanFrame) {
        self.events.on_receive(frame);
        rx::handle_frame(frame, &mut self.resources);
    }

    /// Must be called every 100 ms.
    pub fn timer_tick_100ms(&mut self) {
        self.nodes.timer_tick();
        rx::age_assemblies(&mut self.resources);
    }

    /* Main loop */

    /// Performs the highest priority pending piece of work. Returns true if
    /// anything was done.
    pub fn run(&mut self) -> bool {
        if self.process_duplicate_aliases() {
            return true;
        }

        if self.process_outgoing_can_frame() {
            return true;
        }

        if self.process_login_frame() {
            return true;
        }

        if self.process_egress_message() {
            return true;
        }

        if self.enumerate_first_node() {
            return true;
        }

        self.enumerate_next_node()
    }

    fn process_duplicate_aliases(&mut self) -> bool {
        self.lock.lock();

        let found = self.resources.alias_mappings.has_duplicate_flag();

        while let Some(mapping) = self.resources.alias_mappings.next_duplicate() {
            if let Some(node) = self
                .nodes
                .find_by_any_alias(mapping.alias)
                .and_then(|index| self.nodes.get_mut(index))
            {
                warn!(
                    "alias {:#x} of node {:#x} is in use elsewhere, restarting login",
                    mapping.alias,
                    node.id()
                );

                if let Some(datagram) = node.reset_login() {
                    self.resources.messages.free(datagram);
                }
            }

            if self
                .login_frame
                .is_some_and(|frame| frame.source_alias() == mapping.alias)
            {
                self.login_frame = None;
            }

            self.resources.alias_mappings.unregister(mapping.alias);
        }

        self.resources.alias_mappings.clear_has_duplicate_flag();

        self.lock.unlock();

        found
    }

    fn process_outgoing_can_frame(&mut self) -> bool {
        if self.outgoing_can.is_none() {
            self.lock.lock();
            self.outgoing_can = self.resources.can_tx_fifo.pop();
            self.lock.unlock();
        }

        let Some(handle) = self.outgoing_can else {
            return false;
        };

        let Some(frame) = self.resources.can_buffers.get(handle).copied() else {
            self.outgoing_can = None;
            return true;
        };

        if self.driver.transmit_frame(&frame) {
            self.driver.on_transmit(&frame);

            self.lock.lock();
            self.resources.can_buffers.free(handle);
            self.lock.unlock();

            self.outgoing_can = None;
        }

        true
    }

    fn process_login_frame(&mut self) -> bool {
        let Some(frame) = self.login_frame else {
            return false;
        };

        if self.driver.transmit_frame(&frame) {
            self.driver.on_transmit(&frame);
            self.login_frame = None;
        }

        true
    }

    fn process_egress_message(&mut self) -> bool {
        if self.outgoing_message.is_none() {
            self.lock.lock();
            let popped = self.resources.egress.pop();
            self.lock.unlock();

            let Some(handle) = popped else {
                return false;
            };

            let permitted = self.resources.messages.get(handle).is_some_and(|message| {
                self.resources
                    .alias_mappings
                    .find_by_alias(message.header.source_alias)
                    .is_some_and(|mapping| mapping.is_permitted)
            });

            if !permitted {
                warn!("dropping message from an alias that is not permitted");

                self.lock.lock();
                self.resources.messages.free(handle);
                self.lock.unlock();

                return true;
            }

            self.outgoing_message = Some(OutgoingMessage {
                handle,
                start_index: 0,
                frames_sent: 0,
            });
        }

        let Some(outgoing) = self.outgoing_message.as_mut() else {
            return false;
        };

        let Some(message) = self.resources.messages.get(outgoing.handle) else {
            self.outgoing_message = None;
            return true;
        };

        self.lock.lock();

        let mut sink = FifoSink {
            buffers: &mut self.resources.can_buffers,
            fifo: &mut self.resources.can_tx_fifo,
        };

        let queued = tx::transmit_next_frame(&mut sink, &message, &mut outgoing.start_index);
        if queued {
            outgoing.frames_sent += 1;
        }

        let complete = tx::is_transmit_complete(&message, outgoing.start_index, outgoing.frames_sent);
        let handle = outgoing.handle;

        if complete {
            self.resources.messages.free(handle);
            self.outgoing_message = None;
        }

        self.lock.unlock();

        queued
    }

    fn enumerate_first_node(&mut self) -> bool {
        if self.current_node.is_some() {
            return false;
        }

        let Some(index) = self.nodes.first(MAIN_STATEMACHINE_ENUMERATOR_KEY) else {
            return false;
        };

        self.current_node = Some(index);
        self.dispatch_node(index);

        true
    }

    fn enumerate_next_node(&mut self) -> bool {
        if self.current_node.is_none() {
            return false;
        }

        match self.nodes.next(MAIN_STATEMACHINE_ENUMERATOR_KEY) {
            Some(index) => {
                self.current_node = Some(index);
                self.dispatch_node(index);
                true
            }
            None => {
                self.current_node = None;
                false
            }
        }
    }

    fn dispatch_node(&mut self, index: usize) {
        let Some(node) = self.nodes.get_mut(index) else {
            return;
        };

        if node.run_state == RunState::Run {
            self.events.on_run_node(node);
            return;
        }

        self.lock.lock();
        login::run(
            node,
            &mut self.resources.alias_mappings,
            &mut self.events,
            &mut self.login_frame,
        );
        self.lock.unlock();
    }

    /* Messages */

    /// Claims an empty message buffer for the application to fill.
    pub fn allocate_message(&mut self, payload_type: PayloadType) -> Result<MessageHandle, StackError> {
        self.lock.lock();
        let handle = self.resources.messages.allocate(payload_type);
        self.lock.unlock();

        handle.ok_or(StackError::BufferUnavailable(payload_type))
    }

    pub fn message(&self, handle: MessageHandle) -> Option<MessageRef<'_>> {
        self.resources.messages.get(handle)
    }

    pub fn message_mut(&mut self, handle: MessageHandle) -> Option<MessageMut<'_>> {
        self.resources.messages.get_mut(handle)
    }

    pub fn free_message(&mut self, handle: MessageHandle) {
        self.lock.lock();
        self.resources.messages.free(handle);
        self.lock.unlock();
    }

    /// Next complete message received from the bus. The caller owns it until
    /// it is passed to [`free_message`](Self::free_message).
    pub fn ingress_pop(&mut self) -> Option<MessageHandle> {
        self.lock.lock();
        let handle = self.resources.ingress.pop();
        self.lock.unlock();

        handle
    }

    /// Queues a filled message for transmission. The stack frees it once the
    /// last frame was queued. On error the caller keeps ownership.
    pub fn egress_push(&mut self, handle: MessageHandle) -> Result<(), StackError> {
        if self.resources.messages.get(handle).is_none() {
            return Err(StackError::InvalidHandle);
        }

        self.lock.lock();
        let pushed = self.resources.egress.push(handle);
        self.lock.unlock();

        pushed.map_err(|_| StackError::EgressFull)
    }

    /// Builds a message from node `node_index` and queues it for
    /// transmission, choosing the smallest buffer that fits `payload`.
    pub fn send_message(
        &mut self,
        node_index: usize,
        mti: u16,
        dest_alias: u16,
        payload: &[u8],
    ) -> Result<(), StackError> {
        let (alias, node_id) = self
            .nodes
            .get(node_index)
            .map(|node| (node.alias, node.id()))
            .ok_or(StackError::InvalidHandle)?;

        let payload_type = match mti {
            MTI_DATAGRAM => PayloadType::Datagram,
            MTI_STREAM_DATA => PayloadType::Stream,
            _ if payload.len() <= PayloadType::Basic.capacity() => PayloadType::Basic,
            _ => PayloadType::Snip,
        };

        let handle = self.allocate_message(payload_type)?;

        if let Some(mut message) = self.resources.messages.get_mut(handle) {
            message.load(mti, alias, node_id, dest_alias, 0);
            message.append(payload);
        }

        self.egress_push(handle).inspect_err(|_| self.free_message(handle))
    }

    /* Inspection */

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.nodes.get_mut(index)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Index of the permitted node currently using `alias`.
    pub fn find_node_by_alias(&self, alias: u16) -> Option<usize> {
        self.nodes.find_by_alias(alias)
    }

    pub fn alias_mappings(&self) -> AliasMappingInfo<'_> {
        self.resources.alias_mappings.info()
    }

    pub fn can_buffer_stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.resources.can_buffers.allocated_count(),
            max_allocated: self.resources.can_buffers.max_allocated(),
            capacity: crate::config::CAN_BUFFER_DEPTH,
        }
    }

    pub fn message_buffer_stats(&self, payload_type: PayloadType) -> PoolStats {
        self.resources.messages.stats(payload_type)
    }

    pub fn clear_buffer_peaks(&mut self) {
        self.lock.lock();
        self.resources.can_buffers.clear_max();
        self.resources.messages.clear_max();
        self.lock.unlock();
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    pub fn resources(&self) -> &SharedResources {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut SharedResources {
        &mut self.resources
    }
}

#[cfg(test)]
mod tests {
    use heapless::Vec;

    use super::*;
    use crate::defines::*;

    static PARAMETERS: NodeParameters = NodeParameters::new(PSI_SIMPLE | PSI_DATAGRAM);

    #[derive(Default)]
    struct RecordingDriver {
        frames: Vec<CanFrame, 64>,
        busy: bool,
    }

    impl CanDriver for RecordingDriver {
        fn transmit_frame(&mut self, frame: &CanFrame) -> bool {
            !self.busy && self.frames.push(*frame).is_ok()
        }
    }

    #[derive(Default)]
    struct CountingLock {
        depth: i32,
        locks: usize,
    }

    impl ResourceLock for CountingLock {
        fn lock(&mut self) {
            assert_eq!(self.depth, 0, "lock is not reentrant");
            self.depth += 1;
            self.locks += 1;
        }

        fn unlock(&mut self) {
            self.depth -= 1;
        }
    }

    // A pass that ends the node enumeration reports no work, so keep going.
    fn run_until_idle<D: CanDriver, L: ResourceLock, E: StackEvents>(stack: &mut Stack<D, L, E>) {
        for _ in 0..200 {
            stack.run();
        }
    }

    fn logged_in_stack() -> Stack<RecordingDriver, CountingLock> {
        let mut stack = Stack::new(RecordingDriver::default(), CountingLock::default(), ());
        stack.register_node(0x0102_0304_0506, &PARAMETERS).unwrap();

        run_until_idle(&mut stack);
        for _ in 0..3 {
            stack.timer_tick_100ms();
        }
        run_until_idle(&mut stack);

        assert_eq!(stack.node(0).unwrap().run_state, RunState::Run);
        stack.driver_mut().frames.clear();
        stack
    }

    #[test]
    fn login_frames_reach_driver_in_order() {
        let stack = logged_in_stack();
        assert_eq!(stack.lock.depth, 0);
        assert!(stack.lock.locks > 0);

        let node = stack.node(0).unwrap();
        assert_eq!(node.alias, 0x755);
        assert!(node.state.permitted && node.state.initialized);
        assert_eq!(stack.find_node_by_alias(0x755), Some(0));
        assert!(stack.alias_mappings().mappings[0].is_permitted);
    }

    #[test]
    fn busy_driver_retains_frame() {
        let mut stack = Stack::with_driver(RecordingDriver {
            busy: true,
            ..Default::default()
        });
        stack.register_node(0x0102_0304_0506, &PARAMETERS).unwrap();

        for _ in 0..10 {
            stack.run();
        }
        assert_eq!(stack.node(0).unwrap().run_state, RunState::LoadCid06);
        assert!(stack.driver().frames.is_empty());

        stack.driver_mut().busy = false;
        assert!(stack.run());
        assert_eq!(
            stack.driver().frames[0],
            CanFrame::check_id(7, 0x755, 0x0102_0304_0506)
        );
    }

    #[test]
    fn control_replies_go_out_before_login_frames() {
        let mut stack = Stack::with_driver(RecordingDriver::default());
        stack.register_node(0x0102_0304_0506, &PARAMETERS).unwrap();

        for _ in 0..10 {
            if stack.login_frame.is_some() {
                break;
            }
            stack.run();
        }
        assert_eq!(
            stack.login_frame,
            Some(CanFrame::check_id(7, 0x755, 0x0102_0304_0506))
        );

        // someone else checks our tentative alias
        stack.receive_frame(&CanFrame::check_id(7, 0x755, 0x0909_0909_0909));
        stack.run();

        assert_eq!(stack.driver().frames[0], CanFrame::reserve_id(0x755));
    }

    #[test]
    fn duplicate_alias_restarts_login() {
        let mut stack = logged_in_stack();

        stack.receive_frame(&CanFrame::alias_map_definition(0x755, 0x0909_0909_0909));
        assert!(stack.run());

        let node = stack.node(0).unwrap();
        assert_eq!(node.run_state, RunState::GenerateSeed);
        assert!(!node.state.permitted && !node.state.initialized);
        assert!(stack.alias_mappings().mappings.is_empty());
        assert!(!stack.alias_mappings().has_duplicate_alias);

        // the AMR queued by the receive handler goes out next
        stack.run();
        assert_eq!(
            stack.driver().frames[0],
            CanFrame::alias_map_reset(0x755, 0x0102_0304_0506)
        );
    }

    #[test]
    fn egress_messages_are_segmented() {
        let mut stack = logged_in_stack();

        let payload: Vec<u8, 20> = (0..20).collect();
        stack.send_message(0, MTI_DATAGRAM, 0xBBB, &payload).unwrap();
        run_until_idle(&mut stack);

        let identifiers: Vec<u32, 4> = stack.driver().frames.iter().map(|f| f.identifier()).collect();
        assert_eq!(identifiers, [0x1BBBB755, 0x1CBBB755, 0x1DBBB755]);
        assert_eq!(stack.message_buffer_stats(PayloadType::Datagram).allocated, 0);
        assert_eq!(stack.can_buffer_stats().allocated, 0);
        assert_eq!(stack.lock.depth, 0);
    }

    #[test]
    fn egress_from_inhibited_alias_is_dropped() {
        let mut stack = Stack::with_driver(RecordingDriver::default());

        let handle = stack.allocate_message(PayloadType::Basic).unwrap();
        stack.message_mut(handle).unwrap().load(MTI_PC_EVENT_REPORT, 0x123, 0, 0, 0);
        stack.egress_push(handle).unwrap();

        assert!(stack.run());
        assert!(stack.message(handle).is_none());
        assert!(stack.driver().frames.is_empty());
    }

    #[test]
    fn message_api_errors() {
        let mut stack = Stack::with_driver(RecordingDriver::default());

        let handle = stack.allocate_message(PayloadType::Datagram).unwrap();
        stack.free_message(handle);
        assert_eq!(stack.egress_push(handle), Err(StackError::InvalidHandle));
        assert_eq!(
            stack.send_message(3, MTI_PC_EVENT_REPORT, 0, &[]),
            Err(StackError::InvalidHandle)
        );

        for _ in 0..crate::config::DATAGRAM_BUFFER_DEPTH {
            stack.allocate_message(PayloadType::Datagram).unwrap();
        }
        assert_eq!(
            stack.allocate_message(PayloadType::Datagram),
            Err(StackError::BufferUnavailable(PayloadType::Datagram))
        );

        assert_eq!(
            stack.register_node(0, &PARAMETERS),
            Err(StackError::Node(NodeError::InvalidNodeId(0)))
        );
    }

    #[test]
    fn received_messages_reach_ingress() {
        let mut stack = logged_in_stack();

        stack.receive_frame(&CanFrame::new(0x1A7556BE, &[0x20, 0x43]).unwrap());

        let handle = stack.ingress_pop().unwrap();
        let message = stack.message(handle).unwrap();
        assert_eq!(message.header.mti, MTI_DATAGRAM);
        assert_eq!(message.header.dest_alias, 0x755);
        assert_eq!(message.payload(), &[0x20, 0x43]);

        stack.free_message(handle);
        assert_eq!(stack.ingress_pop(), None);
    }
}
