use crate::{
    alias_mapping::AliasMappingTable,
    assembly::AssemblyList,
    buffer_store::{CanBufferStore, OpenLcbBufferStore},
    fifo::{CanTxFifo, MessageFifo},
    frame::CanFrame,
    message::MessageHandle,
};

/// Everything the receive interrupt, the timer interrupt and the main loop
/// touch. The main loop only mutates it between `lock` and `unlock`.
#[derive(Debug, Default)]
pub struct SharedResources {
    pub can_buffers: CanBufferStore,
    pub can_tx_fifo: CanTxFifo,
    pub messages: OpenLcbBufferStore,
    pub ingress: MessageFifo,
    pub egress: MessageFifo,
    pub assembly: AssemblyList,
    pub alias_mappings: AliasMappingTable,
}

impl SharedResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `frame` into a CAN buffer and queues it for transmission.
    /// Returns false if no buffer was available.
    pub fn queue_frame(&mut self, frame: CanFrame) -> bool {
        let Some(handle) = self.can_buffers.allocate_with(frame) else {
            warn!("no CAN buffer for frame {:#x}", frame.identifier());
            return false;
        };

        if let Err(handle) = self.can_tx_fifo.push(handle) {
            self.can_buffers.free(handle);
            return false;
        }

        true
    }

    /// Hands a complete message to the application, freeing it if the
    /// ingress queue is full.
    pub fn push_ingress(&mut self, handle: MessageHandle) -> bool {
        if let Err(handle) = self.ingress.push(handle) {
            warn!("ingress queue full, dropping message");
            self.messages.free(handle);
            return false;
        }

        true
    }
}
