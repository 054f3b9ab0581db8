use crate::{frame::CanFrame, node::Node};

/// The CAN hardware as seen by the stack.
pub trait CanDriver {
    /// Queues `frame` on the bus. Returns false when the hardware transmit
    /// buffer is full so the stack retries the same frame on the next pass.
    fn transmit_frame(&mut self, frame: &CanFrame) -> bool;

    /// Called after every frame the driver accepted.
    fn on_transmit(&mut self, _frame: &CanFrame) {}
}

impl<T: CanDriver + ?Sized> CanDriver for &mut T {
    fn transmit_frame(&mut self, frame: &CanFrame) -> bool {
        (**self).transmit_frame(frame)
    }

    fn on_transmit(&mut self, frame: &CanFrame) {
        (**self).on_transmit(frame)
    }
}

/// Guards the state shared between the main loop and the receive and timer
/// interrupts. On bare metal this masks those interrupts, on a hosted port it
/// takes a mutex.
pub trait ResourceLock {
    fn lock(&mut self);
    fn unlock(&mut self);
}

/// For single context use and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLock;

impl ResourceLock for NoLock {
    fn lock(&mut self) {}
    fn unlock(&mut self) {}
}

/// Optional application hooks. Every method defaults to doing nothing.
pub trait StackEvents {
    /// Every frame handed to the stack, before it is processed.
    fn on_receive(&mut self, _frame: &CanFrame) {}

    /// A node picked a new tentative alias.
    fn on_alias_change(&mut self, _alias: u16, _node_id: u64) {}

    /// A node that finished login gets a turn of the main loop.
    fn on_run_node(&mut self, _node: &mut Node) {}
}

impl StackEvents for () {}

/// Adapts a non-blocking [`embedded_can`] driver.
#[derive(Debug)]
pub struct NbCanDriver<T> {
    can: T,
}

impl<T: embedded_can::nb::Can> NbCanDriver<T> {
    pub fn new(can: T) -> Self {
        Self { can }
    }

    pub fn inner(&mut self) -> &mut T {
        &mut self.can
    }

    pub fn into_inner(self) -> T {
        self.can
    }

    /// Reads one frame if the peripheral has one, converting it into a
    /// [`CanFrame`]. Standard and remote frames are discarded.
    pub fn receive(&mut self) -> Option<CanFrame> {
        use embedded_can::Frame;

        let frame = self.can.receive().ok()?;
        if frame.is_remote_frame() {
            return None;
        }

        match frame.id() {
            embedded_can::Id::Extended(id) => CanFrame::new(id.as_raw(), frame.data()),
            embedded_can::Id::Standard(_) => None,
        }
    }
}

impl<T: embedded_can::nb::Can> CanDriver for NbCanDriver<T> {
    fn transmit_frame(&mut self, frame: &CanFrame) -> bool {
        use embedded_can::Frame;

        let Some(hal_frame) = T::Frame::new(Frame::id(frame), frame.payload()) else {
            return false;
        };

        match self.can.transmit(&hal_frame) {
            // a displaced lower priority frame is dropped
            Ok(_) => true,
            Err(nb::Error::WouldBlock) => false,
            Err(nb::Error::Other(_)) => false,
        }
    }
}
