//! Splits OpenLCB messages into CAN frames, one frame per call.
//!
//! Every function takes a cursor into the message payload owned by the
//! caller. The cursor only moves when the driver accepted the frame, so a
//! failed call is simply repeated later.

use crate::{
    buffer_store::CanBufferStore,
    defines::*,
    driver::CanDriver,
    fifo::CanTxFifo,
    frame::{CanFrame, OpenLcbFrameType},
    message::MessageRef,
};

const ADDRESSED_DATA_BYTES: usize = 6;
const FRAME_DATA_BYTES: usize = 8;

fn chunk<'a>(message: &MessageRef<'a>, start_index: usize, max: usize) -> &'a [u8] {
    let payload = message.payload();
    let start = start_index.min(payload.len());
    let end = (start + max).min(payload.len());

    &payload[start..end]
}

fn send<D: CanDriver>(driver: &mut D, frame: &CanFrame, start_index: &mut usize, len: usize) -> bool {
    if !driver.transmit_frame(frame) {
        return false;
    }

    *start_index += len;
    driver.on_transmit(frame);

    true
}

/// Sends the next frame of a message whose MTI carries a destination. The
/// destination alias and framing bits take the first two payload bytes.
pub fn transmit_addressed_frame<D: CanDriver>(
    driver: &mut D,
    message: &MessageRef,
    start_index: &mut usize,
) -> bool {
    let count = message.header.payload_count as usize;
    let data = chunk(message, *start_index, ADDRESSED_DATA_BYTES);

    let framing = if count <= ADDRESSED_DATA_BYTES {
        MULTIFRAME_ONLY
    } else if *start_index < ADDRESSED_DATA_BYTES {
        MULTIFRAME_FIRST
    } else if *start_index + data.len() < count {
        MULTIFRAME_MIDDLE
    } else {
        MULTIFRAME_FINAL
    };

    let dest_alias = message.header.dest_alias;
    let mut payload = [0u8; 8];
    payload[0] = framing | ((dest_alias >> 8) & 0x0F) as u8;
    payload[1] = dest_alias as u8;
    payload[2..2 + data.len()].copy_from_slice(data);

    let Some(frame) = CanFrame::openlcb_message(
        message.header.mti,
        message.header.source_alias,
        &payload[..2 + data.len()],
    ) else {
        return false;
    };

    send(driver, &frame, start_index, data.len())
}

/// Sends a global message. Only the first eight bytes are ever sent; global
/// messages do not span frames.
pub fn transmit_unaddressed_frame<D: CanDriver>(
    driver: &mut D,
    message: &MessageRef,
    start_index: &mut usize,
) -> bool {
    let data = chunk(message, *start_index, FRAME_DATA_BYTES);

    let Some(frame) =
        CanFrame::openlcb_message(message.header.mti, message.header.source_alias, data)
    else {
        return false;
    };

    send(driver, &frame, start_index, data.len())
}

/// Sends the next frame of an event report with payload. The CAN MTI marks
/// first/middle/last. A report carries at least its event id, so it always
/// spans a first and a last frame, the last one empty when the data ran out
/// on a frame boundary.
pub fn transmit_event_with_payload_frame<D: CanDriver>(
    driver: &mut D,
    message: &MessageRef,
    start_index: &mut usize,
) -> bool {
    let count = message.header.payload_count as usize;
    let data = chunk(message, *start_index, FRAME_DATA_BYTES);

    let can_mti = if *start_index == 0 && count > 0 {
        CAN_MTI_PCER_WITH_PAYLOAD_FIRST
    } else if *start_index + data.len() < count {
        CAN_MTI_PCER_WITH_PAYLOAD_MIDDLE
    } else {
        CAN_MTI_PCER_WITH_PAYLOAD_LAST
    };

    let Some(frame) = CanFrame::openlcb_message(can_mti, message.header.source_alias, data)
    else {
        return false;
    };

    send(driver, &frame, start_index, data.len())
}

/// Sends the next frame of a datagram. The frame type in the identifier
/// marks only/first/middle/final.
pub fn transmit_datagram_frame<D: CanDriver>(
    driver: &mut D,
    message: &MessageRef,
    start_index: &mut usize,
) -> bool {
    let count = message.header.payload_count as usize;
    let data = chunk(message, *start_index, FRAME_DATA_BYTES);

    let frame_type = if count <= FRAME_DATA_BYTES {
        OpenLcbFrameType::DatagramOnly
    } else if *start_index < FRAME_DATA_BYTES {
        OpenLcbFrameType::DatagramFirst
    } else if *start_index + data.len() < count {
        OpenLcbFrameType::DatagramMiddle
    } else {
        OpenLcbFrameType::DatagramFinal
    };

    let Some(frame) = CanFrame::openlcb(
        frame_type,
        message.header.dest_alias,
        message.header.source_alias,
        data,
    ) else {
        return false;
    };

    send(driver, &frame, start_index, data.len())
}

/// Sends the next eight bytes of stream data to the destination alias.
#[cfg(feature = "stream")]
pub fn transmit_stream_frame<D: CanDriver>(
    driver: &mut D,
    message: &MessageRef,
    start_index: &mut usize,
) -> bool {
    let data = chunk(message, *start_index, FRAME_DATA_BYTES);

    let Some(frame) = CanFrame::openlcb(
        OpenLcbFrameType::Stream,
        message.header.dest_alias,
        message.header.source_alias,
        data,
    ) else {
        return false;
    };

    send(driver, &frame, start_index, data.len())
}

/// Stream support is compiled out: the data is consumed without sending
/// anything.
#[cfg(not(feature = "stream"))]
pub fn transmit_stream_frame<D: CanDriver>(
    _driver: &mut D,
    message: &MessageRef,
    start_index: &mut usize,
) -> bool {
    trace!("stream support disabled, dropping stream data");
    *start_index = message.header.payload_count as usize;

    true
}

/// Sends the next frame of `message`, picking the framing from its MTI.
pub fn transmit_next_frame<D: CanDriver>(
    driver: &mut D,
    message: &MessageRef,
    start_index: &mut usize,
) -> bool {
    match message.header.mti {
        MTI_DATAGRAM => transmit_datagram_frame(driver, message, start_index),
        MTI_PC_EVENT_REPORT_WITH_PAYLOAD => {
            transmit_event_with_payload_frame(driver, message, start_index)
        }
        MTI_STREAM_DATA => transmit_stream_frame(driver, message, start_index),
        _ if message.header.is_addressed() => {
            transmit_addressed_frame(driver, message, start_index)
        }
        _ => transmit_unaddressed_frame(driver, message, start_index),
    }
}

/// True once every frame of `message` has gone out. `frames_sent` counts the
/// successful calls so far, which lets empty messages send their one frame.
pub fn is_transmit_complete(message: &MessageRef, start_index: usize, frames_sent: usize) -> bool {
    if frames_sent == 0 {
        return false;
    }

    let count = message.header.payload_count as usize;

    match message.header.mti {
        MTI_PC_EVENT_REPORT_WITH_PAYLOAD => start_index >= count && (frames_sent >= 2 || count == 0),
        MTI_DATAGRAM | MTI_STREAM_DATA => start_index >= count,
        _ if message.header.is_addressed() => start_index >= count,
        _ => true,
    }
}

/// [`CanDriver`] that queues frames on the CAN transmit FIFO instead of the
/// bus. Egress messages are segmented through it so every frame leaves in
/// FIFO order.
pub struct FifoSink<'a> {
    pub buffers: &'a mut CanBufferStore,
    pub fifo: &'a mut CanTxFifo,
}

impl CanDriver for FifoSink<'_> {
    fn transmit_frame(&mut self, frame: &CanFrame) -> bool {
        if self.fifo.is_full() {
            return false;
        }

        let Some(handle) = self.buffers.allocate_with(*frame) else {
            return false;
        };

        match self.fifo.push(handle) {
            Ok(()) => true,
            Err(handle) => {
                self.buffers.free(handle);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use heapless::Vec;

    use super::*;
    use crate::message::{Message, MessageMut};

    #[derive(Default)]
    struct RecordingDriver {
        frames: Vec<CanFrame, 64>,
        transmitted: usize,
        busy: bool,
    }

    impl CanDriver for RecordingDriver {
        fn transmit_frame(&mut self, frame: &CanFrame) -> bool {
            if self.busy {
                return false;
            }

            self.frames.push(*frame).is_ok()
        }

        fn on_transmit(&mut self, _frame: &CanFrame) {
            self.transmitted += 1;
        }
    }

    fn build<'a, const N: usize>(
        message: &'a mut Message<N>,
        mti: u16,
        dest_alias: u16,
        payload: &[u8],
    ) -> MessageMut<'a> {
        let mut view = message.view_mut();
        view.load(mti, 0xAAA, 0, dest_alias, 0);
        view.append(payload);
        view
    }

    fn send_all(driver: &mut RecordingDriver, message: &MessageRef) {
        let mut start_index = 0;
        let mut frames_sent = 0;

        while !is_transmit_complete(message, start_index, frames_sent) {
            assert!(transmit_next_frame(driver, message, &mut start_index));
            frames_sent += 1;
        }
    }

    #[test]
    fn datagram_segmentation() {
        let mut message = Message::<72>::default();
        let payload: Vec<u8, 31> = (0..31).collect();
        build(&mut message, MTI_DATAGRAM, 0xBBB, &payload);

        let mut driver = RecordingDriver::default();
        send_all(&mut driver, &message.view());

        let identifiers: Vec<u32, 8> = driver.frames.iter().map(|f| f.identifier()).collect();
        assert_eq!(identifiers, [0x1BBBBAAA, 0x1CBBBAAA, 0x1CBBBAAA, 0x1DBBBAAA]);
        assert_eq!(driver.frames[0].payload(), &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(driver.frames[2].payload(), &[16, 17, 18, 19, 20, 21, 22, 23]);
        assert_eq!(driver.frames[3].payload(), &[24, 25, 26, 27, 28, 29, 30]);
        assert_eq!(driver.transmitted, 4);
    }

    #[test]
    fn short_datagram_is_single_frame() {
        let mut message = Message::<72>::default();
        build(&mut message, MTI_DATAGRAM, 0xBBB, &[0x20, 0x43]);

        let mut driver = RecordingDriver::default();
        send_all(&mut driver, &message.view());

        assert_eq!(driver.frames.len(), 1);
        assert_eq!(driver.frames[0].identifier(), 0x1ABBBAAA);
    }

    #[test]
    fn addressed_message_framing() {
        let mut message = Message::<256>::default();
        build(&mut message, MTI_SIMPLE_NODE_INFO_REPLY, 0x6BE, b"\x04acme\0widget\0");

        let mut driver = RecordingDriver::default();
        send_all(&mut driver, &message.view());

        assert_eq!(driver.frames.len(), 3);
        for frame in driver.frames.iter() {
            assert_eq!(frame.identifier(), 0x19A08AAA);
            assert_eq!(frame.dest_alias(), 0x6BE);
        }
        assert_eq!(driver.frames[0].payload(), &[0x16, 0xBE, 4, b'a', b'c', b'm', b'e', 0]);
        assert_eq!(driver.frames[1].payload(), &[0x36, 0xBE, b'w', b'i', b'd', b'g', b'e', b't']);
        assert_eq!(driver.frames[2].payload(), &[0x26, 0xBE, 0]);
    }

    #[test]
    fn short_addressed_message() {
        let mut message = Message::<16>::default();
        build(&mut message, MTI_VERIFY_NODE_ID_ADDRESSED, 0x6BE, &[]);

        let mut driver = RecordingDriver::default();
        send_all(&mut driver, &message.view());

        assert_eq!(driver.frames.len(), 1);
        assert_eq!(driver.frames[0].identifier(), 0x19488AAA);
        assert_eq!(driver.frames[0].payload(), &[0x06, 0xBE]);
    }

    #[test]
    fn unaddressed_message_sends_one_frame() {
        let mut message = Message::<16>::default();
        build(&mut message, MTI_PC_EVENT_REPORT, 0, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        let mut driver = RecordingDriver::default();
        send_all(&mut driver, &message.view());

        assert_eq!(driver.frames.len(), 1);
        assert_eq!(driver.frames[0].identifier(), 0x195B4AAA);
        assert_eq!(driver.frames[0].payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn event_report_with_payload_framing() {
        let mut message = Message::<256>::default();
        let payload: Vec<u8, 20> = (0..20).collect();
        build(&mut message, MTI_PC_EVENT_REPORT_WITH_PAYLOAD, 0, &payload);

        let mut driver = RecordingDriver::default();
        send_all(&mut driver, &message.view());

        let identifiers: Vec<u32, 8> = driver.frames.iter().map(|f| f.identifier()).collect();
        assert_eq!(identifiers, [0x19F16AAA, 0x19F15AAA, 0x19F14AAA]);
        assert_eq!(driver.frames[1].payload(), &[8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(driver.frames[2].payload(), &[16, 17, 18, 19]);
    }

    #[test]
    fn event_report_filling_one_frame_ends_with_empty_last() {
        let mut message = Message::<256>::default();
        build(&mut message, MTI_PC_EVENT_REPORT_WITH_PAYLOAD, 0, &[5, 1, 1, 1, 7, 0xFF, 0, 0x25]);

        let mut driver = RecordingDriver::default();
        send_all(&mut driver, &message.view());

        assert_eq!(driver.frames.len(), 2);
        assert_eq!(driver.frames[0].identifier(), 0x19F16AAA);
        assert_eq!(driver.frames[0].payload(), &[5, 1, 1, 1, 7, 0xFF, 0, 0x25]);
        assert_eq!(driver.frames[1].identifier(), 0x19F14AAA);
        assert!(driver.frames[1].payload().is_empty());
    }

    #[test]
    fn busy_driver_keeps_cursor() {
        let mut message = Message::<72>::default();
        build(&mut message, MTI_DATAGRAM, 0xBBB, &[0; 20]);
        let view = message.view();

        let mut driver = RecordingDriver {
            busy: true,
            ..Default::default()
        };
        let mut start_index = 8;

        assert!(!transmit_next_frame(&mut driver, &view, &mut start_index));
        assert_eq!(start_index, 8);
        assert_eq!(driver.transmitted, 0);

        driver.busy = false;
        assert!(transmit_next_frame(&mut driver, &view, &mut start_index));
        assert_eq!(start_index, 16);
        assert_eq!(driver.transmitted, 1);
    }

    #[test]
    fn fifo_sink_applies_backpressure() {
        let mut buffers = CanBufferStore::new();
        let mut fifo = CanTxFifo::new();
        let mut sink = FifoSink {
            buffers: &mut buffers,
            fifo: &mut fifo,
        };

        let frame = CanFrame::reserve_id(0xAAA);
        for _ in 0..crate::config::CAN_BUFFER_DEPTH {
            assert!(sink.transmit_frame(&frame));
        }
        assert!(!sink.transmit_frame(&frame));
        assert_eq!(fifo.count(), crate::config::CAN_BUFFER_DEPTH);
    }
}
