//! Turns received CAN frames into OpenLCB messages and answers the CAN
//! control frames of the alias allocation protocol.

use heapless::Vec;

use crate::{
    assembly::{AssemblyError, AssemblyKey},
    config::{ALIAS_MAPPING_BUFFER_DEPTH, ASSEMBLY_TIMEOUT_TICKS},
    defines::*,
    frame::{CanFrame, ControlFrameKind, FrameKind, OpenLcbFrameType},
    message::{MessageHandle, PayloadType},
    resources::SharedResources,
};

/// First payload byte holding message data in addressed frames, after the
/// framing bits and destination alias.
const ADDRESSED_DATA_OFFSET: usize = 2;

/// A complete SNIP reply carries six null terminated fields.
const SNIP_NULL_COUNT: usize = 6;

/// Processes one frame received from the bus.
pub fn handle_frame(frame: &CanFrame, resources: &mut SharedResources) {
    match frame.kind() {
        FrameKind::CheckId(4..=7) => handle_cid(frame, resources),
        FrameKind::CheckId(_) => {}
        FrameKind::Control(kind) => match kind {
            ControlFrameKind::ReserveId => handle_rid(frame, resources),
            ControlFrameKind::AliasMapDefinition => handle_amd(frame, resources),
            ControlFrameKind::AliasMapEnquiry => handle_ame(frame, resources),
            ControlFrameKind::AliasMapReset => handle_amr(frame, resources),
            ControlFrameKind::ErrorInformationReport0
            | ControlFrameKind::ErrorInformationReport1
            | ControlFrameKind::ErrorInformationReport2
            | ControlFrameKind::ErrorInformationReport3 => handle_eir(frame, resources),
        },
        FrameKind::UnknownControl(field) => {
            trace!("ignoring control frame {:#x}", field);
        }
        FrameKind::OpenLcb(frame_type) => handle_openlcb_frame(frame, frame_type, resources),
    }
}

fn handle_openlcb_frame(
    frame: &CanFrame,
    frame_type: OpenLcbFrameType,
    resources: &mut SharedResources,
) {
    match frame_type {
        OpenLcbFrameType::Standard if frame.is_addressed_message() => {
            if !is_for_us(frame, resources) {
                return;
            }

            let is_snip = frame.openlcb_mti() == MTI_SIMPLE_NODE_INFO_REPLY;

            match frame.framing_bits() {
                MULTIFRAME_ONLY if is_snip => handle_legacy_snip(frame, resources),
                MULTIFRAME_ONLY => {
                    handle_single_frame(frame, ADDRESSED_DATA_OFFSET, PayloadType::Basic, resources)
                }
                MULTIFRAME_FIRST => {
                    let payload_type = if is_snip {
                        PayloadType::Snip
                    } else {
                        PayloadType::Basic
                    };

                    handle_first_frame(frame, ADDRESSED_DATA_OFFSET, payload_type, resources)
                }
                MULTIFRAME_MIDDLE => handle_middle_frame(frame, ADDRESSED_DATA_OFFSET, resources),
                MULTIFRAME_FINAL => handle_last_frame(frame, ADDRESSED_DATA_OFFSET, resources),
                framing => {
                    debug!("ignoring reserved framing bits {:#x}", framing);
                }
            }
        }
        OpenLcbFrameType::Standard => match frame.variable_field() {
            CAN_MTI_PCER_WITH_PAYLOAD_FIRST => {
                handle_first_frame(frame, 0, PayloadType::Snip, resources)
            }
            CAN_MTI_PCER_WITH_PAYLOAD_MIDDLE => handle_middle_frame(frame, 0, resources),
            CAN_MTI_PCER_WITH_PAYLOAD_LAST => handle_last_frame(frame, 0, resources),
            _ => handle_single_frame(frame, 0, PayloadType::Basic, resources),
        },
        OpenLcbFrameType::DatagramOnly
        | OpenLcbFrameType::DatagramFirst
        | OpenLcbFrameType::DatagramMiddle
        | OpenLcbFrameType::DatagramFinal => {
            if !is_for_us(frame, resources) {
                return;
            }

            match frame_type {
                OpenLcbFrameType::DatagramOnly => {
                    handle_single_frame(frame, 0, PayloadType::Basic, resources)
                }
                OpenLcbFrameType::DatagramFirst => {
                    handle_first_frame(frame, 0, PayloadType::Datagram, resources)
                }
                OpenLcbFrameType::DatagramMiddle => handle_middle_frame(frame, 0, resources),
                _ => handle_last_frame(frame, 0, resources),
            }
        }
        OpenLcbFrameType::Stream => handle_stream_frame(frame, resources),
        OpenLcbFrameType::Reserved => {}
    }
}

fn is_for_us(frame: &CanFrame, resources: &SharedResources) -> bool {
    resources
        .alias_mappings
        .find_by_alias(frame.dest_alias())
        .is_some()
}

fn assembly_key(frame: &CanFrame) -> AssemblyKey {
    AssemblyKey {
        source_alias: frame.source_alias(),
        dest_alias: frame.dest_alias(),
        mti: frame.openlcb_mti(),
    }
}

fn data(frame: &CanFrame, offset: usize) -> &[u8] {
    frame.payload().get(offset..).unwrap_or(&[])
}

/// Allocates a message of `payload_type` with its header loaded from `frame`.
fn allocate_for(
    frame: &CanFrame,
    payload_type: PayloadType,
    resources: &mut SharedResources,
) -> Option<MessageHandle> {
    let handle = resources.messages.allocate(payload_type)?;

    if let Some(mut message) = resources.messages.get_mut(handle) {
        message.load(
            frame.openlcb_mti(),
            frame.source_alias(),
            0,
            frame.dest_alias(),
            0,
        );
    }

    Some(handle)
}

/// Queues a rejection for `frame` on the ingress FIFO, addressed from the
/// frame's destination back to its source.
pub fn load_reject_message(frame: &CanFrame, error_code: u16, resources: &mut SharedResources) {
    let mti = if frame.openlcb_mti() == MTI_DATAGRAM {
        MTI_DATAGRAM_REJECTED_REPLY
    } else {
        MTI_OPTIONAL_INTERACTION_REJECTED
    };

    debug!(
        "rejecting {:#x} from {:#x} with {:#x}",
        frame.openlcb_mti(),
        frame.source_alias(),
        error_code
    );

    let Some(handle) = resources.messages.allocate(PayloadType::Basic) else {
        warn!("no buffer for rejection {:#x}", error_code);
        return;
    };

    if let Some(mut message) = resources.messages.get_mut(handle) {
        message.load(mti, frame.dest_alias(), 0, frame.source_alias(), 0);
        message.append_word(frame.source_alias());
        message.append_word(error_code);
    }

    resources.push_ingress(handle);
}

/* OpenLCB messages */

/// A message that fits in one frame goes straight to the ingress FIFO.
pub fn handle_single_frame(
    frame: &CanFrame,
    offset: usize,
    payload_type: PayloadType,
    resources: &mut SharedResources,
) {
    let Some(handle) = allocate_for(frame, payload_type, resources) else {
        if frame.dest_alias() != 0 {
            load_reject_message(frame, ERROR_TEMPORARY_BUFFER_UNAVAILABLE, resources);
        } else {
            debug!("no buffer for {:#x}, dropped", frame.openlcb_mti());
        }
        return;
    };

    if let Some(mut message) = resources.messages.get_mut(handle) {
        message.append(data(frame, offset));
    }

    resources.push_ingress(handle);
}

/// Starts assembling a multi-frame message.
pub fn handle_first_frame(
    frame: &CanFrame,
    offset: usize,
    payload_type: PayloadType,
    resources: &mut SharedResources,
) {
    let key = assembly_key(frame);

    if resources
        .assembly
        .find(key.source_alias, key.dest_alias, key.mti)
        .is_some()
    {
        load_reject_message(
            frame,
            ERROR_TEMPORARY_OUT_OF_ORDER_START_BEFORE_LAST_END,
            resources,
        );
        return;
    }

    let Some(handle) = allocate_for(frame, payload_type, resources) else {
        load_reject_message(frame, ERROR_TEMPORARY_BUFFER_UNAVAILABLE, resources);
        return;
    };

    if let Some(mut message) = resources.messages.get_mut(handle) {
        message.append(data(frame, offset));
        message.header.state.in_process = true;
    }

    match resources.assembly.add(key, handle) {
        Ok(()) => {}
        Err(AssemblyError::DuplicateKey(_)) | Err(AssemblyError::Full) => {
            resources.messages.free(handle);
            load_reject_message(frame, ERROR_TEMPORARY_BUFFER_UNAVAILABLE, resources);
        }
    }
}

/// Appends to a message started by an earlier first frame.
pub fn handle_middle_frame(frame: &CanFrame, offset: usize, resources: &mut SharedResources) {
    let key = assembly_key(frame);

    let Some(handle) = resources
        .assembly
        .find(key.source_alias, key.dest_alias, key.mti)
    else {
        load_reject_message(
            frame,
            ERROR_TEMPORARY_OUT_OF_ORDER_MIDDLE_END_WITH_NO_START,
            resources,
        );
        return;
    };

    append_assembled(frame, offset, handle, resources);
}

/// Completes a message and hands it to the application.
pub fn handle_last_frame(frame: &CanFrame, offset: usize, resources: &mut SharedResources) {
    let key = assembly_key(frame);

    let Some(handle) = resources
        .assembly
        .find(key.source_alias, key.dest_alias, key.mti)
    else {
        load_reject_message(
            frame,
            ERROR_TEMPORARY_OUT_OF_ORDER_MIDDLE_END_WITH_NO_START,
            resources,
        );
        return;
    };

    if !append_assembled(frame, offset, handle, resources) {
        return;
    }

    if let Some(message) = resources.messages.get_mut(handle) {
        message.header.state.in_process = false;
    }

    resources.assembly.release(handle);
    resources.push_ingress(handle);
}

/// Appends the frame's data to a message under assembly. A message that
/// outgrows its buffer is abandoned and the sender told so.
fn append_assembled(
    frame: &CanFrame,
    offset: usize,
    handle: MessageHandle,
    resources: &mut SharedResources,
) -> bool {
    let incoming = data(frame, offset);
    let appended = resources
        .messages
        .get_mut(handle)
        .map(|mut message| message.append(incoming))
        .unwrap_or(0);

    if appended == incoming.len() {
        return true;
    }

    warn!(
        "{:#x} from {:#x} overflows its buffer, discarding",
        frame.openlcb_mti(),
        frame.source_alias()
    );

    resources.assembly.release(handle);
    resources.messages.free(handle);
    load_reject_message(frame, ERROR_TEMPORARY_BUFFER_UNAVAILABLE, resources);

    false
}

/// SNIP replies from older nodes carry no framing bits, so the end of the
/// message is found by counting the null terminated fields.
pub fn handle_legacy_snip(frame: &CanFrame, resources: &mut SharedResources) {
    let key = assembly_key(frame);
    let incoming_nulls = frame.count_nulls(ADDRESSED_DATA_OFFSET);

    let Some(handle) = resources
        .assembly
        .find(key.source_alias, key.dest_alias, key.mti)
    else {
        if incoming_nulls >= SNIP_NULL_COUNT {
            handle_single_frame(frame, ADDRESSED_DATA_OFFSET, PayloadType::Snip, resources);
        } else {
            handle_first_frame(frame, ADDRESSED_DATA_OFFSET, PayloadType::Snip, resources);
        }
        return;
    };

    let nulls = resources
        .messages
        .get(handle)
        .map(|message| message.count_nulls())
        .unwrap_or(0)
        + incoming_nulls;

    if nulls < SNIP_NULL_COUNT {
        handle_middle_frame(frame, ADDRESSED_DATA_OFFSET, resources);
    } else {
        handle_last_frame(frame, ADDRESSED_DATA_OFFSET, resources);
    }
}

/// Stream data frames are delivered one frame per message; flow control
/// belongs to the stream protocol above this layer.
#[cfg(feature = "stream")]
pub fn handle_stream_frame(frame: &CanFrame, resources: &mut SharedResources) {
    if !is_for_us(frame, resources) {
        return;
    }

    handle_single_frame(frame, 0, PayloadType::Stream, resources)
}

#[cfg(not(feature = "stream"))]
pub fn handle_stream_frame(frame: &CanFrame, _resources: &mut SharedResources) {
    trace!("stream support disabled, dropping {:#x}", frame.identifier());
}

/// Advances the age of every message under assembly and discards those
/// whose remaining frames never arrived. Called from the 100 ms tick.
pub fn age_assemblies(resources: &mut SharedResources) {
    let mut expired: Vec<MessageHandle, { crate::config::MESSAGE_BUFFER_DEPTH }> = Vec::new();

    for (_, handle) in resources.assembly.iter() {
        if let Some(message) = resources.messages.get_mut(*handle) {
            message.header.timer_ticks = message.header.timer_ticks.saturating_add(1);

            if message.header.timer_ticks >= ASSEMBLY_TIMEOUT_TICKS {
                let _ = expired.push(*handle);
            }
        }
    }

    for handle in expired {
        warn!("discarding incomplete message");
        resources.assembly.release(handle);
        resources.messages.free(handle);
    }
}

/* CAN control frames */

/// Flags our mapping if another node is using one of our aliases and tells
/// the other node to drop it. Returns true if the alias was ours.
fn check_for_duplicate_alias(frame: &CanFrame, resources: &mut SharedResources) -> bool {
    let alias = frame.source_alias();

    let Some(mapping) = resources.alias_mappings.mark_duplicate(alias) else {
        return false;
    };

    warn!("alias {:#x} is also in use by another node", alias);

    if mapping.is_permitted {
        resources.queue_frame(CanFrame::alias_map_reset(alias, mapping.node_id));
    }

    true
}

/// Another node is checking an alias; object if it is one of ours.
pub fn handle_cid(frame: &CanFrame, resources: &mut SharedResources) {
    let alias = frame.source_alias();

    if resources.alias_mappings.find_by_alias(alias).is_some() {
        debug!("CID for our alias {:#x}, reserving", alias);
        resources.queue_frame(CanFrame::reserve_id(alias));
    }
}

pub fn handle_rid(frame: &CanFrame, resources: &mut SharedResources) {
    check_for_duplicate_alias(frame, resources);
}

pub fn handle_amd(frame: &CanFrame, resources: &mut SharedResources) {
    check_for_duplicate_alias(frame, resources);
}

pub fn handle_amr(frame: &CanFrame, resources: &mut SharedResources) {
    check_for_duplicate_alias(frame, resources);
}

pub fn handle_eir(frame: &CanFrame, resources: &mut SharedResources) {
    check_for_duplicate_alias(frame, resources);
}

/// Answers an Alias Map Enquiry with an AMD for each matching permitted
/// mapping. Nodes still logging in stay silent.
pub fn handle_ame(frame: &CanFrame, resources: &mut SharedResources) {
    if check_for_duplicate_alias(frame, resources) {
        return;
    }

    let mut replies: Vec<CanFrame, ALIAS_MAPPING_BUFFER_DEPTH> = Vec::new();

    match frame.node_id_from_payload(0) {
        Some(node_id) if frame.payload_count() == 6 => {
            if let Some(mapping) = resources.alias_mappings.find_by_node_id(node_id) {
                if mapping.is_permitted {
                    let _ = replies.push(CanFrame::alias_map_definition(mapping.alias, node_id));
                }
            }
        }
        _ if frame.payload_count() == 0 => {
            for mapping in resources.alias_mappings.iter().filter(|m| m.is_permitted) {
                let _ = replies.push(CanFrame::alias_map_definition(mapping.alias, mapping.node_id));
            }
        }
        _ => {}
    }

    for reply in replies {
        resources.queue_frame(reply);
    }
}
