use embedded_can::{ExtendedId, Id};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

use crate::defines::*;

/// A raw CAN 2.0 frame with a 29-bit extended identifier, as exchanged with
/// the bus driver.
///
/// OpenLCB never uses standard identifiers or remote frames, so neither is
/// representable here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanFrame {
    identifier: u32,
    payload_count: u8,
    payload: [u8; 8],
}

impl CanFrame {
    /// Creates a new data frame. `payload` must have a length in the range
    /// 0..=8 and `identifier` must fit in 29 bits or else `None` will be
    /// returned instead.
    pub fn new(identifier: u32, payload: &[u8]) -> Option<Self> {
        if payload.len() > 8 || identifier > ExtendedId::MAX.as_raw() {
            return None;
        }

        let mut copy = [0u8; 8];
        copy[..payload.len()].copy_from_slice(payload);

        Some(Self {
            identifier,
            payload_count: payload.len() as u8,
            payload: copy,
        })
    }

    /// Gets the raw 29-bit identifier of the frame
    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    /// Number of valid bytes at the start of the payload
    pub fn payload_count(&self) -> usize {
        self.payload_count as usize
    }

    /// The valid prefix of the payload
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_count as usize]
    }

    pub fn is_openlcb_message(&self) -> bool {
        self.identifier & CAN_OPENLCB_MSG != 0
    }

    pub fn source_alias(&self) -> u16 {
        (self.identifier & MASK_CAN_SOURCE_ALIAS) as u16
    }

    /// The 12 bits carried in bits 23..12 of the identifier (MTI, destination
    /// alias or control frame type, depending on the frame).
    pub fn variable_field(&self) -> u16 {
        ((self.identifier & MASK_CAN_VARIABLE_FIELD) >> 12) as u16
    }

    fn sequence(&self) -> u8 {
        ((self.identifier & MASK_CAN_FRAME_TYPE) >> 24) as u8
    }

    /// Classifies the frame by its identifier.
    pub fn kind(&self) -> FrameKind {
        if self.is_openlcb_message() {
            return FrameKind::OpenLcb(OpenLcbFrameType::from_primitive(self.sequence()));
        }

        match self.sequence() {
            0 => match ControlFrameKind::try_from(self.variable_field()) {
                Ok(kind) => FrameKind::Control(kind),
                Err(FrameError::UnknownControlFrame(field)) => FrameKind::UnknownControl(field),
            },
            sequence => FrameKind::CheckId(sequence),
        }
    }

    /// True for standard messages whose MTI carries a destination alias in the
    /// first two payload bytes.
    pub fn is_addressed_message(&self) -> bool {
        self.kind() == FrameKind::OpenLcb(OpenLcbFrameType::Standard)
            && self.identifier & MASK_CAN_DEST_ADDRESS_PRESENT != 0
    }

    /// Destination alias, wherever this kind of frame carries it. Zero for
    /// global messages and control frames.
    pub fn dest_alias(&self) -> u16 {
        match self.kind() {
            FrameKind::OpenLcb(OpenLcbFrameType::Standard) => {
                if self.is_addressed_message() && self.payload_count >= 2 {
                    (((self.payload[0] & 0x0F) as u16) << 8) | self.payload[1] as u16
                } else {
                    0
                }
            }
            FrameKind::OpenLcb(
                OpenLcbFrameType::DatagramOnly
                | OpenLcbFrameType::DatagramFirst
                | OpenLcbFrameType::DatagramMiddle
                | OpenLcbFrameType::DatagramFinal
                | OpenLcbFrameType::Stream,
            ) => self.variable_field(),
            _ => 0,
        }
    }

    /// Framing bits from the high nibble of byte 0 of an addressed message.
    pub fn framing_bits(&self) -> u8 {
        if self.payload_count == 0 {
            return MULTIFRAME_ONLY;
        }

        self.payload[0] & MASK_MULTIFRAME_BITS
    }

    /// Translates the CAN-level MTI into the 16-bit OpenLCB MTI. PC Event
    /// Report with payload fragments all map to the same MTI.
    pub fn openlcb_mti(&self) -> u16 {
        match self.kind() {
            FrameKind::OpenLcb(OpenLcbFrameType::Standard) => match self.variable_field() {
                CAN_MTI_PCER_WITH_PAYLOAD_FIRST
                | CAN_MTI_PCER_WITH_PAYLOAD_MIDDLE
                | CAN_MTI_PCER_WITH_PAYLOAD_LAST => MTI_PC_EVENT_REPORT_WITH_PAYLOAD,
                mti => mti,
            },
            FrameKind::OpenLcb(
                OpenLcbFrameType::DatagramOnly
                | OpenLcbFrameType::DatagramFirst
                | OpenLcbFrameType::DatagramMiddle
                | OpenLcbFrameType::DatagramFinal,
            ) => MTI_DATAGRAM,
            FrameKind::OpenLcb(OpenLcbFrameType::Stream) => MTI_STREAM_DATA,
            _ => 0,
        }
    }

    /// Reads a 48-bit node id from six big-endian payload bytes at `offset`.
    pub fn node_id_from_payload(&self, offset: usize) -> Option<u64> {
        let bytes = self.payload().get(offset..offset + 6)?;

        Some(bytes.iter().fold(0u64, |id, byte| (id << 8) | *byte as u64))
    }

    /// Number of zero bytes in the valid payload starting at `offset`.
    pub fn count_nulls(&self, offset: usize) -> usize {
        self.payload()
            .iter()
            .skip(offset)
            .filter(|byte| **byte == 0)
            .count()
    }
}

/* Frame builders */

fn node_id_bytes(node_id: u64) -> [u8; 6] {
    let bytes = node_id.to_be_bytes();

    [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]
}

impl CanFrame {
    fn control(field: u32, alias: u16, payload: &[u8]) -> Self {
        let mut copy = [0u8; 8];
        copy[..payload.len()].copy_from_slice(payload);

        Self {
            identifier: RESERVED_TOP_BIT | field | (alias as u32 & MASK_CAN_SOURCE_ALIAS),
            payload_count: payload.len() as u8,
            payload: copy,
        }
    }

    /// Check ID frame for `sequence` 7..=4, carrying the matching 12-bit slice
    /// of `node_id` (CID7 holds bits 47..36, CID4 bits 11..0).
    pub fn check_id(sequence: u8, alias: u16, node_id: u64) -> Self {
        let sequence = sequence.clamp(4, 7);
        let slice = (node_id >> ((sequence as u32 - 4) * 12)) & 0xFFF;

        Self::control(
            ((sequence as u32) << 24) | ((slice as u32) << 12),
            alias,
            &[],
        )
    }

    pub fn reserve_id(alias: u16) -> Self {
        Self::control(CAN_CONTROL_FRAME_RID, alias, &[])
    }

    pub fn alias_map_definition(alias: u16, node_id: u64) -> Self {
        Self::control(CAN_CONTROL_FRAME_AMD, alias, &node_id_bytes(node_id))
    }

    pub fn alias_map_reset(alias: u16, node_id: u64) -> Self {
        Self::control(CAN_CONTROL_FRAME_AMR, alias, &node_id_bytes(node_id))
    }

    /// Alias Map Enquiry, targeted when `node_id` is given and global otherwise.
    pub fn alias_mapping_enquiry(alias: u16, node_id: Option<u64>) -> Self {
        match node_id {
            Some(node_id) => Self::control(CAN_CONTROL_FRAME_AME, alias, &node_id_bytes(node_id)),
            None => Self::control(CAN_CONTROL_FRAME_AME, alias, &[]),
        }
    }

    /// OpenLCB frame of the given type. `variable_field` is the CAN MTI for
    /// standard frames and the destination alias for datagram and stream
    /// frames. Returns `None` if the payload is longer than 8 bytes.
    pub fn openlcb(
        frame_type: OpenLcbFrameType,
        variable_field: u16,
        source_alias: u16,
        payload: &[u8],
    ) -> Option<Self> {
        let identifier = RESERVED_TOP_BIT
            | CAN_OPENLCB_MSG
            | ((u8::from(frame_type) as u32) << 24)
            | (((variable_field & 0x0FFF) as u32) << 12)
            | (source_alias as u32 & MASK_CAN_SOURCE_ALIAS);

        Self::new(identifier, payload)
    }

    /// Single frame global or addressed message for an OpenLCB `mti`.
    pub fn openlcb_message(mti: u16, source_alias: u16, payload: &[u8]) -> Option<Self> {
        Self::openlcb(OpenLcbFrameType::Standard, mti, source_alias, payload)
    }
}

impl embedded_can::Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        match id.into() {
            Id::Extended(id) => CanFrame::new(id.as_raw(), data),
            Id::Standard(_) => None,
        }
    }

    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        None
    }

    fn is_extended(&self) -> bool {
        true
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        Id::Extended(ExtendedId::new(self.identifier).unwrap_or(ExtendedId::ZERO))
    }

    fn dlc(&self) -> usize {
        self.payload_count as usize
    }

    fn data(&self) -> &[u8] {
        self.payload()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    #[error("Received a control frame with an unknown type field ({0:?})")]
    UnknownControlFrame(u16),
}

/// Classification of a frame by the layout of its identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameKind {
    /// Check ID frame with its sequence number (7..=4 for OpenLCB, 3..=1 are
    /// not used)
    CheckId(u8),
    Control(ControlFrameKind),
    UnknownControl(u16),
    OpenLcb(OpenLcbFrameType),
}

/// The non-CID control frames, keyed by bits 23..12 of the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = FrameError, constructor = FrameError::UnknownControlFrame))]
#[repr(u16)]
pub enum ControlFrameKind {
    /// Reserve ID
    ReserveId = 0x0700,
    /// Alias Map Definition
    AliasMapDefinition = 0x0701,
    /// Alias Map Enquiry
    AliasMapEnquiry = 0x0702,
    /// Alias Map Reset
    AliasMapReset = 0x0703,
    ErrorInformationReport0 = 0x0710,
    ErrorInformationReport1 = 0x0711,
    ErrorInformationReport2 = 0x0712,
    ErrorInformationReport3 = 0x0713,
}

/// Value of bits 26..24 of an OpenLCB frame's identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OpenLcbFrameType {
    #[num_enum(default)]
    Reserved = 0,
    Standard = 1,
    DatagramOnly = 2,
    DatagramFirst = 3,
    DatagramMiddle = 4,
    DatagramFinal = 5,
    Stream = 7,
}

#[cfg(test)]
mod tests {
    use embedded_can::{ExtendedId, Frame, StandardId};

    use super::*;

    #[test]
    fn frame_construction_limits() {
        assert!(CanFrame::new(0x1FFF_FFFF, &[0; 8]).is_some());
        assert!(CanFrame::new(0x2000_0000, &[]).is_none());
        assert!(CanFrame::new(0x1000_0000, &[0; 9]).is_none());

        assert!(<CanFrame as Frame>::new(StandardId::ZERO, &[]).is_none());
        assert!(<CanFrame as Frame>::new_remote(ExtendedId::ZERO, 0).is_none());

        let frame = <CanFrame as Frame>::new(ExtendedId::new(0x195B4ABC).unwrap(), &[1, 2]).unwrap();
        assert_eq!(frame.identifier(), 0x195B4ABC);
        assert_eq!(Frame::data(&frame), &[1, 2]);
        assert_eq!(Frame::id(&frame), Id::Extended(ExtendedId::new(0x195B4ABC).unwrap()));
    }

    #[test]
    fn classify_frames() {
        /* Control frames */

        assert_eq!(CanFrame::new(0x17020BBB, &[]).unwrap().kind(), FrameKind::CheckId(7));
        assert_eq!(CanFrame::new(0x14AAABBB, &[]).unwrap().kind(), FrameKind::CheckId(4));
        assert_eq!(CanFrame::new(0x13AAABBB, &[]).unwrap().kind(), FrameKind::CheckId(3));
        assert_eq!(
            CanFrame::new(0x10700BBB, &[]).unwrap().kind(),
            FrameKind::Control(ControlFrameKind::ReserveId)
        );
        assert_eq!(
            CanFrame::new(0x10702BBB, &[]).unwrap().kind(),
            FrameKind::Control(ControlFrameKind::AliasMapEnquiry)
        );
        assert_eq!(
            CanFrame::new(0x10712BBB, &[]).unwrap().kind(),
            FrameKind::Control(ControlFrameKind::ErrorInformationReport2)
        );
        assert_eq!(
            CanFrame::new(0x10704BBB, &[]).unwrap().kind(),
            FrameKind::UnknownControl(0x704)
        );

        /* OpenLCB frames */

        assert_eq!(
            CanFrame::new(0x195B4ABC, &[]).unwrap().kind(),
            FrameKind::OpenLcb(OpenLcbFrameType::Standard)
        );
        assert_eq!(
            CanFrame::new(0x1BBBBAAA, &[]).unwrap().kind(),
            FrameKind::OpenLcb(OpenLcbFrameType::DatagramFirst)
        );
        assert_eq!(
            CanFrame::new(0x1EBBBAAA, &[]).unwrap().kind(),
            FrameKind::OpenLcb(OpenLcbFrameType::Reserved)
        );
        assert_eq!(
            CanFrame::new(0x1FBBBAAA, &[]).unwrap().kind(),
            FrameKind::OpenLcb(OpenLcbFrameType::Stream)
        );
    }

    #[test]
    fn extract_header_fields() {
        let pcer = CanFrame::new(0x195B4ABC, &[5, 1, 1, 1, 7, 0xFF, 0, 0x25]).unwrap();
        assert_eq!(pcer.openlcb_mti(), MTI_PC_EVENT_REPORT);
        assert_eq!(pcer.source_alias(), 0xABC);
        assert_eq!(pcer.dest_alias(), 0);
        assert!(!pcer.is_addressed_message());

        let snip = CanFrame::new(0x19A086BE, &[0x39, 0x99, b'a', 0]).unwrap();
        assert!(snip.is_addressed_message());
        assert_eq!(snip.openlcb_mti(), MTI_SIMPLE_NODE_INFO_REPLY);
        assert_eq!(snip.dest_alias(), 0x999);
        assert_eq!(snip.framing_bits(), MULTIFRAME_MIDDLE);
        assert_eq!(snip.count_nulls(2), 1);

        let datagram = CanFrame::new(0x1DBBBAAA, &[1, 2]).unwrap();
        assert_eq!(datagram.openlcb_mti(), MTI_DATAGRAM);
        assert_eq!(datagram.dest_alias(), 0xBBB);

        for can_mti in [0xF16u32, 0xF15, 0xF14] {
            let frame = CanFrame::new(0x1900_0ABC | (can_mti << 12), &[]).unwrap();
            assert_eq!(frame.openlcb_mti(), MTI_PC_EVENT_REPORT_WITH_PAYLOAD);
        }

        let amd = CanFrame::alias_map_definition(0xAAA, 0x0102_0304_0506);
        assert_eq!(amd.identifier(), 0x10701AAA);
        assert_eq!(amd.node_id_from_payload(0), Some(0x0102_0304_0506));
        assert_eq!(amd.node_id_from_payload(3), None);
    }

    #[test]
    fn check_id_frames_carry_node_id() {
        let node_id = 0x0102_0304_0506;

        assert_eq!(CanFrame::check_id(7, 0x755, node_id).identifier(), 0x17010755);
        assert_eq!(CanFrame::check_id(6, 0x755, node_id).identifier(), 0x16203755);
        assert_eq!(CanFrame::check_id(5, 0x755, node_id).identifier(), 0x15040755);
        assert_eq!(CanFrame::check_id(4, 0x755, node_id).identifier(), 0x14506755);
    }

    #[test]
    fn build_openlcb_frames() {
        let frame = CanFrame::openlcb(OpenLcbFrameType::DatagramMiddle, 0xBBB, 0xAAA, &[1]).unwrap();
        assert_eq!(frame.identifier(), 0x1CBBBAAA);

        let frame = CanFrame::openlcb_message(MTI_INITIALIZATION_COMPLETE, 0x755, &[0; 6]).unwrap();
        assert_eq!(frame.identifier(), 0x19100755);

        assert!(CanFrame::openlcb_message(MTI_PC_EVENT_REPORT, 0x755, &[0; 9]).is_none());
    }
}
