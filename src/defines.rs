//! Wire-level constants: MTI values, protocol support bits, error codes and
//! the bit layout of the 29-bit CAN identifier.

/* CAN identifier layout */

pub const RESERVED_TOP_BIT: u32 = 0x1000_0000;
pub const CAN_OPENLCB_MSG: u32 = 0x0800_0000;

pub const MASK_CAN_FRAME_TYPE: u32 = 0x0700_0000;
pub const MASK_CAN_FRAME_SEQUENCE_NUMBER: u32 = 0x0700_0000;
pub const MASK_CAN_VARIABLE_FIELD: u32 = 0x00FF_F000;
pub const MASK_CAN_SOURCE_ALIAS: u32 = 0x0000_0FFF;
pub const MASK_CAN_DEST_ADDRESS_PRESENT: u32 = 0x0000_8000;

pub const OPENLCB_MESSAGE_STANDARD_FRAME_TYPE: u32 = 0x0100_0000;
pub const CAN_FRAME_TYPE_DATAGRAM_ONLY: u32 = 0x0200_0000;
pub const CAN_FRAME_TYPE_DATAGRAM_FIRST: u32 = 0x0300_0000;
pub const CAN_FRAME_TYPE_DATAGRAM_MIDDLE: u32 = 0x0400_0000;
pub const CAN_FRAME_TYPE_DATAGRAM_FINAL: u32 = 0x0500_0000;
pub const CAN_FRAME_TYPE_RESERVED: u32 = 0x0600_0000;
pub const CAN_FRAME_TYPE_STREAM: u32 = 0x0700_0000;

/* Control frames: CID sequence in bits 26..24, everything else in 23..12 */

pub const CAN_CONTROL_FRAME_CID7: u32 = 0x0700_0000;
pub const CAN_CONTROL_FRAME_CID6: u32 = 0x0600_0000;
pub const CAN_CONTROL_FRAME_CID5: u32 = 0x0500_0000;
pub const CAN_CONTROL_FRAME_CID4: u32 = 0x0400_0000;
pub const CAN_CONTROL_FRAME_CID3: u32 = 0x0300_0000;
pub const CAN_CONTROL_FRAME_CID2: u32 = 0x0200_0000;
pub const CAN_CONTROL_FRAME_CID1: u32 = 0x0100_0000;

pub const CAN_CONTROL_FRAME_RID: u32 = 0x0070_0000;
pub const CAN_CONTROL_FRAME_AMD: u32 = 0x0070_1000;
pub const CAN_CONTROL_FRAME_AME: u32 = 0x0070_2000;
pub const CAN_CONTROL_FRAME_AMR: u32 = 0x0070_3000;
pub const CAN_CONTROL_FRAME_EIR0: u32 = 0x0071_0000;
pub const CAN_CONTROL_FRAME_EIR1: u32 = 0x0071_1000;
pub const CAN_CONTROL_FRAME_EIR2: u32 = 0x0071_2000;
pub const CAN_CONTROL_FRAME_EIR3: u32 = 0x0071_3000;

/* Framing bits in the upper nibble of the first byte of addressed messages */

pub const MASK_MULTIFRAME_BITS: u8 = 0xF0;
pub const MULTIFRAME_ONLY: u8 = 0x00;
pub const MULTIFRAME_FIRST: u8 = 0x10;
pub const MULTIFRAME_FINAL: u8 = 0x20;
pub const MULTIFRAME_MIDDLE: u8 = 0x30;

/* CAN MTIs for PC Event Report with payload; all collapse to the last one */

pub const CAN_MTI_PCER_WITH_PAYLOAD_FIRST: u16 = 0x0F16;
pub const CAN_MTI_PCER_WITH_PAYLOAD_MIDDLE: u16 = 0x0F15;
pub const CAN_MTI_PCER_WITH_PAYLOAD_LAST: u16 = 0x0F14;

/* OpenLCB MTIs */

pub const MTI_MASK_DEST_ADDRESS_PRESENT: u16 = 0x0008;

pub const MTI_INITIALIZATION_COMPLETE: u16 = 0x0100;
pub const MTI_INITIALIZATION_COMPLETE_SIMPLE: u16 = 0x0101;
pub const MTI_VERIFY_NODE_ID_ADDRESSED: u16 = 0x0488;
pub const MTI_VERIFY_NODE_ID_GLOBAL: u16 = 0x0490;
pub const MTI_VERIFIED_NODE_ID: u16 = 0x0170;
pub const MTI_VERIFIED_NODE_ID_SIMPLE: u16 = 0x0171;
pub const MTI_OPTIONAL_INTERACTION_REJECTED: u16 = 0x0068;
pub const MTI_TERMINATE_DUE_TO_ERROR: u16 = 0x00A8;
pub const MTI_PROTOCOL_SUPPORT_INQUIRY: u16 = 0x0828;
pub const MTI_PROTOCOL_SUPPORT_REPLY: u16 = 0x0668;

pub const MTI_CONSUMER_IDENTIFY: u16 = 0x08F4;
pub const MTI_CONSUMER_IDENTIFY_RANGE: u16 = 0x04A4;
pub const MTI_CONSUMER_IDENTIFIED_UNKNOWN: u16 = 0x04C7;
pub const MTI_CONSUMER_IDENTIFIED_SET: u16 = 0x04C4;
pub const MTI_CONSUMER_IDENTIFIED_CLEAR: u16 = 0x04C5;
pub const MTI_PRODUCER_IDENTIFY: u16 = 0x0914;
pub const MTI_PRODUCER_IDENTIFY_RANGE: u16 = 0x0524;
pub const MTI_PRODUCER_IDENTIFIED_UNKNOWN: u16 = 0x0547;
pub const MTI_PRODUCER_IDENTIFIED_SET: u16 = 0x0544;
pub const MTI_PRODUCER_IDENTIFIED_CLEAR: u16 = 0x0545;
pub const MTI_EVENTS_IDENTIFY_DEST: u16 = 0x0968;
pub const MTI_EVENTS_IDENTIFY: u16 = 0x0970;
pub const MTI_EVENT_LEARN: u16 = 0x0594;
pub const MTI_PC_EVENT_REPORT: u16 = 0x05B4;
pub const MTI_PC_EVENT_REPORT_WITH_PAYLOAD: u16 = 0x0F14;

pub const MTI_SIMPLE_NODE_INFO_REQUEST: u16 = 0x0DE8;
pub const MTI_SIMPLE_NODE_INFO_REPLY: u16 = 0x0A08;

pub const MTI_STREAM_INIT_REQUEST: u16 = 0x0CC8;
pub const MTI_STREAM_INIT_REPLY: u16 = 0x0868;
pub const MTI_STREAM_PROCEED: u16 = 0x0888;
pub const MTI_STREAM_COMPLETE: u16 = 0x08A8;
/// Pseudo MTI carried by stream data messages; never appears on the wire.
pub const MTI_STREAM_DATA: u16 = 0xF000;

pub const MTI_DATAGRAM: u16 = 0x1C48;
pub const MTI_DATAGRAM_OK_REPLY: u16 = 0x0A28;
pub const MTI_DATAGRAM_REJECTED_REPLY: u16 = 0x0A48;

/* Protocol Support Inquiry bits */

pub const PSI_SIMPLE: u32 = 0x80_0000;
pub const PSI_DATAGRAM: u32 = 0x40_0000;
pub const PSI_STREAM: u32 = 0x20_0000;
pub const PSI_MEMORY_CONFIGURATION: u32 = 0x10_0000;
pub const PSI_RESERVATION: u32 = 0x08_0000;
pub const PSI_EVENT_EXCHANGE: u32 = 0x04_0000;
pub const PSI_IDENTIFICATION: u32 = 0x02_0000;
pub const PSI_TEACHING_LEARNING: u32 = 0x01_0000;
pub const PSI_REMOTE_BUTTON: u32 = 0x00_8000;
pub const PSI_ABBREVIATED_DEFAULT_CDI: u32 = 0x00_4000;
pub const PSI_DISPLAY: u32 = 0x00_2000;
pub const PSI_SIMPLE_NODE_INFORMATION: u32 = 0x00_1000;
pub const PSI_CONFIGURATION_DESCRIPTION_INFO: u32 = 0x00_0800;
pub const PSI_TRAIN_CONTROL: u32 = 0x00_0400;
pub const PSI_FUNCTION_DESCRIPTION: u32 = 0x00_0200;
pub const PSI_FUNCTION_CONFIGURATION: u32 = 0x00_0040;
pub const PSI_FIRMWARE_UPGRADE: u32 = 0x00_0020;
pub const PSI_FIRMWARE_UPGRADE_ACTIVE: u32 = 0x00_0010;

/* Error codes carried in rejection replies */

pub const ERROR_PERMANENT: u16 = 0x1000;
pub const ERROR_PERMANENT_SOURCE_NOT_PERMITTED: u16 = 0x1020;
pub const ERROR_PERMANENT_NOT_IMPLEMENTED: u16 = 0x1040;
pub const ERROR_PERMANENT_NOT_IMPLEMENTED_UNKNOWN_SUBCOMMAND: u16 = 0x1041;
pub const ERROR_PERMANENT_NOT_IMPLEMENTED_UNKNOWN_COMMAND: u16 = 0x1042;
pub const ERROR_PERMANENT_NOT_IMPLEMENTED_UNKNOWN_MTI: u16 = 0x1043;
pub const ERROR_PERMANENT_INVALID_ARGUMENTS: u16 = 0x1080;

pub const ERROR_TEMPORARY: u16 = 0x2000;
pub const ERROR_TEMPORARY_TIMEOUT: u16 = 0x2010;
pub const ERROR_TEMPORARY_BUFFER_UNAVAILABLE: u16 = 0x2020;
pub const ERROR_TEMPORARY_NOT_EXPECTED_OUT_OF_ORDER: u16 = 0x2040;
pub const ERROR_TEMPORARY_OUT_OF_ORDER_MIDDLE_END_WITH_NO_START: u16 = 0x2041;
pub const ERROR_TEMPORARY_OUT_OF_ORDER_START_BEFORE_LAST_END: u16 = 0x2042;
pub const ERROR_TEMPORARY_TRANSFER_ERROR: u16 = 0x2080;

/* Well-known event ids */

pub const EVENT_ID_EMERGENCY_OFF: u64 = 0x0100_0000_0000_FFFF;
pub const EVENT_ID_CLEAR_EMERGENCY_OFF: u64 = 0x0100_0000_0000_FFFE;
pub const EVENT_ID_EMERGENCY_STOP: u64 = 0x0100_0000_0000_FFFD;
pub const EVENT_ID_CLEAR_EMERGENCY_STOP: u64 = 0x0100_0000_0000_FFFC;
pub const EVENT_ID_DUPLICATE_NODE_DETECTED: u64 = 0x0101_0000_0000_0201;

/* Configuration memory address spaces */

pub const ADDRESS_SPACE_CONFIGURATION_DEFINITION_INFO: u8 = 0xFF;
pub const ADDRESS_SPACE_ALL: u8 = 0xFE;
pub const ADDRESS_SPACE_CONFIGURATION_MEMORY: u8 = 0xFD;

pub const NODE_ID_MASK: u64 = 0xFFFF_FFFF_FFFF;
pub const ALIAS_MASK: u16 = 0x0FFF;
