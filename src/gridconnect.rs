//! GridConnect, the ASCII CAN framing used by OpenLCB TCP and USB bridges:
//! `:X19170ABCN0102030405060708;`

use embedded_can::ExtendedId;
use heapless::Vec;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::frame::CanFrame;

/// `:` + `X` + 8 identifier digits + `N` + 16 data digits + `;`
pub const GRIDCONNECT_MAX_LENGTH: usize = 28;

const MAX_DATA_DIGITS: usize = 16;
const IDENTIFIER_DIGITS: usize = 8;
const START: u8 = b':';
const TERMINATOR: u8 = b';';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GridConnectError {
    #[error("Tried to decode an empty buffer")]
    Empty,
    #[error("Expected ':' at the start of a frame but got ({0:?})")]
    MissingStart(u8),
    #[error("Tried to decode ID kind but it was invalid ({0:?})")]
    InvalidIdKind(u8),
    #[error("Received an identifier with ({0:?}) digits (should be 8)")]
    InvalidIdentifierLength(usize),
    #[error("Tried to decode a hex digit but it was out of range ({0:?})")]
    IllegalHexDigit(u8),
    #[error("Received a CAN Extended ID ({0:?}) that was out of the valid range (0..=0x1FFFFFFF)")]
    IdentifierOutOfRange(u32),
    #[error("Tried to decode frame format but it was invalid ({0:?})")]
    InvalidFrameFormat(u8),
    #[error("Received encoded data with a length ({0:?}) that was not a multiple of 2")]
    OddDataLength(usize),
    #[error("Received ({0:?}) data bytes (at most 8 fit in a frame)")]
    TooManyDataBytes(usize),
    #[error("Frame does not end with ';'")]
    MissingTerminator,
}

/// OpenLCB only uses extended frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = GridConnectError, constructor = GridConnectError::InvalidIdKind))]
#[repr(u8)]
pub enum IdKind {
    Extended = b'X',
}

/// Remote frames have no use in OpenLCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = GridConnectError, constructor = GridConnectError::InvalidFrameFormat))]
#[repr(u8)]
pub enum FrameFormat {
    Normal = b'N',
}

/* Encoding */

pub fn to_hex_digit(value: u32) -> u8 {
    const HEX_LUT: &[u8] = "0123456789ABCDEF".as_bytes();

    HEX_LUT[(value & 0xF) as usize]
}

pub fn extended_id_to_hex(id: ExtendedId) -> [u8; 8] {
    let raw = id.as_raw();

    core::array::from_fn(|i| to_hex_digit(raw >> (28 - 4 * i)))
}

pub fn bytes_to_hex(data: &[u8]) -> impl Iterator<Item = u8> + '_ {
    data.iter()
        .flat_map(|byte| [to_hex_digit((byte >> 4) as u32), to_hex_digit(*byte as u32)])
}

/* Decoding */

pub fn hex_digit_to_u8(byte: u8) -> Result<u8, GridConnectError> {
    Ok(match byte {
        b'0'..=b'9' => byte - b'0',
        b'a'..=b'f' => byte - b'a' + 10,
        b'A'..=b'F' => byte - b'A' + 10,
        _ => return Err(GridConnectError::IllegalHexDigit(byte)),
    })
}

pub fn u8_from_hex_nibbles(hex_nibbles: [u8; 2]) -> Result<u8, GridConnectError> {
    let msn = hex_digit_to_u8(hex_nibbles[0])?;
    let lsn = hex_digit_to_u8(hex_nibbles[1])?;

    Ok((msn << 4) | lsn)
}

pub fn extended_id_from_hex(hex_nibbles: &[u8]) -> Result<ExtendedId, GridConnectError> {
    if hex_nibbles.len() != IDENTIFIER_DIGITS {
        return Err(GridConnectError::InvalidIdentifierLength(hex_nibbles.len()));
    }

    let mut value = 0u32;

    for nibble in hex_nibbles {
        value <<= 4;
        value |= hex_digit_to_u8(*nibble)? as u32;
    }

    ExtendedId::new(value).ok_or(GridConnectError::IdentifierOutOfRange(value))
}

pub fn unpack_data_bytes(hex_bytes: &[u8]) -> Result<Vec<u8, 8>, GridConnectError> {
    if hex_bytes.len() % 2 != 0 {
        return Err(GridConnectError::OddDataLength(hex_bytes.len()));
    }

    if hex_bytes.len() > MAX_DATA_DIGITS {
        return Err(GridConnectError::TooManyDataBytes(hex_bytes.len() / 2));
    }

    let mut buf = Vec::new();

    for chunk in hex_bytes.chunks_exact(2) {
        let byte = u8_from_hex_nibbles([chunk[0], chunk[1]])?;
        buf.push(byte)
            .map_err(|_| GridConnectError::TooManyDataBytes(hex_bytes.len() / 2))?;
    }

    Ok(buf)
}

impl CanFrame {
    pub fn to_gridconnect(&self) -> Vec<u8, GRIDCONNECT_MAX_LENGTH> {
        // identifiers are masked to 29 bits on construction
        let id = ExtendedId::new(self.identifier()).unwrap_or(ExtendedId::ZERO);

        [START, u8::from(IdKind::Extended)]
            .into_iter()
            .chain(extended_id_to_hex(id))
            .chain([u8::from(FrameFormat::Normal)])
            .chain(bytes_to_hex(self.payload()))
            .chain([TERMINATOR])
            .collect()
    }

    /// Decodes one complete frame such as `:X19170ABCN0102;`.
    pub fn from_gridconnect(buffer: &[u8]) -> Result<Self, GridConnectError> {
        let (&start, rest) = buffer.split_first().ok_or(GridConnectError::Empty)?;
        if start != START {
            return Err(GridConnectError::MissingStart(start));
        }

        let (&kind, rest) = rest.split_first().ok_or(GridConnectError::InvalidIdKind(0))?;
        let IdKind::Extended = kind.try_into()?;

        let (&terminator, rest) = rest.split_last().ok_or(GridConnectError::MissingTerminator)?;
        if terminator != TERMINATOR {
            return Err(GridConnectError::MissingTerminator);
        }

        let format_index = rest
            .iter()
            .position(|byte| !byte.is_ascii_hexdigit())
            .ok_or(GridConnectError::InvalidIdentifierLength(rest.len()))?;

        let id = extended_id_from_hex(&rest[..format_index])?;
        let FrameFormat::Normal = rest[format_index].try_into()?;
        let data = unpack_data_bytes(&rest[format_index + 1..])?;

        CanFrame::new(id.as_raw(), &data).ok_or(GridConnectError::TooManyDataBytes(data.len()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum DecoderState {
    #[default]
    SyncStart,
    FindHeader,
    FindData,
}

/// Reassembles frames from a GridConnect byte stream. Bytes outside a
/// frame are skipped and a `:` always starts a new frame, so the decoder
/// resynchronises after garbage or a truncated frame.
#[derive(Debug, Default)]
pub struct GridConnectDecoder {
    state: DecoderState,
    buffer: Vec<u8, GRIDCONNECT_MAX_LENGTH>,
}

impl GridConnectDecoder {
    pub const fn new() -> Self {
        Self {
            state: DecoderState::SyncStart,
            buffer: Vec::new(),
        }
    }

    /// Feeds one byte. Returns `WouldBlock` until a frame is complete.
    pub fn push(&mut self, byte: u8) -> nb::Result<CanFrame, GridConnectError> {
        if byte == START {
            self.buffer.clear();
            self.state = DecoderState::FindHeader;
            return self.store(byte);
        }

        match self.state {
            DecoderState::SyncStart => Err(nb::Error::WouldBlock),
            DecoderState::FindHeader => {
                if self.buffer.len() == 1 {
                    if let Err(error) = IdKind::try_from(byte) {
                        return self.fail(error);
                    }
                } else if !byte.is_ascii_hexdigit() {
                    self.state = DecoderState::FindData;
                } else if self.buffer.len() == 2 + IDENTIFIER_DIGITS {
                    return self.fail(GridConnectError::InvalidIdentifierLength(IDENTIFIER_DIGITS + 1));
                }

                self.store(byte)
            }
            DecoderState::FindData => {
                if byte == TERMINATOR {
                    if self.buffer.push(byte).is_err() {
                        return self.fail(GridConnectError::MissingTerminator);
                    }

                    let result = CanFrame::from_gridconnect(&self.buffer);
                    self.reset();

                    return result.map_err(nb::Error::Other);
                }

                if !byte.is_ascii_hexdigit() {
                    return self.fail(GridConnectError::IllegalHexDigit(byte));
                }

                self.store(byte)
            }
        }
    }

    /// Drops any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = DecoderState::SyncStart;
    }

    fn store(&mut self, byte: u8) -> nb::Result<CanFrame, GridConnectError> {
        if self.buffer.push(byte).is_err() {
            return self.fail(GridConnectError::TooManyDataBytes(MAX_DATA_DIGITS / 2 + 1));
        }

        Err(nb::Error::WouldBlock)
    }

    fn fail(&mut self, error: GridConnectError) -> nb::Result<CanFrame, GridConnectError> {
        debug!("discarding GridConnect frame: {}", error);
        self.reset();

        Err(nb::Error::Other(error))
    }
}
