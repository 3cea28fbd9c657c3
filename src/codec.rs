//! # Serial Frame Codec
//!
//! Encoding and decoding of Modbus serial ADUs in both wire formats:
//!
//! ### Modbus RTU
//! - Binary frame: `unit id | PDU | CRC16` with the CRC sent low byte first
//! - No delimiters; a frame ends after 3.5 character times of line silence,
//!   so [`RtuFrameBuffer`] only yields a frame when the caller reports silence
//! - Frames with a bad CRC are dropped without a response
//!
//! ### Modbus ASCII
//! - Text frame: `:` + hex(unit id | PDU | LRC) + CR LF
//! - [`AsciiFrameBuffer`] splits the byte stream on the delimiters
//! - Frames with a bad LRC are dropped without a response
//!
//! ```rust
//! use voltage_modbus_sim::codec::{FrameCodec, FramerKind};
//! use voltage_modbus_sim::protocol::{Frame, ModbusFunction};
//!
//! let codec = FrameCodec::new(FramerKind::Rtu);
//! let request = Frame::read(1, ModbusFunction::ReadHoldingRegisters, 0, 2);
//! let adu = codec.encode_request(&request);
//! assert_eq!(adu, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
//! assert_eq!(codec.decode_request(&adu).unwrap(), request);
//! ```

use std::fmt;
use std::str::FromStr;

use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{Frame, ModbusResponse, UnitId};
use crate::{MAX_ASCII_FRAME_SIZE, MAX_RTU_FRAME_SIZE};

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Smallest RTU ADU: unit id, function code, CRC
const MIN_RTU_FRAME_SIZE: usize = 4;

/// Calculate the Modbus CRC16 (polynomial 0xA001, init 0xFFFF)
///
/// The result is transmitted little-endian: `01 03 00 00 00 02` is followed
/// on the wire by `C4 0B`, so the value returned here is `0x0BC4`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Calculate the Modbus LRC: two's complement of the byte sum, modulo 256
pub fn lrc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |sum, &byte| sum.wrapping_add(byte))
        .wrapping_neg()
}

/// Convert byte to 2-character upper-case ASCII hex
fn byte_to_ascii_hex(byte: u8) -> [u8; 2] {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    [DIGITS[(byte >> 4) as usize], DIGITS[(byte & 0x0F) as usize]]
}

/// Convert single ASCII character to hex value
fn ascii_char_to_hex(c: u8) -> ModbusResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(ModbusError::frame(format!(
            "Invalid ASCII hex character: 0x{:02X}",
            c
        ))),
    }
}

/// Convert 2-character ASCII hex to byte
fn ascii_hex_to_byte(pair: &[u8]) -> ModbusResult<u8> {
    match pair {
        [high, low] => Ok((ascii_char_to_hex(*high)? << 4) | ascii_char_to_hex(*low)?),
        _ => Err(ModbusError::frame("Invalid ASCII hex length")),
    }
}

/// Serial wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramerKind {
    #[default]
    Rtu,
    Ascii,
}

impl FromStr for FramerKind {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rtu" => Ok(FramerKind::Rtu),
            "ascii" => Ok(FramerKind::Ascii),
            other => Err(ModbusError::configuration(format!(
                "Unknown framer '{}', expected rtu or ascii",
                other
            ))),
        }
    }
}

impl fmt::Display for FramerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramerKind::Rtu => write!(f, "RTU"),
            FramerKind::Ascii => write!(f, "ASCII"),
        }
    }
}

/// Stateless ADU encoder/decoder for one wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    kind: FramerKind,
}

impl FrameCodec {
    /// Create a codec for the given wire format
    pub fn new(kind: FramerKind) -> Self {
        Self { kind }
    }

    /// Wire format of this codec
    pub fn kind(&self) -> FramerKind {
        self.kind
    }

    /// Wrap a PDU into a complete ADU with unit id and checksum
    pub fn encode_adu(&self, unit_id: UnitId, pdu: &[u8]) -> Vec<u8> {
        let mut raw = Vec::with_capacity(pdu.len() + 3);
        raw.push(unit_id);
        raw.extend_from_slice(pdu);

        match self.kind {
            FramerKind::Rtu => {
                let crc = crc16(&raw);
                raw.extend_from_slice(&crc.to_le_bytes());
                raw
            }
            FramerKind::Ascii => {
                raw.push(lrc(&raw));
                let mut frame = Vec::with_capacity(raw.len() * 2 + 3);
                frame.push(b':');
                for &byte in &raw {
                    frame.extend_from_slice(&byte_to_ascii_hex(byte));
                }
                frame.extend_from_slice(b"\r\n");
                frame
            }
        }
    }

    /// Validate an ADU and split it into unit id and PDU
    ///
    /// Returns a frame error for structural problems and `CrcMismatch` or
    /// `LrcMismatch` for checksum failures.
    pub fn decode_adu(&self, adu: &[u8]) -> ModbusResult<(UnitId, Vec<u8>)> {
        match self.kind {
            FramerKind::Rtu => Self::decode_rtu(adu),
            FramerKind::Ascii => Self::decode_ascii(adu),
        }
    }

    fn decode_rtu(adu: &[u8]) -> ModbusResult<(UnitId, Vec<u8>)> {
        if adu.len() < MIN_RTU_FRAME_SIZE {
            return Err(ModbusError::frame(format!("RTU frame too short: {} bytes", adu.len())));
        }
        if adu.len() > MAX_RTU_FRAME_SIZE {
            return Err(ModbusError::frame(format!("RTU frame too large: {} bytes", adu.len())));
        }

        let (body, checksum) = adu.split_at(adu.len() - 2);
        let received = u16::from_le_bytes([checksum[0], checksum[1]]);
        let calculated = crc16(body);
        if received != calculated {
            return Err(ModbusError::crc_mismatch(calculated, received));
        }

        Ok((body[0], body[1..].to_vec()))
    }

    fn decode_ascii(adu: &[u8]) -> ModbusResult<(UnitId, Vec<u8>)> {
        if adu.len() > MAX_ASCII_FRAME_SIZE {
            return Err(ModbusError::frame(format!("ASCII frame too large: {} bytes", adu.len())));
        }
        let hex = adu
            .strip_prefix(b":")
            .ok_or_else(|| ModbusError::frame("Invalid ASCII frame start character"))?
            .strip_suffix(b"\r\n")
            .ok_or_else(|| ModbusError::frame("Invalid ASCII frame end characters"))?;
        if hex.len() % 2 != 0 {
            return Err(ModbusError::frame("Invalid ASCII frame length"));
        }

        let mut raw = hex
            .chunks_exact(2)
            .map(ascii_hex_to_byte)
            .collect::<ModbusResult<Vec<u8>>>()?;

        // unit id, function code, LRC
        if raw.len() < 3 {
            return Err(ModbusError::frame("ASCII frame too short after decoding"));
        }

        let received = raw.pop().unwrap_or_default();
        let calculated = lrc(&raw);
        if received != calculated {
            return Err(ModbusError::lrc_mismatch(calculated, received));
        }

        Ok((raw[0], raw[1..].to_vec()))
    }

    /// Decode a request ADU into a [`Frame`]
    pub fn decode_request(&self, adu: &[u8]) -> ModbusResult<Frame> {
        let (unit_id, pdu) = self.decode_adu(adu)?;
        Frame::from_pdu(unit_id, &pdu)
    }

    /// Encode a request [`Frame`] into an ADU
    pub fn encode_request(&self, frame: &Frame) -> Vec<u8> {
        self.encode_adu(frame.unit_id, &frame.to_pdu())
    }

    /// Encode a response into an ADU
    pub fn encode_response(&self, response: &ModbusResponse) -> Vec<u8> {
        self.encode_adu(response.unit_id, &response.to_pdu())
    }

    /// Decode a response ADU
    pub fn decode_response(&self, adu: &[u8]) -> ModbusResult<ModbusResponse> {
        let (unit_id, pdu) = self.decode_adu(adu)?;
        ModbusResponse::from_pdu(unit_id, &pdu)
    }
}

/// Accumulates RTU bytes until the line goes silent
///
/// The buffer never decides on its own where a frame ends; the owner calls
/// [`RtuFrameBuffer::on_silence`] once no byte arrived for one frame gap.
#[derive(Debug, Default)]
pub struct RtuFrameBuffer {
    buffer: Vec<u8>,
    overflowed: bool,
}

impl RtuFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    ///
    /// Overrunning the maximum RTU size discards the frame; bytes keep being
    /// swallowed until the next silence so the tail is not mistaken for a frame.
    pub fn push(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        if self.overflowed {
            return Ok(());
        }
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_RTU_FRAME_SIZE {
            let len = self.buffer.len();
            self.buffer.clear();
            self.overflowed = true;
            return Err(ModbusError::frame(format!("RTU frame too large: {}+ bytes", len)));
        }
        Ok(())
    }

    /// Close the current frame after a frame gap of silence
    pub fn on_silence(&mut self) -> Option<Vec<u8>> {
        if self.overflowed {
            self.overflowed = false;
            return None;
        }
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Check whether bytes of an unfinished frame are pending
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && !self.overflowed
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.overflowed = false;
    }
}

/// Splits an ASCII byte stream into `:`...CRLF frames
#[derive(Debug, Default)]
pub struct AsciiFrameBuffer {
    buffer: Vec<u8>,
    in_frame: bool,
}

impl AsciiFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns a complete frame (delimiters included) or an
    /// overflow error once the frame is finished or abandoned
    ///
    /// A `:` always starts a new frame, discarding any partial one. Bytes
    /// outside a frame are ignored.
    pub fn push_byte(&mut self, byte: u8) -> Option<ModbusResult<Vec<u8>>> {
        if byte == b':' {
            self.buffer.clear();
            self.buffer.push(byte);
            self.in_frame = true;
            return None;
        }
        if !self.in_frame {
            return None;
        }

        self.buffer.push(byte);
        if byte == b'\n' && self.buffer.ends_with(b"\r\n") {
            self.in_frame = false;
            return Some(Ok(std::mem::take(&mut self.buffer)));
        }
        if self.buffer.len() > MAX_ASCII_FRAME_SIZE {
            self.reset();
            return Some(Err(ModbusError::frame("ASCII frame too large")));
        }
        None
    }

    /// Check whether a frame has been started but not finished
    pub fn is_partial(&self) -> bool {
        self.in_frame
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_frame = false;
    }
}
