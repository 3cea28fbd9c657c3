//! Modbus protocol definitions and data structures
//!
//! This module contains the core Modbus protocol definitions: function codes,
//! exception codes, the decoded request [`Frame`], the [`ModbusResponse`] built
//! by the dispatcher, and conversions between registers and typed values.
//!
//! Everything here works on the PDU (function code plus payload). Unit ids and
//! checksums belong to the serial ADU and are handled by [`crate::codec`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus unit identifier; 0 is the broadcast address
pub type UnitId = u8;

/// Value written by Write Single Coil to switch a coil on
pub const COIL_ON: u16 = 0xFF00;

/// Value written by Write Single Coil to switch a coil off
pub const COIL_OFF: u16 = 0x0000;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if the function addresses a bit table (coils or discrete inputs)
    pub fn is_bit_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteMultipleCoils
        )
    }
}

impl ModbusFunction {
    /// Human-readable name, e.g. "Read Holding Registers"
    pub fn name(self) -> &'static str {
        match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Short upper-case name as used in the Modbus application protocol document
    pub fn name(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "ILLEGAL_FUNCTION",
            ModbusException::IllegalDataAddress => "ILLEGAL_DATA_ADDRESS",
            ModbusException::IllegalDataValue => "ILLEGAL_DATA_VALUE",
            ModbusException::ServerDeviceFailure => "SERVER_DEVICE_FAILURE",
            ModbusException::Acknowledge => "ACKNOWLEDGE",
            ModbusException::ServerDeviceBusy => "SERVER_DEVICE_BUSY",
            ModbusException::MemoryParityError => "MEMORY_PARITY_ERROR",
            ModbusException::GatewayPathUnavailable => "GATEWAY_PATH_UNAVAILABLE",
            ModbusException::GatewayTargetDeviceFailedToRespond => "GATEWAY_TARGET_NO_RESPONSE",
        }
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
            ModbusException::Acknowledge => "The server has accepted the request and is processing it, but a long duration of time will be required to do so",
            ModbusException::ServerDeviceBusy => "The server is engaged in processing a long-duration program command",
            ModbusException::MemoryParityError => "The server attempted to read record file, but detected a parity error in the memory",
            ModbusException::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.to_u8())
    }
}

/// A decoded request
///
/// `data` carries the value bytes of write requests: the two value bytes for
/// single writes, the packed payload (without the byte count) for multiple
/// writes. For function codes this server does not implement, `data` holds the
/// raw PDU payload so the dispatcher can still answer with ILLEGAL_FUNCTION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub unit_id: UnitId,
    pub function_code: u8,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl Frame {
    /// Build a read request (function codes 0x01-0x04)
    pub fn read(unit_id: UnitId, function: ModbusFunction, address: ModbusAddress, quantity: u16) -> Self {
        Self {
            unit_id,
            function_code: function.to_u8(),
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Build a Write Single Coil request
    pub fn write_single_coil(unit_id: UnitId, address: ModbusAddress, value: bool) -> Self {
        let raw = if value { COIL_ON } else { COIL_OFF };
        Self {
            unit_id,
            function_code: ModbusFunction::WriteSingleCoil.to_u8(),
            address,
            quantity: 1,
            data: raw.to_be_bytes().to_vec(),
        }
    }

    /// Build a Write Single Register request
    pub fn write_single_register(unit_id: UnitId, address: ModbusAddress, value: u16) -> Self {
        Self {
            unit_id,
            function_code: ModbusFunction::WriteSingleRegister.to_u8(),
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        }
    }

    /// Build a Write Multiple Coils request
    pub fn write_multiple_coils(unit_id: UnitId, address: ModbusAddress, values: &[bool]) -> Self {
        Self {
            unit_id,
            function_code: ModbusFunction::WriteMultipleCoils.to_u8(),
            address,
            quantity: values.len() as u16,
            data: data_utils::pack_bits(values),
        }
    }

    /// Build a Write Multiple Registers request
    pub fn write_multiple_registers(unit_id: UnitId, address: ModbusAddress, values: &[u16]) -> Self {
        Self {
            unit_id,
            function_code: ModbusFunction::WriteMultipleRegisters.to_u8(),
            address,
            quantity: values.len() as u16,
            data: data_utils::registers_to_bytes(values),
        }
    }

    /// Resolve the function code, failing with `InvalidFunction` for unsupported codes
    pub fn function(&self) -> ModbusResult<ModbusFunction> {
        ModbusFunction::from_u8(self.function_code)
    }

    /// Check if the frame was sent to the broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.unit_id == 0
    }

    /// The 16-bit value carried by a single write request
    pub fn single_value(&self) -> ModbusResult<u16> {
        match self.data.as_slice() {
            [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
            _ => Err(ModbusError::frame("Single write carries no 16-bit value")),
        }
    }

    /// Decode a request PDU received for `unit_id`
    ///
    /// Structure is validated against the function code: read and single
    /// write requests are exactly 5 bytes, multiple writes are 6 bytes plus
    /// the announced byte count. Any mismatch is a frame error.
    pub fn from_pdu(unit_id: UnitId, pdu: &[u8]) -> ModbusResult<Self> {
        let (&function_code, body) = pdu
            .split_first()
            .ok_or_else(|| ModbusError::frame("Empty PDU"))?;

        let function = match ModbusFunction::from_u8(function_code) {
            Ok(function) => function,
            Err(_) => {
                return Ok(Self {
                    unit_id,
                    function_code,
                    address: 0,
                    quantity: 0,
                    data: body.to_vec(),
                })
            }
        };

        if body.len() < 4 {
            return Err(ModbusError::frame(format!(
                "{} request too short: {} bytes",
                function,
                pdu.len()
            )));
        }
        let address = u16::from_be_bytes([body[0], body[1]]);
        let word = u16::from_be_bytes([body[2], body[3]]);

        match function {
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                if body.len() != 4 {
                    return Err(ModbusError::frame(format!(
                        "{} request must be 5 bytes, got {}",
                        function,
                        pdu.len()
                    )));
                }
                Ok(Self {
                    unit_id,
                    function_code,
                    address,
                    quantity: 1,
                    data: body[2..4].to_vec(),
                })
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                let byte_count = *body
                    .get(4)
                    .ok_or_else(|| ModbusError::frame(format!("{} request missing byte count", function)))?
                    as usize;
                if body.len() != 5 + byte_count {
                    return Err(ModbusError::frame(format!(
                        "{} announces {} data bytes, carries {}",
                        function,
                        byte_count,
                        body.len() - 5
                    )));
                }
                Ok(Self {
                    unit_id,
                    function_code,
                    address,
                    quantity: word,
                    data: body[5..].to_vec(),
                })
            }
            _ => {
                if body.len() != 4 {
                    return Err(ModbusError::frame(format!(
                        "{} request must be 5 bytes, got {}",
                        function,
                        pdu.len()
                    )));
                }
                Ok(Self {
                    unit_id,
                    function_code,
                    address,
                    quantity: word,
                    data: Vec::new(),
                })
            }
        }
    }

    /// Encode the request PDU
    pub fn to_pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(6 + self.data.len());
        pdu.push(self.function_code);

        match ModbusFunction::from_u8(self.function_code) {
            Ok(ModbusFunction::WriteSingleCoil) | Ok(ModbusFunction::WriteSingleRegister) => {
                pdu.extend_from_slice(&self.address.to_be_bytes());
                pdu.extend_from_slice(&self.data);
            }
            Ok(ModbusFunction::WriteMultipleCoils) | Ok(ModbusFunction::WriteMultipleRegisters) => {
                pdu.extend_from_slice(&self.address.to_be_bytes());
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
                pdu.push(self.data.len() as u8);
                pdu.extend_from_slice(&self.data);
            }
            Ok(_) => {
                pdu.extend_from_slice(&self.address.to_be_bytes());
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
            }
            Err(_) => pdu.extend_from_slice(&self.data),
        }

        pdu
    }
}

/// Modbus response structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    pub unit_id: UnitId,
    pub function_code: u8,
    pub data: Vec<u8>,
    pub exception: Option<ModbusException>,
}

impl ModbusResponse {
    /// Create a successful response
    pub fn new_success(unit_id: UnitId, function_code: u8, data: Vec<u8>) -> Self {
        Self {
            unit_id,
            function_code,
            data,
            exception: None,
        }
    }

    /// Create an exception response
    pub fn new_exception(unit_id: UnitId, function_code: u8, exception: ModbusException) -> Self {
        Self {
            unit_id,
            function_code,
            data: Vec::new(),
            exception: Some(exception),
        }
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Get exception error if present
    pub fn get_exception(&self) -> Option<ModbusError> {
        self.exception
            .map(|exc| ModbusError::protocol(format!("Modbus exception: {}", exc)))
    }

    /// Encode the response PDU; exception responses set bit 7 of the function code
    pub fn to_pdu(&self) -> Vec<u8> {
        match self.exception {
            Some(exception) => vec![self.function_code | 0x80, exception.to_u8()],
            None => {
                let mut pdu = Vec::with_capacity(1 + self.data.len());
                pdu.push(self.function_code);
                pdu.extend_from_slice(&self.data);
                pdu
            }
        }
    }

    /// Decode a response PDU
    pub fn from_pdu(unit_id: UnitId, pdu: &[u8]) -> ModbusResult<Self> {
        let (&function_code, body) = pdu
            .split_first()
            .ok_or_else(|| ModbusError::frame("Empty PDU"))?;

        if function_code & 0x80 != 0 {
            let code = match body {
                [code] => *code,
                _ => return Err(ModbusError::frame("Exception response must be 2 bytes")),
            };
            let exception = ModbusException::from_u8(code)
                .ok_or_else(|| ModbusError::frame(format!("Unknown exception code 0x{:02X}", code)))?;
            return Ok(Self::new_exception(unit_id, function_code & 0x7F, exception));
        }

        Ok(Self::new_success(unit_id, function_code, body.to_vec()))
    }

    /// Parse response data as registers (u16 values)
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        if let Some(error) = self.get_exception() {
            return Err(error);
        }

        let (&byte_count, payload) = self
            .data
            .split_first()
            .ok_or_else(|| ModbusError::frame("Empty response data"))?;
        let byte_count = byte_count as usize;
        if payload.len() < byte_count {
            return Err(ModbusError::frame("Incomplete register data"));
        }
        if byte_count % 2 != 0 {
            return Err(ModbusError::frame("Invalid register data length"));
        }

        data_utils::bytes_to_registers(&payload[..byte_count])
    }

    /// Parse response data as bits (bool values, LSB first, padded to whole bytes)
    pub fn parse_bits(&self) -> ModbusResult<Vec<bool>> {
        if let Some(error) = self.get_exception() {
            return Err(error);
        }

        let (&byte_count, payload) = self
            .data
            .split_first()
            .ok_or_else(|| ModbusError::frame("Empty response data"))?;
        let byte_count = byte_count as usize;
        if payload.len() < byte_count {
            return Err(ModbusError::frame("Incomplete bit data"));
        }

        Ok(data_utils::unpack_bits(&payload[..byte_count], byte_count * 8))
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::invalid_data("Byte array length must be even"));
        }

        Ok(bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Pack boolean values into bytes, LSB first
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values; missing bytes read as `false`
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map(|byte| byte & (1 << (i % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Convert u32 to two u16 registers (big-endian)
    pub fn u32_to_registers(value: u32) -> [u16; 2] {
        [(value >> 16) as u16, value as u16]
    }

    /// Convert two u16 registers to u32 (big-endian)
    pub fn registers_to_u32(registers: &[u16]) -> ModbusResult<u32> {
        match registers {
            [hi, lo, ..] => Ok(((*hi as u32) << 16) | (*lo as u32)),
            _ => Err(ModbusError::invalid_data("Need at least 2 registers for u32")),
        }
    }

    /// Convert f32 to two u16 registers (IEEE 754, big-endian)
    pub fn f32_to_registers(value: f32) -> [u16; 2] {
        u32_to_registers(value.to_bits())
    }

    /// Convert two u16 registers to f32 (IEEE 754, big-endian)
    pub fn registers_to_f32(registers: &[u16]) -> ModbusResult<f32> {
        Ok(f32::from_bits(registers_to_u32(registers)?))
    }

    /// Convert text to `width` registers, two characters per register, high byte first
    ///
    /// Short text is padded with spaces; long text is truncated.
    pub fn string_to_registers(text: &str, width: usize) -> Vec<u16> {
        let mut bytes: Vec<u8> = text.bytes().take(width * 2).collect();
        bytes.resize(width * 2, b' ');
        bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Convert registers back to text, dropping trailing padding
    pub fn registers_to_string(registers: &[u16]) -> String {
        let bytes = registers_to_bytes(registers);
        String::from_utf8_lossy(&bytes)
            .trim_end_matches(|c| c == ' ' || c == '\0')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x03).unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(ModbusFunction::ReadHoldingRegisters.to_u8(), 0x03);
        assert!(ModbusFunction::WriteMultipleCoils.is_bit_function());
        assert!(!ModbusFunction::ReadInputRegisters.is_bit_function());

        assert!(ModbusFunction::from_u8(0xFF).is_err());
    }

    #[test]
    fn test_exception_conversion() {
        assert_eq!(ModbusException::from_u8(0x02).unwrap(), ModbusException::IllegalDataAddress);
        assert_eq!(ModbusException::IllegalDataAddress.to_u8(), 0x02);
        assert_eq!(
            format!("{}", ModbusException::IllegalDataValue),
            "ILLEGAL_DATA_VALUE (0x03)"
        );
    }

    #[test]
    fn test_read_request_pdu() {
        let frame = Frame::from_pdu(1, &[0x03, 0x00, 0x64, 0x00, 0x02]).unwrap();
        assert_eq!(frame.function().unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(frame.address, 100);
        assert_eq!(frame.quantity, 2);
        assert!(frame.data.is_empty());
        assert_eq!(frame.to_pdu(), vec![0x03, 0x00, 0x64, 0x00, 0x02]);

        // One byte too many for a read request
        assert!(Frame::from_pdu(1, &[0x03, 0x00, 0x64, 0x00, 0x02, 0x00]).is_err());
        assert!(Frame::from_pdu(1, &[0x03, 0x00]).is_err());
        assert!(Frame::from_pdu(1, &[]).is_err());
    }

    #[test]
    fn test_write_request_pdu() {
        let frame = Frame::from_pdu(1, &[0x06, 0x00, 0x10, 0x12, 0x34]).unwrap();
        assert_eq!(frame.quantity, 1);
        assert_eq!(frame.single_value().unwrap(), 0x1234);
        assert_eq!(frame, Frame::write_single_register(1, 16, 0x1234));

        let pdu = [0x10, 0x00, 0x10, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x00, 0x0B];
        let frame = Frame::from_pdu(1, &pdu).unwrap();
        assert_eq!(frame, Frame::write_multiple_registers(1, 16, &[10, 11]));
        assert_eq!(frame.to_pdu(), pdu.to_vec());

        // Byte count says 4, only 3 follow
        assert!(Frame::from_pdu(1, &[0x10, 0x00, 0x10, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x00]).is_err());

        let frame = Frame::write_multiple_coils(1, 20, &[true, false, true]);
        assert_eq!(frame.to_pdu(), vec![0x0F, 0x00, 0x14, 0x00, 0x03, 0x01, 0x05]);
    }

    #[test]
    fn test_unknown_function_keeps_payload() {
        let frame = Frame::from_pdu(7, &[0x2B, 0x0E, 0x01, 0x00]).unwrap();
        assert_eq!(frame.function_code, 0x2B);
        assert_eq!(frame.data, vec![0x0E, 0x01, 0x00]);
        assert!(frame.function().is_err());
        assert_eq!(frame.to_pdu(), vec![0x2B, 0x0E, 0x01, 0x00]);
    }

    #[test]
    fn test_data_utils() {
        let registers = vec![0x1234, 0x5678];
        let bytes = data_utils::registers_to_bytes(&registers);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(data_utils::bytes_to_registers(&bytes).unwrap(), registers);
        assert!(data_utils::bytes_to_registers(&[0x01]).is_err());

        let bits = vec![true, false, true, true, false, false, false, false, true];
        let packed = data_utils::pack_bits(&bits);
        assert_eq!(packed, vec![0x0D, 0x01]);
        assert_eq!(data_utils::unpack_bits(&packed, bits.len()), bits);

        assert_eq!(data_utils::u32_to_registers(345000), [0x0005, 0x43A8]);
        assert_eq!(data_utils::registers_to_u32(&[0x0005, 0x43A8]).unwrap(), 345000);
        let regs = data_utils::f32_to_registers(127.4);
        assert_eq!(data_utils::registers_to_f32(&regs).unwrap(), 127.4);
    }

    #[test]
    fn test_string_registers() {
        let regs = data_utils::string_to_registers("Str", 2);
        assert_eq!(regs, vec![0x5374, 0x7220]);
        assert_eq!(data_utils::registers_to_string(&regs), "Str");

        let regs = data_utils::string_to_registers("Strxyz", 2);
        assert_eq!(data_utils::registers_to_string(&regs), "Strx");
    }

    #[test]
    fn test_response_pdu() {
        let response = ModbusResponse::new_exception(1, 0x03, ModbusException::IllegalDataAddress);
        assert_eq!(response.to_pdu(), vec![0x83, 0x02]);
        assert_eq!(ModbusResponse::from_pdu(1, &[0x83, 0x02]).unwrap(), response);
        assert!(response.parse_registers().is_err());

        let response = ModbusResponse::from_pdu(1, &[0x03, 0x04, 0x12, 0x34, 0x56, 0x78]).unwrap();
        assert_eq!(response.parse_registers().unwrap(), vec![0x1234, 0x5678]);

        let response = ModbusResponse::new_success(1, 0x01, vec![1, 0b1010_1010]);
        let bits = response.parse_bits().unwrap();
        assert_eq!(bits.len(), 8);
        assert!(!bits[0]); // LSB first
        assert!(bits[1]);
        assert!(!bits[2]);
        assert!(bits[3]);
    }
}
