//! Request dispatch: unit id routing and function code handlers
//!
//! The dispatcher is synchronous. Every handler validates the whole request
//! before touching the store and turns store errors into exception responses
//! through [`ModbusError::to_exception`].

use log::debug;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{data_utils, Frame, ModbusFunction, ModbusResponse, UnitId, COIL_OFF, COIL_ON};
use crate::register_bank::{DeviceContext, ServerContext, TableKind};
use crate::utils::validation;

/// What the server loop should do with a dispatched frame
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Send this response
    Response(ModbusResponse),
    /// Broadcast executed on every device, nothing is sent
    Broadcast,
    /// Addressed to a unit this server does not serve
    Ignored,
}

/// Routes decoded frames to the devices of a [`ServerContext`]
#[derive(Debug, Clone)]
pub struct RequestDispatcher {
    context: ServerContext,
    unit_id: UnitId,
    broadcast_enable: bool,
}

impl RequestDispatcher {
    /// `unit_id` 0 accepts any unit; `broadcast_enable` makes unit 0 a
    /// broadcast executed silently on every device
    pub fn new(context: ServerContext, unit_id: UnitId, broadcast_enable: bool) -> Self {
        Self {
            context,
            unit_id,
            broadcast_enable,
        }
    }

    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    /// Process one frame
    ///
    /// ```rust
    /// use voltage_modbus_sim::dispatcher::{DispatchOutcome, RequestDispatcher};
    /// use voltage_modbus_sim::protocol::{Frame, ModbusFunction};
    /// use voltage_modbus_sim::register_bank::{Cell, CellType, DeviceContext, ServerContext, TableBlock};
    ///
    /// let bits = TableBlock::sequential(8, Cell::new(CellType::Bits, 0)).unwrap();
    /// let regs = TableBlock::sequential(8, Cell::new(CellType::Uint16, 7)).unwrap();
    /// let device = DeviceContext::plain(bits.clone(), bits, regs.clone(), regs);
    /// let dispatcher = RequestDispatcher::new(ServerContext::single(device), 0, false);
    ///
    /// let request = Frame::read(1, ModbusFunction::ReadHoldingRegisters, 0, 1);
    /// match dispatcher.dispatch(&request) {
    ///     DispatchOutcome::Response(response) => assert_eq!(response.data, vec![2, 0, 7]),
    ///     other => panic!("unexpected outcome {:?}", other),
    /// }
    /// ```
    pub fn dispatch(&self, frame: &Frame) -> DispatchOutcome {
        if frame.is_broadcast() && self.broadcast_enable {
            for device in self.context.devices() {
                if let Err(e) = execute(device, frame) {
                    debug!("Broadcast 0x{:02X} failed: {}", frame.function_code, e);
                }
            }
            return DispatchOutcome::Broadcast;
        }

        if self.unit_id != 0 && frame.unit_id != self.unit_id {
            debug!("Ignoring frame for unit {} (serving {})", frame.unit_id, self.unit_id);
            return DispatchOutcome::Ignored;
        }

        let device = match self.context.device(frame.unit_id) {
            Some(device) => device,
            None => {
                debug!("No device configured for unit {}", frame.unit_id);
                return DispatchOutcome::Ignored;
            }
        };

        let response = match execute(device, frame) {
            Ok(data) => ModbusResponse::new_success(frame.unit_id, frame.function_code, data),
            Err(e) => {
                debug!(
                    "Unit {} function 0x{:02X} address {}: {}",
                    frame.unit_id, frame.function_code, frame.address, e
                );
                ModbusResponse::new_exception(frame.unit_id, frame.function_code, e.to_exception())
            }
        };
        DispatchOutcome::Response(response)
    }
}

/// Run the request against one device and build the response payload
fn execute(device: &DeviceContext, frame: &Frame) -> ModbusResult<Vec<u8>> {
    let function = frame.function()?;
    let table = TableKind::for_function(function);

    match function {
        ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
            validation::validate_read_bits(frame.quantity)?;
            let bits = device.read_bits(table, frame.address, frame.quantity)?;
            let packed = data_utils::pack_bits(&bits);
            let mut data = Vec::with_capacity(1 + packed.len());
            data.push(packed.len() as u8);
            data.extend_from_slice(&packed);
            Ok(data)
        }
        ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
            validation::validate_read_registers(frame.quantity)?;
            let registers = device.read_registers(table, frame.address, frame.quantity)?;
            let bytes = data_utils::registers_to_bytes(&registers);
            let mut data = Vec::with_capacity(1 + bytes.len());
            data.push(bytes.len() as u8);
            data.extend_from_slice(&bytes);
            Ok(data)
        }
        ModbusFunction::WriteSingleCoil => {
            let raw = frame.single_value()?;
            let value = match raw {
                COIL_ON => true,
                COIL_OFF => false,
                other => {
                    return Err(ModbusError::invalid_data(format!(
                        "Coil value must be 0xFF00 or 0x0000, got 0x{:04X}",
                        other
                    )))
                }
            };
            device.write_bits(table, frame.address, &[value])?;
            Ok(echo(frame.address, raw))
        }
        ModbusFunction::WriteSingleRegister => {
            let value = frame.single_value()?;
            device.write_registers(table, frame.address, &[value])?;
            Ok(echo(frame.address, value))
        }
        ModbusFunction::WriteMultipleCoils => {
            validation::validate_write_coils(frame.quantity)?;
            validation::validate_byte_count((frame.quantity as usize + 7) / 8, frame.data.len())?;
            let bits = data_utils::unpack_bits(&frame.data, frame.quantity as usize);
            device.write_bits(table, frame.address, &bits)?;
            Ok(echo(frame.address, frame.quantity))
        }
        ModbusFunction::WriteMultipleRegisters => {
            validation::validate_write_registers(frame.quantity)?;
            validation::validate_byte_count(frame.quantity as usize * 2, frame.data.len())?;
            let registers = data_utils::bytes_to_registers(&frame.data)?;
            device.write_registers(table, frame.address, &registers)?;
            Ok(echo(frame.address, frame.quantity))
        }
    }
}

/// Address and value/quantity, as echoed by write responses
fn echo(address: u16, word: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(4);
    data.extend_from_slice(&address.to_be_bytes());
    data.extend_from_slice(&word.to_be_bytes());
    data
}
