//! Modbus register bank for server-side data storage
//!
//! Storage is organised in three layers:
//!
//! - [`Cell`]: one 16-bit register (or one coil in a plain bit block) with its
//!   declared type, access flags and optional action
//! - [`TableBlock`]: a fixed set of cells, either sequential (dense, base
//!   address 0) or sparse (only declared addresses exist)
//! - [`DeviceContext`]: the four Modbus tables of one unit, either sharing a
//!   single block or each owning its own
//!
//! Values wider than one register (uint32, float32, strings) occupy a head
//! cell carrying the type followed by [`CellType::Next`] cells. Bit tables of
//! blocks built by the simulator overlay are packed 16 coils per register,
//! LSB first.
//!
//! Every multi-address access is validated completely before anything is
//! touched; a rejected write leaves the store unchanged.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::actions::{Action, ActionEngine};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{data_utils, ModbusFunction, UnitId};

/// Number of addressable registers in one table
pub const MAX_BLOCK_SIZE: usize = 0x1_0000;

/// The four Modbus data tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
    /// Coils (read/write) - 1 bit each
    Coils,
    /// Discrete inputs (read-only) - 1 bit each
    DiscreteInputs,
    /// Holding registers (read/write) - 16 bits each
    HoldingRegisters,
    /// Input registers (read-only) - 16 bits each
    InputRegisters,
}

impl TableKind {
    pub fn is_bit_table(self) -> bool {
        matches!(self, TableKind::Coils | TableKind::DiscreteInputs)
    }

    /// Table addressed by a function code
    pub fn for_function(function: ModbusFunction) -> Self {
        match function {
            ModbusFunction::ReadCoils
            | ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteMultipleCoils => TableKind::Coils,
            ModbusFunction::ReadDiscreteInputs => TableKind::DiscreteInputs,
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::WriteSingleRegister
            | ModbusFunction::WriteMultipleRegisters => TableKind::HoldingRegisters,
            ModbusFunction::ReadInputRegisters => TableKind::InputRegisters,
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TableKind::Coils => "coils",
            TableKind::DiscreteInputs => "discrete inputs",
            TableKind::HoldingRegisters => "holding registers",
            TableKind::InputRegisters => "input registers",
        };
        write!(f, "{}", name)
    }
}

/// Declared type of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellType {
    Bits,
    Uint16,
    Uint32,
    Float32,
    String,
    /// Continuation of the multi-register value that starts before it
    Next,
}

impl CellType {
    /// Registers occupied by one value, `None` for strings (sized by their range)
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            CellType::Uint32 | CellType::Float32 => Some(2),
            CellType::String => None,
            _ => Some(1),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CellType::Bits => "bits",
            CellType::Uint16 => "uint16",
            CellType::Uint32 => "uint32",
            CellType::Float32 => "float32",
            CellType::String => "string",
            CellType::Next => "next",
        }
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One addressable register
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub cell_type: CellType,
    pub value: u16,
    pub writable: bool,
    pub invalid: bool,
    pub action: Option<Action>,
}

impl Cell {
    /// A writable, valid cell without action
    pub fn new(cell_type: CellType, value: u16) -> Self {
        Self {
            cell_type,
            value,
            writable: true,
            invalid: false,
            action: None,
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::new(CellType::Uint16, 0)
    }
}

/// Decoded value starting at an address
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Bits(u16),
    Uint16(u16),
    Uint32(u32),
    Float32(f32),
    String(String),
}

impl CellValue {
    pub fn cell_type(&self) -> CellType {
        match self {
            CellValue::Bits(_) => CellType::Bits,
            CellValue::Uint16(_) => CellType::Uint16,
            CellValue::Uint32(_) => CellType::Uint32,
            CellValue::Float32(_) => CellType::Float32,
            CellValue::String(_) => CellType::String,
        }
    }

    /// Register image of the value; strings are padded or cut to `width`
    pub fn to_registers(&self, width: usize) -> Vec<u16> {
        match self {
            CellValue::Bits(value) | CellValue::Uint16(value) => vec![*value],
            CellValue::Uint32(value) => data_utils::u32_to_registers(*value).to_vec(),
            CellValue::Float32(value) => data_utils::f32_to_registers(*value).to_vec(),
            CellValue::String(text) => data_utils::string_to_registers(text, width.max(1)),
        }
    }

    /// Decode registers according to the head cell type
    pub fn from_registers(cell_type: CellType, registers: &[u16]) -> ModbusResult<Self> {
        let first = registers
            .first()
            .copied()
            .ok_or_else(|| ModbusError::invalid_data("No registers to decode"))?;
        match cell_type {
            CellType::Bits => Ok(CellValue::Bits(first)),
            CellType::Uint16 => Ok(CellValue::Uint16(first)),
            CellType::Uint32 => Ok(CellValue::Uint32(data_utils::registers_to_u32(registers)?)),
            CellType::Float32 => Ok(CellValue::Float32(data_utils::registers_to_f32(registers)?)),
            CellType::String => Ok(CellValue::String(data_utils::registers_to_string(registers))),
            CellType::Next => Err(ModbusError::invalid_data("Continuation cell has no value of its own")),
        }
    }
}

#[derive(Debug, Clone)]
enum Storage {
    Sequential(Vec<Cell>),
    Sparse(BTreeMap<u16, Cell>),
}

/// Fixed-size container of cells for one or more tables
///
/// Sequential blocks hold addresses `0..size`. Sparse blocks hold exactly the
/// addresses they were built with. Neither grows on access.
#[derive(Debug, Clone)]
pub struct TableBlock {
    storage: Storage,
    packed_bits: bool,
}

impl TableBlock {
    /// Dense block of `size` copies of `template`
    pub fn sequential(size: usize, template: Cell) -> ModbusResult<Self> {
        if size > MAX_BLOCK_SIZE {
            return Err(ModbusError::configuration(format!(
                "Block size {} exceeds {} registers",
                size, MAX_BLOCK_SIZE
            )));
        }
        Ok(Self {
            storage: Storage::Sequential(vec![template; size]),
            packed_bits: false,
        })
    }

    /// Block holding only the given addresses
    pub fn sparse<I: IntoIterator<Item = (u16, Cell)>>(cells: I) -> Self {
        Self {
            storage: Storage::Sparse(cells.into_iter().collect()),
            packed_bits: false,
        }
    }

    /// Store coils and discrete inputs 16 per register, LSB first
    pub fn packed(mut self) -> Self {
        self.packed_bits = true;
        self
    }

    pub fn is_packed(&self) -> bool {
        self.packed_bits
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.storage, Storage::Sparse(_))
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Sequential(cells) => cells.len(),
            Storage::Sparse(cells) => cells.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, address: u16) -> Option<&Cell> {
        match &self.storage {
            Storage::Sequential(cells) => cells.get(address as usize),
            Storage::Sparse(cells) => cells.get(&address),
        }
    }

    pub fn get_mut(&mut self, address: u16) -> Option<&mut Cell> {
        match &mut self.storage {
            Storage::Sequential(cells) => cells.get_mut(address as usize),
            Storage::Sparse(cells) => cells.get_mut(&address),
        }
    }

    /// Put a cell at `address`
    ///
    /// Sparse blocks gain the address; sequential blocks only accept
    /// addresses inside their size.
    pub fn insert(&mut self, address: u16, cell: Cell) -> ModbusResult<()> {
        match &mut self.storage {
            Storage::Sequential(cells) => {
                let len = cells.len();
                let slot = cells.get_mut(address as usize).ok_or_else(|| {
                    ModbusError::configuration(format!(
                        "Address {} outside sequential block of size {}",
                        address, len
                    ))
                })?;
                *slot = cell;
            }
            Storage::Sparse(cells) => {
                cells.insert(address, cell);
            }
        }
        Ok(())
    }

    /// All addresses present, ascending
    pub fn addresses(&self) -> Vec<u16> {
        match &self.storage {
            Storage::Sequential(cells) => (0..cells.len()).map(|a| a as u16).collect(),
            Storage::Sparse(cells) => cells.keys().copied().collect(),
        }
    }

    /// Registers used by the value starting at `address`: the head plus its `Next` cells
    pub fn span_width(&self, address: u16) -> usize {
        let mut width = 1;
        while let Some(next) = address.checked_add(width as u16) {
            match self.get(next) {
                Some(cell) if cell.cell_type == CellType::Next => width += 1,
                _ => break,
            }
        }
        width
    }

    /// Raw values of `width` consecutive registers, `None` if any is missing
    pub fn read_span(&self, address: u16, width: usize) -> Option<Vec<u16>> {
        (0..width)
            .map(|offset| {
                address
                    .checked_add(offset as u16)
                    .and_then(|a| self.get(a))
                    .map(|cell| cell.value)
            })
            .collect()
    }

    /// Overwrite consecutive register values, skipping addresses that do not exist
    pub fn write_span(&mut self, address: u16, values: &[u16]) {
        for (offset, &value) in values.iter().enumerate() {
            if let Some(cell) = address
                .checked_add(offset as u16)
                .and_then(|a| self.get_mut(a))
            {
                cell.value = value;
            }
        }
    }

    fn read_bit(&self, address: u16) -> bool {
        if self.packed_bits {
            self.get(address / 16)
                .map(|cell| (cell.value >> (address % 16)) & 1 == 1)
                .unwrap_or(false)
        } else {
            self.get(address).map(|cell| cell.value != 0).unwrap_or(false)
        }
    }

    fn write_bit(&mut self, address: u16, value: bool) {
        let packed = self.packed_bits;
        let register = if packed { address / 16 } else { address };
        if let Some(cell) = self.get_mut(register) {
            if packed {
                let mask = 1u16 << (address % 16);
                if value {
                    cell.value |= mask;
                } else {
                    cell.value &= !mask;
                }
            } else {
                cell.value = value as u16;
            }
        }
    }

    /// Register that stores a bit address
    fn bit_register(&self, address: u16) -> u16 {
        if self.packed_bits {
            address / 16
        } else {
            address
        }
    }
}

/// Table blocks of one device
#[derive(Debug, Clone)]
pub enum DeviceBlocks {
    /// All four tables view the same block
    Shared(TableBlock),
    /// Each table owns its own block
    Separate {
        coils: TableBlock,
        discrete_inputs: TableBlock,
        holding_registers: TableBlock,
        input_registers: TableBlock,
    },
}

impl DeviceBlocks {
    pub fn block(&self, kind: TableKind) -> &TableBlock {
        match self {
            DeviceBlocks::Shared(block) => block,
            DeviceBlocks::Separate {
                coils,
                discrete_inputs,
                holding_registers,
                input_registers,
            } => match kind {
                TableKind::Coils => coils,
                TableKind::DiscreteInputs => discrete_inputs,
                TableKind::HoldingRegisters => holding_registers,
                TableKind::InputRegisters => input_registers,
            },
        }
    }

    pub fn block_mut(&mut self, kind: TableKind) -> &mut TableBlock {
        match self {
            DeviceBlocks::Shared(block) => block,
            DeviceBlocks::Separate {
                coils,
                discrete_inputs,
                holding_registers,
                input_registers,
            } => match kind {
                TableKind::Coils => coils,
                TableKind::DiscreteInputs => discrete_inputs,
                TableKind::HoldingRegisters => holding_registers,
                TableKind::InputRegisters => input_registers,
            },
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, DeviceBlocks::Shared(_))
    }
}

#[derive(Debug)]
struct DeviceState {
    blocks: DeviceBlocks,
    engine: Arc<ActionEngine>,
    type_exception: bool,
}

/// Convert a start address and count into a register range, rejecting
/// empty requests and ranges running past address 65535
fn address_range(address: u16, count: usize) -> ModbusResult<Range<u32>> {
    let start = address as u32;
    let end = start + count as u32;
    if count == 0 || end as usize > MAX_BLOCK_SIZE {
        return Err(ModbusError::invalid_address(address, count.min(u16::MAX as usize) as u16));
    }
    Ok(start..end)
}

impl DeviceState {
    fn validate_registers(&self, kind: TableKind, range: Range<u32>, write: bool) -> ModbusResult<()> {
        let block = self.blocks.block(kind);
        for raw in range.clone() {
            let address = raw as u16;
            let cell = block
                .get(address)
                .ok_or_else(|| ModbusError::not_found(kind, address))?;
            if cell.invalid {
                return Err(ModbusError::invalid_cell(kind, address));
            }
            if write && !cell.writable {
                return Err(ModbusError::not_writable(kind, address));
            }
            if self.type_exception && cell.cell_type == CellType::Bits {
                return Err(ModbusError::type_mismatch(kind, address));
            }
        }

        if self.type_exception {
            let starts_inside = block
                .get(range.start as u16)
                .map(|cell| cell.cell_type == CellType::Next)
                .unwrap_or(false);
            if starts_inside {
                return Err(ModbusError::type_mismatch(kind, range.start as u16));
            }
            let ends_inside = (range.end as usize) < MAX_BLOCK_SIZE
                && block
                    .get(range.end as u16)
                    .map(|cell| cell.cell_type == CellType::Next)
                    .unwrap_or(false);
            if ends_inside {
                return Err(ModbusError::type_mismatch(kind, (range.end - 1) as u16));
            }
        }
        Ok(())
    }

    /// Validate a bit range and return the registers it touches
    fn validate_bits(&self, kind: TableKind, range: Range<u32>, write: bool) -> ModbusResult<BTreeSet<u16>> {
        let block = self.blocks.block(kind);
        let mut touched = BTreeSet::new();
        for raw in range {
            let address = raw as u16;
            let register = block.bit_register(address);
            let cell = block
                .get(register)
                .ok_or_else(|| ModbusError::not_found(kind, address))?;
            if cell.invalid {
                return Err(ModbusError::invalid_cell(kind, address));
            }
            if write && !cell.writable {
                return Err(ModbusError::not_writable(kind, address));
            }
            if self.type_exception && cell.cell_type != CellType::Bits {
                return Err(ModbusError::type_mismatch(kind, address));
            }
            touched.insert(register);
        }
        Ok(touched)
    }

    fn run_actions<I: IntoIterator<Item = u16>>(&mut self, kind: TableKind, registers: I) {
        let DeviceState { blocks, engine, .. } = self;
        let block = blocks.block_mut(kind);
        for register in registers {
            engine.apply(block, register);
        }
    }
}

/// Thread-safe handle to the tables of one unit
///
/// Cloning the handle shares the same storage.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    state: Arc<Mutex<DeviceState>>,
}

impl DeviceContext {
    /// Create a device from its blocks and the engine that runs cell actions
    ///
    /// With `type_exception` set, accesses that do not match the declared
    /// cell type (bit functions on register cells, register accesses that
    /// split a multi-register value) are rejected.
    pub fn new(blocks: DeviceBlocks, engine: Arc<ActionEngine>, type_exception: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                blocks,
                engine,
                type_exception,
            })),
        }
    }

    /// Device with four independent plain blocks and no actions
    ///
    /// ```rust
    /// use voltage_modbus_sim::register_bank::{Cell, CellType, DeviceContext, TableBlock, TableKind};
    ///
    /// let bits = TableBlock::sequential(10, Cell::new(CellType::Bits, 0)).unwrap();
    /// let regs = TableBlock::sparse((0..10).map(|a| (a, Cell::default())));
    /// let device = DeviceContext::plain(bits.clone(), bits, regs.clone(), regs);
    ///
    /// device.write_registers(TableKind::HoldingRegisters, 2, &[42]).unwrap();
    /// assert_eq!(device.read_registers(TableKind::HoldingRegisters, 2, 1).unwrap(), vec![42]);
    /// assert!(device.read_registers(TableKind::HoldingRegisters, 10, 1).is_err());
    /// ```
    pub fn plain(
        coils: TableBlock,
        discrete_inputs: TableBlock,
        holding_registers: TableBlock,
        input_registers: TableBlock,
    ) -> Self {
        Self::new(
            DeviceBlocks::Separate {
                coils,
                discrete_inputs,
                holding_registers,
                input_registers,
            },
            Arc::new(ActionEngine::default()),
            false,
        )
    }

    fn lock(&self) -> ModbusResult<MutexGuard<'_, DeviceState>> {
        self.state
            .lock()
            .map_err(|_| ModbusError::internal("Failed to lock device state"))
    }

    /// Read coils or discrete inputs (function codes 0x01/0x02)
    pub fn read_bits(&self, kind: TableKind, address: u16, count: u16) -> ModbusResult<Vec<bool>> {
        let mut state = self.lock()?;
        let range = address_range(address, count as usize)?;
        let touched = state.validate_bits(kind, range.clone(), false)?;

        let block = state.blocks.block(kind);
        let values = range.map(|raw| block.read_bit(raw as u16)).collect();

        state.run_actions(kind, touched);
        Ok(values)
    }

    /// Write coils (function codes 0x05/0x0F)
    pub fn write_bits(&self, kind: TableKind, address: u16, values: &[bool]) -> ModbusResult<()> {
        let mut state = self.lock()?;
        let range = address_range(address, values.len())?;
        let touched = state.validate_bits(kind, range.clone(), true)?;

        let block = state.blocks.block_mut(kind);
        for (raw, &value) in range.zip(values) {
            block.write_bit(raw as u16, value);
        }

        state.run_actions(kind, touched);
        Ok(())
    }

    /// Read holding or input registers (function codes 0x03/0x04)
    pub fn read_registers(&self, kind: TableKind, address: u16, count: u16) -> ModbusResult<Vec<u16>> {
        let mut state = self.lock()?;
        let range = address_range(address, count as usize)?;
        state.validate_registers(kind, range.clone(), false)?;

        let block = state.blocks.block(kind);
        let values = range
            .clone()
            .map(|raw| block.get(raw as u16).map(|cell| cell.value).unwrap_or_default())
            .collect();

        state.run_actions(kind, range.map(|raw| raw as u16));
        Ok(values)
    }

    /// Write holding registers (function codes 0x06/0x10)
    pub fn write_registers(&self, kind: TableKind, address: u16, values: &[u16]) -> ModbusResult<()> {
        let mut state = self.lock()?;
        let range = address_range(address, values.len())?;
        state.validate_registers(kind, range.clone(), true)?;

        let block = state.blocks.block_mut(kind);
        block.write_span(address, values);

        state.run_actions(kind, range.map(|raw| raw as u16));
        Ok(())
    }

    /// Single value access; bit tables return 0 or 1. No action runs.
    pub fn get(&self, kind: TableKind, address: u16) -> ModbusResult<u16> {
        let state = self.lock()?;
        let block = state.blocks.block(kind);
        let register = if kind.is_bit_table() { block.bit_register(address) } else { address };
        let cell = block
            .get(register)
            .ok_or_else(|| ModbusError::not_found(kind, address))?;
        if cell.invalid {
            return Err(ModbusError::invalid_cell(kind, address));
        }
        if kind.is_bit_table() {
            Ok(block.read_bit(address) as u16)
        } else {
            Ok(cell.value)
        }
    }

    /// Single value write through the normal write path (checks and actions)
    pub fn set(&self, kind: TableKind, address: u16, value: u16) -> ModbusResult<()> {
        if kind.is_bit_table() {
            self.write_bits(kind, address, &[value != 0])
        } else {
            self.write_registers(kind, address, &[value])
        }
    }

    /// Store a value ignoring write permissions, for simulation and tests
    ///
    /// Works on read-only tables too; the address must exist.
    pub fn preset(&self, kind: TableKind, address: u16, value: u16) -> ModbusResult<()> {
        let mut state = self.lock()?;
        let block = state.blocks.block_mut(kind);
        if kind.is_bit_table() {
            if block.get(block.bit_register(address)).is_none() {
                return Err(ModbusError::not_found(kind, address));
            }
            block.write_bit(address, value != 0);
        } else {
            block
                .get_mut(address)
                .ok_or_else(|| ModbusError::not_found(kind, address))?
                .value = value;
        }
        Ok(())
    }

    /// Copy of the cell holding `address` (for bit tables, the register holding the bit)
    pub fn cell(&self, kind: TableKind, address: u16) -> ModbusResult<Cell> {
        let state = self.lock()?;
        let block = state.blocks.block(kind);
        let register = if kind.is_bit_table() { block.bit_register(address) } else { address };
        block
            .get(register)
            .cloned()
            .ok_or_else(|| ModbusError::not_found(kind, address))
    }

    /// Decoded value starting at `address`, without running actions
    pub fn typed_value(&self, kind: TableKind, address: u16) -> ModbusResult<CellValue> {
        let state = self.lock()?;
        let block = state.blocks.block(kind);
        let register = if kind.is_bit_table() { block.bit_register(address) } else { address };
        let cell = block
            .get(register)
            .ok_or_else(|| ModbusError::not_found(kind, address))?;
        if cell.invalid {
            return Err(ModbusError::invalid_cell(kind, address));
        }
        if cell.cell_type == CellType::Next {
            return Err(ModbusError::type_mismatch(kind, address));
        }

        let width = cell
            .cell_type
            .fixed_width()
            .unwrap_or_else(|| block.span_width(register));
        let registers = block
            .read_span(register, width)
            .ok_or_else(|| ModbusError::not_found(kind, address))?;
        CellValue::from_registers(cell.cell_type, &registers)
    }

    /// Check if all four tables view one block
    pub fn is_shared(&self) -> ModbusResult<bool> {
        Ok(self.lock()?.blocks.is_shared())
    }

    /// Number of cells in the block behind `kind`
    pub fn block_len(&self, kind: TableKind) -> ModbusResult<usize> {
        Ok(self.lock()?.blocks.block(kind).len())
    }
}

/// The set of devices served on one line
#[derive(Debug, Clone)]
pub enum ServerContext {
    /// One device answers every unit id
    Single(DeviceContext),
    /// Devices keyed by unit id; other ids are ignored
    Multi(HashMap<UnitId, DeviceContext>),
}

impl ServerContext {
    pub fn single(device: DeviceContext) -> Self {
        ServerContext::Single(device)
    }

    pub fn multi(devices: HashMap<UnitId, DeviceContext>) -> Self {
        ServerContext::Multi(devices)
    }

    pub fn is_single(&self) -> bool {
        matches!(self, ServerContext::Single(_))
    }

    /// Device addressed by `unit_id`; in single mode always the one device
    pub fn device(&self, unit_id: UnitId) -> Option<&DeviceContext> {
        match self {
            ServerContext::Single(device) => Some(device),
            ServerContext::Multi(devices) => devices.get(&unit_id),
        }
    }

    /// All devices, multi-mode devices ordered by unit id
    pub fn devices(&self) -> Vec<&DeviceContext> {
        match self {
            ServerContext::Single(device) => vec![device],
            ServerContext::Multi(devices) => {
                let mut ids: Vec<&UnitId> = devices.keys().collect();
                ids.sort();
                ids.into_iter().filter_map(|id| devices.get(id)).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_device() -> DeviceContext {
        let bits = TableBlock::sequential(10, Cell::new(CellType::Bits, 0)).unwrap();
        let regs = TableBlock::sparse((0..10).map(|a| (a, Cell::default())));
        DeviceContext::plain(bits.clone(), bits, regs.clone(), regs)
    }

    #[test]
    fn test_coil_operations() {
        let device = plain_device();

        device.write_bits(TableKind::Coils, 3, &[true]).unwrap();
        assert_eq!(device.read_bits(TableKind::Coils, 3, 1).unwrap(), vec![true]);

        device.write_bits(TableKind::Coils, 5, &[true, false, true]).unwrap();
        assert_eq!(device.read_bits(TableKind::Coils, 5, 3).unwrap(), vec![true, false, true]);

        // Discrete inputs are a separate block
        assert_eq!(device.read_bits(TableKind::DiscreteInputs, 3, 1).unwrap(), vec![false]);
    }

    #[test]
    fn test_register_operations() {
        let device = plain_device();

        device.write_registers(TableKind::HoldingRegisters, 5, &[42]).unwrap();
        assert_eq!(device.read_registers(TableKind::HoldingRegisters, 5, 1).unwrap(), vec![42]);

        device.write_registers(TableKind::HoldingRegisters, 7, &[100, 200, 300]).unwrap();
        assert_eq!(
            device.read_registers(TableKind::HoldingRegisters, 7, 3).unwrap(),
            vec![100, 200, 300]
        );

        device.preset(TableKind::InputRegisters, 0, 7).unwrap();
        assert_eq!(device.get(TableKind::InputRegisters, 0).unwrap(), 7);
    }

    #[test]
    fn test_out_of_range_never_resizes() {
        let device = plain_device();

        let err = device.read_registers(TableKind::HoldingRegisters, 8, 3).unwrap_err();
        assert_eq!(err, ModbusError::not_found(TableKind::HoldingRegisters, 10));
        let err = device.write_bits(TableKind::Coils, 10, &[true]).unwrap_err();
        assert_eq!(err, ModbusError::not_found(TableKind::Coils, 10));
        assert_eq!(device.block_len(TableKind::Coils).unwrap(), 10);

        assert!(device.read_registers(TableKind::HoldingRegisters, 65535, 2).is_err());
        assert!(device.read_registers(TableKind::HoldingRegisters, 0, 0).is_err());
    }

    #[test]
    fn test_failed_write_changes_nothing() {
        let mut block = TableBlock::sequential(4, Cell::default()).unwrap();
        block.insert(2, Cell::new(CellType::Uint16, 9).read_only()).unwrap();
        let device = DeviceContext::new(DeviceBlocks::Shared(block), Arc::new(ActionEngine::default()), false);

        let err = device.write_registers(TableKind::HoldingRegisters, 0, &[1, 1, 1]).unwrap_err();
        assert_eq!(err, ModbusError::not_writable(TableKind::HoldingRegisters, 2));
        assert_eq!(
            device.read_registers(TableKind::HoldingRegisters, 0, 4).unwrap(),
            vec![0, 0, 9, 0]
        );
    }

    #[test]
    fn test_invalid_cell_rejects_read_and_write() {
        let mut block = TableBlock::sequential(4, Cell::default()).unwrap();
        let mut invalid = Cell::new(CellType::Uint16, 5);
        invalid.invalid = true;
        block.insert(1, invalid).unwrap();
        let device = DeviceContext::new(DeviceBlocks::Shared(block), Arc::new(ActionEngine::default()), false);

        assert!(matches!(
            device.read_registers(TableKind::InputRegisters, 0, 2),
            Err(ModbusError::InvalidCell { address: 1, .. })
        ));
        assert!(matches!(
            device.write_registers(TableKind::HoldingRegisters, 1, &[3]),
            Err(ModbusError::InvalidCell { address: 1, .. })
        ));
    }

    #[test]
    fn test_packed_bits_map_to_registers() {
        let block = TableBlock::sequential(2, Cell::new(CellType::Bits, 0x0708)).unwrap().packed();
        assert!(block.is_packed());
        assert!(!block.is_sparse());
        let device = DeviceContext::new(DeviceBlocks::Shared(block), Arc::new(ActionEngine::default()), false);

        // 0x0708: bits 3, 8, 9, 10 set
        let bits = device.read_bits(TableKind::Coils, 0, 16).unwrap();
        let set: Vec<usize> = bits.iter().enumerate().filter(|(_, b)| **b).map(|(i, _)| i).collect();
        assert_eq!(set, vec![3, 8, 9, 10]);

        device.write_bits(TableKind::Coils, 16, &[true, true]).unwrap();
        assert_eq!(device.get(TableKind::HoldingRegisters, 1).unwrap(), 0x070B);
        assert_eq!(device.get(TableKind::Coils, 17).unwrap(), 1);
        assert!(device.read_bits(TableKind::Coils, 32, 1).is_err());
    }

    #[test]
    fn test_type_exception() {
        let mut block = TableBlock::sequential(4, Cell::default()).unwrap();
        block.insert(0, Cell::new(CellType::Bits, 1)).unwrap();
        block.insert(1, Cell::new(CellType::Uint32, 0)).unwrap();
        block.insert(2, Cell::new(CellType::Next, 5)).unwrap();
        let blocks = DeviceBlocks::Shared(block.packed());

        let strict = DeviceContext::new(blocks.clone(), Arc::new(ActionEngine::default()), true);
        assert!(strict.read_registers(TableKind::HoldingRegisters, 0, 1).is_err());
        assert!(strict.read_registers(TableKind::HoldingRegisters, 1, 1).is_err());
        assert!(strict.read_registers(TableKind::HoldingRegisters, 2, 1).is_err());
        assert_eq!(strict.read_registers(TableKind::HoldingRegisters, 1, 2).unwrap(), vec![0, 5]);
        assert!(strict.read_bits(TableKind::Coils, 16, 1).is_err());
        assert_eq!(strict.read_bits(TableKind::Coils, 0, 1).unwrap(), vec![true]);

        let lenient = DeviceContext::new(blocks, Arc::new(ActionEngine::default()), false);
        assert_eq!(lenient.read_registers(TableKind::HoldingRegisters, 2, 1).unwrap(), vec![5]);
    }

    #[test]
    fn test_read_returns_value_before_action() {
        let mut block = TableBlock::sequential(2, Cell::default()).unwrap();
        block
            .insert(0, Cell::new(CellType::Uint16, 10).with_action(Action::Increment))
            .unwrap();
        let device = DeviceContext::new(DeviceBlocks::Shared(block), Arc::new(ActionEngine::default()), false);

        assert_eq!(device.read_registers(TableKind::HoldingRegisters, 0, 1).unwrap(), vec![10]);
        assert_eq!(device.read_registers(TableKind::HoldingRegisters, 0, 1).unwrap(), vec![11]);

        // Writes store the value first, then run the action
        device.write_registers(TableKind::HoldingRegisters, 0, &[100]).unwrap();
        assert_eq!(device.get(TableKind::HoldingRegisters, 0).unwrap(), 101);
    }

    #[test]
    fn test_typed_value() {
        let mut block = TableBlock::sequential(6, Cell::default()).unwrap();
        let [hi, lo] = data_utils::u32_to_registers(345000);
        block.insert(0, Cell::new(CellType::Uint32, hi)).unwrap();
        block.insert(1, Cell::new(CellType::Next, lo)).unwrap();
        let text = data_utils::string_to_registers("Strx", 2);
        block.insert(2, Cell::new(CellType::String, text[0])).unwrap();
        block.insert(3, Cell::new(CellType::Next, text[1])).unwrap();
        let device = DeviceContext::new(DeviceBlocks::Shared(block), Arc::new(ActionEngine::default()), false);

        assert_eq!(device.typed_value(TableKind::HoldingRegisters, 0).unwrap(), CellValue::Uint32(345000));
        assert_eq!(
            device.typed_value(TableKind::HoldingRegisters, 2).unwrap(),
            CellValue::String("Strx".to_string())
        );
        assert!(device.typed_value(TableKind::HoldingRegisters, 1).is_err());
        assert_eq!(CellValue::Uint32(345000).to_registers(2), vec![hi, lo]);
        assert_eq!(CellValue::String("Strx".to_string()).to_registers(2), text);
        assert_eq!(CellValue::String("S".to_string()).to_registers(2), vec![0x5320, 0x2020]);
        assert_eq!(device.typed_value(TableKind::HoldingRegisters, 4).unwrap(), CellValue::Uint16(0));
    }

    #[test]
    fn test_server_context_lookup() {
        let device = plain_device();
        let single = ServerContext::single(device.clone());
        assert!(single.is_single());
        assert!(single.device(17).is_some());

        let mut devices = HashMap::new();
        devices.insert(3, device);
        let multi = ServerContext::multi(devices);
        assert!(multi.device(3).is_some());
        assert!(multi.device(4).is_none());
        assert_eq!(multi.devices().len(), 1);
        assert!(!multi.is_single());
    }
}
