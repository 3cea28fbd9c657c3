//! # Register Simulator
//!
//! Builds a [`DeviceContext`] from a declarative overlay document. The
//! document is JSON with these sections:
//!
//! | Section   | Content                                                          |
//! |-----------|------------------------------------------------------------------|
//! | `setup`   | table sizes, block layout flags, default values and actions      |
//! | `invalid` | addresses that reject every access                               |
//! | `write`   | the only writable addresses (everything is writable when empty)  |
//! | `bits`, `uint16`, `uint32`, `float32`, `string` | typed cell declarations    |
//! | `repeat`  | copy resolved cells from a source range onto a destination range |
//!
//! Addresses are either a single integer or an inclusive `[start, end]` pair.
//! Typed declarations are a bare address or `{"addr", "value", "action",
//! "parameters"}` records.
//!
//! Resolution is a fixed sequence of rules, each overriding the previous ones
//! at the addresses it touches:
//!
//! 1. baseline: every address gets the `uint16` default (bit blocks: `bits`)
//! 2. `invalid` flags
//! 3. `write` permissions
//! 4. typed lists, in the order bits, uint16, uint32, float32, string
//! 5. `repeat` rules
//!
//! An invalid address stays invalid whatever later rules declare there.
//!
//! ```rust
//! use voltage_modbus_sim::actions::ActionEngine;
//! use voltage_modbus_sim::register_bank::TableKind;
//! use voltage_modbus_sim::simulator::{demo_overlay, SimulatorOverlay};
//!
//! let device = SimulatorOverlay::new(demo_overlay().unwrap(), ActionEngine::default())
//!     .build()
//!     .unwrap();
//! assert_eq!(device.read_registers(TableKind::HoldingRegisters, 16, 1).unwrap(), vec![3124]);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::actions::{Action, ActionEngine, ActionParameters, TypeDefaults};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::data_utils;
use crate::register_bank::{Cell, CellType, DeviceBlocks, DeviceContext, TableBlock, MAX_BLOCK_SIZE};

/// Overlay bundled with the `serial_simulator` binary
const DEMO_OVERLAY: &str = include_str!("../config/demo_simulator.json");

/// Parse the bundled demo overlay
pub fn demo_overlay() -> ModbusResult<OverlaySpec> {
    OverlaySpec::from_json_str(DEMO_OVERLAY)
}

fn default_true() -> bool {
    true
}

/// Complete overlay document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlaySpec {
    pub setup: SetupSection,
    #[serde(default)]
    pub invalid: Vec<AddressSpec>,
    #[serde(default)]
    pub write: Vec<AddressSpec>,
    #[serde(default)]
    pub bits: Vec<CellEntry>,
    #[serde(default)]
    pub uint16: Vec<CellEntry>,
    #[serde(default)]
    pub uint32: Vec<CellEntry>,
    #[serde(default)]
    pub float32: Vec<CellEntry>,
    #[serde(default)]
    pub string: Vec<CellEntry>,
    #[serde(default)]
    pub repeat: Vec<RepeatRule>,
}

impl OverlaySpec {
    pub fn from_json_str(json: &str) -> ModbusResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Cannot read overlay {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }
}

/// `setup` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupSection {
    #[serde(rename = "co size", default)]
    pub co_size: usize,
    #[serde(rename = "di size", default)]
    pub di_size: usize,
    #[serde(rename = "hr size", default)]
    pub hr_size: usize,
    #[serde(rename = "ir size", default)]
    pub ir_size: usize,
    /// All four tables view one block of the largest size
    #[serde(rename = "shared blocks", default = "default_true")]
    pub shared_blocks: bool,
    /// Reject accesses that do not match the declared cell type
    #[serde(rename = "type exception", default)]
    pub type_exception: bool,
    #[serde(rename = "block type", default)]
    pub block_type: BlockType,
    #[serde(default)]
    pub defaults: DefaultsSection,
}

/// Storage layout of the blocks built by the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    #[default]
    Sequential,
    Sparse,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultsSection {
    #[serde(default)]
    pub value: TypeDefaults,
    #[serde(default)]
    pub action: DefaultActions,
}

/// Action attached to every cell of a type that declares none
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultActions {
    pub bits: Option<String>,
    pub uint16: Option<String>,
    pub uint32: Option<String>,
    pub float32: Option<String>,
    pub string: Option<String>,
}

impl DefaultActions {
    fn name_for(&self, cell_type: CellType) -> Option<&str> {
        match cell_type {
            CellType::Bits => self.bits.as_deref(),
            CellType::Uint16 => self.uint16.as_deref(),
            CellType::Uint32 => self.uint32.as_deref(),
            CellType::Float32 => self.float32.as_deref(),
            CellType::String => self.string.as_deref(),
            CellType::Next => None,
        }
    }
}

/// A single address or an inclusive `[start, end]` range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddressSpec {
    Single(u16),
    Range([u16; 2]),
}

impl AddressSpec {
    /// Inclusive bounds; a reversed range is a configuration error
    pub fn bounds(&self) -> ModbusResult<(u16, u16)> {
        match *self {
            AddressSpec::Single(address) => Ok((address, address)),
            AddressSpec::Range([start, end]) if start <= end => Ok((start, end)),
            AddressSpec::Range([start, end]) => Err(ModbusError::configuration(format!(
                "Address range [{}, {}] is reversed",
                start, end
            ))),
        }
    }
}

/// Entry of a typed list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellEntry {
    /// Declare the type only; value and action come from the defaults
    Address(AddressSpec),
    Record(CellRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub addr: AddressSpec,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub parameters: Option<ActionParameters>,
}

impl CellEntry {
    fn address(&self) -> &AddressSpec {
        match self {
            CellEntry::Address(address) => address,
            CellEntry::Record(record) => &record.addr,
        }
    }

    fn value(&self) -> Option<&serde_json::Value> {
        match self {
            CellEntry::Address(_) => None,
            CellEntry::Record(record) => record.value.as_ref(),
        }
    }

    fn action(&self) -> Option<&str> {
        match self {
            CellEntry::Address(_) => None,
            CellEntry::Record(record) => record.action.as_deref(),
        }
    }

    fn parameters(&self) -> Option<&ActionParameters> {
        match self {
            CellEntry::Address(_) => None,
            CellEntry::Record(record) => record.parameters.as_ref(),
        }
    }
}

/// Copy the cells of `addr` onto `to`, wrapping the source when `to` is longer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatRule {
    pub addr: AddressSpec,
    pub to: AddressSpec,
}

/// Address-level flags collected from `invalid` and `write`
struct AccessFlags {
    invalid: BTreeSet<u16>,
    /// `None` when no write restriction is declared
    writable: Option<BTreeSet<u16>>,
}

impl AccessFlags {
    fn stamp(&self, address: u16, cell: &mut Cell) {
        cell.invalid = self.invalid.contains(&address);
        cell.writable = self
            .writable
            .as_ref()
            .map(|set| set.contains(&address))
            .unwrap_or(true);
    }
}

/// One value laid out over consecutive registers
struct ValueSpan {
    start: u16,
    cell_type: CellType,
    registers: Vec<u16>,
    action: Option<Action>,
}

impl ValueSpan {
    fn end(&self) -> u16 {
        self.start + (self.registers.len() as u16 - 1)
    }
}

/// Declared extent of the value covering an address
#[derive(Debug, Clone, Copy)]
struct Declared {
    start: u16,
    end: u16,
    cell_type: CellType,
}

/// A block under construction
struct Target {
    name: &'static str,
    holds_bits: bool,
    holds_registers: bool,
    size: usize,
    template: Cell,
    block: TableBlock,
    declared: HashMap<u16, Declared>,
}

impl Target {
    fn new(
        name: &'static str,
        holds_bits: bool,
        holds_registers: bool,
        size: usize,
        template: Cell,
        block_type: BlockType,
    ) -> ModbusResult<Self> {
        let block = match block_type {
            BlockType::Sequential => TableBlock::sequential(size, template.clone())?,
            BlockType::Sparse => TableBlock::sparse(Vec::new()),
        };
        Ok(Self {
            name,
            holds_bits,
            holds_registers,
            size,
            template,
            block,
            declared: HashMap::new(),
        })
    }

    fn fits(&self, end: u16) -> bool {
        (end as usize) < self.size
    }

    fn accepts(&self, cell_type: CellType) -> bool {
        if cell_type == CellType::Bits {
            self.holds_bits
        } else {
            self.holds_registers
        }
    }

    fn apply_flags(&mut self, flags: &AccessFlags) {
        for address in self.block.addresses() {
            if let Some(cell) = self.block.get_mut(address) {
                flags.stamp(address, cell);
            }
        }
        // Sparse blocks materialise invalid addresses so they answer with an exception
        for &address in &flags.invalid {
            if self.fits(address) && self.block.get(address).is_none() {
                let mut cell = self.template.clone();
                flags.stamp(address, &mut cell);
                let _ = self.block.insert(address, cell);
            }
        }
    }

    /// Cell at `address`, created from the baseline template if missing
    fn entry(&mut self, address: u16, flags: &AccessFlags) -> ModbusResult<&mut Cell> {
        if self.block.get(address).is_none() {
            let mut cell = self.template.clone();
            flags.stamp(address, &mut cell);
            self.block.insert(address, cell)?;
        }
        self.block
            .get_mut(address)
            .ok_or_else(|| ModbusError::internal(format!("{} block lost address {}", self.name, address)))
    }

    fn place(&mut self, value: &ValueSpan, flags: &AccessFlags) -> ModbusResult<()> {
        let (start, end) = (value.start, value.end());

        for address in start..=end {
            if let Some(previous) = self.declared.get(&address) {
                let previous_wide = previous.start != previous.end;
                if previous_wide && (previous.start < start || previous.end > end) {
                    return Err(ModbusError::configuration(format!(
                        "{} [{}, {}] partially overlaps {} [{}, {}] in {} block",
                        value.cell_type, start, end, previous.cell_type, previous.start, previous.end, self.name
                    )));
                }
                debug!(
                    "{} at {} overrides earlier {} declaration in {} block",
                    value.cell_type, address, previous.cell_type, self.name
                );
            }
        }

        for (offset, &register) in value.registers.iter().enumerate() {
            let address = start + offset as u16;
            let cell = self.entry(address, flags)?;
            cell.value = register;
            if offset == 0 {
                cell.cell_type = value.cell_type;
                cell.action = value.action.clone();
            } else {
                cell.cell_type = CellType::Next;
                cell.action = None;
            }
            self.declared.insert(
                address,
                Declared {
                    start,
                    end,
                    cell_type: value.cell_type,
                },
            );
        }
        Ok(())
    }

    fn repeat(&mut self, (src_start, src_end): (u16, u16), (dst_start, dst_end): (u16, u16)) -> ModbusResult<()> {
        let source: Vec<Option<Cell>> = (src_start..=src_end)
            .map(|address| self.block.get(address).cloned())
            .collect();

        for (k, address) in (dst_start..=dst_end).enumerate() {
            let copied = match &source[k % source.len()] {
                Some(cell) => cell,
                None => continue,
            };
            let mut cell = copied.clone();
            cell.invalid |= self.block.get(address).map(|c| c.invalid).unwrap_or(false);
            if self.declared.remove(&address).is_some() {
                debug!("repeat overrides declaration at {} in {} block", address, self.name);
            }
            self.block.insert(address, cell)?;
        }
        Ok(())
    }

    /// Every multi-register value must be complete after resolution
    fn validate_spans(&self) -> ModbusResult<()> {
        for address in self.block.addresses() {
            let cell_type = match self.block.get(address) {
                Some(cell) => cell.cell_type,
                None => continue,
            };
            match cell_type {
                CellType::Uint32 | CellType::Float32 => {
                    if self.block.span_width(address) != 2 {
                        return Err(ModbusError::configuration(format!(
                            "{} at {} in {} block does not span exactly 2 registers",
                            cell_type, address, self.name
                        )));
                    }
                }
                CellType::Next => {
                    let continues = address
                        .checked_sub(1)
                        .and_then(|previous| self.block.get(previous))
                        .map(|previous| {
                            matches!(
                                previous.cell_type,
                                CellType::Uint32 | CellType::Float32 | CellType::String | CellType::Next
                            )
                        })
                        .unwrap_or(false);
                    if !continues {
                        return Err(ModbusError::configuration(format!(
                            "Register {} in {} block continues no multi-register value",
                            address, self.name
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Resolves an [`OverlaySpec`] into a simulated device
pub struct SimulatorOverlay {
    spec: OverlaySpec,
    engine: ActionEngine,
}

impl SimulatorOverlay {
    /// Pair an overlay with the engine holding its custom actions
    pub fn new(spec: OverlaySpec, engine: ActionEngine) -> Self {
        Self { spec, engine }
    }

    pub fn spec(&self) -> &OverlaySpec {
        &self.spec
    }

    /// Register a custom action before resolution
    pub fn register_action<F>(&mut self, name: &str, callback: F) -> ModbusResult<()>
    where
        F: Fn(u16, &mut crate::register_bank::Cell) + Send + Sync + 'static,
    {
        self.engine.register(name, callback)
    }

    /// Resolve every rule and return the finished device
    ///
    /// Any inconsistency is a configuration error; nothing is served from a
    /// partially resolved overlay.
    pub fn build(self) -> ModbusResult<DeviceContext> {
        let SimulatorOverlay { spec, mut engine } = self;
        let setup = &spec.setup;

        for (name, size) in [
            ("co size", setup.co_size),
            ("di size", setup.di_size),
            ("hr size", setup.hr_size),
            ("ir size", setup.ir_size),
        ] {
            if size > MAX_BLOCK_SIZE {
                return Err(ModbusError::configuration(format!(
                    "{} {} exceeds {}",
                    name, size, MAX_BLOCK_SIZE
                )));
            }
        }

        engine.set_defaults(setup.defaults.value.clone());
        let default_action = |cell_type: CellType| -> ModbusResult<Option<Action>> {
            setup
                .defaults
                .action
                .name_for(cell_type)
                .map(|name| engine.resolve(name, None))
                .transpose()
        };

        let register_template = {
            let mut cell = Cell::new(CellType::Uint16, setup.defaults.value.uint16);
            cell.action = default_action(CellType::Uint16)?;
            cell
        };
        let bit_template = {
            let mut cell = Cell::new(CellType::Bits, setup.defaults.value.bits);
            cell.action = default_action(CellType::Bits)?;
            cell
        };

        let mut targets = if setup.shared_blocks {
            let size = setup.co_size.max(setup.di_size).max(setup.hr_size).max(setup.ir_size);
            vec![Target::new("shared", true, true, size, register_template, setup.block_type)?]
        } else {
            vec![
                Target::new("coils", true, false, setup.co_size, bit_template.clone(), setup.block_type)?,
                Target::new("discrete inputs", true, false, setup.di_size, bit_template, setup.block_type)?,
                Target::new("holding registers", false, true, setup.hr_size, register_template.clone(), setup.block_type)?,
                Target::new("input registers", false, true, setup.ir_size, register_template, setup.block_type)?,
            ]
        };

        let flags = collect_flags(&spec, &targets)?;
        for target in targets.iter_mut() {
            target.apply_flags(&flags);
        }

        for (cell_type, entries) in [
            (CellType::Bits, &spec.bits),
            (CellType::Uint16, &spec.uint16),
            (CellType::Uint32, &spec.uint32),
            (CellType::Float32, &spec.float32),
            (CellType::String, &spec.string),
        ] {
            for entry in entries {
                let action = match entry.action() {
                    Some(name) => Some(engine.resolve(name, entry.parameters())?),
                    None => default_action(cell_type)?,
                };
                let bounds = entry.address().bounds()?;
                let values = layout(cell_type, bounds, entry.value(), engine.defaults(), action)?;

                let mut placed = false;
                for target in targets
                    .iter_mut()
                    .filter(|t| t.accepts(cell_type) && t.fits(bounds.1))
                {
                    for value in &values {
                        target.place(value, &flags)?;
                    }
                    placed = true;
                }
                if !placed {
                    return Err(ModbusError::configuration(format!(
                        "{} entry [{}, {}] fits no block",
                        cell_type, bounds.0, bounds.1
                    )));
                }
            }
        }

        for rule in &spec.repeat {
            let source = rule.addr.bounds()?;
            let destination = rule.to.bounds()?;
            let mut placed = false;
            for target in targets
                .iter_mut()
                .filter(|t| t.fits(source.1) && t.fits(destination.1))
            {
                target.repeat(source, destination)?;
                placed = true;
            }
            if !placed {
                return Err(ModbusError::configuration(format!(
                    "repeat [{}, {}] -> [{}, {}] fits no block",
                    source.0, source.1, destination.0, destination.1
                )));
            }
        }

        for target in &targets {
            target.validate_spans()?;
        }

        for target in &targets {
            info!(
                "Simulator {} block: {} cells ({:?})",
                target.name,
                target.block.len(),
                setup.block_type
            );
        }

        let mut blocks = targets.into_iter().map(|t| t.block);
        let blocks = match (blocks.next(), blocks.next(), blocks.next(), blocks.next()) {
            (Some(shared), None, None, None) => DeviceBlocks::Shared(shared.packed()),
            (Some(coils), Some(discrete_inputs), Some(holding_registers), Some(input_registers)) => {
                DeviceBlocks::Separate {
                    coils: coils.packed(),
                    discrete_inputs: discrete_inputs.packed(),
                    holding_registers,
                    input_registers,
                }
            }
            _ => return Err(ModbusError::internal("Unexpected simulator block layout")),
        };

        Ok(DeviceContext::new(blocks, Arc::new(engine), setup.type_exception))
    }
}

/// Gather `invalid` and `write` addresses, checking each fits some block
fn collect_flags(spec: &OverlaySpec, targets: &[Target]) -> ModbusResult<AccessFlags> {
    let collect = |section: &str, ranges: &[AddressSpec]| -> ModbusResult<BTreeSet<u16>> {
        let mut addresses = BTreeSet::new();
        for range in ranges {
            let (start, end) = range.bounds()?;
            if !targets.iter().any(|t| t.fits(end)) {
                return Err(ModbusError::configuration(format!(
                    "{} range [{}, {}] fits no block",
                    section, start, end
                )));
            }
            addresses.extend(start..=end);
        }
        Ok(addresses)
    };

    let invalid = collect("invalid", &spec.invalid)?;
    let writable = if spec.write.is_empty() {
        None
    } else {
        Some(collect("write", &spec.write)?)
    };
    Ok(AccessFlags { invalid, writable })
}

/// Split a typed entry into the values it declares
///
/// Bits and uint16 give one value per address; uint32 and float32 one value
/// per register pair; a string one value over the whole range.
fn layout(
    cell_type: CellType,
    (start, end): (u16, u16),
    value: Option<&serde_json::Value>,
    defaults: &TypeDefaults,
    action: Option<Action>,
) -> ModbusResult<Vec<ValueSpan>> {
    let count = (end - start) as usize + 1;
    let bad_value = || {
        ModbusError::configuration(format!(
            "{} entry [{}, {}] has an invalid value: {}",
            cell_type,
            start,
            end,
            value.map(|v| v.to_string()).unwrap_or_default()
        ))
    };

    let registers = match cell_type {
        CellType::Bits | CellType::Uint16 => match value {
            Some(v) => vec![v.as_u64().filter(|n| *n <= u16::MAX as u64).ok_or_else(bad_value)? as u16],
            None => defaults.registers(cell_type, 1),
        },
        CellType::Uint32 => match value {
            Some(v) => {
                let n = v.as_u64().filter(|n| *n <= u32::MAX as u64).ok_or_else(bad_value)?;
                data_utils::u32_to_registers(n as u32).to_vec()
            }
            None => defaults.registers(cell_type, 2),
        },
        CellType::Float32 => match value {
            Some(v) => data_utils::f32_to_registers(v.as_f64().ok_or_else(bad_value)? as f32).to_vec(),
            None => defaults.registers(cell_type, 2),
        },
        CellType::String => match value {
            Some(v) => data_utils::string_to_registers(v.as_str().ok_or_else(bad_value)?, count),
            None => defaults.registers(cell_type, count),
        },
        CellType::Next => return Err(ModbusError::internal("Next is not a declarable type")),
    };

    if count % registers.len() != 0 {
        return Err(ModbusError::configuration(format!(
            "{} entry [{}, {}] must cover a multiple of {} registers",
            cell_type,
            start,
            end,
            registers.len()
        )));
    }

    Ok((0..count / registers.len())
        .map(|i| ValueSpan {
            start: start + (i * registers.len()) as u16,
            cell_type,
            registers: registers.clone(),
            action: action.clone(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_bank::{CellValue, TableKind};

    fn demo_device() -> DeviceContext {
        SimulatorOverlay::new(demo_overlay().unwrap(), ActionEngine::default())
            .build()
            .unwrap()
    }

    fn overlay(json: &str) -> ModbusResult<DeviceContext> {
        SimulatorOverlay::new(OverlaySpec::from_json_str(json)?, ActionEngine::default()).build()
    }

    #[test]
    fn test_demo_overlay_parses() {
        let spec = demo_overlay().unwrap();
        assert_eq!(spec.setup.hr_size, 200);
        assert!(spec.setup.shared_blocks);
        assert_eq!(spec.setup.defaults.value.bits, 0x0708);
        assert_eq!(spec.invalid, vec![AddressSpec::Single(1), AddressSpec::Range([6, 6])]);
        assert_eq!(spec.bits[0], CellEntry::Address(AddressSpec::Range([7, 9])));
        assert_eq!(spec.repeat.len(), 1);
    }

    #[test]
    fn test_demo_typed_values() {
        let device = demo_device();
        let hr = TableKind::HoldingRegisters;

        assert!(device.is_shared().unwrap());
        assert_eq!(device.block_len(hr).unwrap(), 250);
        assert_eq!(device.typed_value(hr, 0).unwrap(), CellValue::Uint16(1));
        assert_eq!(device.typed_value(hr, 2).unwrap(), CellValue::Bits(0x81));
        assert_eq!(device.typed_value(hr, 8).unwrap(), CellValue::Bits(0x0708));
        assert_eq!(device.typed_value(hr, 17).unwrap(), CellValue::Uint16(5678));
        assert_eq!(device.typed_value(hr, 21).unwrap(), CellValue::Uint32(3124));
        assert_eq!(device.typed_value(hr, 25).unwrap(), CellValue::Uint32(5678));
        assert_eq!(device.typed_value(hr, 33).unwrap(), CellValue::Float32(5678.19));
        assert_eq!(device.typed_value(hr, 41).unwrap(), CellValue::String("Str".to_string()));
        assert_eq!(device.typed_value(hr, 43).unwrap(), CellValue::String("Strx".to_string()));

        let cell = device.cell(hr, 14).unwrap();
        assert_eq!(cell.value, 15);
        assert_eq!(cell.action, Some(Action::Reset));
    }

    #[test]
    fn test_demo_invalid_addresses() {
        let device = demo_device();
        for address in [1u16, 6] {
            assert!(matches!(
                device.read_registers(TableKind::HoldingRegisters, address, 1),
                Err(ModbusError::InvalidCell { .. })
            ));
            assert!(matches!(
                device.write_registers(TableKind::HoldingRegisters, address, &[0]),
                Err(ModbusError::InvalidCell { .. })
            ));
        }
    }

    #[test]
    fn test_demo_write_permissions() {
        let device = demo_device();
        let hr = TableKind::HoldingRegisters;

        device.write_registers(hr, 16, &[1, 2, 3]).unwrap();
        assert_eq!(device.read_registers(hr, 16, 3).unwrap(), vec![1, 2, 3]);

        let err = device.write_registers(hr, 19, &[7]).unwrap_err();
        assert_eq!(err, ModbusError::not_writable(hr, 19));
        assert!(device.write_registers(hr, 18, &[7, 7]).is_err());
        assert_eq!(device.get(hr, 18).unwrap(), 3);
    }

    #[test]
    fn test_demo_increment_sequence() {
        let device = demo_device();
        let hr = TableKind::HoldingRegisters;

        let reads: Vec<u16> = (0..6)
            .map(|_| device.read_registers(hr, 19, 1).unwrap()[0])
            .collect();
        assert_eq!(reads, vec![14661, 14662, 14663, 14664, 14665, 14666]);
        assert_eq!(device.get(hr, 19).unwrap(), 14667);
    }

    #[test]
    fn test_demo_repeat_copies_resolved_cells() {
        let device = demo_device();
        let hr = TableKind::HoldingRegisters;

        for k in 0..=45u16 {
            assert_eq!(device.cell(hr, 46 + k).unwrap(), device.cell(hr, k).unwrap(), "address {}", 46 + k);
        }
        // Destination longer than the source wraps around
        for k in 0..=46u16 {
            assert_eq!(device.cell(hr, 92 + k).unwrap(), device.cell(hr, k).unwrap(), "address {}", 92 + k);
        }
        assert!(device.cell(hr, 47).unwrap().invalid);
        assert_eq!(device.typed_value(hr, 139).unwrap(), CellValue::Uint16(1));
    }

    #[test]
    fn test_default_value_fills_unlisted_addresses() {
        let device = overlay(
            r#"{"setup": {"co size": 10, "di size": 10, "hr size": 200, "ir size": 10,
                "defaults": {"value": {"uint16": 1}}}}"#,
        )
        .unwrap();
        assert_eq!(device.read_registers(TableKind::HoldingRegisters, 100, 1).unwrap(), vec![1]);
    }

    #[test]
    fn test_invalid_wins_over_typed_value() {
        let device = overlay(
            r#"{"setup": {"hr size": 10},
                "invalid": [4],
                "uint16": [{"addr": [3, 5], "value": 77}]}"#,
        )
        .unwrap();
        let hr = TableKind::HoldingRegisters;
        assert_eq!(device.read_registers(hr, 3, 1).unwrap(), vec![77]);
        assert!(device.read_registers(hr, 4, 1).is_err());
        assert!(device.write_registers(hr, 4, &[1]).is_err());
    }

    #[test]
    fn test_unknown_action_is_fatal() {
        let err = overlay(r#"{"setup": {"hr size": 10}, "uint16": [{"addr": 1, "action": "explode"}]}"#)
            .unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));
    }

    #[test]
    fn test_custom_action_registration() {
        let spec = OverlaySpec::from_json_str(
            r#"{"setup": {"hr size": 4}, "uint16": [{"addr": 0, "value": 5, "action": "custom1"}]}"#,
        )
        .unwrap();
        assert!(SimulatorOverlay::new(spec.clone(), ActionEngine::default()).build().is_err());

        let mut simulator = SimulatorOverlay::new(spec, ActionEngine::default());
        simulator
            .register_action("custom1", |_, cell| cell.value = cell.value.wrapping_add(10))
            .unwrap();
        let device = simulator.build().unwrap();
        assert_eq!(device.read_registers(TableKind::HoldingRegisters, 0, 1).unwrap(), vec![5]);
        assert_eq!(device.get(TableKind::HoldingRegisters, 0).unwrap(), 15);
    }

    #[test]
    fn test_configuration_errors() {
        // uint32 over an odd number of registers
        assert!(overlay(r#"{"setup": {"hr size": 10}, "uint32": [{"addr": [0, 2], "value": 1}]}"#).is_err());
        // later uint16 cutting a uint32 in half
        assert!(overlay(
            r#"{"setup": {"hr size": 10}, "uint32": [{"addr": [0, 1], "value": 1}], "uint16": [{"addr": 1, "value": 2}]}"#
        )
        .is_err());
        // outside every block
        assert!(overlay(r#"{"setup": {"hr size": 10}, "invalid": [10]}"#).is_err());
        // too large
        assert!(overlay(r#"{"setup": {"hr size": 70000}}"#).is_err());
        // reversed range
        assert!(overlay(r#"{"setup": {"hr size": 10}, "write": [[5, 2]]}"#).is_err());
        // repeat that splits a uint32 at the destination end
        assert!(overlay(
            r#"{"setup": {"hr size": 10}, "uint32": [{"addr": [0, 1], "value": 1}], "repeat": [{"addr": [0, 1], "to": [4, 4]}]}"#
        )
        .is_err());
    }

    #[test]
    fn test_default_actions_attach_to_type() {
        let device = overlay(
            r#"{"setup": {"hr size": 4, "defaults": {"value": {"uint16": 7}, "action": {"uint16": "increment"}}},
                "uint16": [{"addr": 3, "value": 100, "action": "reset"}]}"#,
        )
        .unwrap();
        let hr = TableKind::HoldingRegisters;
        assert_eq!(device.read_registers(hr, 0, 1).unwrap(), vec![7]);
        assert_eq!(device.read_registers(hr, 0, 1).unwrap(), vec![8]);
        assert_eq!(device.read_registers(hr, 3, 1).unwrap(), vec![100]);
        assert_eq!(device.read_registers(hr, 3, 1).unwrap(), vec![7]);
    }

    #[test]
    fn test_separate_sparse_blocks() {
        let device = overlay(
            r#"{"setup": {"co size": 2, "di size": 2, "hr size": 20, "ir size": 20,
                          "shared blocks": false, "block type": "sparse",
                          "defaults": {"value": {"bits": 1}}},
                "bits": [0],
                "uint16": [{"addr": [10, 11], "value": 9}]}"#,
        )
        .unwrap();

        assert!(!device.is_shared().unwrap());
        assert_eq!(device.read_bits(TableKind::Coils, 0, 2).unwrap(), vec![true, false]);
        assert!(device.read_bits(TableKind::Coils, 16, 1).is_err());
        assert_eq!(device.read_registers(TableKind::InputRegisters, 10, 2).unwrap(), vec![9, 9]);
        assert!(device.read_registers(TableKind::HoldingRegisters, 0, 1).is_err());
        assert_eq!(device.block_len(TableKind::HoldingRegisters).unwrap(), 2);
    }

    #[test]
    fn test_overlay_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.json");
        std::fs::write(&path, r#"{"setup": {"hr size": 3}}"#).unwrap();
        let spec = OverlaySpec::from_json_file(&path).unwrap();
        assert_eq!(spec.setup.hr_size, 3);

        assert!(OverlaySpec::from_json_file(dir.path().join("missing.json")).is_err());
    }
}
