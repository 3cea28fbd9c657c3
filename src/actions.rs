//! Cell actions
//!
//! An action is a named side effect that runs after a cell has been read or
//! written: counters that advance on every poll, registers that snap back to
//! their default, random noise. Built-in actions are plain enum variants so
//! cells stay cloneable data; custom actions are callbacks registered by name
//! on the [`ActionEngine`] before the overlay is resolved.
//!
//! | Name        | Effect                                                    |
//! |-------------|-----------------------------------------------------------|
//! | `increment` | add 1, wrapping at the type maximum (strings unchanged)   |
//! | `reset`     | restore the type default value                            |
//! | `random`    | uniform random value in `[minval, maxval]`                |
//! | `uptime`    | seconds since the engine was created                      |
//! | any other   | custom callback registered under that name                |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::data_utils;
use crate::register_bank::{Cell, CellType, TableBlock};

/// Custom action callback: receives the address and the head cell of the value
pub type ActionCallback = Arc<dyn Fn(u16, &mut Cell) + Send + Sync>;

/// Names reserved for the built-in actions
pub const BUILTIN_ACTIONS: [&str; 4] = ["increment", "reset", "random", "uptime"];

/// Lower bound used by `random` when no `minval` is given
pub const DEFAULT_RANDOM_MIN: f64 = 1.0;

/// Upper bound used by `random` when no `maxval` is given
pub const DEFAULT_RANDOM_MAX: f64 = 65535.0;

/// Optional action parameters from the overlay document
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionParameters {
    #[serde(default)]
    pub minval: Option<f64>,
    #[serde(default)]
    pub maxval: Option<f64>,
}

/// A resolved action attached to a cell
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Increment,
    Reset,
    Random { min: f64, max: f64 },
    Uptime,
    Custom(String),
}

impl Action {
    pub fn name(&self) -> &str {
        match self {
            Action::Increment => "increment",
            Action::Reset => "reset",
            Action::Random { .. } => "random",
            Action::Uptime => "uptime",
            Action::Custom(name) => name,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Random { min, max } => write!(f, "random[{}..={}]", min, max),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Default value per cell type, used for the initial fill and by `reset`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeDefaults {
    pub bits: u16,
    pub uint16: u16,
    pub uint32: u32,
    pub float32: f32,
    pub string: String,
}

impl Default for TypeDefaults {
    fn default() -> Self {
        Self {
            bits: 0,
            uint16: 0,
            uint32: 0,
            float32: 0.0,
            string: String::new(),
        }
    }
}

impl TypeDefaults {
    /// Register image of the default value for `cell_type` spanning `width` registers
    pub fn registers(&self, cell_type: CellType, width: usize) -> Vec<u16> {
        match cell_type {
            CellType::Bits => vec![self.bits],
            CellType::Uint16 => vec![self.uint16],
            CellType::Uint32 => data_utils::u32_to_registers(self.uint32).to_vec(),
            CellType::Float32 => data_utils::f32_to_registers(self.float32).to_vec(),
            CellType::String => data_utils::string_to_registers(&self.string, width.max(1)),
            CellType::Next => vec![0],
        }
    }
}

/// Registry and executor of cell actions
pub struct ActionEngine {
    customs: HashMap<String, ActionCallback>,
    defaults: TypeDefaults,
    started: Instant,
}

impl fmt::Debug for ActionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.customs.keys().collect();
        names.sort();
        f.debug_struct("ActionEngine")
            .field("customs", &names)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl Default for ActionEngine {
    fn default() -> Self {
        Self::new(TypeDefaults::default())
    }
}

impl ActionEngine {
    pub fn new(defaults: TypeDefaults) -> Self {
        Self {
            customs: HashMap::new(),
            defaults,
            started: Instant::now(),
        }
    }

    /// Register a custom action under `name`
    ///
    /// Built-in names cannot be overridden.
    ///
    /// ```rust
    /// use voltage_modbus_sim::actions::ActionEngine;
    ///
    /// let mut engine = ActionEngine::default();
    /// engine.register("double", |_address, cell| cell.value = cell.value.wrapping_mul(2)).unwrap();
    /// assert!(engine.register("reset", |_, _| {}).is_err());
    /// ```
    pub fn register<F>(&mut self, name: &str, callback: F) -> ModbusResult<()>
    where
        F: Fn(u16, &mut Cell) + Send + Sync + 'static,
    {
        if BUILTIN_ACTIONS.contains(&name) {
            return Err(ModbusError::configuration(format!(
                "Action '{}' is built in and cannot be replaced",
                name
            )));
        }
        self.customs.insert(name.to_string(), Arc::new(callback));
        Ok(())
    }

    /// Replace the type defaults used by `reset`
    pub fn set_defaults(&mut self, defaults: TypeDefaults) {
        self.defaults = defaults;
    }

    pub fn defaults(&self) -> &TypeDefaults {
        &self.defaults
    }

    /// Check if a custom action with this name is registered
    pub fn has_custom(&self, name: &str) -> bool {
        self.customs.contains_key(name)
    }

    /// Turn an action name from the overlay into an [`Action`]
    ///
    /// Unknown names are configuration errors.
    pub fn resolve(&self, name: &str, parameters: Option<&ActionParameters>) -> ModbusResult<Action> {
        match name {
            "increment" => Ok(Action::Increment),
            "reset" => Ok(Action::Reset),
            "uptime" => Ok(Action::Uptime),
            "random" => {
                let params = parameters.copied().unwrap_or_default();
                let min = params.minval.unwrap_or(DEFAULT_RANDOM_MIN);
                let max = params.maxval.unwrap_or(DEFAULT_RANDOM_MAX);
                if !min.is_finite() || !max.is_finite() || min > max {
                    return Err(ModbusError::configuration(format!(
                        "Invalid random range: minval={}, maxval={}",
                        min, max
                    )));
                }
                Ok(Action::Random { min, max })
            }
            custom if self.has_custom(custom) => Ok(Action::Custom(custom.to_string())),
            unknown => Err(ModbusError::configuration(format!("Unknown action '{}'", unknown))),
        }
    }

    /// Run the action of the cell at `address`, if it has one
    pub fn apply(&self, block: &mut TableBlock, address: u16) {
        let (cell_type, action) = match block.get(address) {
            Some(Cell {
                cell_type,
                action: Some(action),
                ..
            }) => (*cell_type, action.clone()),
            _ => return,
        };

        match action {
            Action::Increment => increment(block, address, cell_type),
            Action::Reset => {
                let width = block.span_width(address);
                block.write_span(address, &self.defaults.registers(cell_type, width));
            }
            Action::Random { min, max } => random(block, address, cell_type, min, max),
            Action::Uptime => {
                let seconds = self.started.elapsed().as_secs();
                let registers = match cell_type {
                    CellType::Bits | CellType::Uint16 => vec![(seconds % 0x1_0000) as u16],
                    CellType::Uint32 => data_utils::u32_to_registers(seconds as u32).to_vec(),
                    CellType::Float32 => data_utils::f32_to_registers(seconds as f32).to_vec(),
                    CellType::String | CellType::Next => return,
                };
                block.write_span(address, &registers);
            }
            Action::Custom(name) => match (self.customs.get(&name), block.get_mut(address)) {
                (Some(callback), Some(cell)) => callback(address, cell),
                _ => debug!("Custom action '{}' is not registered, address {} left unchanged", name, address),
            },
        }
    }
}

fn increment(block: &mut TableBlock, address: u16, cell_type: CellType) {
    let registers = match cell_type {
        CellType::Bits | CellType::Uint16 => match block.get(address) {
            Some(cell) => vec![cell.value.wrapping_add(1)],
            None => return,
        },
        CellType::Uint32 => match block.read_span(address, 2) {
            Some(regs) => match data_utils::registers_to_u32(&regs) {
                Ok(value) => data_utils::u32_to_registers(value.wrapping_add(1)).to_vec(),
                Err(_) => return,
            },
            None => return,
        },
        CellType::Float32 => match block.read_span(address, 2) {
            Some(regs) => match data_utils::registers_to_f32(&regs) {
                Ok(value) if value.is_finite() && value < f32::MAX => {
                    data_utils::f32_to_registers(value + 1.0).to_vec()
                }
                Ok(_) => data_utils::f32_to_registers(f32::MIN).to_vec(),
                Err(_) => return,
            },
            None => return,
        },
        CellType::String | CellType::Next => return,
    };
    block.write_span(address, &registers);
}

fn random(block: &mut TableBlock, address: u16, cell_type: CellType, min: f64, max: f64) {
    let mut rng = rand::thread_rng();
    let registers = match cell_type {
        CellType::Bits | CellType::Uint16 => {
            let lo = min.clamp(0.0, u16::MAX as f64) as u16;
            let hi = max.clamp(0.0, u16::MAX as f64) as u16;
            vec![rng.gen_range(lo..=hi)]
        }
        CellType::Uint32 => {
            let lo = min.clamp(0.0, u32::MAX as f64) as u32;
            let hi = max.clamp(0.0, u32::MAX as f64) as u32;
            data_utils::u32_to_registers(rng.gen_range(lo..=hi)).to_vec()
        }
        CellType::Float32 => {
            let lo = min.clamp(f32::MIN as f64, f32::MAX as f64) as f32;
            let hi = max.clamp(f32::MIN as f64, f32::MAX as f64) as f32;
            let value = rng.gen_range(lo..=hi);
            data_utils::f32_to_registers(value).to_vec()
        }
        CellType::String | CellType::Next => return,
    };
    block.write_span(address, &registers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_bank::CellValue;

    fn block_with(cells: Vec<(u16, Cell)>) -> TableBlock {
        TableBlock::sparse(cells)
    }

    #[test]
    fn test_resolve_names() {
        let mut engine = ActionEngine::default();
        engine.register("custom1", |_, _| {}).unwrap();

        assert_eq!(engine.resolve("increment", None).unwrap(), Action::Increment);
        assert_eq!(
            engine.resolve("custom1", None).unwrap(),
            Action::Custom("custom1".to_string())
        );
        assert_eq!(
            engine.resolve("random", None).unwrap(),
            Action::Random { min: DEFAULT_RANDOM_MIN, max: DEFAULT_RANDOM_MAX }
        );

        let err = engine.resolve("explode", None).unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));

        let params = ActionParameters { minval: Some(10.0), maxval: Some(5.0) };
        assert!(engine.resolve("random", Some(&params)).is_err());
    }

    #[test]
    fn test_increment_wraps_uint16() {
        let engine = ActionEngine::default();
        let mut block = block_with(vec![
            (0, Cell::new(CellType::Uint16, 65534).with_action(Action::Increment)),
        ]);

        engine.apply(&mut block, 0);
        assert_eq!(block.get(0).unwrap().value, 65535);
        engine.apply(&mut block, 0);
        assert_eq!(block.get(0).unwrap().value, 0);
    }

    #[test]
    fn test_increment_uint32_spans_two_registers() {
        let engine = ActionEngine::default();
        let [hi, lo] = data_utils::u32_to_registers(0x0000_FFFF);
        let mut block = block_with(vec![
            (27, Cell::new(CellType::Uint32, hi).with_action(Action::Increment)),
            (28, Cell::new(CellType::Next, lo)),
        ]);

        engine.apply(&mut block, 27);
        assert_eq!(block.get(27).unwrap().value, 0x0001);
        assert_eq!(block.get(28).unwrap().value, 0x0000);
    }

    #[test]
    fn test_increment_float_and_string() {
        let engine = ActionEngine::default();
        let [hi, lo] = data_utils::f32_to_registers(1.5);
        let mut block = block_with(vec![
            (0, Cell::new(CellType::Float32, hi).with_action(Action::Increment)),
            (1, Cell::new(CellType::Next, lo)),
            (2, Cell::new(CellType::String, 0x5374).with_action(Action::Increment)),
        ]);

        engine.apply(&mut block, 0);
        let regs = block.read_span(0, 2).unwrap();
        assert_eq!(
            CellValue::from_registers(CellType::Float32, &regs).unwrap(),
            CellValue::Float32(2.5)
        );

        engine.apply(&mut block, 2);
        assert_eq!(block.get(2).unwrap().value, 0x5374);
    }

    #[test]
    fn test_reset_restores_type_default() {
        let defaults = TypeDefaults {
            bits: 0x0708,
            ..TypeDefaults::default()
        };
        let engine = ActionEngine::new(defaults);
        let mut block = block_with(vec![(14, Cell::new(CellType::Bits, 15).with_action(Action::Reset))]);

        engine.apply(&mut block, 14);
        assert_eq!(block.get(14).unwrap().value, 0x0708);
    }

    #[test]
    fn test_random_respects_bounds() {
        let engine = ActionEngine::default();
        let mut block = block_with(vec![(
            0,
            Cell::new(CellType::Uint16, 0).with_action(Action::Random { min: 10.0, max: 12.0 }),
        )]);

        for _ in 0..50 {
            engine.apply(&mut block, 0);
            let value = block.get(0).unwrap().value;
            assert!((10..=12).contains(&value));
        }
    }

    #[test]
    fn test_custom_callback_runs() {
        let mut engine = ActionEngine::default();
        engine
            .register("double", |_address, cell| cell.value = cell.value.wrapping_mul(2))
            .unwrap();
        let action = engine.resolve("double", None).unwrap();
        let mut block = block_with(vec![(5, Cell::new(CellType::Uint16, 21).with_action(action))]);

        engine.apply(&mut block, 5);
        assert_eq!(block.get(5).unwrap().value, 42);
    }
}
