/// Utility functions and helpers for the serial server
///
/// This module contains request validation, formatting helpers for logs
/// and statistics, and test logging setup.

use std::time::Duration;

use crate::error::{ModbusError, ModbusResult};

/// Request validation utilities
///
/// Quantity and byte count violations are `InvalidData` errors, answered
/// with ILLEGAL_DATA_VALUE.
pub mod validation {
    use super::*;

    /// Validate a unit id given on the command line (0 = any, 1-247)
    pub fn validate_unit_id(unit_id: u8) -> ModbusResult<()> {
        if unit_id > 247 {
            return Err(ModbusError::configuration(format!(
                "Invalid unit id: {} (must be 0-247)",
                unit_id
            )));
        }
        Ok(())
    }

    fn validate_count(what: &str, count: u16, max: u16) -> ModbusResult<()> {
        if count == 0 || count > max {
            return Err(ModbusError::invalid_data(format!(
                "Invalid {} count: {} (must be 1-{})",
                what, count, max
            )));
        }
        Ok(())
    }

    /// Quantity of a Read Coils / Read Discrete Inputs request
    pub fn validate_read_bits(count: u16) -> ModbusResult<()> {
        validate_count("bit", count, crate::MAX_READ_BITS)
    }

    /// Quantity of a Read Holding / Input Registers request
    pub fn validate_read_registers(count: u16) -> ModbusResult<()> {
        validate_count("register", count, crate::MAX_READ_REGISTERS)
    }

    /// Quantity of a Write Multiple Coils request
    pub fn validate_write_coils(count: u16) -> ModbusResult<()> {
        validate_count("coil", count, crate::MAX_WRITE_COILS)
    }

    /// Quantity of a Write Multiple Registers request
    pub fn validate_write_registers(count: u16) -> ModbusResult<()> {
        validate_count("register", count, crate::MAX_WRITE_REGISTERS)
    }

    /// The announced byte count must match the quantity exactly
    pub fn validate_byte_count(expected: usize, actual: usize) -> ModbusResult<()> {
        if expected != actual {
            return Err(ModbusError::invalid_data(format!(
                "Byte count {} does not match quantity ({} bytes expected)",
                actual, expected
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(validation::validate_unit_id(0).is_ok());
        assert!(validation::validate_unit_id(247).is_ok());
        assert!(validation::validate_unit_id(248).is_err());

        assert!(validation::validate_read_bits(2000).is_ok());
        assert!(validation::validate_read_bits(2001).is_err());
        assert!(validation::validate_read_registers(125).is_ok());
        assert!(validation::validate_read_registers(0).is_err());
        assert!(validation::validate_write_coils(1968).is_ok());
        assert!(validation::validate_write_coils(1969).is_err());
        assert!(validation::validate_write_registers(123).is_ok());
        assert!(matches!(
            validation::validate_write_registers(124),
            Err(ModbusError::InvalidData { .. })
        ));

        assert!(validation::validate_byte_count(4, 4).is_ok());
        assert!(validation::validate_byte_count(4, 6).is_err());
    }

    #[test]
    fn test_formatting() {
        let bytes = vec![0x01, 0x03, 0x10, 0xFF];
        assert_eq!(format::bytes_to_hex(&bytes), "01 03 10 FF");

        let registers = vec![0x1234, 0x5678];
        assert_eq!(format::registers_to_hex(&registers), "1234 5678");

        assert_eq!(format::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format::format_duration(Duration::from_millis(90_000)), "1m 30.0s");
    }
}
