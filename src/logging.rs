//! Logging for the serial server
//!
//! Two layers:
//!
//! - [`CallbackLogger`] is the sink the server loop writes packet and request
//!   events to. Where they end up is decided by the callback.
//! - [`init_env_logger`] configures the `log` facade for the binaries.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{Frame, ModbusFunction, ModbusResponse};
use crate::utils::format::{bytes_to_hex, registers_to_hex};

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw packet data only
    Raw,
    /// Show interpreted packet data with field descriptions
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
        }
    }

    fn to_log_level(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse the command line level names; `critical` maps to [`LogLevel::Error`]
impl FromStr for LogLevel {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" | "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(ModbusError::configuration(format!("Unknown log level '{}'", other))),
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that uses callbacks for flexible logging
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("enabled", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode: LoggingMode::Interpreted,
        }
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => eprintln!("[{}] {}: {}", timestamp, level, message),
                LogLevel::Info | LogLevel::Debug => println!("[{}] {}: {}", timestamp, level, message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Forward events into the `log` facade under the `modbus.packets` target
    pub fn log_facade(min_level: LogLevel) -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            log::log!(target: "modbus.packets", level.to_log_level(), "{}", message);
        });
        Self::new(Some(callback), min_level)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    /// Log an error message
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Log a warning message
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    /// Log an info message
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Log a debug message
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Check if a message at the given level should be logged
    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log a raw ADU with hex dump
    pub fn log_packet(&self, level: LogLevel, direction: &str, data: &[u8]) {
        if !self.should_log(level) {
            return;
        }
        let message = format!("{} packet ({} bytes): {}", direction, data.len(), bytes_to_hex(data));
        self.log(level, &message);
    }

    /// Log a decoded request according to the logging mode
    pub fn log_request(&self, frame: &Frame) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        let interpreted = format!(
            "Modbus Request -> Unit: {}, Function: {} (0x{:02X}), Address: {}, Quantity: {}",
            frame.unit_id,
            function_name(frame.function_code),
            frame.function_code,
            frame.address,
            frame.quantity
        );
        let raw = format!("Modbus Request -> Raw PDU: {}", bytes_to_hex(&frame.to_pdu()));
        self.emit(&interpreted, &raw);
    }

    /// Log a response according to the logging mode
    pub fn log_response(&self, response: &ModbusResponse) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        let details = match response.exception {
            Some(exception) => format!("Exception: {}", exception),
            None => interpret_response_data(response.function_code, &response.data),
        };
        let interpreted = format!(
            "Modbus Response <- Unit: {}, Function: {} (0x{:02X}), {}",
            response.unit_id,
            function_name(response.function_code),
            response.function_code,
            details
        );
        let raw = format!("Modbus Response <- Raw PDU: {}", bytes_to_hex(&response.to_pdu()));
        self.emit(&interpreted, &raw);
    }

    fn emit(&self, interpreted: &str, raw: &str) {
        match self.mode {
            LoggingMode::Raw => self.info(raw),
            LoggingMode::Interpreted => self.info(interpreted),
            LoggingMode::Both => {
                self.info(interpreted);
                self.debug(raw);
            }
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Get human-readable function name
fn function_name(function_code: u8) -> String {
    ModbusFunction::from_u8(function_code)
        .map(|function| function.name().to_string())
        .unwrap_or_else(|_| "Unknown Function".to_string())
}

/// Interpret response data based on function code
fn interpret_response_data(function_code: u8, data: &[u8]) -> String {
    if data.is_empty() {
        return "No data".to_string();
    }

    match (ModbusFunction::from_u8(function_code), data) {
        (Ok(ModbusFunction::ReadCoils), [byte_count, bits @ ..])
        | (Ok(ModbusFunction::ReadDiscreteInputs), [byte_count, bits @ ..]) => {
            let values: Vec<u8> = bits
                .iter()
                .flat_map(|byte| (0..8).map(move |bit| (byte >> bit) & 1))
                .take(16)
                .collect();
            format!("Byte count: {}, Bits: {:?}", byte_count, values)
        }
        (Ok(ModbusFunction::ReadHoldingRegisters), [byte_count, payload @ ..])
        | (Ok(ModbusFunction::ReadInputRegisters), [byte_count, payload @ ..]) => {
            let registers: Vec<u16> = payload
                .chunks_exact(2)
                .take(8)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            format!("Byte count: {}, Registers: {}", byte_count, registers_to_hex(&registers))
        }
        (Ok(ModbusFunction::WriteSingleCoil), [a0, a1, v0, v1]) => {
            let value = u16::from_be_bytes([*v0, *v1]);
            format!(
                "Address: {}, Value: 0x{:04X} ({})",
                u16::from_be_bytes([*a0, *a1]),
                value,
                if value == crate::protocol::COIL_ON { "ON" } else { "OFF" }
            )
        }
        (Ok(ModbusFunction::WriteSingleRegister), [a0, a1, v0, v1]) => {
            let value = u16::from_be_bytes([*v0, *v1]);
            format!("Address: {}, Value: {} (0x{:04X})", u16::from_be_bytes([*a0, *a1]), value, value)
        }
        (Ok(ModbusFunction::WriteMultipleCoils), [a0, a1, q0, q1])
        | (Ok(ModbusFunction::WriteMultipleRegisters), [a0, a1, q0, q1]) => format!(
            "Address: {}, Quantity: {}",
            u16::from_be_bytes([*a0, *a1]),
            u16::from_be_bytes([*q0, *q1])
        ),
        _ => format!("Data: {}", hex::encode(data)),
    }
}

/// Configure the `log` facade for a binary
///
/// Output goes to `output` (appended) when given, to stderr otherwise. At
/// INFO level only the bare message is printed; every other level gets
/// `timestamp - target - LEVEL - message`.
pub fn init_env_logger(level: LogLevel, output: Option<&Path>) -> ModbusResult<()> {
    let bare = level == LogLevel::Info;

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level.to_level_filter())
        .format(move |buf, record| {
            if bare {
                writeln!(buf, "{}", record.args())
            } else {
                writeln!(
                    buf,
                    "{} - {} - {} - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
                    record.target(),
                    record.level(),
                    record.args()
                )
            }
        });

    if let Some(path) = output {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ModbusError::configuration(format!("Cannot open log file {}: {}", path.display(), e)))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .map_err(|e| ModbusError::configuration(format!("Logger already initialised: {}", e)))
}

/// Convenience macro for creating a simple console logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

/// Convenience macro for creating a custom logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::CallbackLogger::with_mode(Some($callback), $level, $mode)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::protocol::ModbusException;

    fn capture(level: LogLevel, mode: LoggingMode) -> (CallbackLogger, Arc<Mutex<Vec<(LogLevel, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push((level, message.to_string()));
        });
        (crate::custom_logger!(callback, level, mode), lines)
    }

    #[test]
    fn test_level_names() {
        assert_eq!("critical".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Warn.to_level_filter(), log::LevelFilter::Warn);
    }

    #[test]
    fn test_logger_constructors() {
        let console = crate::console_logger!();
        assert_eq!(console.get_mode(), LoggingMode::Interpreted);
        assert!(format!("{:?}", console).contains("enabled: true"));
        assert!(format!("{:?}", CallbackLogger::disabled()).contains("enabled: false"));
    }

    #[test]
    fn test_level_filtering() {
        let (logger, lines) = capture(LogLevel::Info, LoggingMode::Interpreted);
        logger.debug("hidden");
        logger.info("shown");
        logger.error("also shown");
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (LogLevel::Info, "shown".to_string()));

        // Disabled logger never calls anything
        CallbackLogger::disabled().error("nothing");
    }

    #[test]
    fn test_packet_and_request_logging() {
        let (logger, lines) = capture(LogLevel::Debug, LoggingMode::Both);
        logger.log_packet(LogLevel::Info, "RX", &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
        logger.log_request(&Frame::read(1, ModbusFunction::ReadHoldingRegisters, 0, 2));
        logger.log_response(&ModbusResponse::new_success(1, 0x03, vec![0x04, 0x00, 0xAB, 0x00, 0xCD]));
        logger.log_response(&ModbusResponse::new_exception(1, 0x03, ModbusException::IllegalDataAddress));

        let lines = lines.lock().unwrap();
        assert_eq!(lines[0].1, "RX packet (8 bytes): 01 03 00 00 00 02 C4 0B");
        assert!(lines[1].1.contains("Unit: 1"));
        assert!(lines[1].1.contains("Quantity: 2"));
        assert_eq!(lines[2], (LogLevel::Debug, "Modbus Request -> Raw PDU: 03 00 00 00 02".to_string()));
        assert!(lines[3].1.contains("Registers: 00AB 00CD"));
        assert!(lines.iter().any(|(_, line)| line.contains("ILLEGAL_DATA_ADDRESS")));
    }

    #[test]
    fn test_log_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        // Another test may have installed a logger already; the file is created either way
        let _ = init_env_logger(LogLevel::Info, Some(&path));
        assert!(path.exists());
    }
}
