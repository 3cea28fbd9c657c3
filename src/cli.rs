/// Command line arguments shared by the server binaries

use std::path::PathBuf;

use clap::Parser;

use crate::codec::FramerKind;
use crate::error::ModbusResult;
use crate::logging::{CallbackLogger, LogLevel, LoggingMode};
use crate::server::ServerConfig;
use crate::transport::{Parity, SerialConfig};

/// Modbus RTU/ASCII serial server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct ServerArgs {
    /// Log level
    #[arg(
        short = 'l',
        long = "log-level",
        default_value = "info",
        value_parser = ["critical", "error", "warning", "info", "debug"]
    )]
    pub log_level: String,

    /// Serial line speed
    #[arg(short = 'b', long = "baudrate", default_value_t = 9600)]
    pub baudrate: u32,

    /// Unit id to answer (0 answers any unit)
    #[arg(short = 'i', long = "id", default_value_t = 0)]
    pub id: u8,

    /// Append log output to this file instead of stderr
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Parity: N, E or O
    #[arg(short = 'P', long = "parity", default_value = "N")]
    pub parity: Parity,

    #[arg(short = 'S', long = "stop-bits", default_value_t = 1)]
    pub stop_bits: u8,

    #[arg(short = 'B', long = "byte-size", default_value_t = 8)]
    pub byte_size: u8,

    /// Serial port, e.g. /dev/ttyUSB0 or COM3
    #[arg(short = 'p', long = "port")]
    pub port: String,

    /// Wire framing
    #[arg(short = 'F', long = "framer", default_value = "rtu")]
    pub framer: FramerKind,

    /// Execute unit 0 requests on every device without answering
    #[arg(long)]
    pub broadcast: bool,

    /// Log every frame in hex and decoded form
    #[arg(long = "packet-logging")]
    pub packet_logging: bool,

    /// Simulator overlay document (JSON); the demo overlay when omitted
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
}

impl ServerArgs {
    pub fn log_level(&self) -> ModbusResult<LogLevel> {
        self.log_level.parse()
    }

    /// Resolve the arguments into a validated server configuration
    pub fn to_server_config(&self) -> ModbusResult<ServerConfig> {
        let config = ServerConfig {
            serial: SerialConfig {
                port: self.port.clone(),
                baud_rate: self.baudrate,
                parity: self.parity,
                stop_bits: self.stop_bits,
                byte_size: self.byte_size,
            },
            framer: self.framer,
            unit_id: self.id,
            broadcast_enable: self.broadcast,
            packet_logging: self.packet_logging,
            ..ServerConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Sink for packet logging, routed into the `log` facade
    pub fn packet_logger(&self) -> CallbackLogger {
        if !self.packet_logging {
            return CallbackLogger::disabled();
        }
        let mut logger = CallbackLogger::log_facade(LogLevel::Debug);
        logger.set_mode(LoggingMode::Both);
        logger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = ServerArgs::try_parse_from(["serial_simulator", "-p", "/dev/ttyUSB0"]).unwrap();
        assert_eq!(args.log_level().unwrap(), LogLevel::Info);
        assert_eq!(args.baudrate, 9600);
        assert_eq!(args.id, 0);
        assert_eq!(args.parity, Parity::None);
        assert_eq!(args.framer, FramerKind::Rtu);
        assert!(args.output.is_none());
        assert!(args.config.is_none());

        let config = args.to_server_config().unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.serial.stop_bits, 1);
        assert_eq!(config.serial.byte_size, 8);
        assert!(!config.broadcast_enable);
    }

    #[test]
    fn test_all_flags() {
        let args = ServerArgs::try_parse_from([
            "serial_simulator",
            "-l", "warning",
            "-b", "19200",
            "-i", "5",
            "-o", "server.log",
            "-P", "e",
            "-S", "2",
            "-B", "7",
            "-p", "COM3",
            "-F", "ascii",
            "--broadcast",
            "--packet-logging",
            "-c", "overlay.json",
        ])
        .unwrap();

        assert_eq!(args.log_level().unwrap(), LogLevel::Warn);
        assert_eq!(args.output, Some(PathBuf::from("server.log")));
        assert_eq!(args.config, Some(PathBuf::from("overlay.json")));

        let config = args.to_server_config().unwrap();
        assert_eq!(config.serial.baud_rate, 19200);
        assert_eq!(config.serial.parity, Parity::Even);
        assert_eq!(config.serial.stop_bits, 2);
        assert_eq!(config.serial.byte_size, 7);
        assert_eq!(config.framer, FramerKind::Ascii);
        assert_eq!(config.unit_id, 5);
        assert!(config.broadcast_enable);
        assert!(config.packet_logging);
        assert_eq!(args.packet_logger().get_mode(), LoggingMode::Both);
    }

    #[test]
    fn test_rejected_arguments() {
        assert!(ServerArgs::try_parse_from(["serial_server"]).is_err());
        assert!(ServerArgs::try_parse_from(["serial_server", "-p", "x", "-l", "verbose"]).is_err());
        assert!(ServerArgs::try_parse_from(["serial_server", "-p", "x", "-F", "tcp"]).is_err());
        assert!(ServerArgs::try_parse_from(["serial_server", "-p", "x", "-P", "M"]).is_err());

        let args = ServerArgs::try_parse_from(["serial_server", "-p", "x", "-i", "250"]).unwrap();
        assert!(args.to_server_config().is_err());
    }

    #[test]
    fn test_critical_maps_to_error() {
        let args = ServerArgs::try_parse_from(["serial_server", "-p", "x", "-l", "critical"]).unwrap();
        assert_eq!(args.log_level().unwrap(), LogLevel::Error);
    }
}
