//! # Voltage Modbus Sim - Modbus RTU/ASCII Serial Server and Register Simulator
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **Version:** 0.3.0
//! **License:** MIT
//!
//! A Modbus RTU/ASCII serial server with a schema-driven register simulator,
//! built on Tokio. It is intended for testing masters, gateways and SCADA
//! integrations against simulated field devices.
//!
//! ## Features
//!
//! - **Serial Framing**: RTU with CRC16 and t3.5 silence detection, ASCII with LRC
//! - **Typed Registers**: bits, uint16, uint32, float32 and string cells
//! - **Simulator Overlays**: JSON documents with defaults, invalid and write
//!   ranges, typed cell lists and repeat rules
//! - **Cell Actions**: increment, reset, random, uptime and named custom callbacks
//! - **Multi-Device**: one device for every unit id, or one per unit id, plus broadcast
//! - **Monitoring**: server and transport statistics, packet logging
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Server |
//! |------|----------|--------|
//! | 0x01 | Read Coils | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ |
//! | 0x03 | Read Holding Registers | ✅ |
//! | 0x04 | Read Input Registers | ✅ |
//! | 0x05 | Write Single Coil | ✅ |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ |
//!
//! Any other function code is answered with ILLEGAL_FUNCTION.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_modbus_sim::{ModbusSerialServer, ModbusServer, ServerConfig, ServerContext};
//! use voltage_modbus_sim::simulator::{demo_overlay, SimulatorOverlay};
//! use voltage_modbus_sim::actions::ActionEngine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let overlay = SimulatorOverlay::new(demo_overlay()?, ActionEngine::default());
//!     let context = ServerContext::single(overlay.build()?);
//!
//!     let mut config = ServerConfig::default();
//!     config.serial.port = "/dev/ttyUSB0".to_string();
//!
//!     let mut server = ModbusSerialServer::new(config, context)?;
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Serial Line   │◄──►│    Transport    │
//! └─────────────────┘    └─────────────────┘
//!                                 │
//!                        ┌─────────────────┐
//!                        │   Server Loop   │──► Frame Codec (RTU / ASCII)
//!                        └─────────────────┘
//!                                 │
//!                        ┌─────────────────┐
//!                        │   Dispatcher    │
//!                        └─────────────────┘
//!                                 │
//!                        ┌─────────────────┐
//!                        │  Register Bank  │◄── Simulator Overlay
//!                        └─────────────────┘          │
//!                                 │                    │
//!                        ┌─────────────────┐           │
//!                        │  Action Engine  │◄──────────┘
//!                        └─────────────────┘
//! ```

/// Core error types and result handling
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod error;

/// Modbus protocol definitions and message handling
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod protocol;

/// RTU and ASCII frame encoding, decoding and stream buffering
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod codec;

/// Serial line transport
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod transport;

/// Cell actions run on every access
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod actions;

/// Typed register storage for simulated devices
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod register_bank;

/// Overlay documents that build simulated devices
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod simulator;

/// Request execution against the register bank
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod dispatcher;

/// Serial server loop and lifecycle
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod server;

/// Command line arguments for the server binaries
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod cli;

/// Utility functions for validation and formatting
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod utils;

/// Logging system for the library
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod logging;

// Re-export main types for convenience
pub use error::{ModbusError, ModbusResult};
pub use protocol::{Frame, ModbusException, ModbusFunction, ModbusResponse, UnitId};
pub use codec::{FrameCodec, FramerKind};
pub use transport::{Parity, SerialConfig, SerialTransport, ServerTransport, TransportStats};
pub use actions::{Action, ActionEngine, TypeDefaults};
pub use register_bank::{Cell, CellType, CellValue, DeviceContext, ServerContext, TableBlock, TableKind};
pub use simulator::{OverlaySpec, SimulatorOverlay};
pub use dispatcher::{DispatchOutcome, RequestDispatcher};
pub use server::{ModbusSerialServer, ModbusServer, ServerConfig, ServerLoop, ServerStats};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};

/// Maximum number of coils or discrete inputs in one read request
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum number of registers in one read request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of coils in one Write Multiple Coils request
pub const MAX_WRITE_COILS: u16 = 1968;

/// Maximum number of registers in one Write Multiple Registers request
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Maximum Modbus ASCII frame size in characters, delimiters included
pub const MAX_ASCII_FRAME_SIZE: usize = 513;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Sim v{} - Modbus RTU/ASCII serial server and simulator by Evan Liu", VERSION)
}
