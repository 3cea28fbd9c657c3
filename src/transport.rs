//! # Serial Transport Layer
//!
//! Byte-level access to the serial line for the server loop.
//!
//! ## Components
//!
//! - [`SerialConfig`]: line parameters (port, baud rate, parity, stop bits,
//!   byte size) and the RTU frame gap derived from them
//! - [`ServerTransport`]: the interface the server loop drives, a read with
//!   timeout plus a write of one complete ADU
//! - [`SerialTransport`]: implementation over any async byte stream, opened
//!   on a real port with [`SerialTransport::open`]
//!
//! The server loop is the only reader and the only writer of a transport.
//! Reads are cancel safe, so a pending read can be abandoned on shutdown.
//!
//! ## Frame gap
//!
//! RTU frames are separated by 3.5 character times of silence. A character
//! is 11 bits on the wire, so at 9600 baud the gap is about 4 ms. Above
//! 19200 baud the gap is fixed at 1.75 ms.
//!
//! ```rust
//! use std::time::Duration;
//! use voltage_modbus_sim::transport::SerialConfig;
//!
//! let mut config = SerialConfig::default();
//! assert_eq!(config.frame_gap(), Duration::from_micros(4007));
//! config.baud_rate = 115200;
//! assert_eq!(config.frame_gap(), Duration::from_micros(1750));
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::SerialStream;

use crate::error::{ModbusError, ModbusResult};

/// Fixed RTU frame gap above 19200 baud
const MIN_FRAME_GAP_US: u64 = 1750;

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Accepts `N`/`E`/`O` and `none`/`even`/`odd` in any case
impl FromStr for Parity {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "n" | "none" => Ok(Parity::None),
            "e" | "even" => Ok(Parity::Even),
            "o" | "odd" => Ok(Parity::Odd),
            other => Err(ModbusError::configuration(format!("Unknown parity '{}'", other))),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Parity::None => "N",
            Parity::Even => "E",
            Parity::Odd => "O",
        };
        f.write_str(letter)
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: u8,
    pub byte_size: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS0".to_string(),
            baud_rate: 9600,
            parity: Parity::None,
            stop_bits: 1,
            byte_size: 8,
        }
    }
}

impl SerialConfig {
    /// Check every parameter can be applied to a port
    pub fn validate(&self) -> ModbusResult<()> {
        if self.port.is_empty() {
            return Err(ModbusError::configuration("Serial port name is empty"));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::configuration("Baud rate must be positive"));
        }
        self.data_bits()?;
        self.stop_bits()?;
        Ok(())
    }

    /// Silence that ends an RTU frame (3.5 character times)
    pub fn frame_gap(&self) -> Duration {
        if self.baud_rate > 19200 {
            return Duration::from_micros(MIN_FRAME_GAP_US);
        }
        let char_time_us = 11_000_000 / self.baud_rate.max(1) as u64;
        Duration::from_micros(char_time_us * 35 / 10)
    }

    fn data_bits(&self) -> ModbusResult<tokio_serial::DataBits> {
        match self.byte_size {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(ModbusError::configuration(format!(
                "Invalid byte size {} (must be 5-8)",
                other
            ))),
        }
    }

    fn stop_bits(&self) -> ModbusResult<tokio_serial::StopBits> {
        match self.stop_bits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            other => Err(ModbusError::configuration(format!(
                "Invalid stop bits {} (must be 1 or 2)",
                other
            ))),
        }
    }
}

impl fmt::Display for SerialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}{}{}",
            self.port, self.baud_rate, self.byte_size, self.parity, self.stop_bits
        )
    }
}

/// Byte transport driven by the server loop
#[async_trait]
pub trait ServerTransport: Send {
    /// Read whatever bytes are available, waiting at most `wait`
    ///
    /// Returns `Ok(None)` when the wait elapsed without data. A closed or
    /// failing line is an error.
    async fn read_chunk(&mut self, buf: &mut [u8], wait: Duration) -> ModbusResult<Option<usize>>;

    /// Write one complete ADU
    async fn write_frame(&mut self, frame: &[u8]) -> ModbusResult<()>;

    /// Release the line; further reads and writes fail
    async fn close(&mut self) -> ModbusResult<()>;

    fn is_open(&self) -> bool;

    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub reads: u64,
    pub writes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Serial line transport
///
/// Generic over the stream so that tests can run the full server over an
/// in-memory pipe; production code uses [`SerialStream`].
pub struct SerialTransport<S = SerialStream> {
    name: String,
    stream: Option<S>,
    stats: TransportStats,
}

impl SerialTransport<SerialStream> {
    /// Open the serial device with the configured line parameters
    pub fn open(config: &SerialConfig) -> ModbusResult<Self> {
        config.validate()?;
        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(config.data_bits()?)
            .stop_bits(config.stop_bits()?)
            .parity(config.parity.into());

        let stream = SerialStream::open(&builder)
            .map_err(|e| ModbusError::connection(format!("Failed to open serial port {}: {}", config.port, e)))?;

        info!("Opened serial port {}", config);
        Ok(Self::from_stream(config.port.clone(), stream))
    }
}

impl<S> SerialTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already open stream
    pub fn from_stream(name: impl Into<String>, stream: S) -> Self {
        Self {
            name: name.into(),
            stream: Some(stream),
            stats: TransportStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn stream(&mut self) -> ModbusResult<&mut S> {
        let name = &self.name;
        self.stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection(format!("Serial port {} is closed", name)))
    }
}

#[async_trait]
impl<S> ServerTransport for SerialTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_chunk(&mut self, buf: &mut [u8], wait: Duration) -> ModbusResult<Option<usize>> {
        let result = timeout(wait, self.stream()?.read(buf)).await;
        match result {
            Ok(Ok(0)) => {
                self.stats.errors += 1;
                Err(ModbusError::io(format!("Serial port {} closed by peer", self.name)))
            }
            Ok(Ok(n)) => {
                self.stats.reads += 1;
                self.stats.bytes_received += n as u64;
                Ok(Some(n))
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                Err(ModbusError::io(format!("Serial read error on {}: {}", self.name, e)))
            }
            Err(_) => {
                self.stats.timeouts += 1;
                Ok(None)
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let stream = self.stream()?;
        let written = async {
            stream.write_all(frame).await?;
            stream.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                self.stats.writes += 1;
                self.stats.bytes_sent += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.errors += 1;
                Err(ModbusError::io(format!("Serial write error on {}: {}", self.name, e)))
            }
        }
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            // The port itself is released on drop
            let _ = stream.shutdown().await;
            debug!("Closed serial port {}", self.name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parity_parsing() {
        assert_eq!("N".parse::<Parity>().unwrap(), Parity::None);
        assert_eq!("e".parse::<Parity>().unwrap(), Parity::Even);
        assert_eq!("Odd".parse::<Parity>().unwrap(), Parity::Odd);
        assert!("M".parse::<Parity>().is_err());
        assert_eq!(Parity::Even.to_string(), "E");
    }

    #[test]
    fn test_serial_config_validation() {
        let config = SerialConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.to_string(), "/dev/ttyS0 9600 8N1");

        let bad_bits = SerialConfig { byte_size: 9, ..SerialConfig::default() };
        assert!(bad_bits.validate().is_err());
        let bad_stop = SerialConfig { stop_bits: 3, ..SerialConfig::default() };
        assert!(bad_stop.validate().is_err());
        let bad_baud = SerialConfig { baud_rate: 0, ..SerialConfig::default() };
        assert!(bad_baud.validate().is_err());
    }

    #[test]
    fn test_frame_gap() {
        let at = |baud_rate| SerialConfig { baud_rate, ..SerialConfig::default() }.frame_gap();
        assert_eq!(at(9600), Duration::from_micros(4007));
        assert_eq!(at(19200), Duration::from_micros(2002));
        assert_eq!(at(38400), Duration::from_micros(1750));
    }

    #[tokio::test]
    async fn test_stream_transport() {
        let (server_side, mut client_side) = tokio::io::duplex(64);
        let mut transport = SerialTransport::from_stream("pipe", server_side);
        let mut buf = [0u8; 16];

        assert_eq!(transport.read_chunk(&mut buf, Duration::from_millis(10)).await.unwrap(), None);

        client_side.write_all(&[1, 2, 3]).await.unwrap();
        let n = transport.read_chunk(&mut buf, Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        transport.write_frame(&[9, 8]).await.unwrap();
        let mut echo = [0u8; 2];
        client_side.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo, [9, 8]);

        let stats = transport.get_stats();
        assert_eq!(stats.bytes_received, 3);
        assert_eq!(stats.bytes_sent, 2);
        assert_eq!(stats.timeouts, 1);

        drop(client_side);
        assert!(transport.read_chunk(&mut buf, Duration::from_millis(100)).await.is_err());

        transport.close().await.unwrap();
        assert!(!transport.is_open());
        assert!(transport.write_frame(&[0]).await.is_err());
    }
}
