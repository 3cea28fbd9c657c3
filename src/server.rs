/// Modbus serial server
///
/// [`ServerLoop`] owns one transport and runs the read, dispatch and write
/// cycle until shutdown. [`ModbusSerialServer`] runs a loop on a tokio task
/// and exposes start/stop through the [`ModbusServer`] trait.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::codec::{AsciiFrameBuffer, FrameCodec, FramerKind, RtuFrameBuffer};
use crate::dispatcher::{DispatchOutcome, RequestDispatcher};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::{CallbackLogger, LogLevel};
use crate::protocol::UnitId;
use crate::register_bank::ServerContext;
use crate::transport::{SerialConfig, SerialTransport, ServerTransport, TransportStats};
use crate::utils::validation;

/// Read timeout while no frame is in progress; bounds how long a silent
/// line keeps the loop inside one read
const IDLE_READ_TIMEOUT: Duration = Duration::from_millis(1000);

const READ_BUFFER_SIZE: usize = 512;

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Start the server
    async fn start(&mut self) -> ModbusResult<()>;

    /// Stop the server and wait for its loop to finish
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Get server statistics
    fn get_stats(&self) -> ServerStats;
}

/// Server statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Complete ADUs cut from the byte stream
    pub frames_received: u64,
    /// ADUs discarded for checksum, structure or size errors
    pub frames_dropped: u64,
    /// Requests executed, broadcasts included
    pub requests_processed: u64,
    pub exception_responses: u64,
    pub broadcasts: u64,
    /// Frames for units this server does not serve
    pub ignored_frames: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
}

/// Shared view of the statistics of a running loop
#[derive(Debug, Clone)]
pub struct StatsHandle {
    inner: Arc<Mutex<ServerStats>>,
    started: Instant,
}

impl StatsHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ServerStats::default())),
            started: Instant::now(),
        }
    }

    fn update<F: FnOnce(&mut ServerStats)>(&self, f: F) {
        if let Ok(mut stats) = self.inner.lock() {
            f(&mut stats);
        }
    }

    /// Current counters with the uptime filled in
    pub fn snapshot(&self) -> ServerStats {
        let mut stats = self
            .inner
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default();
        stats.uptime_seconds = self.started.elapsed().as_secs();
        stats
    }
}

/// Serial server configuration
///
/// Every field has a default, so a JSON file only needs the values that
/// differ:
///
/// ```rust
/// use voltage_modbus_sim::server::ServerConfig;
/// use voltage_modbus_sim::codec::FramerKind;
///
/// let config = ServerConfig::from_json_str(r#"{"framer": "ascii", "serial": {"port": "/dev/ttyUSB0"}}"#).unwrap();
/// assert_eq!(config.framer, FramerKind::Ascii);
/// assert_eq!(config.serial.port, "/dev/ttyUSB0");
/// assert_eq!(config.serial.baud_rate, 9600);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub serial: SerialConfig,
    pub framer: FramerKind,
    /// Unit id answered; 0 answers any unit
    pub unit_id: UnitId,
    /// Treat unit 0 as broadcast: executed on every device, never answered
    pub broadcast_enable: bool,
    /// Send every ADU and decoded request/response to the log sink
    pub packet_logging: bool,
    /// Longest pause inside an ASCII frame before it is abandoned
    pub inter_char_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            framer: FramerKind::Rtu,
            unit_id: 0,
            broadcast_enable: false,
            packet_logging: false,
            inter_char_timeout_ms: 1000,
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> ModbusResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Cannot read server config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        self.serial.validate()?;
        validation::validate_unit_id(self.unit_id)?;
        if self.inter_char_timeout_ms == 0 {
            return Err(ModbusError::configuration("Inter-character timeout must be positive"));
        }
        Ok(())
    }

    pub fn inter_char_timeout(&self) -> Duration {
        Duration::from_millis(self.inter_char_timeout_ms)
    }
}

/// Single owner of a transport: reads, dispatches and answers frames
pub struct ServerLoop<T: ServerTransport> {
    transport: T,
    codec: FrameCodec,
    dispatcher: RequestDispatcher,
    logger: CallbackLogger,
    packet_logging: bool,
    frame_gap: Duration,
    inter_char_timeout: Duration,
    rtu: RtuFrameBuffer,
    ascii: AsciiFrameBuffer,
    stats: StatsHandle,
}

impl<T: ServerTransport> ServerLoop<T> {
    pub fn new(transport: T, config: &ServerConfig, context: ServerContext, logger: CallbackLogger) -> Self {
        Self {
            transport,
            codec: FrameCodec::new(config.framer),
            dispatcher: RequestDispatcher::new(context, config.unit_id, config.broadcast_enable),
            logger,
            packet_logging: config.packet_logging,
            frame_gap: config.serial.frame_gap(),
            inter_char_timeout: config.inter_char_timeout(),
            rtu: RtuFrameBuffer::new(),
            ascii: AsciiFrameBuffer::new(),
            stats: StatsHandle::new(),
        }
    }

    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }

    /// Serve until `shutdown` fires or the transport fails
    ///
    /// Shutdown interrupts a pending read, so it takes effect within one
    /// frame. A transport failure closes the line and is returned.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> ModbusResult<()> {
        info!(
            "Modbus {} server loop started (frame gap {:?})",
            self.codec.kind(),
            self.frame_gap
        );
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let wait = self.read_wait();
            let read = tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping server loop");
                    break;
                }
                read = self.transport.read_chunk(&mut buf, wait) => read,
            };

            let step = match read {
                Ok(Some(n)) => self.on_bytes(&buf[..n]).await,
                Ok(None) => self.on_silence().await,
                Err(e) => Err(e),
            };
            if let Err(e) = step {
                error!("Serial transport failed: {}", e);
                if let Err(close_err) = self.transport.close().await {
                    warn!("Failed to close transport: {}", close_err);
                }
                return Err(e);
            }
        }

        let stats = self.stats.snapshot();
        let line = self.transport_stats();
        self.transport.close().await?;
        info!(
            "Server loop stopped: {} frames, {} requests, {} dropped, {} read timeouts, {} line errors",
            stats.frames_received, stats.requests_processed, stats.frames_dropped, line.timeouts, line.errors
        );
        Ok(())
    }

    fn read_wait(&self) -> Duration {
        match self.codec.kind() {
            FramerKind::Rtu if !self.rtu.is_empty() => self.frame_gap,
            FramerKind::Ascii if self.ascii.is_partial() => self.inter_char_timeout,
            _ => IDLE_READ_TIMEOUT,
        }
    }

    async fn on_bytes(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        self.stats.update(|s| s.bytes_received += bytes.len() as u64);

        match self.codec.kind() {
            FramerKind::Rtu => {
                if let Err(e) = self.rtu.push(bytes) {
                    self.drop_frame(&e);
                }
            }
            FramerKind::Ascii => {
                for &byte in bytes {
                    match self.ascii.push_byte(byte) {
                        Some(Ok(adu)) => self.handle_adu(adu).await?,
                        Some(Err(e)) => self.drop_frame(&e),
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_silence(&mut self) -> ModbusResult<()> {
        match self.codec.kind() {
            FramerKind::Rtu => {
                if let Some(adu) = self.rtu.on_silence() {
                    self.handle_adu(adu).await?;
                }
            }
            FramerKind::Ascii => {
                if self.ascii.is_partial() {
                    self.ascii.reset();
                    let timeout_ms = self.inter_char_timeout.as_millis() as u64;
                    self.drop_frame(&ModbusError::timeout("Incomplete ASCII frame", timeout_ms));
                }
            }
        }
        Ok(())
    }

    /// Decode, dispatch and answer one ADU; only transport errors escape
    async fn handle_adu(&mut self, adu: Vec<u8>) -> ModbusResult<()> {
        self.stats.update(|s| s.frames_received += 1);
        if self.packet_logging {
            self.logger.log_packet(LogLevel::Info, "RX", &adu);
        }

        let frame = match self.codec.decode_request(&adu) {
            Ok(frame) => frame,
            Err(e) => {
                self.drop_frame(&e);
                return Ok(());
            }
        };
        if self.packet_logging {
            self.logger.log_request(&frame);
        }

        match self.dispatcher.dispatch(&frame) {
            DispatchOutcome::Response(response) => {
                let reply = self.codec.encode_response(&response);
                if self.packet_logging {
                    self.logger.log_response(&response);
                    self.logger.log_packet(LogLevel::Info, "TX", &reply);
                }
                self.transport.write_frame(&reply).await?;

                let exception = response.is_exception();
                self.stats.update(|s| {
                    s.requests_processed += 1;
                    s.bytes_sent += reply.len() as u64;
                    if exception {
                        s.exception_responses += 1;
                    }
                });
            }
            DispatchOutcome::Broadcast => {
                debug!("Broadcast function 0x{:02X} executed", frame.function_code);
                self.stats.update(|s| {
                    s.requests_processed += 1;
                    s.broadcasts += 1;
                });
            }
            DispatchOutcome::Ignored => self.stats.update(|s| s.ignored_frames += 1),
        }
        Ok(())
    }

    fn drop_frame(&self, e: &ModbusError) {
        debug!("Dropping frame: {}", e);
        self.stats.update(|s| s.frames_dropped += 1);
    }
}

/// Modbus RTU/ASCII serial server
pub struct ModbusSerialServer {
    config: ServerConfig,
    context: ServerContext,
    logger: CallbackLogger,
    stats: Option<StatsHandle>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handle: Option<JoinHandle<ModbusResult<()>>>,
    running: Arc<AtomicBool>,
}

impl ModbusSerialServer {
    /// Create a server; the configuration is validated here
    pub fn new(config: ServerConfig, context: ServerContext) -> ModbusResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            context,
            logger: CallbackLogger::disabled(),
            stats: None,
            shutdown_tx: None,
            handle: None,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Sink for packet logging
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    /// Run the server loop over an already open transport
    pub fn start_with_transport<T>(&mut self, transport: T) -> ModbusResult<()>
    where
        T: ServerTransport + 'static,
    {
        if self.is_running() {
            return Err(ModbusError::protocol("Server is already running"));
        }

        let server_loop = ServerLoop::new(transport, &self.config, self.context.clone(), self.logger.clone());
        self.stats = Some(server_loop.stats());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        self.handle = Some(tokio::spawn(async move {
            let result = server_loop.run(shutdown_rx).await;
            running.store(false, Ordering::SeqCst);
            result
        }));
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Wait until the loop ends by itself, i.e. the transport failed
    ///
    /// Cancel safe: dropping the future keeps the task handle, so `stop`
    /// still joins the loop afterwards.
    pub async fn wait(&mut self) -> ModbusResult<()> {
        let joined = match self.handle.as_mut() {
            Some(handle) => handle.await,
            None => return Ok(()),
        };
        self.handle = None;
        joined.map_err(|e| ModbusError::internal(format!("Server task failed: {}", e)))?
    }
}

#[async_trait]
impl ModbusServer for ModbusSerialServer {
    async fn start(&mut self) -> ModbusResult<()> {
        info!(
            "Starting Modbus {} server on {} (unit id {}, broadcast {})",
            self.config.framer,
            self.config.serial,
            self.config.unit_id,
            if self.config.broadcast_enable { "on" } else { "off" }
        );
        let transport = SerialTransport::open(&self.config.serial)?;
        self.start_with_transport(transport)
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        let result = self.wait().await;
        self.running.store(false, Ordering::SeqCst);
        info!("Modbus serial server stopped");
        result
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        self.stats
            .as_ref()
            .map(StatsHandle::snapshot)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    use crate::register_bank::{Cell, CellType, DeviceContext, TableBlock};

    fn context() -> ServerContext {
        let bits = TableBlock::sequential(16, Cell::new(CellType::Bits, 0)).unwrap();
        let regs = TableBlock::sequential(16, Cell::new(CellType::Uint16, 0)).unwrap();
        ServerContext::single(DeviceContext::plain(bits.clone(), bits, regs.clone(), regs))
    }

    fn fast_config() -> ServerConfig {
        ServerConfig {
            serial: SerialConfig {
                baud_rate: 115200,
                ..SerialConfig::default()
            },
            inter_char_timeout_ms: 50,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.serial.port, "/dev/ttyS0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.framer, FramerKind::Rtu);
        assert_eq!(config.unit_id, 0);
        assert!(!config.broadcast_enable);
        assert_eq!(config.inter_char_timeout(), Duration::from_millis(1000));
        assert!(config.validate().is_ok());

        let invalid = ServerConfig {
            unit_id: 250,
            ..ServerConfig::default()
        };
        assert!(invalid.validate().is_err());
        assert!(ModbusSerialServer::new(invalid, context()).is_err());
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(
            &path,
            r#"{"serial": {"baud_rate": 19200, "parity": "even"}, "unit_id": 3, "broadcast_enable": true}"#,
        )
        .unwrap();

        let config = ServerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.serial.baud_rate, 19200);
        assert_eq!(config.serial.parity, crate::transport::Parity::Even);
        assert_eq!(config.unit_id, 3);
        assert!(config.broadcast_enable);
        assert!(matches!(
            ServerConfig::from_json_str("{\"unit_id\": \"x\"}"),
            Err(ModbusError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let (server_side, mut client) = tokio::io::duplex(256);
        let mut server = ModbusSerialServer::new(fast_config(), context()).unwrap();
        server
            .start_with_transport(SerialTransport::from_stream("pipe", server_side))
            .unwrap();
        assert!(server.is_running());
        assert!(server
            .start_with_transport(SerialTransport::from_stream("pipe", tokio::io::duplex(8).0))
            .is_err());

        client
            .write_all(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03, 0x98, 0x0B])
            .await
            .unwrap();
        let mut reply = [0u8; 8];
        timeout(Duration::from_secs(2), client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, [0x01, 0x06, 0x00, 0x01, 0x00, 0x03, 0x98, 0x0B]);

        let stats = server.get_stats();
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.requests_processed, 1);
        assert_eq!(stats.bytes_sent, 8);

        timeout(Duration::from_secs(1), server.stop()).await.unwrap().unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_loop_ends_when_line_closes() {
        let (server_side, client) = tokio::io::duplex(64);
        let mut server = ModbusSerialServer::new(fast_config(), context()).unwrap();
        server
            .start_with_transport(SerialTransport::from_stream("pipe", server_side))
            .unwrap();

        drop(client);
        let result = timeout(Duration::from_secs(2), server.wait()).await.unwrap();
        assert!(matches!(result, Err(ModbusError::Io { .. })));
        assert!(!server.is_running());
    }
}
