/// Voltage Modbus Serial Server
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Serves a plain device with zeroed tables under the unit id given by
/// `--id`: 10 coils and 10 discrete inputs in sequential blocks, 10 holding
/// and 10 input registers in sparse blocks.

use std::collections::HashMap;

use clap::Parser;
use log::{debug, info, warn};

use voltage_modbus_sim::cli::ServerArgs;
use voltage_modbus_sim::logging::init_env_logger;
use voltage_modbus_sim::{
    Cell, CellType, DeviceContext, ModbusResult, ModbusSerialServer, ModbusServer, ServerContext,
    TableBlock,
};

const BLOCK_SIZE: u16 = 10;

fn plain_device() -> ModbusResult<DeviceContext> {
    let bits = || TableBlock::sequential(BLOCK_SIZE as usize, Cell::new(CellType::Bits, 0));
    let registers =
        || TableBlock::sparse((0..BLOCK_SIZE).map(|address| (address, Cell::new(CellType::Uint16, 0))));

    Ok(DeviceContext::plain(bits()?, bits()?, registers(), registers()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ServerArgs::parse();
    init_env_logger(args.log_level()?, args.output.as_deref())?;
    debug!("Command line arguments: {:?}", args);
    if args.config.is_some() {
        warn!("--config only applies to the simulator, ignoring it");
    }

    let config = args.to_server_config()?;
    let mut devices = HashMap::new();
    devices.insert(args.id, plain_device()?);

    let mut server = ModbusSerialServer::new(config, ServerContext::multi(devices))?
        .with_logger(args.packet_logger());

    info!("### start SYNC serial server, listening on {}", args.port);
    server.start().await?;

    let interrupted = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            true
        }
        result = server.wait() => {
            result?;
            false
        }
    };
    if interrupted {
        info!("### server shutdown requested by keyboard interrupt");
        server.stop().await?;
    }
    Ok(())
}
