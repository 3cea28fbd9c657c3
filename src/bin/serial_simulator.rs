/// Voltage Modbus Serial Simulator
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Serves one simulated device built from an overlay document over a serial
/// line. Without `--config` the bundled demo overlay is served.

use std::time::Duration;

use clap::Parser;
use log::{debug, info};

use voltage_modbus_sim::actions::ActionEngine;
use voltage_modbus_sim::cli::ServerArgs;
use voltage_modbus_sim::logging::init_env_logger;
use voltage_modbus_sim::simulator::{demo_overlay, OverlaySpec, SimulatorOverlay};
use voltage_modbus_sim::utils::format::format_duration;
use voltage_modbus_sim::{ModbusSerialServer, ModbusServer, ServerContext, TableKind};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ServerArgs::parse();
    init_env_logger(args.log_level()?, args.output.as_deref())?;
    debug!("Command line arguments: {:?}", args);

    let config = args.to_server_config()?;
    let spec = match &args.config {
        Some(path) => {
            info!("Loading overlay from {}", path.display());
            OverlaySpec::from_json_file(path)?
        }
        None => demo_overlay()?,
    };

    let mut overlay = SimulatorOverlay::new(spec, ActionEngine::default());
    overlay.register_action("custom1", |address, cell| {
        debug!("custom1 action at address {} (value {})", address, cell.value);
    })?;
    overlay.register_action("custom2", |address, cell| {
        debug!("custom2 action at address {} (value {})", address, cell.value);
    })?;
    let device = overlay.build()?;
    info!(
        "Simulated device ready: {} holding registers, {} coils",
        device.block_len(TableKind::HoldingRegisters)?,
        device.block_len(TableKind::Coils)?
    );

    let mut server = ModbusSerialServer::new(config, ServerContext::single(device))?
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

    let stats = server.get_stats();
    info!(
        "Served {} requests ({} exceptions, {} dropped frames) in {}",
        stats.requests_processed,
        stats.exception_responses,
        stats.frames_dropped,
        format_duration(Duration::from_secs(stats.uptime_seconds))
    );
    Ok(())
}
