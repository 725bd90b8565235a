/// Voltage DataPool Server Demo
///
/// Runs a virtual Modbus TCP device with simulated process values, logs
/// writes to the first holding registers and keeps the data pool in a
/// snapshot file between runs.
///
/// Usage: server_demo [bind_address] [snapshot_file] [--trace]

use std::time::Duration;

use anyhow::Context;
use log::{error, info};
use rand::Rng;
use tokio::signal;
use tokio::time::interval;

use voltage_datapool::utils::format::format_duration;
use voltage_datapool::{console_logger, ModbusServer, Region, RegisterChange, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let trace = args.iter().any(|a| a == "--trace");
    let mut positional = args.iter().filter(|a| !a.starts_with("--"));
    let bind_address = positional.next().cloned().unwrap_or_else(|| "127.0.0.1:5020".to_string());
    let snapshot = positional.next().cloned().unwrap_or_else(|| "datapool.bin".to_string());

    println!("🚀 Voltage DataPool Server Demo");
    println!("===============================");
    println!("- Bind address: {}", bind_address);
    println!("- Snapshot file: {}", snapshot);
    println!("- Packet trace: {}", if trace { "on" } else { "off" });
    println!();

    let config = ServerConfig {
        bind_address,
        max_connections: 50,
        packet_logging: trace,
        ..Default::default()
    };
    let mut server = ModbusServer::with_config(config);
    if trace {
        server.set_logger(console_logger!());
    }

    if server.load_data_pool(&snapshot).await? {
        info!("📂 Restored data pool from {}", snapshot);
    } else {
        info!("🔧 Initializing test data...");
        for i in 0..50u16 {
            server.write_value(Region::HoldingRegister, i, 0x1000 + i)?;
            server.write_value(Region::InputRegister, i, 0x2000 + i)?;
            server.write_coil(i, i % 3 == 0)?;
            server.write_discrete(i, i % 2 == 0)?;
        }
    }

    for address in 0..4u16 {
        server.subscribe(address, |change: &RegisterChange| {
            info!(
                "🔔 Holding register {} changed: {} -> {}",
                change.address, change.before, change.after
            );
        })?;
    }

    let local_addr = server.start().await.context("starting TCP listener")?;
    info!("✅ Server listening on {}", local_addr);
    info!("   Input registers 100-119 hold simulated f32 values");
    info!("   Holding registers 0-3 are watched for client writes");

    let simulator = server.dispatcher().clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(2));
        loop {
            ticker.tick().await;
            let pool = simulator.data_pool();
            let mut rng = rand::thread_rng();
            for register in (100..120u16).step_by(2) {
                let value: f32 = rng.gen_range(215.0..245.0);
                let bytes = value.to_be_bytes();
                if let Err(e) = pool.region(Region::InputRegister).set_bytes(&bytes, register as usize * 2) {
                    error!("Simulation update failed: {}", e);
                }
            }
            let alarm: bool = rng.gen_bool(0.1);
            let _ = pool.region(Region::DiscreteInput).set_byte(100, alarm as u8);
        }
    });

    let mut ticker = interval(Duration::from_secs(10));
    ticker.tick().await;
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = server.get_stats();
                info!(
                    "📊 {} online, {} requests, uptime {}",
                    stats.online_sessions,
                    stats.total_requests,
                    format_duration(Duration::from_secs(stats.uptime_seconds))
                );
            }
            result = &mut shutdown => {
                match result {
                    Ok(()) => info!("🛑 Received interrupt signal, stopping server..."),
                    Err(err) => error!("❌ Failed to listen for interrupt signal: {}", err),
                }
                break;
            }
        }
    }

    server.stop().await?;
    server.save_data_pool(&snapshot).await?;

    let final_stats = server.get_stats();
    println!("\n📊 Final server statistics:");
    println!("{}", serde_json::to_string_pretty(&final_stats)?);
    println!("\n✅ Server stopped safely");
    Ok(())
}
