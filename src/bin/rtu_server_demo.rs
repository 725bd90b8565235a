/// Modbus RTU Server Demo
///
/// Serves the data pool on a serial port:
///
///   rtu_server_demo /dev/ttyUSB0 9600 [station]
///
/// Without hardware, `rtu_server_demo --loopback` wires the RTU worker to an
/// in-memory line and plays a master against it.

use std::time::Duration;

use anyhow::{bail, Context};
use log::{info, warn};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};

use voltage_datapool::rtu::{pack_rtu, validate_crc};
use voltage_datapool::utils::format::bytes_to_hex;
use voltage_datapool::{
    CallbackLogger, LogCallback, LogLevel, LoggingMode, ModbusServer, Region, SerialConfig, MAX_RTU_FRAME_SIZE,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let callback: LogCallback = Box::new(|level, message| println!("[RTU] {}: {}", level.as_str(), message));
    let mut server = ModbusServer::new();
    server.set_logger(CallbackLogger::with_mode(Some(callback), LogLevel::Info, LoggingMode::Both));
    for i in 0..10u16 {
        server.write_value(Region::HoldingRegister, i, i * 100)?;
        server.write_coil(i, i % 2 == 0)?;
    }

    if args.first().map(String::as_str) == Some("--loopback") {
        return run_loopback(server).await;
    }

    let port = match args.first() {
        Some(port) => port.clone(),
        None => bail!("usage: rtu_server_demo <port> [baud] [station] | --loopback"),
    };
    let baud_rate: u32 = args.get(1).map(|b| b.parse()).transpose().context("invalid baud rate")?.unwrap_or(9600);
    let station: u8 = args.get(2).map(|s| s.parse()).transpose().context("invalid station")?.unwrap_or(1);

    let config = SerialConfig::new(port, baud_rate).with_station(Some(station));
    info!("🔌 Frame gap at {} baud: {:?}", baud_rate, config.frame_gap());
    server.start_serial(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("🛑 Stopping RTU server...");
    server.stop().await?;
    Ok(())
}

async fn run_loopback(mut server: ModbusServer) -> anyhow::Result<()> {
    let (mut master, line) = tokio::io::duplex(512);
    server
        .start_serial_stream(line, SerialConfig::new("loopback", 115_200))
        .await?;

    let mut rng = rand::thread_rng();
    let requests: Vec<Vec<u8>> = vec![
        vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x04],
        vec![0x01, 0x06, 0x00, 0x02, 0x00, rng.gen()],
        vec![0x01, 0x01, 0x00, 0x00, 0x00, 0x0A],
        vec![0x01, 0x10, 0x00, 0x05, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78],
        vec![0x02, 0x03, 0x00, 0x00, 0x00, 0x01],
        vec![0x01, 0x03, 0xFF, 0xFF, 0x00, 0x02],
    ];

    for core in requests {
        let frame = pack_rtu(&core);
        info!("➡️  {}", bytes_to_hex(&frame));
        master.write_all(&frame).await?;

        let mut reply = vec![0u8; MAX_RTU_FRAME_SIZE];
        match timeout(Duration::from_millis(200), master.read(&mut reply)).await {
            Ok(Ok(n)) => {
                reply.truncate(n);
                info!("⬅️  {} (crc ok: {})", bytes_to_hex(&reply), validate_crc(&reply));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => warn!("No reply (station {} not served)", core[0]),
        }
        sleep(Duration::from_millis(20)).await;
    }

    println!("{}", serde_json::to_string_pretty(&server.get_stats())?);
    server.stop().await?;
    Ok(())
}
