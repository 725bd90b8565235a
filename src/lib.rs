//! # Voltage DataPool - Virtual Modbus Device Engine
//!
//! A register-space server: shared, byte-addressable memory holding coils,
//! discrete inputs, holding registers and input registers, fronted by a
//! Modbus request dispatcher and served over TCP and serial RTU at the same
//! time.
//!
//! ## Features
//!
//! - **🗄️ Shared Data Pool**: four 65536-point regions, every access atomic per request
//! - **🔧 Protocol-Exact Replies**: success and exception frames byte-for-byte per Modbus
//! - **🔔 Change Notifications**: subscribe to holding registers, batched per write request
//! - **🔄 Concurrent Sessions**: one async task per TCP client, plus a serial RTU worker
//! - **💾 Snapshots**: save and restore the whole data pool as a flat binary blob
//! - **📊 Statistics**: connection, request and traffic counters
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Limit |
//! |------|----------|-------|
//! | 0x01 | Read Coils | 2040 |
//! | 0x02 | Read Discrete Inputs | 2040 |
//! | 0x03 | Read Holding Registers | 127 |
//! | 0x04 | Read Input Registers | 127 |
//! | 0x05 | Write Single Coil | 1 |
//! | 0x06 | Write Single Register | 1 |
//! | 0x0F | Write Multiple Coils | 2040 |
//! | 0x10 | Write Multiple Registers | 127 |
//!
//! Any other function code is answered with exception 0x01.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_datapool::{ModbusServer, Region, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_address: "127.0.0.1:1502".to_string(),
//!         ..Default::default()
//!     };
//!     let mut server = ModbusServer::with_config(config);
//!
//!     server.write_value(Region::InputRegister, 0, 230.5f32)?;
//!     server.subscribe(100, |change| {
//!         println!("register {} -> {}", change.address, change.after);
//!     })?;
//!
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
//! │  TCP Listener   │    │   RTU Worker    │
//! │ (MBAP framing)  │    │  (CRC + gaps)   │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//!          └──────────┬────────────┘
//!           ┌─────────────────────┐
//!           │ Protocol Dispatcher │──► Subscription Registry
//!           └─────────────────────┘
//!                     │
//!           ┌─────────────────────┐
//!           │      Data Pool      │
//!           │ (4 × AddressSpace)  │
//!           └─────────────────────┘
//! ```

/// Error types and result handling
pub mod error;

/// Fixed-capacity concurrent byte memory
pub mod address_space;

/// The four Modbus regions
pub mod data_pool;

/// Function codes, exceptions and request parsing
pub mod protocol;

/// Request execution and reply construction
pub mod dispatcher;

/// Holding register change notifications
pub mod subscription;

/// Length-prefixed frame codecs
pub mod frame;

/// RTU CRC framing
pub mod rtu;

/// TCP listener and sessions
pub mod tcp;

/// Serial RTU transport
pub mod serial;

/// Server facade
pub mod server;

/// Numeric byte-order transforms
pub mod transform;

/// Callback packet logging
pub mod logging;

/// Utility functions
pub mod utils;

// Re-export main types for convenience
pub use error::{ServerError, ServerResult};
pub use address_space::AddressSpace;
pub use data_pool::{DataPool, Region, ResolvedAddress};
pub use protocol::{ModbusException, ModbusFunction, Request};
pub use dispatcher::ProtocolDispatcher;
pub use subscription::{RegisterChange, SubscriptionId, SubscriptionRegistry};
pub use frame::{Frame, FrameCodec, LsisFastEnetCodec, MbapCodec};
pub use serial::SerialConfig;
pub use server::{ModbusServer, ServerConfig, ServerStats};
pub use tcp::OnlineSession;
pub use transform::{DataFormat, WireValue};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};

/// Points per region
pub const DATA_POOL_LENGTH: usize = 65536;

/// Maximum number of coils that can be read/written in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2040;

/// Maximum number of registers that can be read/written in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 127;

/// MBAP header: transaction id, protocol id, length
pub const MBAP_HEADER_SIZE: usize = 6;

/// Largest request core the dispatcher accepts: a Write Multiple Coils of
/// `MAX_COILS_PER_REQUEST` points (station, function, address, quantity,
/// byte count, packed bits)
pub const MAX_REQUEST_CORE_SIZE: usize = 7 + (MAX_COILS_PER_REQUEST as usize + 7) / 8;

/// Maximum Modbus TCP frame size (MBAP header + core)
pub const MAX_TCP_FRAME_SIZE: usize = MBAP_HEADER_SIZE + MAX_REQUEST_CORE_SIZE;

/// Maximum Modbus RTU frame size (core + CRC)
pub const MAX_RTU_FRAME_SIZE: usize = MAX_REQUEST_CORE_SIZE + 2;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage DataPool v{} - virtual Modbus TCP/RTU device engine", VERSION)
}
