/// Register-space server
///
/// [`ModbusServer`] owns the data pool, the subscription registry and the
/// dispatcher, and exposes them through two independent transports: a TCP
/// listener (one session per client) and a serial RTU worker. Both share the
/// same dispatcher, so a value written over one transport is immediately
/// visible on the other and through the application-side accessors.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::data_pool::{DataPool, Region, ResolvedAddress};
use crate::dispatcher::ProtocolDispatcher;
use crate::error::{ServerError, ServerResult};
use crate::logging::CallbackLogger;
use crate::serial::{self, SerialConfig};
use crate::subscription::{RegisterChange, SubscriptionId, SubscriptionRegistry};
use crate::tcp::{self, OnlineSession, SessionTable};
use crate::transform::{decode_string, encode_string, DataFormat, WireValue};
use crate::DEFAULT_TCP_PORT;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TCP listener binds to
    pub bind_address: String,
    /// Sessions accepted at once; further connections are closed immediately
    pub max_connections: usize,
    /// Time allowed for a frame to arrive completely once it has started
    pub frame_timeout_ms: u64,
    /// Hex-dump every packet through `tracing`
    pub packet_logging: bool,
    /// Byte order used by `read_value` / `write_value`
    pub data_format: DataFormat,
    /// Swap the two characters of every register in string access
    pub string_reverse: bool,
}

impl ServerConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Parse a configuration from JSON; absent fields take their defaults
    pub fn from_json(json: &str) -> ServerResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", DEFAULT_TCP_PORT),
            max_connections: 100,
            frame_timeout_ms: 5000,
            packet_logging: false,
            data_format: DataFormat::default(),
            string_reverse: false,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub connections_count: u64,
    pub online_sessions: usize,
    pub total_requests: u64,
    pub exception_replies: u64,
    pub dropped_frames: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) connections_count: AtomicU64,
    total_requests: AtomicU64,
    exception_replies: AtomicU64,
    dropped_frames: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Everything a transport worker needs to serve requests
#[derive(Debug)]
pub(crate) struct ServerContext {
    pub(crate) dispatcher: Arc<ProtocolDispatcher>,
    pub(crate) stats: Arc<StatsCounters>,
    pub(crate) logger: CallbackLogger,
    pub(crate) packet_logging: bool,
}

impl ServerContext {
    /// A complete frame arrived
    pub(crate) fn on_received(&self, transport: &str, frame: &[u8], core: &[u8]) {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_received.fetch_add(frame.len() as u64, Ordering::Relaxed);
        if self.packet_logging {
            log_packet(transport, "recv", frame);
        }
        self.logger.log_request(transport, frame, core);
    }

    /// A reply was written
    pub(crate) fn on_sent(&self, transport: &str, frame: &[u8], core: &[u8]) {
        self.stats.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        if core.get(1).map_or(false, |function| function & 0x80 != 0) {
            self.stats.exception_replies.fetch_add(1, Ordering::Relaxed);
        }
        if self.packet_logging {
            log_packet(transport, "send", frame);
        }
        self.logger.log_response(transport, frame, core);
    }

    /// A frame was discarded without reply
    pub(crate) fn on_dropped(&self) {
        self.stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }
}

fn log_packet(transport: &str, direction: &str, data: &[u8]) {
    tracing::info!(
        "[MODBUS-{}] {} {}",
        transport,
        direction,
        crate::utils::format::bytes_to_hex(data)
    );
}

struct TcpHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

struct SerialHandle {
    port: String,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Virtual Modbus device serving TCP and serial RTU clients
pub struct ModbusServer {
    config: ServerConfig,
    dispatcher: Arc<ProtocolDispatcher>,
    stats: Arc<StatsCounters>,
    logger: CallbackLogger,
    sessions: SessionTable,
    tcp: Option<TcpHandle>,
    serial: Option<SerialHandle>,
    running: Arc<AtomicBool>,
    start_time: Option<Instant>,
}

impl ModbusServer {
    /// Create a server with the default configuration and an empty data pool
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let dispatcher = ProtocolDispatcher::new(
            Arc::new(DataPool::default()),
            Arc::new(SubscriptionRegistry::new()),
        );
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            stats: Arc::new(StatsCounters::default()),
            logger: CallbackLogger::disabled(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            tcp: None,
            serial: None,
            running: Arc::new(AtomicBool::new(false)),
            start_time: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Packet callback used by transports started after this call
    pub fn set_logger(&mut self, logger: CallbackLogger) {
        self.logger = logger;
    }

    pub fn dispatcher(&self) -> &Arc<ProtocolDispatcher> {
        &self.dispatcher
    }

    fn pool(&self) -> &DataPool {
        self.dispatcher.data_pool()
    }

    fn context(&self) -> Arc<ServerContext> {
        Arc::new(ServerContext {
            dispatcher: self.dispatcher.clone(),
            stats: self.stats.clone(),
            logger: self.logger.clone(),
            packet_logging: self.config.packet_logging,
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the TCP listener on the configured bind address
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 was requested.
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        if self.tcp.is_some() {
            return Err(ServerError::configuration("TCP server is already running"));
        }

        let bind_address: SocketAddr = self.config.bind_address.parse().map_err(|e| {
            ServerError::configuration(format!("Invalid bind address {}: {}", self.config.bind_address, e))
        })?;

        info!("🚀 Starting Modbus TCP server on {}", bind_address);

        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(|e| ServerError::connection(format!("Failed to bind to {}: {}", bind_address, e)))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(tcp::run_listener(
            listener,
            self.context(),
            self.sessions.clone(),
            self.config.max_connections,
            self.config.frame_timeout(),
            shutdown_tx.clone(),
        ));

        self.tcp = Some(TcpHandle { local_addr, shutdown_tx, task });
        self.running.store(true, Ordering::SeqCst);
        self.start_time.get_or_insert_with(Instant::now);

        info!("✅ Modbus TCP server listening on {}", local_addr);
        debug!("   - Max connections: {}", self.config.max_connections);
        debug!("   - Frame timeout: {:?}", self.config.frame_timeout());
        Ok(local_addr)
    }

    /// Start the TCP listener on `0.0.0.0:port`
    pub async fn start_on_port(&mut self, port: u16) -> ServerResult<SocketAddr> {
        self.config.bind_address = format!("0.0.0.0:{}", port);
        self.start().await
    }

    /// Open a serial port and serve RTU requests on it
    pub async fn start_serial(&mut self, config: SerialConfig) -> ServerResult<()> {
        let port = config.open()?;
        self.start_serial_stream(port, config).await
    }

    /// Serve RTU requests on an already opened byte stream
    pub async fn start_serial_stream<S>(&mut self, stream: S, config: SerialConfig) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.serial.is_some() {
            return Err(ServerError::configuration("Serial port is already open"));
        }

        info!(
            "🚀 Serving Modbus RTU on {} ({} baud, station {:?})",
            config.port, config.baud_rate, config.station
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let port = config.port.clone();
        let context = self.context();
        let task = tokio::spawn(async move {
            if let Err(e) = serial::run_worker(stream, context, &config, shutdown_rx).await {
                warn!("Serial worker on {} stopped: {}", config.port, e);
            }
        });

        self.serial = Some(SerialHandle { port, shutdown_tx, task });
        self.start_time.get_or_insert_with(Instant::now);
        Ok(())
    }

    /// Stop the serial worker and release the port
    pub async fn close_serial(&mut self) -> ServerResult<()> {
        if let Some(serial) = self.serial.take() {
            let _ = serial.shutdown_tx.send(());
            serial
                .task
                .await
                .map_err(|e| ServerError::internal(format!("Serial worker panicked: {}", e)))?;
            info!("⏹️  Serial port {} closed", serial.port);
        }
        Ok(())
    }

    /// Stop accepting connections, close every session and the serial port
    pub async fn stop(&mut self) -> ServerResult<()> {
        if let Some(tcp) = self.tcp.take() {
            let _ = tcp.shutdown_tx.send(());
            tcp.task
                .await
                .map_err(|e| ServerError::internal(format!("Listener task panicked: {}", e)))?;
            info!("⏹️  Modbus TCP server on {} stopped", tcp.local_addr);
        }
        self.running.store(false, Ordering::SeqCst);
        self.close_serial().await
    }

    /// Whether the TCP listener is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_serial_open(&self) -> bool {
        self.serial.is_some()
    }

    /// Address the TCP listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().map(|tcp| tcp.local_addr)
    }

    /// Number of connected TCP clients
    pub fn online_count(&self) -> usize {
        self.sessions.lock().map(|sessions| sessions.len()).unwrap_or(0)
    }

    /// Connected TCP clients, ordered by session id
    pub fn online_sessions(&self) -> Vec<OnlineSession> {
        let mut sessions: Vec<OnlineSession> = self
            .sessions
            .lock()
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default();
        sessions.sort_by_key(|session| session.id);
        sessions
    }

    pub fn get_stats(&self) -> ServerStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ServerStats {
            connections_count: load(&self.stats.connections_count),
            online_sessions: self.online_count(),
            total_requests: load(&self.stats.total_requests),
            exception_replies: load(&self.stats.exception_replies),
            dropped_frames: load(&self.stats.dropped_frames),
            bytes_received: load(&self.stats.bytes_received),
            bytes_sent: load(&self.stats.bytes_sent),
            uptime_seconds: self.start_time.map_or(0, |t| t.elapsed().as_secs()),
        }
    }

    // ------------------------------------------------------------------
    // Coils and discrete inputs (one memory byte per point)
    // ------------------------------------------------------------------

    pub fn read_coil(&self, address: u16) -> ServerResult<bool> {
        Ok(self.pool().region(Region::Coil).get_byte(address as usize)? != 0)
    }

    pub fn read_coils(&self, address: u16, length: u16) -> ServerResult<Vec<bool>> {
        self.read_points(Region::Coil, address, length)
    }

    pub fn write_coil(&self, address: u16, value: bool) -> ServerResult<()> {
        self.pool().region(Region::Coil).set_byte(address as usize, value as u8)
    }

    /// Write consecutive coils; points past the end of the pool are dropped
    pub fn write_coils(&self, address: u16, values: &[bool]) -> ServerResult<usize> {
        self.write_points(Region::Coil, address, values)
    }

    pub fn read_discrete(&self, address: u16) -> ServerResult<bool> {
        Ok(self.pool().region(Region::DiscreteInput).get_byte(address as usize)? != 0)
    }

    pub fn read_discretes(&self, address: u16, length: u16) -> ServerResult<Vec<bool>> {
        self.read_points(Region::DiscreteInput, address, length)
    }

    /// Discrete inputs are read-only for clients but writable by the application
    pub fn write_discrete(&self, address: u16, value: bool) -> ServerResult<()> {
        self.pool().region(Region::DiscreteInput).set_byte(address as usize, value as u8)
    }

    pub fn write_discretes(&self, address: u16, values: &[bool]) -> ServerResult<usize> {
        self.write_points(Region::DiscreteInput, address, values)
    }

    fn read_points(&self, region: Region, address: u16, length: u16) -> ServerResult<Vec<bool>> {
        let bytes = self.pool().region(region).get_bytes(address as usize, length as usize)?;
        Ok(bytes.into_iter().map(|b| b != 0).collect())
    }

    fn write_points(&self, region: Region, address: u16, values: &[bool]) -> ServerResult<usize> {
        let bytes: Vec<u8> = values.iter().map(|&v| v as u8).collect();
        self.pool().region(region).set_bytes(&bytes, address as usize)
    }

    // ------------------------------------------------------------------
    // Raw access by resolved address
    // ------------------------------------------------------------------

    /// Copy the memory behind a resolved address
    ///
    /// Register regions return big-endian words, point regions one byte per
    /// point.
    pub fn read(&self, address: &ResolvedAddress) -> ServerResult<Vec<u8>> {
        self.pool()
            .region(address.region)
            .get_bytes(address.byte_index(), address.byte_len())
    }

    /// Write memory behind a resolved address
    ///
    /// At most `address.length` units are written and the write is truncated
    /// at the end of the region. Returns the number of bytes written.
    /// Subscribers are not notified; only protocol writes raise
    /// notifications.
    pub fn write(&self, address: &ResolvedAddress, data: &[u8]) -> ServerResult<usize> {
        self.pool()
            .region(address.region)
            .set_bytes_len(data, address.byte_index(), address.byte_len())
    }

    // ------------------------------------------------------------------
    // Register bits and numeric views
    // ------------------------------------------------------------------

    fn register_bit_index(address: u16, bit: u8) -> ServerResult<usize> {
        if bit > 15 {
            return Err(ServerError::invalid_data(format!("Register bit {} out of range 0-15", bit)));
        }
        // High byte of the big-endian word holds bits 8-15
        let byte = address as usize * 2 + (1 - bit as usize / 8);
        Ok(byte * 8 + bit as usize % 8)
    }

    /// Read bit `bit` (0 = least significant) of holding register `address`
    pub fn read_register_bit(&self, address: u16, bit: u8) -> ServerResult<bool> {
        let index = Self::register_bit_index(address, bit)?;
        self.pool().region(Region::HoldingRegister).get_bit(index)
    }

    /// Write bit `bit` of holding register `address`, keeping the other 15
    pub fn write_register_bit(&self, address: u16, bit: u8, value: bool) -> ServerResult<()> {
        let index = Self::register_bit_index(address, bit)?;
        self.pool().region(Region::HoldingRegister).set_bit(index, value)
    }

    fn register_region(region: Region) -> ServerResult<Region> {
        match region {
            Region::HoldingRegister | Region::InputRegister => Ok(region),
            other => Err(ServerError::invalid_data(format!("{:?} does not hold numeric values", other))),
        }
    }

    /// Decode a numeric value starting at register `address`
    pub fn read_value<T: WireValue>(&self, region: Region, address: u16) -> ServerResult<T> {
        let region = Self::register_region(region)?;
        self.pool()
            .region(region)
            .get_value(address as usize * 2, self.config.data_format)
    }

    /// Encode a numeric value starting at register `address`
    pub fn write_value<T: WireValue>(&self, region: Region, address: u16, value: T) -> ServerResult<usize> {
        let region = Self::register_region(region)?;
        self.pool()
            .region(region)
            .set_value(address as usize * 2, value, self.config.data_format)
    }

    /// Decode `count` consecutive values starting at register `address`
    pub fn read_values<T: WireValue>(&self, region: Region, address: u16, count: u16) -> ServerResult<Vec<T>> {
        let region = Self::register_region(region)?;
        let bytes = self
            .pool()
            .region(region)
            .get_bytes(address as usize * 2, count as usize * T::SIZE)?;
        bytes
            .chunks_exact(T::SIZE)
            .map(|chunk| self.config.data_format.decode(chunk))
            .collect()
    }

    /// Encode `values` back to back starting at register `address`
    ///
    /// Like `write_value`, a write running past the end is truncated; the
    /// number of bytes stored is returned.
    pub fn write_values<T: WireValue>(&self, region: Region, address: u16, values: &[T]) -> ServerResult<usize> {
        let region = Self::register_region(region)?;
        let mut bytes = Vec::with_capacity(values.len() * T::SIZE);
        for value in values {
            bytes.extend(self.config.data_format.encode(*value));
        }
        self.pool().region(region).set_bytes(&bytes, address as usize * 2)
    }

    /// Read text stored in `registers` registers starting at `address`
    pub fn read_string(&self, region: Region, address: u16, registers: u16) -> ServerResult<String> {
        let region = Self::register_region(region)?;
        let bytes = self
            .pool()
            .region(region)
            .get_bytes(address as usize * 2, registers as usize * 2)?;
        Ok(decode_string(&bytes, self.config.string_reverse))
    }

    /// Store text two characters per register starting at `address`
    pub fn write_string(&self, region: Region, address: u16, text: &str) -> ServerResult<usize> {
        let region = Self::register_region(region)?;
        let bytes = encode_string(text, self.config.string_reverse);
        self.pool().region(region).set_bytes(&bytes, address as usize * 2)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Call `callback` whenever a client write changes holding register `address`
    pub fn subscribe<F>(&self, address: u16, callback: F) -> ServerResult<SubscriptionId>
    where
        F: Fn(&RegisterChange) + Send + Sync + 'static,
    {
        self.dispatcher.subscriptions().subscribe(address, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> ServerResult<bool> {
        self.dispatcher.subscriptions().unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Concatenation of coil, discrete, holding and input memory
    pub fn save_to_bytes(&self) -> ServerResult<Vec<u8>> {
        self.pool().dump()
    }

    pub fn load_from_bytes(&self, blob: &[u8]) -> ServerResult<()> {
        self.pool().load(blob)
    }

    /// Write the data pool snapshot to `path`
    pub async fn save_data_pool<P: AsRef<Path>>(&self, path: P) -> ServerResult<()> {
        let blob = self.save_to_bytes()?;
        tokio::fs::write(path.as_ref(), blob).await?;
        info!("💾 Data pool saved to {}", path.as_ref().display());
        Ok(())
    }

    /// Load the data pool snapshot from `path`
    ///
    /// Returns `Ok(false)` when the file does not exist.
    pub async fn load_data_pool<P: AsRef<Path>>(&self, path: P) -> ServerResult<bool> {
        let blob = match tokio::fs::read(path.as_ref()).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        self.load_from_bytes(&blob)?;
        info!("📂 Data pool loaded from {}", path.as_ref().display());
        Ok(true)
    }
}

impl Default for ModbusServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ModbusServer {
    fn drop(&mut self) {
        if let Some(tcp) = self.tcp.take() {
            let _ = tcp.shutdown_tx.send(());
        }
        if let Some(serial) = self.serial.take() {
            let _ = serial.shutdown_tx.send(());
        }
    }
}
