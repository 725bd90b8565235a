//! Callback packet logging
//!
//! The server reports every exchange it handles (request received, reply
//! sent) to an application-supplied callback, independently of the `log`
//! facade used for lifecycle messages. This is how embedding applications
//! show traffic in their own consoles or UIs.

use std::sync::Arc;

use crate::protocol::ModbusFunction;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw packet data only
    Raw,
    /// Show interpreted packet data with field descriptions
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that forwards server traffic to a callback
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => eprintln!("[{}] {}: {}", timestamp, level.as_str(), message),
                LogLevel::Info | LogLevel::Debug => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log packet data with hex dump
    pub fn log_packet(&self, level: LogLevel, direction: &str, data: &[u8]) {
        if !self.should_log(level) {
            return;
        }
        let message = format!(
            "{} packet ({} bytes): {}",
            direction,
            data.len(),
            crate::utils::format::bytes_to_hex(data)
        );
        self.log(level, &message);
    }

    /// Log a received request
    ///
    /// `frame` is the packet as it arrived on the wire, `core` the
    /// `[station, function, payload...]` part of it.
    pub fn log_request(&self, transport: &str, frame: &[u8], core: &[u8]) {
        let direction = format!("{} request <-", transport);
        self.log_exchange(&direction, frame, core, describe_request);
    }

    /// Log a reply about to be sent
    pub fn log_response(&self, transport: &str, frame: &[u8], core: &[u8]) {
        let direction = format!("{} response ->", transport);
        self.log_exchange(&direction, frame, core, describe_response);
    }

    fn log_exchange(&self, direction: &str, frame: &[u8], core: &[u8], describe: fn(&[u8]) -> String) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        match self.mode {
            LoggingMode::Raw => self.log_packet(LogLevel::Info, direction, frame),
            LoggingMode::Interpreted => self.info(&format!("{} {}", direction, describe(core))),
            LoggingMode::Both => {
                self.info(&format!("{} {}", direction, describe(core)));
                self.log_packet(LogLevel::Debug, direction, frame);
            }
        }
    }
}

fn function_name(code: u8) -> String {
    match ModbusFunction::from_u8(code & 0x7F) {
        Ok(function) => function.to_string(),
        Err(_) => format!("Unknown Function (0x{:02X})", code & 0x7F),
    }
}

fn describe_request(core: &[u8]) -> String {
    if core.len() < 2 {
        return format!("Data: {}", hex::encode(core));
    }
    let payload = &core[2..];
    let fields = if payload.len() >= 4 {
        let address = u16::from_be_bytes([payload[0], payload[1]]);
        let value = u16::from_be_bytes([payload[2], payload[3]]);
        match core[1] {
            0x05 => format!("Address: {}, Value: 0x{:04X} ({})", address, value, if value == 0xFF00 { "ON" } else { "OFF" }),
            0x06 => format!("Address: {}, Value: {} (0x{:04X})", address, value, value),
            _ => format!("Address: {}, Quantity: {}", address, value),
        }
    } else {
        format!("Data: {}", hex::encode(payload))
    };
    format!("Station: {}, Function: {}, {}", core[0], function_name(core[1]), fields)
}

fn describe_response(core: &[u8]) -> String {
    if core.len() < 3 {
        return format!("Data: {}", hex::encode(core));
    }
    let (station, code, payload) = (core[0], core[1], &core[2..]);
    if code & 0x80 != 0 {
        return format!("Station: {}, Function: {}, Exception: 0x{:02X}", station, function_name(code), payload[0]);
    }
    let fields = match code {
        0x01 | 0x02 => {
            let bits = crate::protocol::data_utils::unpack_bits(&payload[1..], (payload.len() - 1) * 8);
            format!("Byte count: {}, Coils: {:?}", payload[0], &bits[..bits.len().min(16)])
        }
        0x03 | 0x04 => {
            let registers = crate::protocol::data_utils::bytes_to_registers(&payload[1..]);
            format!("Byte count: {}, Registers: {:?}", payload[0], &registers[..registers.len().min(8)])
        }
        0x05 | 0x06 | 0x0F | 0x10 if payload.len() >= 4 => {
            let address = u16::from_be_bytes([payload[0], payload[1]]);
            let value = u16::from_be_bytes([payload[2], payload[3]]);
            format!("Address: {}, Value: {}", address, value)
        }
        _ => format!("Data: {}", hex::encode(payload)),
    };
    format!("Station: {}, Function: {}, {}", station, function_name(code), fields)
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("enabled", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Convenience macro for creating a simple console logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

/// Convenience macro for creating a custom logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::CallbackLogger::with_mode(Some($callback), $level, $mode)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn capture(mode: LoggingMode, level: LogLevel) -> (CallbackLogger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push(format!("{} {}", level.as_str(), message));
        });
        (CallbackLogger::with_mode(Some(callback), level, mode), lines)
    }

    #[test]
    fn test_interpreted_request() {
        let (logger, lines) = capture(LoggingMode::Interpreted, LogLevel::Info);
        logger.log_request("TCP", &[], &[0x01, 0x03, 0x00, 0x0A, 0x00, 0x02]);
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Read Holding Registers"));
        assert!(lines[0].contains("Address: 10, Quantity: 2"));
    }

    #[test]
    fn test_exception_response() {
        let (logger, lines) = capture(LoggingMode::Interpreted, LogLevel::Info);
        logger.log_response("RTU", &[], &[0x01, 0x83, 0x02]);
        assert!(lines.lock().unwrap()[0].contains("Exception: 0x02"));
    }

    #[test]
    fn test_raw_mode_and_level_filter() {
        let (logger, lines) = capture(LoggingMode::Both, LogLevel::Info);
        logger.log_response("TCP", &[0x00, 0x01], &[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]);
        // The raw dump is at debug level and filtered out
        assert_eq!(lines.lock().unwrap().len(), 1);

        let (logger, lines) = capture(LoggingMode::Raw, LogLevel::Debug);
        logger.log_request("TCP", &[0xAB, 0xCD], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert!(lines.lock().unwrap()[0].contains("AB CD"));
    }

    #[test]
    fn test_disabled_logger() {
        let logger = CallbackLogger::default();
        assert!(!logger.is_enabled());
        logger.log_request("TCP", &[], &[0x01, 0x03]);
    }
}
