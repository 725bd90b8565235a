/// Serial RTU transport
///
/// The worker is generic over any async byte stream so it can serve a real
/// port opened through `tokio-serial` as well as an in-memory pipe.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::error::{ServerError, ServerResult};
use crate::protocol::SlaveId;
use crate::rtu::{frame_gap, process_rtu_frame};
use crate::server::ServerContext;
use crate::MAX_RTU_FRAME_SIZE;

/// Serial line settings
#[derive(Debug, Clone, PartialEq)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    /// Station answered on this line; `None` answers every station
    pub station: Option<SlaveId>,
}

impl SerialConfig {
    /// 8 data bits, no parity, one stop bit, answering station 1
    pub fn new<S: Into<String>>(port: S, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            station: Some(1),
        }
    }

    pub fn with_station(mut self, station: Option<SlaveId>) -> Self {
        self.station = station;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Silence that terminates a frame at this baud rate
    pub fn frame_gap(&self) -> Duration {
        frame_gap(self.baud_rate)
    }

    /// Open the configured port
    pub fn open(&self) -> ServerResult<SerialStream> {
        tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits)
            .parity(self.parity)
            .open_native_async()
            .map_err(|e| ServerError::connection(format!("Failed to open serial port {}: {}", self.port, e)))
    }
}

/// Serve RTU requests on `stream` until shutdown or end of stream
pub(crate) async fn run_worker<S>(
    mut stream: S,
    context: Arc<ServerContext>,
    config: &SerialConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ServerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let gap = config.frame_gap();
    let mut chunk = [0u8; MAX_RTU_FRAME_SIZE];
    let mut frame = Vec::with_capacity(MAX_RTU_FRAME_SIZE);

    debug!("RTU worker on {} using frame gap {:?}", config.port, gap);

    loop {
        let read = tokio::select! {
            read = stream.read(&mut chunk) => read?,
            _ = shutdown_rx.recv() => {
                debug!("RTU worker on {} closing on shutdown", config.port);
                return Ok(());
            }
        };
        if read == 0 {
            debug!("Serial stream {} ended", config.port);
            return Ok(());
        }

        frame.clear();
        frame.extend_from_slice(&chunk[..read]);
        let mut oversized = false;

        // Accumulate until the line stays silent for one frame gap
        loop {
            match timeout(gap, stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => {
                    if frame.len() + n > MAX_RTU_FRAME_SIZE {
                        oversized = true;
                    } else {
                        frame.extend_from_slice(&chunk[..n]);
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        if oversized {
            warn!("Discarding RTU frame longer than {} bytes", MAX_RTU_FRAME_SIZE);
            context.on_dropped();
            continue;
        }

        let core_len = frame.len().saturating_sub(2);
        context.on_received("RTU", &frame, &frame[..core_len]);

        match process_rtu_frame(&frame, &context.dispatcher, config.station) {
            Some(reply) => {
                stream.write_all(&reply).await?;
                stream.flush().await?;
                context.on_sent("RTU", &reply, &reply[..reply.len() - 2]);
            }
            None => context.on_dropped(),
        }
    }
}
