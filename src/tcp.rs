/// Modbus TCP listener
///
/// One task accepts connections; every accepted client gets its own session
/// task. Sessions stay registered in a shared table while they are connected
/// and are closed when the listener receives the shutdown signal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::error::{ServerError, ServerResult};
use crate::frame::{pack_tcp, read_frame, MbapCodec};
use crate::server::ServerContext;

/// A connected client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnlineSession {
    pub id: u64,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

pub(crate) type SessionTable = Arc<Mutex<HashMap<u64, OnlineSession>>>;

/// Per-connection state
struct Session {
    id: u64,
    peer: SocketAddr,
    // Replies are serialized per connection
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
}

/// Removes a session from the table when its task ends, including by panic
struct SessionEntry {
    id: u64,
    sessions: SessionTable,
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        match self.sessions.lock() {
            Ok(mut table) => {
                table.remove(&self.id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.id);
            }
        }
    }
}

impl Session {
    async fn send(&self, frame: &[u8]) -> ServerResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Accept connections until shutdown, then wait for every session to end
pub(crate) async fn run_listener(
    listener: TcpListener,
    context: Arc<ServerContext>,
    sessions: SessionTable,
    max_connections: usize,
    frame_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut tasks = JoinSet::new();
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                let online = sessions.lock().map(|table| table.len()).unwrap_or(0);
                if online >= max_connections {
                    warn!("⚠️  Connection from {} rejected: {} sessions online", peer, online);
                    drop(stream);
                    continue;
                }

                next_id += 1;
                let online_session = OnlineSession { id: next_id, peer, connected_at: Utc::now() };
                if let Ok(mut table) = sessions.lock() {
                    table.insert(next_id, online_session);
                }
                context.stats.connections_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!("🔗 New connection from {} (session {})", peer, next_id);

                tasks.spawn(serve_session(
                    stream,
                    next_id,
                    peer,
                    context.clone(),
                    sessions.clone(),
                    frame_timeout,
                    shutdown_tx.subscribe(),
                ));
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            _ = shutdown_rx.recv() => {
                debug!("Listener received shutdown signal");
                break;
            }
        }
    }

    drop(listener);
    while tasks.join_next().await.is_some() {}
}

async fn serve_session(
    stream: TcpStream,
    id: u64,
    peer: SocketAddr,
    context: Arc<ServerContext>,
    sessions: SessionTable,
    frame_timeout: Duration,
    shutdown_rx: broadcast::Receiver<()>,
) {
    let _entry = SessionEntry { id, sessions };
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let session = Session {
        id,
        peer,
        writer: Arc::new(AsyncMutex::new(write_half)),
    };

    match session_loop(&session, BufReader::new(read_half), &context, frame_timeout, shutdown_rx).await {
        Ok(()) => info!("🔌 Client {} disconnected (session {})", session.peer, session.id),
        Err(e) if e.is_framing_error() => {
            warn!("Closing session {} from {}: {}", session.id, session.peer, e);
        }
        Err(e) => debug!("Session {} from {} ended: {}", session.id, session.peer, e),
    }
}

async fn session_loop(
    session: &Session,
    mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    context: &ServerContext,
    frame_timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ServerResult<()> {
    loop {
        // Idle sessions may wait indefinitely for the next request
        let available = tokio::select! {
            filled = reader.fill_buf() => filled?.len(),
            _ = shutdown_rx.recv() => {
                debug!("Session {} closing on shutdown", session.id);
                return Ok(());
            }
        };
        if available == 0 {
            return Ok(());
        }

        let frame = match timeout(frame_timeout, read_frame(&mut reader, &MbapCodec)).await {
            Ok(result) => match result? {
                Some(frame) => frame,
                None => return Ok(()),
            },
            Err(_) => {
                return Err(ServerError::timeout("receive frame", frame_timeout.as_millis() as u64));
            }
        };

        let wire = frame.to_bytes();
        context.on_received("TCP", &wire, &frame.body);

        let reply = match context.dispatcher.dispatch(&frame.body) {
            Ok(reply) => reply,
            Err(e) => {
                context.on_dropped();
                return Err(ServerError::frame(format!("Unusable request: {}", e)));
            }
        };

        let packet = pack_tcp(&reply, frame.identity as u16);
        session.send(&packet).await?;
        context.on_sent("TCP", &packet, &reply);
    }
}
