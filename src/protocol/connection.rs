//! One live connection between a control service and an agent.

use crate::config::ProtocolConfig;
use crate::error::{wire_code, VolmeshError, VolmeshResult};
use crate::wire::{EncodingCache, Frame, FrameDecoder, Reply, Request};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

use super::{CommandError, CommandLocator, ConnectionState};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type PendingReply = oneshot::Sender<VolmeshResult<crate::wire::FrameBox>>;

/// Handle to a live protocol connection.
///
/// Cheap to clone; the connection stays up while any holder keeps it (the
/// service's connection set, the read loop). Its death does not evict the
/// peer's state contributions, only expiration does.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    config: ProtocolConfig,
    state: Mutex<ConnectionState>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: DashMap<u64, PendingReply>,
    next_tag: AtomicU64,
    shutdown: watch::Sender<bool>,
    on_disconnect: Mutex<Vec<Box<dyn FnOnce(u64) + Send>>>,
}

impl Connection {
    /// Take ownership of an established transport and start speaking the
    /// protocol over it: reader, writer and ping tasks.
    pub fn spawn<T>(
        transport: T,
        locator: Arc<dyn CommandLocator>,
        config: ProtocolConfig,
    ) -> Connection
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                config,
                state: Mutex::new(ConnectionState::Connected),
                outbound,
                pending: DashMap::new(),
                next_tag: AtomicU64::new(1),
                shutdown,
                on_disconnect: Mutex::new(Vec::new()),
            }),
        };

        tokio::spawn(write_loop(
            connection.clone(),
            write_half,
            outbound_rx,
            connection.inner.shutdown.subscribe(),
        ));
        tokio::spawn(read_loop(
            connection.clone(),
            read_half,
            locator,
            connection.inner.shutdown.subscribe(),
        ));
        tokio::spawn(ping_loop(
            connection.clone(),
            connection.inner.shutdown.subscribe(),
        ));

        connection
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Register a callback to run once when the connection dies. Runs
    /// immediately if it is already dead.
    pub fn on_disconnect(&self, callback: impl FnOnce(u64) + Send + 'static) {
        match self.state() {
            ConnectionState::Disconnecting | ConnectionState::Closed => callback(self.inner.id),
            _ => self
                .inner
                .on_disconnect
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Box::new(callback)),
        }
    }

    /// Issue a command to the peer and await its reply.
    pub async fn call_remote(&self, request: Request) -> VolmeshResult<Reply> {
        self.call_remote_inner(request, None).await
    }

    /// Issue a command, encoding document payloads through the broadcast
    /// pass's shared cache.
    pub async fn call_remote_cached(
        &self,
        request: Request,
        cache: &EncodingCache,
    ) -> VolmeshResult<Reply> {
        self.call_remote_inner(request, Some(cache)).await
    }

    async fn call_remote_inner(
        &self,
        request: Request,
        cache: Option<&EncodingCache>,
    ) -> VolmeshResult<Reply> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(VolmeshError::NotConnected {
                state: state.to_string(),
            });
        }
        let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
        let command = request.command_name();
        let encoded = request.to_frame(tag, cache)?.encode()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.insert(tag, reply_tx);
        if self.inner.outbound.send(encoded).is_err() {
            self.inner.pending.remove(&tag);
            return Err(VolmeshError::ConnectionLost);
        }
        let fields = reply_rx.await.map_err(|_| VolmeshError::ConnectionLost)??;
        Reply::from_box(command, &fields)
    }

    /// Tear the connection down: abort the transport, fail pending calls
    /// with connection-lost, cancel the timers. Idempotent.
    pub fn close(&self) {
        self.inner.disconnect();
    }
}

impl ConnectionInner {
    fn disconnect(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ConnectionState::Disconnecting | ConnectionState::Closed => return,
                _ => *state = ConnectionState::Disconnecting,
            }
        }
        debug!(connection = self.id, "connection closing");
        // Stops the reader, writer and ping tasks; dropping the transport
        // halves aborts the socket.
        let _ = self.shutdown.send(true);

        let tags: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for tag in tags {
            if let Some((_, reply_tx)) = self.pending.remove(&tag) {
                let _ = reply_tx.send(Err(VolmeshError::ConnectionLost));
            }
        }

        let callbacks = {
            let mut callbacks = self.on_disconnect.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *callbacks)
        };
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionState::Closed;
        for callback in callbacks {
            callback(self.id);
        }
    }
}

async fn write_loop<W>(
    connection: Connection,
    mut write_half: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
            }
        }
    }
    connection.inner.disconnect();
}

async fn read_loop<R>(
    connection: Connection,
    mut read_half: R,
    locator: Arc<dyn CommandLocator>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buffer = [0u8; 8192];
    let mut idle_deadline = Instant::now() + connection.inner.config.idle_timeout();

    'outer: loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep_until(idle_deadline) => {
                warn!(connection = connection.id(), "peer idle past timeout, aborting transport");
                break;
            }
            read = read_half.read(&mut buffer) => {
                let Ok(count) = read else { break };
                if count == 0 {
                    break;
                }
                // Any inbound traffic, ping included, restarts the idle clock.
                idle_deadline = Instant::now() + connection.inner.config.idle_timeout();
                decoder.feed(&buffer[..count]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => handle_frame(&connection, &locator, frame).await,
                        Ok(None) => break,
                        Err(error) => {
                            warn!(connection = connection.id(), %error, "malformed frame, aborting transport");
                            break 'outer;
                        }
                    }
                }
            }
        }
    }
    connection.inner.disconnect();
}

async fn handle_frame(connection: &Connection, locator: &Arc<dyn CommandLocator>, frame: Frame) {
    match frame {
        Frame::Request {
            command,
            tag,
            fields,
        } => {
            let result = match Request::from_frame(&command, &fields) {
                Ok(request) => locator.dispatch(request).await,
                Err(error) => Err(CommandError::from(error)),
            };
            let response = match result {
                Ok(reply) => match reply.to_box() {
                    Ok(fields) => Frame::Answer { tag, fields },
                    Err(error) => Frame::Error {
                        tag,
                        code: wire_code::COMMAND_FAILED.to_string(),
                        description: error.to_string(),
                    },
                },
                Err(error) => Frame::Error {
                    tag,
                    code: error.code,
                    description: error.description,
                },
            };
            match response.encode() {
                Ok(encoded) => {
                    let _ = connection.inner.outbound.send(encoded);
                }
                Err(error) => {
                    warn!(connection = connection.id(), %command, %error, "failed to encode response");
                }
            }
        }
        Frame::Answer { tag, fields } => {
            if let Some((_, reply_tx)) = connection.inner.pending.remove(&tag) {
                let _ = reply_tx.send(Ok(fields));
            }
        }
        Frame::Error {
            tag,
            code,
            description,
        } => {
            if let Some((_, reply_tx)) = connection.inner.pending.remove(&tag) {
                let _ = reply_tx.send(Err(VolmeshError::PeerCall { code, description }));
            }
        }
    }
}

async fn ping_loop(connection: Connection, mut shutdown: watch::Receiver<bool>) {
    let interval = connection.inner.config.ping_interval;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(interval) => {
                if !connection.is_connected() {
                    break;
                }
                // The reply does not matter; the bytes on the wire keep the
                // peer's idle timer from firing.
                let pinger = connection.clone();
                tokio::spawn(async move {
                    let _ = pinger.call_remote(Request::NoOp).await;
                });
            }
        }
    }
}
