use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument, Span};

use crate::config::TcpConfig;
use crate::connection::{Connection, EventSender, TransportEvent};
use crate::dispatch::MessageDispatcher;
use crate::error::TransportError;
use crate::safe_converter::SafeCast;
use crate::tcp::tcp_connection::TcpConnection;

type ConnectionRegistry = RwLock<FxHashMap<u64, Arc<TcpConnection>>>;

/// A listening TCP socket with the connections that were accepted through it.
///
/// Dropping the server (or cancelling the token it was created with) stops accepting connections
///  and disconnects all connections that are still open.
pub struct TcpServer {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Arc<TcpConnection>>,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
}

impl TcpServer {
    pub async fn listen(
        addr: SocketAddr,
        config: Arc<TcpConfig>,
        dispatcher: Arc<dyn MessageDispatcher>,
        cancel: &CancellationToken,
    ) -> Result<(TcpServer, mpsc::Receiver<TransportEvent>), TransportError> {
        config.validate()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.bind(addr)?;
        let listener = socket.listen(config.connection_queue_length)?;
        let local_addr = listener.local_addr()?;
        info!("listening for TCP connections on {:?}", local_addr);

        let (events, event_receiver) = EventSender::new(config.event_channel_capacity);
        let (incoming_sender, incoming) = mpsc::channel(config.connection_queue_length.safe_cast());
        let registry: Arc<ConnectionRegistry> = Default::default();
        let cancel = cancel.child_token();

        tokio::spawn(accept_loop(listener, config, dispatcher, registry.clone(), incoming_sender, events, cancel.clone()));

        Ok((TcpServer {
            local_addr,
            incoming,
            registry,
            cancel,
        }, event_receiver))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the next accepted connection, or `None` after the server was shut down
    pub async fn accept(&mut self) -> Option<Arc<TcpConnection>> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            c = self.incoming.recv() => c,
        }
    }

    pub async fn connection(&self, id: u64) -> Option<Arc<TcpConnection>> {
        self.registry.read().await
            .get(&id)
            .cloned()
    }

    pub async fn num_connections(&self) -> usize {
        self.registry.read().await.len()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<TcpConfig>,
    dispatcher: Arc<dyn MessageDispatcher>,
    registry: Arc<ConnectionRegistry>,
    incoming: mpsc::Sender<Arc<TcpConnection>>,
    events: EventSender,
    cancel: CancellationToken,
) {
    let mut next_id = 0u64;

    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            r = listener.accept() => match r {
                Ok(x) => x,
                Err(e) => {
                    warn!("error accepting connection: {}", e);
                    events.send_event(TransportEvent::AcceptError { error: e.to_string() });
                    // e.g. running out of file descriptors - this is likely to persist for a while
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        // waiting for the application to call accept() would stall the loop and shutdown
        let permit = match incoming.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                warn!(?addr, "accept queue is full - rejecting connection");
                drop(stream);
                continue;
            }
            Err(TrySendError::Closed(())) => {
                debug!(?addr, "server handle was dropped - rejecting connection");
                continue;
            }
        };

        next_id += 1;
        match register_connection(next_id, stream, addr, &config, dispatcher.clone(), &registry, events.clone()).await {
            Ok(connection) => permit.send(connection),
            Err(e) => warn!("error setting up connection from {:?}: {}", addr, e),
        }
    }

    info!("shutting down TCP server");
    drop(listener);

    let connections = registry.read().await
        .values()
        .cloned()
        .collect::<Vec<_>>();
    for connection in connections {
        connection.disconnect().await;
    }
}

#[instrument(name="accepted_connection", skip_all, fields(id = id, addr = ?addr))]
async fn register_connection(
    id: u64,
    stream: TcpStream,
    addr: SocketAddr,
    config: &TcpConfig,
    dispatcher: Arc<dyn MessageDispatcher>,
    registry: &Arc<ConnectionRegistry>,
    events: EventSender,
) -> Result<Arc<TcpConnection>, TransportError> {
    debug!("accepted connection");
    let connection = TcpConnection::start(id, stream, addr, config, dispatcher, events)?;
    registry.write().await
        .insert(id, connection.clone());

    let registry = registry.clone();
    let c = connection.clone();
    tokio::spawn(async move {
        let reason = c.closed().await;
        registry.write().await
            .remove(&c.id());
        debug!(%reason, "connection removed from registry");
    }.instrument(Span::current()));

    Ok(connection)
}

/// Establishes a TCP connection. The cancellation token applies to the connection attempt only.
pub async fn connect(
    addr: SocketAddr,
    config: &TcpConfig,
    dispatcher: Arc<dyn MessageDispatcher>,
    cancel: &CancellationToken,
) -> Result<(Arc<TcpConnection>, mpsc::Receiver<TransportEvent>), TransportError> {
    config.validate()
        .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

    debug!("connecting to {:?}", addr);
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        r = timeout_after(config.connect_timeout, TcpStream::connect(addr)) => r?,
    };

    let (events, event_receiver) = EventSender::new(config.event_channel_capacity);
    let connection = TcpConnection::start(0, stream, addr, config, dispatcher, events)?;
    Ok((connection, event_receiver))
}

async fn timeout_after<T>(timeout: Option<Duration>, f: impl Future<Output = std::io::Result<T>>) -> Result<T, TransportError> {
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, f).await {
            Ok(r) => Ok(r?),
            Err(_) => Err(TransportError::ConnectionTimeout),
        },
        None => Ok(f.await?),
    }
}
