use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, Instrument};

use crate::config::TcpConfig;
use crate::connection::{Connection, EventSender, PeerState};
use crate::dispatch::MessageDispatcher;
use crate::error::{DisconnectReason, SendOutcome, TransportError};
use crate::tcp::frame_reassembler::encode_frame;
use crate::tcp::tcp_receiver::receive_loop;

/// An established TCP connection. The connection owns the socket: the write half is here, the
///  read half is owned by the connection's receive loop.
pub struct TcpConnection {
    id: u64,
    peer: PeerState,
    /// Sends are serialized by this lock so that frames never interleave on the wire
    writer: Mutex<OwnedWriteHalf>,
    max_frame_len: usize,
}

impl Debug for TcpConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpConnection{{id:{}, remote_addr:{:?}}}", self.id, self.peer.remote_addr())
    }
}

impl TcpConnection {
    /// Takes ownership of a connected stream and spawns the connection's background tasks
    pub(crate) fn start(
        id: u64,
        stream: TcpStream,
        remote_addr: SocketAddr,
        config: &TcpConfig,
        dispatcher: Arc<dyn MessageDispatcher>,
        events: EventSender,
    ) -> Result<Arc<TcpConnection>, TransportError> {
        stream.set_nodelay(config.no_delay)?;
        let (reader, writer) = stream.into_split();

        let connection = Arc::new(TcpConnection {
            id,
            peer: PeerState::new(remote_addr, CancellationToken::new(), events),
            writer: Mutex::new(writer),
            max_frame_len: config.max_frame_len,
        });

        let span = info_span!("tcp_connection", id, ?remote_addr);
        tokio::spawn(
            receive_loop(connection.clone(), reader, dispatcher, config.receive_buffer_size, config.max_frame_len)
                .instrument(span.clone())
        );

        if let Some(interval) = config.keepalive_interval {
            tokio::spawn(keepalive_loop(connection.clone(), interval).instrument(span));
        }

        Ok(connection)
    }

    /// A connection's id is unique per server (or client) process
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn peer(&self) -> &PeerState {
        &self.peer
    }

    /// Terminates the connection unless it is terminated already. The socket is shut down by
    ///  the first caller only.
    ///
    /// Marking the connection as disconnected cancels its token, which aborts a send that is
    ///  blocked on a peer that stopped reading. Only then is the writer lock available.
    pub(crate) async fn close(&self, reason: DisconnectReason) {
        if !self.peer.try_mark_disconnected(reason) {
            return;
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("error shutting down socket: {}", e);
        }
    }
}

fn is_connection_lost(e: &std::io::Error) -> bool {
    matches!(e.kind(),
        ErrorKind::BrokenPipe |
        ErrorKind::ConnectionReset |
        ErrorKind::ConnectionAborted |
        ErrorKind::NotConnected |
        ErrorKind::UnexpectedEof |
        ErrorKind::WriteZero
    )
}

#[async_trait]
impl Connection for TcpConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.peer.remote_addr()
    }

    fn is_disconnected(&self) -> bool {
        self.peer.is_disconnected()
    }

    async fn send(&self, payload: &[u8]) -> Result<SendOutcome, TransportError> {
        if payload.len() > self.max_frame_len {
            return Err(TransportError::MessageTooLarge { size: payload.len(), max: self.max_frame_len });
        }

        let mut buf = BytesMut::new();
        encode_frame(payload, &mut buf);

        let mut writer = self.writer.lock().await;
        if self.peer.is_disconnected() {
            trace!("connection is disconnected - discarding message");
            return Ok(SendOutcome::NotConnected);
        }

        let write_result = tokio::select! {
            _ = self.peer.cancel_token().cancelled() => {
                trace!("connection was closed during send - discarding the rest of the message");
                return Ok(SendOutcome::NotConnected);
            }
            r = writer.write_all(&buf) => r,
        };

        match write_result {
            Ok(()) => {
                self.peer.on_sent();
                Ok(SendOutcome::Sent)
            }
            Err(e) => {
                drop(writer);
                if is_connection_lost(&e) {
                    self.close(DisconnectReason::SendError).await;
                }
                Err(TransportError::Send(e))
            }
        }
    }

    async fn disconnect(&self) {
        self.close(DisconnectReason::LocalRequest).await;
    }

    async fn closed(&self) -> DisconnectReason {
        self.peer.closed().await
    }

    fn last_send(&self) -> Instant {
        self.peer.last_send()
    }

    fn last_receive(&self) -> Instant {
        self.peer.last_receive()
    }
}

/// Sends an empty frame whenever the connection was idle for a full interval
async fn keepalive_loop(connection: Arc<TcpConnection>, interval: Duration) {
    let cancel = connection.peer.cancel_token().clone();
    loop {
        let deadline = connection.last_send() + interval;
        let deadline = if deadline > Instant::now() { deadline } else { Instant::now() + interval };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        if connection.last_send().elapsed() >= interval {
            trace!("sending keepalive");
            if let Err(e) = connection.send(&[]).await {
                debug!("error sending keepalive: {}", e);
            }
        }
    }
}
