use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, trace, warn};

use crate::connection::TransportEvent;
use crate::dispatch::{dispatch_isolated, MessageDispatcher};
use crate::error::DisconnectReason;
use crate::tcp::frame_reassembler::FrameReassembler;
use crate::tcp::tcp_connection::TcpConnection;

/// The only reader of a TCP connection. It runs until the connection is disconnected, either
///  because of something it observed itself or because of a disconnect from elsewhere.
pub(crate) async fn receive_loop(
    connection: Arc<TcpConnection>,
    mut reader: OwnedReadHalf,
    dispatcher: Arc<dyn MessageDispatcher>,
    receive_buffer_size: usize,
    max_frame_len: usize,
) {
    let cancel = connection.peer().cancel_token().clone();
    let mut reassembler = FrameReassembler::new(max_frame_len);
    let mut chunk = vec![0u8; receive_buffer_size];

    let reason = 'receive: loop {
        let read_result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("connection was closed - terminating receive loop");
                return;
            }
            r = reader.read(&mut chunk) => r,
        };

        let num_read = match read_result {
            Ok(0) => {
                debug!("remote side closed the connection");
                break DisconnectReason::RemoteRequest;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("error receiving from socket: {}", e);
                connection.peer().events().send_event(TransportEvent::ReceiveError {
                    remote_addr: connection.peer().remote_addr(),
                    error: e.to_string(),
                });
                break DisconnectReason::ReceiveError;
            }
        };
        trace!("received {} bytes", num_read);

        connection.peer().on_received();
        reassembler.feed(&chunk[..num_read]);

        loop {
            match reassembler.try_take_frame() {
                Ok(Some(frame)) => {
                    dispatch_isolated(&dispatcher, connection.clone(), frame, connection.peer().events()).await;
                    if connection.peer().is_disconnected() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("closing connection: {}", e);
                    break 'receive DisconnectReason::ProtocolViolation;
                }
            }
        }
    };

    connection.close(reason).await;
}
