use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::NcpConfig;
use crate::connection::{Connection, EventSender, PeerState};
use crate::dispatch::{DispatchQueue, MessageDispatcher};
use crate::error::{DisconnectReason, SendOutcome, TransportError};
use crate::ncp::ack_packet::AckPacket;
use crate::ncp::connection_packets::ConnectionPacket;
use crate::ncp::data_packet::{DataPacket, DATA_HEADER_LEN};
use crate::ncp::packet_header::PacketType;
use crate::ncp::reliability::{ReceiveWindow, SendWindow};
use crate::ncp::send_socket::SendSocket;
use crate::ncp::sequence_number::SequenceNumber;

/// An established NCP connection. Client and server sides use the same type, they differ only
///  in how incoming packets are routed to it.
pub struct NcpConnection {
    peer: PeerState,
    client_id: i32,
    socket: Arc<dyn SendSocket>,
    config: Arc<NcpConfig>,
    send_window: Mutex<SendWindow>,
    receive_window: Mutex<ReceiveWindow>,
    dispatch_queue: DispatchQueue,
}

impl Debug for NcpConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NcpConnection")
            .field("remote_addr", &self.peer.remote_addr())
            .field("client_id", &self.client_id)
            .field("disconnected", &self.peer.is_disconnected())
            .finish()
    }
}

impl NcpConnection {
    /// `local_seq` and `remote_seq` are the last sequence numbers each side used during the
    ///  handshake.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        remote_addr: SocketAddr,
        client_id: i32,
        local_seq: SequenceNumber,
        remote_seq: SequenceNumber,
        socket: Arc<dyn SendSocket>,
        config: Arc<NcpConfig>,
        dispatcher: Arc<dyn MessageDispatcher>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Arc<NcpConnection> {
        let peer = PeerState::new(remote_addr, cancel, events.clone());
        peer.on_sent();
        peer.on_received();

        Arc::new_cyclic(|this: &Weak<NcpConnection>| {
            let this: Weak<dyn Connection> = this.clone();
            NcpConnection {
                peer,
                client_id,
                socket,
                send_window: Mutex::new(SendWindow::new(local_seq, config.send_window_size)),
                receive_window: Mutex::new(ReceiveWindow::new(remote_seq)),
                dispatch_queue: DispatchQueue::spawn(this, dispatcher, events, config.dispatch_queue_length),
                config,
            }
        })
    }

    /// Spawns the task that sends acks, retransmits unacknowledged packets and detects dead peers
    pub(crate) fn spawn_maintenance(self: &Arc<Self>) {
        let connection = self.clone();
        tokio::spawn(async move {
            connection.maintenance_loop().await;
        });
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub(crate) fn peer(&self) -> &PeerState {
        &self.peer
    }

    /// Handles a packet from the peer. `body` is everything after the packet header.
    ///
    /// Received messages are handed to the connection's dispatch queue, so this never waits for
    ///  a message handler.
    pub(crate) async fn on_packet(&self, packet_type: PacketType, mut body: &[u8]) {
        if self.peer.is_disconnected() {
            trace!("packet for disconnected connection - dropping");
            return;
        }
        self.peer.on_received();

        match packet_type {
            PacketType::Data => {
                let packet = match DataPacket::deser(&mut body) {
                    Ok(p) => p,
                    Err(e) => return self.on_protocol_violation(e).await,
                };
                // a packet that does not fit into the queue is not acknowledged, so the peer will
                //  retransmit it
                let Some(permit) = self.dispatch_queue.try_reserve() else {
                    debug!(sequence_number = %packet.sequence_number, "dispatch queue is full - dropping packet");
                    return;
                };
                let is_new = self.receive_window.lock().await
                    .on_received(packet.sequence_number);
                if is_new {
                    permit.send(packet.payload);
                }
            }
            PacketType::Acknowledge => {
                match AckPacket::deser(&mut body) {
                    Ok(ack) => {
                        self.send_window.lock().await
                            .on_ack(&ack);
                    }
                    Err(e) => self.on_protocol_violation(e).await,
                }
            }
            PacketType::Connection => {
                match ConnectionPacket::deser(&mut body) {
                    Ok(ConnectionPacket::Disconnect) => {
                        self.close(DisconnectReason::RemoteRequest).await;
                    }
                    Ok(ConnectionPacket::ConnectionError { error_type }) => {
                        debug!(?error_type, "peer reported an error for an established connection");
                        self.close(DisconnectReason::RemoteRequest).await;
                    }
                    Ok(other) => {
                        trace!(packet_type = ?other.packet_type(), "handshake packet for established connection - ignoring");
                    }
                    Err(e) => self.on_protocol_violation(e).await,
                }
            }
        }
    }

    async fn on_protocol_violation(&self, e: anyhow::Error) {
        warn!(remote_addr = ?self.peer.remote_addr(), "malformed packet: {}", e);
        self.close(DisconnectReason::ProtocolViolation).await;
    }

    /// Marks the connection as disconnected. Unless the peer initiated it, the peer is notified
    ///  on a best effort basis.
    pub(crate) async fn close(&self, reason: DisconnectReason) {
        if !self.peer.try_mark_disconnected(reason) {
            return;
        }

        match reason {
            DisconnectReason::RemoteRequest | DisconnectReason::SendError => {}
            _ => {
                let mut buf = BytesMut::new();
                ConnectionPacket::Disconnect.ser(self.config.protocol_id, &mut buf);
                if let Err(e) = self.socket.send_packet(self.peer.remote_addr(), &buf).await {
                    debug!("error sending disconnect packet: {}", e);
                }
            }
        }
    }

    async fn send_packet_buf(&self, packet_buf: &[u8]) -> std::io::Result<()> {
        self.socket.send_packet(self.peer.remote_addr(), packet_buf).await?;
        self.peer.on_sent();
        Ok(())
    }

    async fn send_ack(&self, ack: AckPacket) {
        let mut buf = BytesMut::new();
        ack.ser(self.config.protocol_id, &mut buf);
        if let Err(e) = self.send_packet_buf(&buf).await {
            debug!("error sending ack: {}", e);
        }
    }

    async fn maintenance_loop(&self) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.peer.cancel_token().cancelled() => break,
                _ = interval.tick() => {
                    self.on_tick(Instant::now()).await;
                }
            }
        }
        trace!("maintenance loop terminated");
    }

    pub(crate) async fn on_tick(&self, now: Instant) {
        if self.peer.is_disconnected() {
            return;
        }

        if now.saturating_duration_since(self.peer.last_receive()) >= self.config.idle_timeout {
            debug!(remote_addr = ?self.peer.remote_addr(), "nothing received for {:?}", self.config.idle_timeout);
            self.close(DisconnectReason::Timeout).await;
            return;
        }

        let (due, max_retransmissions) = {
            let mut send_window = self.send_window.lock().await;
            let due = send_window.due_for_retransmission(now, self.config.retransmission_timeout);
            (due, send_window.max_retransmissions())
        };
        if max_retransmissions > self.config.max_retransmissions {
            debug!(remote_addr = ?self.peer.remote_addr(), max_retransmissions, "peer does not acknowledge packets");
            self.close(DisconnectReason::Timeout).await;
            return;
        }
        for packet in due {
            trace!(sequence_number = %packet.sequence_number, "retransmitting");
            let mut buf = BytesMut::new();
            packet.ser(self.config.protocol_id, &mut buf);
            if let Err(e) = self.send_packet_buf(&buf).await {
                debug!("error retransmitting packet: {}", e);
            }
        }

        let pending_ack = self.receive_window.lock().await
            .take_ack();
        if let Some(ack) = pending_ack {
            self.send_ack(ack).await;
        }
        else if now.saturating_duration_since(self.peer.last_send()) >= self.config.keepalive_interval {
            // an ack without news doubles as keepalive
            let ack = self.receive_window.lock().await
                .current_ack();
            self.send_ack(ack).await;
        }
    }

    /// The largest payload that fits into a single datagram
    pub fn max_payload_len(&self) -> usize {
        self.config.mtu - DATA_HEADER_LEN
    }
}

#[async_trait]
impl Connection for NcpConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.peer.remote_addr()
    }

    fn is_disconnected(&self) -> bool {
        self.peer.is_disconnected()
    }

    async fn send(&self, payload: &[u8]) -> Result<SendOutcome, TransportError> {
        if payload.len() > self.max_payload_len() {
            return Err(TransportError::MessageTooLarge { size: payload.len(), max: self.max_payload_len() });
        }
        if self.peer.is_disconnected() {
            return Ok(SendOutcome::NotConnected);
        }

        let packet = self.send_window.lock().await
            .register(Bytes::copy_from_slice(payload), Instant::now())?;

        let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + payload.len());
        packet.ser(self.config.protocol_id, &mut buf);
        if let Err(e) = self.send_packet_buf(&buf).await {
            debug!(sequence_number = %packet.sequence_number, "error sending packet: {}", e);
            self.send_window.lock().await
                .forget(packet.sequence_number);
            return Err(TransportError::Send(e));
        }
        Ok(SendOutcome::Sent)
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
