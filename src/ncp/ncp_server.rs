use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, trace_span, warn, Instrument};
use uuid::Uuid;

use crate::config::NcpConfig;
use crate::connection::{Connection, EventSender, TransportEvent};
use crate::dispatch::MessageDispatcher;
use crate::error::{DisconnectReason, TransportError};
use crate::ncp::connection_packets::{ConnectionErrorType, ConnectionPacket};
use crate::ncp::ncp_session::NcpConnection;
use crate::ncp::packet_header::{split_datagram, PacketType};
use crate::ncp::proof_of_work::{ProofOfWork, Sha256LeadingZeros};
use crate::ncp::send_socket::SendSocket;
use crate::ncp::server_handshake::{AcceptedClient, HandshakeAction, ServerHandshake};

type ConnectionRegistry = RwLock<FxHashMap<SocketAddr, Arc<NcpConnection>>>;

/// A UDP socket accepting NCP connections. All connections share the socket, and incoming
///  datagrams are routed to connections by their sender's address.
///
/// Dropping the server (or cancelling the token it was created with) disconnects all
///  connections.
pub struct NcpServer {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Arc<NcpConnection>>,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
}

impl NcpServer {
    pub async fn listen(
        addr: SocketAddr,
        config: Arc<NcpConfig>,
        dispatcher: Arc<dyn MessageDispatcher>,
        cancel: &CancellationToken,
    ) -> Result<(NcpServer, mpsc::Receiver<TransportEvent>), TransportError> {
        Self::listen_with_proof_of_work(addr, config, dispatcher, Arc::new(Sha256LeadingZeros), cancel).await
    }

    pub async fn listen_with_proof_of_work(
        addr: SocketAddr,
        config: Arc<NcpConfig>,
        dispatcher: Arc<dyn MessageDispatcher>,
        pow: Arc<dyn ProofOfWork>,
        cancel: &CancellationToken,
    ) -> Result<(NcpServer, mpsc::Receiver<TransportEvent>), TransportError> {
        config.validate()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("listening for NCP connections on {:?}", local_addr);

        let (events, event_receiver) = EventSender::new(config.event_channel_capacity);
        let (incoming_sender, incoming) = mpsc::channel(config.accept_queue_length);
        let registry: Arc<ConnectionRegistry> = Default::default();
        let cancel = cancel.child_token();

        let server_loop = ServerLoop {
            handshake: ServerHandshake::new(&config, pow),
            socket,
            config,
            dispatcher,
            registry: registry.clone(),
            incoming: incoming_sender,
            events,
            cancel: cancel.clone(),
        };
        tokio::spawn(server_loop.run());

        Ok((NcpServer {
            local_addr,
            incoming,
            registry,
            cancel,
        }, event_receiver))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the next connection that completed the handshake, or `None` after the server was
    ///  shut down
    pub async fn accept(&mut self) -> Option<Arc<NcpConnection>> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            c = self.incoming.recv() => c,
        }
    }

    pub async fn connection(&self, remote_addr: SocketAddr) -> Option<Arc<NcpConnection>> {
        self.registry.read().await
            .get(&remote_addr)
            .cloned()
    }

    pub async fn num_connections(&self) -> usize {
        self.registry.read().await.len()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for NcpServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ServerLoop {
    handshake: ServerHandshake,
    socket: Arc<UdpSocket>,
    config: Arc<NcpConfig>,
    dispatcher: Arc<dyn MessageDispatcher>,
    registry: Arc<ConnectionRegistry>,
    incoming: mpsc::Sender<Arc<NcpConnection>>,
    events: EventSender,
    cancel: CancellationToken,
}

impl ServerLoop {
    async fn run(self) {
        // one extra byte to detect datagrams exceeding the MTU
        let mut buf = vec![0u8; self.config.mtu + 1];

        loop {
            let (len, from) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(x) => x,
                    Err(e) => {
                        // the socket is shared by all clients, so there is no connection to blame
                        warn!("error receiving datagram: {}", e);
                        continue;
                    }
                },
            };

            if len > self.config.mtu {
                debug!(?from, "datagram exceeds the MTU - dropping");
                continue;
            }

            let correlation_id = Uuid::new_v4();
            let span = trace_span!("packet_received", ?correlation_id, ?from);
            self.on_datagram(&buf[..len], from)
                .instrument(span)
                .await;
        }

        info!("shutting down NCP server");
        let connections = self.registry.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for connection in connections {
            connection.disconnect().await;
        }
    }

    async fn on_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let Some((packet_type, body)) = split_datagram(datagram, self.config.protocol_id) else {
            return;
        };

        let existing = self.registry.read().await
            .get(&from)
            .cloned();
        if let Some(connection) = existing {
            if packet_type == PacketType::Connection {
                match ConnectionPacket::deser(&mut &body[..]) {
                    Ok(ConnectionPacket::ClientVerificationResponse { client_id, .. }) if client_id == connection.client_id() => {
                        debug!("repeated verification response - our confirmation was probably lost");
                        self.send(from, &ConnectionPacket::ConnectionEstablished).await;
                        return;
                    }
                    // a client that restarted on the same address: it can replace its old
                    //  connection, but only by completing a new handshake
                    Ok(packet @ (ConnectionPacket::ConnectionRequest { .. } | ConnectionPacket::ClientVerificationResponse { .. })) => {
                        self.on_handshake_packet(from, packet, Some(connection)).await;
                        return;
                    }
                    _ => {}
                }
            }
            connection.on_packet(packet_type, body).await;
            return;
        }

        if packet_type != PacketType::Connection {
            trace!(?packet_type, "packet from unknown address - dropping");
            return;
        }
        let packet = match ConnectionPacket::deser(&mut &body[..]) {
            Ok(p) => p,
            Err(e) => {
                debug!("invalid connection packet from unknown address - dropping: {}", e);
                return;
            }
        };

        self.on_handshake_packet(from, packet, None).await;
    }

    /// `replaces` is a connection that is registered for the same address already
    async fn on_handshake_packet(&self, from: SocketAddr, packet: ConnectionPacket, replaces: Option<Arc<NcpConnection>>) {
        if replaces.is_none() && matches!(packet, ConnectionPacket::ConnectionRequest { .. }) && self.is_full().await {
            debug!("server full - rejecting connection request");
            self.send(from, &ConnectionPacket::ConnectionError { error_type: ConnectionErrorType::ServerFull }).await;
            return;
        }

        match self.handshake.on_connection_packet(from, packet, Instant::now()) {
            HandshakeAction::Ignore => {}
            HandshakeAction::Reply(reply) => self.send(from, &reply).await,
            HandshakeAction::Accept(accepted) => {
                if let Some(old) = replaces {
                    info!(old_client_id = old.client_id(), client_id = accepted.client_id, "verified client replaces the connection from the same address");
                    {
                        let mut registry = self.registry.write().await;
                        if registry.get(&from).is_some_and(|c| Arc::ptr_eq(c, &old)) {
                            registry.remove(&from);
                        }
                    }
                    // no disconnect packet: it would go to the new client
                    old.close(DisconnectReason::RemoteRequest).await;
                }
                self.on_accepted(from, accepted).await;
            }
        }
    }

    async fn is_full(&self) -> bool {
        self.registry.read().await.len() >= self.config.max_clients
    }

    async fn on_accepted(&self, from: SocketAddr, accepted: AcceptedClient) {
        // the receive loop serves all connections, so it must not wait for the application
        //  to accept
        let permit = match self.incoming.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                warn!(client_id = accepted.client_id, "accept queue is full - rejecting verified client");
                self.send(from, &ConnectionPacket::ConnectionError { error_type: ConnectionErrorType::ServerFull }).await;
                return;
            }
            Err(TrySendError::Closed(())) => {
                debug!("server handle was dropped - rejecting verified client");
                return;
            }
        };

        let connection = {
            let mut registry = self.registry.write().await;
            if registry.len() >= self.config.max_clients {
                drop(registry);
                debug!("server full - rejecting verified client");
                self.send(from, &ConnectionPacket::ConnectionError { error_type: ConnectionErrorType::ServerFull }).await;
                return;
            }

            let connection = NcpConnection::new(
                from,
                accepted.client_id,
                accepted.server_seq,
                accepted.client_seq,
                self.socket.clone(),
                self.config.clone(),
                self.dispatcher.clone(),
                self.events.clone(),
                self.cancel.child_token(),
            );
            registry.insert(from, connection.clone());
            connection
        };
        info!(client_id = accepted.client_id, "accepted connection");

        connection.spawn_maintenance();
        self.spawn_removal_on_close(connection.clone());
        permit.send(connection);
        self.send(from, &ConnectionPacket::ConnectionEstablished).await;
    }

    fn spawn_removal_on_close(&self, connection: Arc<NcpConnection>) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let reason = connection.closed().await;
            let mut registry = registry.write().await;
            // a client may have reconnected from the same address in the meantime
            if registry.get(&connection.remote_addr()).is_some_and(|c| Arc::ptr_eq(c, &connection)) {
                registry.remove(&connection.remote_addr());
            }
            debug!(remote_addr = ?connection.remote_addr(), %reason, "connection removed from registry");
        });
    }

    async fn send(&self, to: SocketAddr, packet: &ConnectionPacket) {
        let mut buf = BytesMut::new();
        packet.ser(self.config.protocol_id, &mut buf);
        if let Err(e) = self.socket.send_packet(to, &buf).await {
            debug!(?to, "error sending connection packet: {}", e);
        }
    }
}
