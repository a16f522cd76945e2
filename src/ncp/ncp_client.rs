use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, trace_span, warn, Instrument};
use uuid::Uuid;

use crate::config::NcpConfig;
use crate::connection::{EventSender, TransportEvent};
use crate::dispatch::MessageDispatcher;
use crate::error::{DisconnectReason, TransportError};
use crate::ncp::client_handshake::ClientHandshake;
use crate::ncp::connection_packets::ConnectionPacket;
use crate::ncp::ncp_session::NcpConnection;
use crate::ncp::packet_header::{split_datagram, PacketType};
use crate::ncp::proof_of_work::{ProofOfWork, Sha256LeadingZeros};

const HANDSHAKE_CHANNEL_CAPACITY: usize = 16;

/// Establishes an NCP connection to a server, using a socket of its own. The cancellation token
///  applies to the connection attempt only.
pub async fn connect(
    addr: SocketAddr,
    config: Arc<NcpConfig>,
    dispatcher: Arc<dyn MessageDispatcher>,
    cancel: &CancellationToken,
) -> Result<(Arc<NcpConnection>, mpsc::Receiver<TransportEvent>), TransportError> {
    connect_with_proof_of_work(addr, config, dispatcher, Arc::new(Sha256LeadingZeros), cancel).await
}

pub async fn connect_with_proof_of_work(
    addr: SocketAddr,
    config: Arc<NcpConfig>,
    dispatcher: Arc<dyn MessageDispatcher>,
    pow: Arc<dyn ProofOfWork>,
    cancel: &CancellationToken,
) -> Result<(Arc<NcpConnection>, mpsc::Receiver<TransportEvent>), TransportError> {
    config.validate()
        .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

    let bind_addr: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    }
    else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    debug!(local_addr = ?socket.local_addr()?, "connecting to {:?}", addr);

    // the receive loop runs as long as the connection, or until the connection attempt fails
    let connection_cancel = CancellationToken::new();
    let receive_loop_guard = connection_cancel.clone().drop_guard();

    let (handshake_sender, mut handshake_receiver) = mpsc::channel(HANDSHAKE_CHANNEL_CAPACITY);
    let (session_sender, session_receiver) = oneshot::channel();
    let receive_loop = ClientReceiveLoop {
        socket: socket.clone(),
        server_addr: addr,
        config: config.clone(),
        cancel: connection_cancel.clone(),
    };
    tokio::spawn(receive_loop.run(ReceiveState::Handshake {
        packets: handshake_sender,
        session: session_receiver,
    }));

    let mut handshake = ClientHandshake::new(&config, &*socket, addr, pow);
    let session = handshake.run(&mut handshake_receiver, cancel).await?;

    let (events, event_receiver) = EventSender::new(config.event_channel_capacity);
    let connection = NcpConnection::new(
        addr,
        session.client_id,
        session.client_seq,
        session.server_seq,
        socket.clone(),
        config.clone(),
        dispatcher,
        events,
        connection_cancel,
    );
    connection.spawn_maintenance();
    if session_sender.send(connection.clone()).is_err() {
        return Err(TransportError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "receive loop terminated during handshake")));
    }

    receive_loop_guard.disarm();
    info!(client_id = session.client_id, "connected to {:?}", addr);
    Ok((connection, event_receiver))
}

enum ReceiveState {
    /// Connection packets go to the handshake until it hands over the established connection
    Handshake {
        packets: mpsc::Sender<ConnectionPacket>,
        session: oneshot::Receiver<Arc<NcpConnection>>,
    },
    Established(Arc<NcpConnection>),
}

struct ClientReceiveLoop {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    config: Arc<NcpConfig>,
    cancel: CancellationToken,
}

impl ClientReceiveLoop {
    async fn run(self, mut state: ReceiveState) {
        // one extra byte to detect datagrams exceeding the MTU
        let mut buf = vec![0u8; self.config.mtu + 1];

        loop {
            let (len, from) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(x) => x,
                    Err(e) => {
                        warn!("error receiving from socket: {}", e);
                        if let ReceiveState::Established(connection) = &state {
                            connection.peer().events().send_event(TransportEvent::ReceiveError {
                                remote_addr: self.server_addr,
                                error: e.to_string(),
                            });
                            connection.close(DisconnectReason::ReceiveError).await;
                        }
                        break;
                    }
                },
            };

            if from != self.server_addr {
                trace!(?from, "datagram from a different address - dropping");
                continue;
            }
            if len > self.config.mtu {
                debug!("datagram exceeds the MTU - dropping");
                continue;
            }

            if let ReceiveState::Handshake { session, .. } = &mut state {
                if let Ok(connection) = session.try_recv() {
                    state = ReceiveState::Established(connection);
                }
            }

            let correlation_id = Uuid::new_v4();
            let span = trace_span!("packet_received", ?correlation_id);
            self.on_datagram(&state, &buf[..len])
                .instrument(span)
                .await;
        }
        debug!("client receive loop terminated");
    }

    async fn on_datagram(&self, state: &ReceiveState, datagram: &[u8]) {
        let Some((packet_type, body)) = split_datagram(datagram, self.config.protocol_id) else {
            return;
        };

        match state {
            ReceiveState::Handshake { packets, .. } => {
                if packet_type != PacketType::Connection {
                    trace!(?packet_type, "packet before the handshake completed - dropping");
                    return;
                }
                match ConnectionPacket::deser(&mut &body[..]) {
                    Ok(packet) => {
                        if packets.try_send(packet).is_err() {
                            debug!("handshake is not accepting packets - dropping");
                        }
                    }
                    Err(e) => debug!("invalid connection packet - dropping: {}", e),
                }
            }
            ReceiveState::Established(connection) => {
                connection.on_packet(packet_type, body).await;
            }
        }
    }
}
