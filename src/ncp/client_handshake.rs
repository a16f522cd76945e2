use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::NcpConfig;
use crate::error::TransportError;
use crate::ncp::connection_packets::{ConnectionErrorType, ConnectionPacket};
use crate::ncp::proof_of_work::ProofOfWork;
use crate::ncp::send_socket::SendSocket;
use crate::ncp::sequence_number::SequenceNumber;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeState {
    Idle,
    RequestSent,
    AwaitingVerification,
    VerificationSent,
    Established,
    Failed,
}

/// The result of a successful handshake: the sequence numbers each side used last, which are
///  the starting points for the connection's reliability state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EstablishedSession {
    pub client_id: i32,
    pub client_seq: SequenceNumber,
    pub server_seq: SequenceNumber,
}

/// The client side of the connection handshake.
///
/// Each step re-sends its packet at a fixed interval until the expected reply arrives or the
///  number of attempts is exhausted. Sending and waiting for the reply run concurrently, and
///  whichever finishes first ends the step.
pub struct ClientHandshake<'a> {
    config: &'a NcpConfig,
    socket: &'a dyn SendSocket,
    server_addr: SocketAddr,
    pow: Arc<dyn ProofOfWork>,
    state: HandshakeState,
}

impl <'a> ClientHandshake<'a> {
    pub fn new(config: &'a NcpConfig, socket: &'a dyn SendSocket, server_addr: SocketAddr, pow: Arc<dyn ProofOfWork>) -> ClientHandshake<'a> {
        ClientHandshake {
            config,
            socket,
            server_addr,
            pow,
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Runs the handshake to completion. `incoming` delivers the connection packets the server
    ///  sends to this client.
    pub async fn run(&mut self, incoming: &mut mpsc::Receiver<ConnectionPacket>, cancel: &CancellationToken) -> Result<EstablishedSession, TransportError> {
        match self.do_run(incoming, cancel).await {
            Ok(session) => {
                self.transition(HandshakeState::Established);
                Ok(session)
            }
            Err(e) => {
                self.transition(HandshakeState::Failed);
                Err(e)
            }
        }
    }

    async fn do_run(&mut self, incoming: &mut mpsc::Receiver<ConnectionPacket>, cancel: &CancellationToken) -> Result<EstablishedSession, TransportError> {
        let client_seq = SequenceNumber::from_raw(rand::random());

        self.transition(HandshakeState::RequestSent);
        let (client_id, server_seq, difficulty, salt) = self.send_until_reply(
            &ConnectionPacket::ConnectionRequest { client_seq },
            incoming,
            cancel,
            |p| match p {
                ConnectionPacket::ClientVerificationRequest { client_id, server_seq, difficulty, salt } => Some((client_id, server_seq, difficulty, salt)),
                _ => None,
            },
        ).await?;

        self.transition(HandshakeState::AwaitingVerification);
        debug!(client_id, difficulty, "received challenge");
        if difficulty > self.config.max_accepted_difficulty {
            debug!(difficulty, max = self.config.max_accepted_difficulty, "server requires more proof of work than we accept");
            return Err(TransportError::ConnectionRejected(ConnectionErrorType::DifficultyTooHigh));
        }
        let nonce = solve_proof_of_work(self.pow.clone(), salt, difficulty, cancel).await?;

        let client_seq = client_seq.next();
        self.transition(HandshakeState::VerificationSent);
        self.send_until_reply(
            &ConnectionPacket::ClientVerificationResponse { client_seq, client_id, nonce },
            incoming,
            cancel,
            |p| match p {
                ConnectionPacket::ConnectionEstablished => Some(()),
                _ => None,
            },
        ).await?;

        Ok(EstablishedSession { client_id, client_seq, server_seq })
    }

    fn transition(&mut self, new_state: HandshakeState) {
        trace!(from = ?self.state, to = ?new_state, "handshake state change");
        self.state = new_state;
    }

    async fn send_until_reply<T>(
        &self,
        packet: &ConnectionPacket,
        incoming: &mut mpsc::Receiver<ConnectionPacket>,
        cancel: &CancellationToken,
        extract_reply: impl Fn(ConnectionPacket) -> Option<T>,
    ) -> Result<T, TransportError> {
        let mut packet_buf = BytesMut::new();
        packet.ser(self.config.protocol_id, &mut packet_buf);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            reply = wait_for_reply(incoming, extract_reply) => reply,
            e = self.interval_send(&packet_buf) => Err(e),
        }
    }

    /// Only returns when sending failed or all attempts are used up
    async fn interval_send(&self, packet_buf: &[u8]) -> TransportError {
        for attempt in 0..self.config.handshake_attempts {
            trace!(attempt, "sending handshake packet");
            if let Err(e) = self.socket.send_packet(self.server_addr, packet_buf).await {
                debug!("error sending handshake packet: {}", e);
                return TransportError::Send(e);
            }
            tokio::time::sleep(self.config.handshake_send_interval).await;
        }
        debug!(attempts = self.config.handshake_attempts, "no reply from server");
        TransportError::ConnectionTimeout
    }
}

async fn wait_for_reply<T>(incoming: &mut mpsc::Receiver<ConnectionPacket>, extract_reply: impl Fn(ConnectionPacket) -> Option<T>) -> Result<T, TransportError> {
    loop {
        let Some(packet) = incoming.recv().await else {
            return Err(TransportError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "receive loop terminated during handshake")));
        };

        if let ConnectionPacket::ConnectionError { error_type } = packet {
            debug!(?error_type, "server rejected connection");
            return Err(TransportError::ConnectionRejected(error_type));
        }

        let packet_type = packet.packet_type();
        match extract_reply(packet) {
            Some(reply) => return Ok(reply),
            None => trace!(?packet_type, "ignoring unexpected connection packet"),
        }
    }
}

/// Sets the flag when dropped, stopping a solver that runs on a blocking thread
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

async fn solve_proof_of_work(pow: Arc<dyn ProofOfWork>, salt: Vec<u8>, difficulty: u8, cancel: &CancellationToken) -> Result<i32, TransportError> {
    let stop = Arc::new(AtomicBool::new(false));
    let _stop_on_drop = StopOnDrop(stop.clone());

    let solver = tokio::task::spawn_blocking(move || pow.solve(&salt, difficulty, &stop));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        solved = solver => match solved {
            Ok(Some(nonce)) => Ok(nonce),
            Ok(None) => Err(TransportError::ConnectionRejected(ConnectionErrorType::DifficultyTooHigh)),
            Err(e) => Err(TransportError::Io(std::io::Error::other(format!("proof of work solver failed: {}", e)))),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ncp::packet_header::PacketHeader;
    use crate::ncp::proof_of_work::MockProofOfWork;
    use crate::ncp::send_socket::MockSendSocket;
    use bytes::Buf;
    use std::time::Duration;
    use tokio::time::Instant;

    fn server_addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn config() -> NcpConfig {
        NcpConfig {
            handshake_send_interval: Duration::from_millis(42),
            handshake_attempts: 5,
            max_accepted_difficulty: 10,
            ..NcpConfig::default()
        }
    }

    fn parse(packet_buf: &[u8]) -> ConnectionPacket {
        let mut b = packet_buf;
        PacketHeader::deser(&mut b).unwrap();
        let result = ConnectionPacket::deser(&mut b).unwrap();
        assert!(!b.has_remaining());
        result
    }

    /// A socket that forwards every sent packet to a channel
    fn recording_socket() -> (MockSendSocket, mpsc::UnboundedReceiver<(Instant, ConnectionPacket)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut socket = MockSendSocket::new();
        socket.expect_send_packet()
            .returning(move |to, packet_buf| {
                assert_eq!(to, server_addr());
                tx.send((Instant::now(), parse(packet_buf))).unwrap();
                Ok(())
            });
        (socket, rx)
    }

    fn solving_pow(nonce: i32) -> Arc<dyn ProofOfWork> {
        let mut pow = MockProofOfWork::new();
        pow.expect_solve()
            .withf(|salt, difficulty, _| salt.to_vec() == vec![1, 2, 3] && *difficulty == 7)
            .return_const(Some(nonce));
        Arc::new(pow)
    }

    fn challenge() -> ConnectionPacket {
        ConnectionPacket::ClientVerificationRequest {
            client_id: 42,
            server_seq: SequenceNumber::from_raw(-9),
            difficulty: 7,
            salt: vec![1, 2, 3],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reply_times_out() {
        let config = config();
        let mut socket = MockSendSocket::new();
        socket.expect_send_packet()
            .times(5)
            .returning(|_, packet_buf| {
                assert!(matches!(parse(packet_buf), ConnectionPacket::ConnectionRequest { .. }));
                Ok(())
            });

        let (_tx, mut incoming) = mpsc::channel(16);
        let mut handshake = ClientHandshake::new(&config, &socket, server_addr(), Arc::new(MockProofOfWork::new()));

        let start = Instant::now();
        let result = handshake.run(&mut incoming, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::ConnectionTimeout)));
        assert_eq!(handshake.state(), HandshakeState::Failed);
        assert_eq!(start.elapsed(), Duration::from_millis(5 * 42));

        // no further sends after giving up
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_handshake() {
        let config = config();
        let (socket, mut sent) = recording_socket();
        let (tx, mut incoming) = mpsc::channel(16);

        let server = async move {
            let (t1, request) = sent.recv().await.unwrap();
            let ConnectionPacket::ConnectionRequest { client_seq: request_seq } = request else { panic!() };

            // the request is re-sent until the challenge arrives
            let (t2, request2) = sent.recv().await.unwrap();
            assert_eq!(request2, request);
            assert_eq!(t2 - t1, Duration::from_millis(42));
            tx.send(challenge()).await.unwrap();

            let (_, response) = sent.recv().await.unwrap();
            assert_eq!(response, ConnectionPacket::ClientVerificationResponse {
                client_seq: request_seq.next(),
                client_id: 42,
                nonce: 1234,
            });
            tx.send(ConnectionPacket::ConnectionEstablished).await.unwrap();
            request_seq
        };

        let cancel = CancellationToken::new();
        let mut handshake = ClientHandshake::new(&config, &socket, server_addr(), solving_pow(1234));
        let (result, request_seq) = tokio::join!(
            handshake.run(&mut incoming, &cancel),
            server,
        );

        assert_eq!(result.unwrap(), EstablishedSession {
            client_id: 42,
            client_seq: request_seq.next(),
            server_seq: SequenceNumber::from_raw(-9),
        });
        assert_eq!(handshake.state(), HandshakeState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_response_times_out() {
        let config = config();
        let (socket, mut sent) = recording_socket();
        let (tx, mut incoming) = mpsc::channel(16);
        tx.send(challenge()).await.unwrap();

        let mut handshake = ClientHandshake::new(&config, &socket, server_addr(), solving_pow(1));
        let result = handshake.run(&mut incoming, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::ConnectionTimeout)));

        let mut num_responses = 0;
        while let Ok((_, p)) = sent.try_recv() {
            if matches!(p, ConnectionPacket::ClientVerificationResponse { .. }) {
                num_responses += 1;
            }
        }
        assert_eq!(num_responses, 5);
    }

    #[rstest::rstest]
    #[case::server_full(ConnectionErrorType::ServerFull)]
    #[case::unknown(ConnectionErrorType::Unspecified)]
    #[tokio::test(start_paused = true)]
    async fn test_rejected(#[case] error_type: ConnectionErrorType) {
        let config = config();
        let (socket, _sent) = recording_socket();
        let (tx, mut incoming) = mpsc::channel(16);
        tx.send(ConnectionPacket::ConnectionError { error_type }).await.unwrap();

        let mut handshake = ClientHandshake::new(&config, &socket, server_addr(), Arc::new(MockProofOfWork::new()));
        let result = handshake.run(&mut incoming, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::ConnectionRejected(t)) if t == error_type));
        assert_eq!(handshake.state(), HandshakeState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_after_verification() {
        let config = config();
        let (socket, _sent) = recording_socket();
        let (tx, mut incoming) = mpsc::channel(16);
        tx.send(challenge()).await.unwrap();
        tx.send(ConnectionPacket::ConnectionError { error_type: ConnectionErrorType::InvalidProofOfWork }).await.unwrap();

        let mut handshake = ClientHandshake::new(&config, &socket, server_addr(), solving_pow(1));
        let result = handshake.run(&mut incoming, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::ConnectionRejected(ConnectionErrorType::InvalidProofOfWork))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_packets_are_ignored() {
        let config = config();
        let (socket, _sent) = recording_socket();
        let (tx, mut incoming) = mpsc::channel(16);
        tx.send(ConnectionPacket::ConnectionEstablished).await.unwrap();
        tx.send(ConnectionPacket::Disconnect).await.unwrap();
        tx.send(challenge()).await.unwrap();
        tx.send(challenge()).await.unwrap();
        tx.send(ConnectionPacket::ConnectionEstablished).await.unwrap();

        let mut handshake = ClientHandshake::new(&config, &socket, server_addr(), solving_pow(1));
        let session = handshake.run(&mut incoming, &CancellationToken::new()).await.unwrap();
        assert_eq!(session.client_id, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_difficulty_too_high() {
        let config = config();
        let (socket, _sent) = recording_socket();
        let (tx, mut incoming) = mpsc::channel(16);
        tx.send(ConnectionPacket::ClientVerificationRequest {
            client_id: 1,
            server_seq: SequenceNumber::ZERO,
            difficulty: 11,
            salt: vec![],
        }).await.unwrap();

        let mut pow = MockProofOfWork::new();
        pow.expect_solve().never();

        let mut handshake = ClientHandshake::new(&config, &socket, server_addr(), Arc::new(pow));
        let result = handshake.run(&mut incoming, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::ConnectionRejected(ConnectionErrorType::DifficultyTooHigh))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure() {
        let config = config();
        let mut socket = MockSendSocket::new();
        socket.expect_send_packet()
            .once()
            .returning(|_, _| Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied)));

        let (_tx, mut incoming) = mpsc::channel(16);
        let mut handshake = ClientHandshake::new(&config, &socket, server_addr(), Arc::new(MockProofOfWork::new()));
        let result = handshake.run(&mut incoming, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::Send(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_loop_gone() {
        let config = config();
        let (socket, _sent) = recording_socket();
        let (tx, mut incoming) = mpsc::channel(16);
        drop(tx);

        let mut handshake = ClientHandshake::new(&config, &socket, server_addr(), Arc::new(MockProofOfWork::new()));
        let result = handshake.run(&mut incoming, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled() {
        let config = config();
        let mut socket = MockSendSocket::new();
        socket.expect_send_packet()
            .times(2)
            .returning(|_, _| Ok(()));

        let (_tx, mut incoming) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let cancel_later = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        };

        let mut handshake = ClientHandshake::new(&config, &socket, server_addr(), Arc::new(MockProofOfWork::new()));
        let (result, _) = tokio::join!(handshake.run(&mut incoming, &cancel), cancel_later);
        assert!(matches!(result, Err(TransportError::Cancelled)));

        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_cancel_stops_solver() {
        let config = NcpConfig { max_accepted_difficulty: 255, ..config() };
        let (socket, _sent) = recording_socket();
        let (tx, mut incoming) = mpsc::channel(16);
        tx.send(ConnectionPacket::ClientVerificationRequest {
            client_id: 1,
            server_seq: SequenceNumber::ZERO,
            difficulty: 255,
            salt: vec![1],
        }).await.unwrap();

        let stopped = Arc::new(AtomicBool::new(false));
        let mut pow = MockProofOfWork::new();
        {
            let stopped = stopped.clone();
            pow.expect_solve()
                .returning(move |_, _, stop| {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    stopped.store(true, Ordering::Relaxed);
                    None
                });
        }

        let cancel = CancellationToken::new();
        let cancel_later = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            }
        };

        let mut handshake = ClientHandshake::new(&config, &socket, server_addr(), Arc::new(pow));
        let (result, _) = tokio::join!(handshake.run(&mut incoming, &cancel), cancel_later);
        assert!(matches!(result, Err(TransportError::Cancelled)));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !stopped.load(Ordering::Relaxed) {
            assert!(std::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}
