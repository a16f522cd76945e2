use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::NcpConfig;
use crate::ncp::connection_packets::{ConnectionErrorType, ConnectionPacket};
use crate::ncp::proof_of_work::ProofOfWork;
use crate::ncp::sequence_number::SequenceNumber;

pub const SALT_LEN: usize = 16;

#[derive(Debug, Clone, Eq, PartialEq)]
struct Challenge {
    client_id: i32,
    server_seq: SequenceNumber,
    salt: [u8; SALT_LEN],
}

/// A client that completed the handshake. The server still decides whether it has room for it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AcceptedClient {
    pub client_id: i32,
    /// the sequence number of the client's verification response
    pub client_seq: SequenceNumber,
    pub server_seq: SequenceNumber,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandshakeAction {
    Reply(ConnectionPacket),
    Accept(AcceptedClient),
    Ignore,
}

/// The server side of the connection handshake.
///
/// The server keeps no per-client state before a handshake completes. A challenge is a keyed
///  hash of the client's address, its request sequence number and the current time epoch, so the
///  server can re-derive it when the verification response arrives. Responses are accepted for
///  challenges from the current and the previous epoch.
pub struct ServerHandshake {
    secret: [u8; 32],
    difficulty: u8,
    challenge_lifetime: Duration,
    started_at: Instant,
    pow: Arc<dyn ProofOfWork>,
}

impl ServerHandshake {
    pub fn new(config: &NcpConfig, pow: Arc<dyn ProofOfWork>) -> ServerHandshake {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::with_secret(secret, config, pow)
    }

    fn with_secret(secret: [u8; 32], config: &NcpConfig, pow: Arc<dyn ProofOfWork>) -> ServerHandshake {
        ServerHandshake {
            secret,
            difficulty: config.pow_difficulty,
            challenge_lifetime: config.challenge_lifetime,
            started_at: Instant::now(),
            pow,
        }
    }

    pub fn on_connection_packet(&self, from: SocketAddr, packet: ConnectionPacket, now: Instant) -> HandshakeAction {
        match packet {
            ConnectionPacket::ConnectionRequest { client_seq } => {
                let challenge = self.challenge(self.epoch(now), from, client_seq);
                trace!(?from, client_id = challenge.client_id, "issuing challenge");
                HandshakeAction::Reply(ConnectionPacket::ClientVerificationRequest {
                    client_id: challenge.client_id,
                    server_seq: challenge.server_seq,
                    difficulty: self.difficulty,
                    salt: challenge.salt.to_vec(),
                })
            }
            ConnectionPacket::ClientVerificationResponse { client_seq, client_id, nonce } => {
                self.on_verification_response(from, client_seq, client_id, nonce, now)
            }
            other => {
                debug!(?from, packet_type = ?other.packet_type(), "unexpected connection packet from unknown client - dropping");
                HandshakeAction::Ignore
            }
        }
    }

    fn on_verification_response(&self, from: SocketAddr, client_seq: SequenceNumber, client_id: i32, nonce: i32, now: Instant) -> HandshakeAction {
        // the client increments its sequence number between request and response
        let request_seq = client_seq.minus(1);

        let epoch = self.epoch(now);
        let challenge = [Some(epoch), epoch.checked_sub(1)].into_iter()
            .flatten()
            .map(|e| self.challenge(e, from, request_seq))
            .find(|c| c.client_id == client_id);

        let Some(challenge) = challenge else {
            debug!(?from, client_id, "verification response does not match a recent challenge");
            return HandshakeAction::Reply(ConnectionPacket::ConnectionError { error_type: ConnectionErrorType::UnknownClient });
        };

        if !self.pow.verify(&challenge.salt, self.difficulty, nonce) {
            debug!(?from, client_id, nonce, "invalid proof of work");
            return HandshakeAction::Reply(ConnectionPacket::ConnectionError { error_type: ConnectionErrorType::InvalidProofOfWork });
        }

        HandshakeAction::Accept(AcceptedClient {
            client_id,
            client_seq,
            server_seq: challenge.server_seq,
        })
    }

    fn epoch(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.started_at).as_millis();
        (elapsed / self.challenge_lifetime.as_millis().max(1)) as u64
    }

    fn challenge(&self, epoch: u64, from: SocketAddr, client_seq: SequenceNumber) -> Challenge {
        let mut sha256 = Sha256::default();
        sha256.update(self.secret);
        sha256.update(epoch.to_le_bytes());
        match from.ip() {
            IpAddr::V4(ip) => sha256.update(ip.octets()),
            IpAddr::V6(ip) => sha256.update(ip.octets()),
        }
        sha256.update(from.port().to_le_bytes());
        sha256.update(client_seq.to_raw().to_le_bytes());
        let hash = sha256.finalize();

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&hash[32 - SALT_LEN..]);
        Challenge {
            client_id: i32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]),
            server_seq: SequenceNumber::from_raw(i16::from_le_bytes([hash[4], hash[5]])),
            salt,
        }
    }
}
