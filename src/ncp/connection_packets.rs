use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

use crate::ncp::packet_header::{PacketHeader, PacketType};
use crate::ncp::sequence_number::SequenceNumber;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// The total size of a connection request datagram, including the packet header. Requests are
///  padded to this size so that a server's reply is always smaller than the request that
///  triggered it.
pub const CONNECTION_REQUEST_PACKET_LEN: usize = 1206;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ConnectionPacketType {
    ConnectionRequest = 1,
    ClientVerificationRequest = 2,
    ClientVerificationResponse = 3,
    ConnectionEstablished = 4,
    ConnectionError = 5,
    Disconnect = 6,
}

/// The reason a server gives for refusing a connection. Unknown values are mapped to
///  [ConnectionErrorType::Unspecified] for compatibility with newer peers.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum ConnectionErrorType {
    ServerFull = 1,
    InvalidProofOfWork = 2,
    /// A verification response did not match any challenge the server issued recently
    UnknownClient = 3,
    /// The server requires more proof-of-work than the client is willing to do
    DifficultyTooHigh = 4,
    #[num_enum(default)]
    Unspecified = 255,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectionPacket {
    ConnectionRequest {
        client_seq: SequenceNumber,
    },
    ClientVerificationRequest {
        client_id: i32,
        server_seq: SequenceNumber,
        difficulty: u8,
        salt: Vec<u8>,
    },
    ClientVerificationResponse {
        client_seq: SequenceNumber,
        client_id: i32,
        nonce: i32,
    },
    ConnectionEstablished,
    ConnectionError {
        error_type: ConnectionErrorType,
    },
    Disconnect,
}

impl ConnectionPacket {
    pub fn packet_type(&self) -> ConnectionPacketType {
        match self {
            ConnectionPacket::ConnectionRequest { .. } => ConnectionPacketType::ConnectionRequest,
            ConnectionPacket::ClientVerificationRequest { .. } => ConnectionPacketType::ClientVerificationRequest,
            ConnectionPacket::ClientVerificationResponse { .. } => ConnectionPacketType::ClientVerificationResponse,
            ConnectionPacket::ConnectionEstablished => ConnectionPacketType::ConnectionEstablished,
            ConnectionPacket::ConnectionError { .. } => ConnectionPacketType::ConnectionError,
            ConnectionPacket::Disconnect => ConnectionPacketType::Disconnect,
        }
    }

    /// Writes the complete datagram, including the packet header
    pub fn ser(&self, protocol_id: u16, buf: &mut BytesMut) {
        PacketHeader::new(protocol_id, PacketType::Connection).ser(buf);
        buf.put_u8(self.packet_type().into());

        match self {
            ConnectionPacket::ConnectionRequest { client_seq } => {
                let padding = CONNECTION_REQUEST_PACKET_LEN - PacketHeader::SERIALIZED_LEN - 1 - size_of::<i16>();
                buf.put_bytes(0, padding);
                buf.put_i16_le(client_seq.to_raw());
            }
            ConnectionPacket::ClientVerificationRequest { client_id, server_seq, difficulty, salt } => {
                buf.put_i32_le(*client_id);
                buf.put_i16_le(server_seq.to_raw());
                buf.put_u8(*difficulty);
                buf.put_u8(salt.len().prechecked_cast());
                buf.put_slice(salt);
            }
            ConnectionPacket::ClientVerificationResponse { client_seq, client_id, nonce } => {
                buf.put_i16_le(client_seq.to_raw());
                buf.put_i32_le(*client_id);
                buf.put_i32_le(*nonce);
            }
            ConnectionPacket::ConnectionEstablished => {}
            ConnectionPacket::ConnectionError { error_type } => {
                buf.put_u8((*error_type).into());
            }
            ConnectionPacket::Disconnect => {}
        }
    }

    /// Parses a connection packet, starting immediately after the packet header
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectionPacket> {
        let packet_type = buf.try_get_u8()?;
        let packet_type = ConnectionPacketType::try_from(packet_type)
            .map_err(|_| anyhow!("invalid connection packet type {}", packet_type))?;

        let result = match packet_type {
            ConnectionPacketType::ConnectionRequest => {
                let expected_remaining = CONNECTION_REQUEST_PACKET_LEN - PacketHeader::SERIALIZED_LEN - 1;
                if buf.remaining() != expected_remaining {
                    bail!("connection request has {} bytes after the header, expected {}", buf.remaining(), expected_remaining);
                }
                buf.advance(expected_remaining - size_of::<i16>());
                ConnectionPacket::ConnectionRequest {
                    client_seq: SequenceNumber::from_raw(buf.try_get_i16_le()?),
                }
            }
            ConnectionPacketType::ClientVerificationRequest => {
                let client_id = buf.try_get_i32_le()?;
                let server_seq = SequenceNumber::from_raw(buf.try_get_i16_le()?);
                let difficulty = buf.try_get_u8()?;
                let salt_len: usize = buf.try_get_u8()?.safe_cast();
                if buf.remaining() < salt_len {
                    bail!("salt length {} exceeds the remaining {} bytes", salt_len, buf.remaining());
                }
                let mut salt = vec![0u8; salt_len];
                buf.copy_to_slice(&mut salt);
                ConnectionPacket::ClientVerificationRequest { client_id, server_seq, difficulty, salt }
            }
            ConnectionPacketType::ClientVerificationResponse => {
                ConnectionPacket::ClientVerificationResponse {
                    client_seq: SequenceNumber::from_raw(buf.try_get_i16_le()?),
                    client_id: buf.try_get_i32_le()?,
                    nonce: buf.try_get_i32_le()?,
                }
            }
            ConnectionPacketType::ConnectionEstablished => {
                // room for session parameters in later protocol versions
                buf.advance(buf.remaining());
                ConnectionPacket::ConnectionEstablished
            }
            ConnectionPacketType::ConnectionError => {
                ConnectionPacket::ConnectionError {
                    error_type: ConnectionErrorType::from(buf.try_get_u8()?),
                }
            }
            ConnectionPacketType::Disconnect => ConnectionPacket::Disconnect,
        };

        if buf.has_remaining() {
            bail!("{} unexpected trailing bytes in {:?} packet", buf.remaining(), packet_type);
        }
        Ok(result)
    }
}
