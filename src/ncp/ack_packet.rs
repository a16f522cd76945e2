use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::ncp::packet_header::{PacketHeader, PacketType};
use crate::ncp::sequence_number::SequenceNumber;

/// Acknowledges up to 64 sequence numbers: bit *k* of the bitmask stands for
///  `sequence_number - k`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AckPacket {
    pub sequence_number: SequenceNumber,
    pub ack_bitmask: u64,
}

impl AckPacket {
    pub const BODY_LEN: usize = 10;

    pub fn ser(&self, protocol_id: u16, buf: &mut BytesMut) {
        PacketHeader::new(protocol_id, PacketType::Acknowledge).ser(buf);
        buf.put_i16_le(self.sequence_number.to_raw());
        buf.put_i64_le(self.ack_bitmask as i64);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckPacket> {
        if buf.remaining() != Self::BODY_LEN {
            bail!("ack packet body must have exactly {} bytes, was {}", Self::BODY_LEN, buf.remaining());
        }

        Ok(AckPacket {
            sequence_number: SequenceNumber::from_raw(buf.try_get_i16_le()?),
            ack_bitmask: buf.try_get_i64_le()? as u64,
        })
    }

    pub fn acknowledged(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        (0..64u16)
            .filter(|&k| self.ack_bitmask & (1u64 << k) != 0)
            .map(|k| self.sequence_number.minus(k))
    }
}
