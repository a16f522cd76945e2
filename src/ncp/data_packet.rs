use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ncp::packet_header::{PacketHeader, PacketType};
use crate::ncp::sequence_number::SequenceNumber;

pub const DATA_HEADER_LEN: usize = PacketHeader::SERIALIZED_LEN + size_of::<i16>();

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataPacket {
    pub sequence_number: SequenceNumber,
    pub payload: Bytes,
}

impl DataPacket {
    pub fn ser(&self, protocol_id: u16, buf: &mut BytesMut) {
        PacketHeader::new(protocol_id, PacketType::Data).ser(buf);
        buf.put_i16_le(self.sequence_number.to_raw());
        buf.put_slice(&self.payload);
    }

    /// The payload is everything after the sequence number
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DataPacket> {
        let sequence_number = SequenceNumber::from_raw(buf.try_get_i16_le()?);
        let payload = buf.copy_to_bytes(buf.remaining());
        Ok(DataPacket { sequence_number, payload })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ser_deser() {
        let packet = DataPacket { sequence_number: SequenceNumber::from_raw(-2), payload: Bytes::from_static(b"xyz") };
        let mut buf = BytesMut::new();
        packet.ser(1, &mut buf);
        assert_eq!(buf.as_ref(), &[1, 0, 0, 0xFE, 0xFF, b'x', b'y', b'z']);

        let mut b = &buf[PacketHeader::SERIALIZED_LEN..];
        assert_eq!(DataPacket::deser(&mut b).unwrap(), packet);
    }

    #[test]
    fn test_empty_payload() {
        let mut b: &[u8] = &[5, 0];
        let packet = DataPacket::deser(&mut b).unwrap();
        assert_eq!(packet.sequence_number, SequenceNumber::from_raw(5));
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_missing_sequence_number() {
        let mut b: &[u8] = &[5];
        assert!(DataPacket::deser(&mut b).is_err());
    }
}
