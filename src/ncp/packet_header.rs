use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::debug;

/// ASCII "NC"
pub const DEFAULT_PROTOCOL_ID: u16 = 0x4E43;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum PacketType {
    Data = 0,
    Acknowledge = 1,
    Connection = 2,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub protocol_id: u16,
    pub packet_type: PacketType,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 3;

    pub fn new(protocol_id: u16, packet_type: PacketType) -> PacketHeader {
        PacketHeader { protocol_id, packet_type }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.protocol_id);
        buf.put_u8(self.packet_type.into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let protocol_id = buf.try_get_u16_le()?;
        let packet_type = buf.try_get_u8()?;
        let packet_type = PacketType::try_from(packet_type)
            .map_err(|_| anyhow!("invalid packet type {}", packet_type))?;

        Ok(PacketHeader { protocol_id, packet_type })
    }
}

/// Splits a received datagram into its packet type and the body after the header. Datagrams that
///  are too short or belong to a different protocol are dropped here.
pub fn split_datagram(mut datagram: &[u8], protocol_id: u16) -> Option<(PacketType, &[u8])> {
    let header = match PacketHeader::deser(&mut datagram) {
        Ok(h) => h,
        Err(e) => {
            debug!("received invalid packet header - dropping: {}", e);
            return None;
        }
    };
    if header.protocol_id != protocol_id {
        debug!(protocol_id = header.protocol_id, "received packet for a different protocol - dropping");
        return None;
    }
    Some((header.packet_type, datagram))
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::data(PacketHeader::new(DEFAULT_PROTOCOL_ID, PacketType::Data), vec![0x43, 0x4E, 0])]
    #[case::ack(PacketHeader::new(1, PacketType::Acknowledge), vec![1, 0, 1])]
    #[case::connection(PacketHeader::new(0xABCD, PacketType::Connection), vec![0xCD, 0xAB, 2])]
    fn test_ser_deser(#[case] header: PacketHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        assert_eq!(PacketHeader::deser(&mut b).unwrap(), header);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::no_type(vec![0x43, 0x4E])]
    #[case::invalid_type(vec![0x43, 0x4E, 3])]
    fn test_deser_invalid(#[case] buf: Vec<u8>) {
        assert!(PacketHeader::deser(&mut buf.as_slice()).is_err());
    }

    #[rstest]
    #[case::data(vec![0x43, 0x4E, 0, 9, 8], Some((PacketType::Data, vec![9, 8])))]
    #[case::header_only(vec![0x43, 0x4E, 1], Some((PacketType::Acknowledge, vec![])))]
    #[case::other_protocol(vec![0x44, 0x4E, 0, 9, 8], None)]
    #[case::too_short(vec![0x43, 0x4E], None)]
    #[case::invalid_type(vec![0x43, 0x4E, 7, 1], None)]
    fn test_split_datagram(#[case] datagram: Vec<u8>, #[case] expected: Option<(PacketType, Vec<u8>)>) {
        let actual = split_datagram(&datagram, DEFAULT_PROTOCOL_ID)
            .map(|(t, body)| (t, body.to_vec()));
        assert_eq!(actual, expected);
    }
}
