use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::connection::Connection;
use crate::error::{SendOutcome, TransportError};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown message tag {0:?}")]
    UnknownTag(MessageTag),

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Converts application messages to and from the payload bytes that are handed to a transport.
pub trait MessageCodec: Send + Sync + 'static {
    type Message: Send + 'static;

    fn encode(&self, message: &Self::Message) -> Result<Bytes, CodecError>;
    fn decode(&self, buf: &[u8]) -> Result<Self::Message, CodecError>;
}

/// Encodes a message and sends the resulting payload over a connection
pub async fn send_message<C: MessageCodec>(connection: &dyn Connection, codec: &C, message: &C::Message) -> Result<SendOutcome, TransportError> {
    let payload = codec.encode(message)?;
    connection.send(&payload).await
}

/// A [MessageTag] identifies the kind of a message on the wire. Tags are part of the protocol
///  between peers and must be stable.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageTag(pub u16);

impl Debug for MessageTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// A closed set of message kinds, typically an enum with one variant per kind. Each variant has
///  its own stable [MessageTag].
pub trait TaggedMessage: Sized + Send + 'static {
    fn tag(&self) -> MessageTag;

    /// serialize the message body, i.e. *without* the tag
    fn ser(&self, buf: &mut BytesMut);

    /// deserialize a message body for a given tag. Returning `Ok(None)` signals that the tag is
    ///  not part of the message set.
    fn deser(tag: MessageTag, buf: &mut impl Buf) -> anyhow::Result<Option<Self>>;
}

/// Encodes [TaggedMessage]s as the message tag (u16 LE) followed by the message body
pub struct TaggedCodec<M: TaggedMessage> {
    _message: PhantomData<fn() -> M>,
}

impl<M: TaggedMessage> TaggedCodec<M> {
    pub fn new() -> TaggedCodec<M> {
        TaggedCodec { _message: PhantomData }
    }
}

impl<M: TaggedMessage> Default for TaggedCodec<M> {
    fn default() -> Self {
        TaggedCodec::new()
    }
}

impl<M: TaggedMessage> MessageCodec for TaggedCodec<M> {
    type Message = M;

    fn encode(&self, message: &M) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        buf.put_u16_le(message.tag().0);
        message.ser(&mut buf);
        Ok(buf.freeze())
    }

    fn decode(&self, mut buf: &[u8]) -> Result<M, CodecError> {
        let tag = buf.try_get_u16_le()
            .map(MessageTag)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;

        match M::deser(tag, &mut buf) {
            Ok(Some(message)) => {
                if buf.has_remaining() {
                    return Err(CodecError::Malformed(format!("{} trailing bytes after message with tag {:?}", buf.remaining(), tag)));
                }
                Ok(message)
            }
            Ok(None) => Err(CodecError::UnknownTag(tag)),
            Err(e) => Err(CodecError::Malformed(e.to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::dispatch::test::DummyConnection;
    use bytes::Buf;
    use rstest::rstest;

    #[derive(Debug, Clone, Eq, PartialEq)]
    pub enum TestMessage {
        Ping(u32),
        Text(String),
    }

    impl TaggedMessage for TestMessage {
        fn tag(&self) -> MessageTag {
            match self {
                TestMessage::Ping(_) => MessageTag(1),
                TestMessage::Text(_) => MessageTag(2),
            }
        }

        fn ser(&self, buf: &mut BytesMut) {
            match self {
                TestMessage::Ping(n) => buf.put_u32_le(*n),
                TestMessage::Text(s) => buf.put_slice(s.as_bytes()),
            }
        }

        fn deser(tag: MessageTag, buf: &mut impl Buf) -> anyhow::Result<Option<Self>> {
            match tag.0 {
                1 => Ok(Some(TestMessage::Ping(buf.try_get_u32_le()?))),
                2 => {
                    let s = String::from_utf8(buf.copy_to_bytes(buf.remaining()).to_vec())?;
                    Ok(Some(TestMessage::Text(s)))
                }
                _ => Ok(None),
            }
        }
    }

    #[rstest]
    #[case::ping(TestMessage::Ping(17), vec![1, 0, 17, 0, 0, 0])]
    #[case::text(TestMessage::Text("hi".to_string()), vec![2, 0, b'h', b'i'])]
    #[case::empty_text(TestMessage::Text("".to_string()), vec![2, 0])]
    fn test_tagged_codec(#[case] msg: TestMessage, #[case] expected: Vec<u8>) {
        let codec = TaggedCodec::<TestMessage>::new();
        let encoded = codec.encode(&msg).unwrap();
        assert_eq!(encoded.as_ref(), expected.as_slice());
        assert_eq!(codec.decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_tagged_codec_unknown_tag() {
        let codec = TaggedCodec::<TestMessage>::new();
        match codec.decode(&[9, 0, 1, 2]) {
            Err(CodecError::UnknownTag(tag)) => assert_eq!(tag, MessageTag(9)),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[rstest]
    #[case::no_tag(vec![])]
    #[case::half_tag(vec![1])]
    #[case::short_body(vec![1, 0, 17])]
    #[case::trailing(vec![1, 0, 17, 0, 0, 0, 99])]
    #[case::bad_utf8(vec![2, 0, 0xff, 0xfe])]
    fn test_tagged_codec_malformed(#[case] buf: Vec<u8>) {
        let codec = TaggedCodec::<TestMessage>::new();
        assert!(matches!(codec.decode(&buf), Err(CodecError::Malformed(_))));
    }

    /// only even numbers can be encoded
    struct EvenCodec;
    impl MessageCodec for EvenCodec {
        type Message = u32;

        fn encode(&self, message: &u32) -> Result<Bytes, CodecError> {
            if message % 2 == 1 {
                return Err(CodecError::Malformed(format!("{} is odd", message)));
            }
            Ok(Bytes::copy_from_slice(&message.to_le_bytes()))
        }

        fn decode(&self, mut buf: &[u8]) -> Result<u32, CodecError> {
            buf.try_get_u32_le()
                .map_err(|e| CodecError::Malformed(e.to_string()))
        }
    }

    #[tokio::test]
    async fn test_send_message() {
        let connection = DummyConnection::new();

        assert_eq!(send_message(&*connection, &EvenCodec, &2).await.unwrap(), SendOutcome::Sent);
        match send_message(&*connection, &EvenCodec, &3).await {
            Err(TransportError::Codec(CodecError::Malformed(msg))) => assert_eq!(msg, "3 is odd"),
            other => panic!("unexpected result {:?}", other),
        }

        assert_eq!(*connection.sent.lock().unwrap(), vec![vec![2, 0, 0, 0]]);
    }

    #[test]
    fn test_message_tag_debug() {
        assert_eq!(format!("{:?}", MessageTag(0x1a2)), "0x01A2");
    }
}
