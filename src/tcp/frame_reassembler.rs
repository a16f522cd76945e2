use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::TransportError;
use crate::safe_converter::PrecheckedCast;

pub const FRAME_PREFIX_LEN: usize = size_of::<i32>();

/// Writes a single frame, i.e. the payload's length as i32 LE followed by the payload itself.
///
/// The caller is responsible for checking the payload size against the configured maximum.
pub fn encode_frame(payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(FRAME_PREFIX_LEN + payload.len());
    buf.put_i32_le(payload.len().prechecked_cast());
    buf.put_slice(payload);
}

/// Turns the chunks of a byte stream into discrete frame payloads, regardless of how the stream
///  is split into chunks.
///
/// Consumed bytes are split off the front of the buffer, which only moves a cursor. The space is
///  reclaimed when the buffer is reserved into after all outstanding frames were handed out.
pub struct FrameReassembler {
    buf: BytesMut,
    max_frame_len: usize,
    /// Set after a protocol violation. The stream is out of sync at that point, and the
    ///  reassembler refuses to produce any more frames.
    violation: Option<String>,
}

impl FrameReassembler {
    pub fn new(max_frame_len: usize) -> FrameReassembler {
        FrameReassembler {
            buf: BytesMut::new(),
            max_frame_len,
            violation: None,
        }
    }

    pub fn feed(&mut self, new_bytes: &[u8]) {
        if self.violation.is_some() {
            return;
        }
        self.buf.extend_from_slice(new_bytes);
    }

    /// Returns the next complete frame's payload, or `None` if more bytes are needed. This should
    ///  be called repeatedly after each [FrameReassembler::feed] until it returns `None` since a
    ///  single chunk of bytes can contain any number of frames.
    ///
    /// Zero-length frames are skipped.
    pub fn try_take_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        if let Some(violation) = &self.violation {
            return Err(TransportError::ProtocolViolation(violation.clone()));
        }

        loop {
            if self.buf.len() < FRAME_PREFIX_LEN {
                return Ok(None);
            }

            let len = (&self.buf[..FRAME_PREFIX_LEN]).get_i32_le();
            if len < 0 {
                return Err(self.poison(format!("negative frame length {}", len)));
            }
            let len = len as usize;
            if len > self.max_frame_len {
                return Err(self.poison(format!("frame length {} exceeds the maximum of {}", len, self.max_frame_len)));
            }

            if len == 0 {
                trace!("dropping empty frame");
                self.buf.advance(FRAME_PREFIX_LEN);
                continue;
            }

            if self.buf.len() < FRAME_PREFIX_LEN + len {
                self.buf.reserve(FRAME_PREFIX_LEN + len - self.buf.len());
                return Ok(None);
            }

            self.buf.advance(FRAME_PREFIX_LEN);
            return Ok(Some(self.buf.split_to(len).freeze()));
        }
    }

    /// number of bytes received but not yet returned as part of a frame
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    fn poison(&mut self, msg: String) -> TransportError {
        self.buf.clear();
        self.violation = Some(msg.clone());
        TransportError::ProtocolViolation(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    const MAX: usize = 1024*1024;

    fn framed(payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for p in payloads {
            encode_frame(p, &mut buf);
        }
        buf.to_vec()
    }

    fn reassemble(stream: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
        let mut reassembler = FrameReassembler::new(MAX);
        let mut result = Vec::new();
        for chunk in stream.chunks(chunk_size) {
            reassembler.feed(chunk);
            while let Some(frame) = reassembler.try_take_frame().unwrap() {
                result.push(frame.to_vec());
            }
        }
        assert_eq!(reassembler.buffered_len(), 0);
        result
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_encode_frame() {
        assert_eq!(framed(&[b"ab"]), vec![2, 0, 0, 0, b'a', b'b']);
        assert_eq!(framed(&[b""]), vec![0, 0, 0, 0]);
    }

    #[rstest]
    fn test_payload_sizes(
        #[values(1, 2, 3, 100, 1000, 65535, 65536)] len: usize,
        #[values(1, 3, 4, 5, 1000, 100_000)] chunk_size: usize,
    ) {
        let payload = payload(len);
        let stream = framed(&[&payload]);
        assert_eq!(reassemble(&stream, chunk_size), vec![payload]);
    }

    #[rstest]
    #[case::byte_by_byte(1)]
    #[case::odd(7)]
    #[case::prefix_sized(4)]
    #[case::all_at_once(usize::MAX)]
    fn test_many_frames(#[case] chunk_size: usize) {
        let p1 = payload(10);
        let p2 = payload(300);
        let p3 = payload(1);
        let stream = framed(&[&p1, &p2, &p3]);

        assert_eq!(reassemble(&stream, chunk_size), vec![p1, p2, p3]);
    }

    #[rstest]
    #[case::byte_by_byte(1)]
    #[case::all_at_once(usize::MAX)]
    fn test_empty_frames_are_dropped(#[case] chunk_size: usize) {
        let stream = framed(&[b"", b"a", b"", b"", b"bc", b""]);
        assert_eq!(reassemble(&stream, chunk_size), vec![b"a".to_vec(), b"bc".to_vec()]);
    }

    #[test]
    fn test_only_empty_payload() {
        let stream = framed(&[b""]);
        assert_eq!(reassemble(&stream, 1), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn test_partial_frame() {
        let mut reassembler = FrameReassembler::new(MAX);
        reassembler.feed(&[5, 0, 0, 0, 1, 2]);
        assert!(reassembler.try_take_frame().unwrap().is_none());
        assert_eq!(reassembler.buffered_len(), 6);

        reassembler.feed(&[3, 4, 5, 9]);
        assert_eq!(reassembler.try_take_frame().unwrap().unwrap().as_ref(), &[1, 2, 3, 4, 5]);
        assert!(reassembler.try_take_frame().unwrap().is_none());
        assert_eq!(reassembler.buffered_len(), 1);
    }

    #[rstest]
    #[case::minus_one(-1)]
    #[case::min(i32::MIN)]
    fn test_negative_length_poisons(#[case] len: i32) {
        let mut reassembler = FrameReassembler::new(MAX);
        let mut stream = framed(&[b"ok"]);
        stream.extend_from_slice(&len.to_le_bytes());
        stream.extend_from_slice(&framed(&[b"never"]));
        reassembler.feed(&stream);

        assert_eq!(reassembler.try_take_frame().unwrap().unwrap().as_ref(), b"ok");
        assert!(matches!(reassembler.try_take_frame(), Err(TransportError::ProtocolViolation(_))));

        reassembler.feed(&framed(&[b"more"]));
        assert!(matches!(reassembler.try_take_frame(), Err(TransportError::ProtocolViolation(_))));
        assert!(matches!(reassembler.try_take_frame(), Err(TransportError::ProtocolViolation(_))));
    }

    #[test]
    fn test_frame_too_long() {
        let mut reassembler = FrameReassembler::new(10);
        reassembler.feed(&framed(&[&payload(10)]));
        assert_eq!(reassembler.try_take_frame().unwrap().unwrap().len(), 10);

        reassembler.feed(&11i32.to_le_bytes());
        assert!(matches!(reassembler.try_take_frame(), Err(TransportError::ProtocolViolation(_))));
    }
}
