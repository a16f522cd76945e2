use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::trace;

use crate::error::TransportError;
use crate::ncp::ack_packet::AckPacket;
use crate::ncp::data_packet::DataPacket;
use crate::ncp::sequence_number::SequenceNumber;

struct UnackedPacket {
    sequence_number: SequenceNumber,
    payload: Bytes,
    last_sent_at: Instant,
    num_retransmissions: u32,
}

/// The sending side of a connection's reliability state: it assigns sequence numbers and keeps
///  sent packets until they are acknowledged.
pub struct SendWindow {
    next_sequence_number: SequenceNumber,
    /// in the order they were sent, which is also the order of sequence numbers
    unacked: VecDeque<UnackedPacket>,
    max_size: usize,
}

impl SendWindow {
    /// `last_used` is the sequence number the peer already saw during the handshake
    pub fn new(last_used: SequenceNumber, max_size: usize) -> SendWindow {
        SendWindow {
            next_sequence_number: last_used.next(),
            unacked: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    /// Assigns the next sequence number to a payload and keeps it for retransmission. The caller
    ///  is responsible for sending the returned packet.
    pub fn register(&mut self, payload: Bytes, now: Instant) -> Result<DataPacket, TransportError> {
        if self.unacked.len() >= self.max_size {
            return Err(TransportError::SendWindowFull(self.unacked.len()));
        }

        let sequence_number = self.next_sequence_number;
        self.next_sequence_number = sequence_number.next();

        self.unacked.push_back(UnackedPacket {
            sequence_number,
            payload: payload.clone(),
            last_sent_at: now,
            num_retransmissions: 0,
        });
        Ok(DataPacket { sequence_number, payload })
    }

    /// Removes all acknowledged packets, returning the number of packets that were removed
    pub fn on_ack(&mut self, ack: &AckPacket) -> usize {
        let before = self.unacked.len();
        self.unacked.retain(|p| {
            let k = ack.sequence_number.distance_from(p.sequence_number);
            let acked = (0..64).contains(&k) && ack.ack_bitmask & (1u64 << k) != 0;
            !acked
        });

        let num_acked = before - self.unacked.len();
        trace!(sequence_number = %ack.sequence_number, num_acked, "received ack");
        num_acked
    }

    /// Returns packets that were not acknowledged within the retransmission timeout, with their
    ///  original sequence numbers. They are considered re-sent at `now`.
    pub fn due_for_retransmission(&mut self, now: Instant, retransmission_timeout: Duration) -> Vec<DataPacket> {
        let mut result = Vec::new();
        for p in self.unacked.iter_mut() {
            if now.saturating_duration_since(p.last_sent_at) >= retransmission_timeout {
                p.last_sent_at = now;
                p.num_retransmissions += 1;
                result.push(DataPacket {
                    sequence_number: p.sequence_number,
                    payload: p.payload.clone(),
                });
            }
        }
        result
    }

    /// Drops a packet that could not be handed to the socket in the first place. Its sequence
    ///  number is not reused, which the receiver tolerates as a gap.
    pub fn forget(&mut self, sequence_number: SequenceNumber) {
        self.unacked.retain(|p| p.sequence_number != sequence_number);
    }

    /// The highest number of retransmissions of any packet that is still unacknowledged
    pub fn max_retransmissions(&self) -> u32 {
        self.unacked.iter()
            .map(|p| p.num_retransmissions)
            .max()
            .unwrap_or(0)
    }

    pub fn num_unacked(&self) -> usize {
        self.unacked.len()
    }
}

/// The receiving side of a connection's reliability state: the bitmask of recently received
///  sequence numbers, used both for acknowledgements and for detecting duplicates.
#[derive(Debug)]
pub struct ReceiveWindow {
    /// the newest sequence number that was received
    base: SequenceNumber,
    /// bit *k* is set if `base - k` was received
    bitmask: u64,
    ack_pending: bool,
}

impl ReceiveWindow {
    /// `last_seen` is the peer's last sequence number from the handshake. It counts as received.
    pub fn new(last_seen: SequenceNumber) -> ReceiveWindow {
        ReceiveWindow {
            base: last_seen,
            bitmask: 1,
            ack_pending: false,
        }
    }

    /// Registers a received sequence number, returning `true` if the packet should be delivered
    ///  and `false` if it is a duplicate or too old to tell.
    ///
    /// Duplicates still cause an ack to be sent: the peer apparently did not receive the
    ///  previous one.
    pub fn on_received(&mut self, sequence_number: SequenceNumber) -> bool {
        self.ack_pending = true;

        let distance = sequence_number.distance_from(self.base);
        if distance > 0 {
            let shift = distance as u32;
            self.bitmask = if shift >= 64 { 0 } else { self.bitmask << shift };
            self.bitmask |= 1;
            self.base = sequence_number;
            return true;
        }

        let k = -(distance as i32) as u32;
        if k >= 64 {
            trace!(%sequence_number, base = %self.base, "received packet that is too old to tell if it is a duplicate - dropping");
            return false;
        }

        let mask = 1u64 << k;
        if self.bitmask & mask != 0 {
            trace!(%sequence_number, "duplicate packet");
            return false;
        }
        self.bitmask |= mask;
        true
    }

    /// Returns an ack if something was received since the last one was taken
    pub fn take_ack(&mut self) -> Option<AckPacket> {
        if !self.ack_pending {
            return None;
        }
        self.ack_pending = false;
        Some(self.current_ack())
    }

    pub fn current_ack(&self) -> AckPacket {
        AckPacket {
            sequence_number: self.base,
            ack_bitmask: self.bitmask,
        }
    }
}
