//! A peer-to-peer message transport: it moves discrete application messages across a network
//!  connection and does not care what those messages mean.
//!
//! There are two transports with a shared [connection::Connection] abstraction:
//! * **TCP** ([tcp]) - messages are framed with a length prefix on top of the byte stream
//! * **NCP** ([ncp]) - a reliable datagram protocol on top of UDP, with an explicit handshake
//!    that includes a proof-of-work admission gate, and sequence numbers / acknowledgment
//!    bitmasks for retransmission of lost packets
//!
//! Application messages are turned into bytes by a [codec::MessageCodec] and handed to a
//!  [dispatch::MessageDispatcher] on the receiving side. Failures of a dispatcher are reported
//!  as [connection::TransportEvent::HandlerFault] and never terminate a connection.
//!
//! ## Stream framing
//!
//! All numbers are little endian.
//!
//! ```ascii
//! 0: payload length (i32)
//! 4: payload
//! ```
//!
//! A length of 0 is a keepalive and is dropped on the receiving side. A negative length (or a
//!  length exceeding the configured maximum) is a protocol violation and terminates the connection.
//!
//! ## NCP packets
//!
//! Every NCP packet is a single UDP datagram starting with the following header (all numbers
//!  little endian):
//!
//! ```ascii
//! 0: protocol id (u16) - packets with a different protocol id are dropped
//! 2: packet type (u8):
//!    * 0: DATA
//!    * 1: ACKNOWLEDGE
//!    * 2: CONNECTION
//! ```
//!
//! *DATA*
//!
//! ```ascii
//! 3: sequence number (i16)
//! 5: payload (up to the end of the datagram)
//! ```
//!
//! *ACKNOWLEDGE* - exactly ten bytes of body. Bit *k* of the bitmask acknowledges sequence number
//!  `sequence number - k`, with wrap-around.
//!
//! ```ascii
//! 3: sequence number (i16)
//! 5: ack bitmask (i64)
//! ```
//!
//! *CONNECTION* - followed by a connection packet type (u8) and a type specific body:
//!
//! ```ascii
//! 1: CONNECTION_REQUEST - the packet is padded to a total of 1206 bytes, the last two bytes
//!     being the client's sequence number (i16). Since the server's reply is much smaller, the
//!     handshake can not be abused to amplify reflection attacks.
//! 2: CLIENT_VERIFICATION_REQUEST
//!     0: client id (i32)
//!     4: server sequence number (i16)
//!     6: proof-of-work difficulty (u8)
//!     7: salt length (u8)
//!     8: salt
//! 3: CLIENT_VERIFICATION_RESPONSE
//!     0: client sequence number (i16) - incremented relative to the request
//!     2: client id (i32)
//!     6: nonce (i32)
//! 4: CONNECTION_ESTABLISHED - no body
//! 5: CONNECTION_ERROR
//!     0: error type (u8)
//! 6: DISCONNECT - no body
//! ```
//!
//! ## Handshake
//!
//! ```ascii
//! client                                       server
//!   | -- CONNECTION_REQUEST (every 42ms) -------> |  stateless: challenge is derived from a
//!   | <----------- CLIENT_VERIFICATION_REQUEST -- |   keyed hash of the client's address
//!   |  (solve proof of work)                      |
//!   | -- CLIENT_VERIFICATION_RESPONSE (42ms) ---> |  verify, allocate connection slot
//!   | <---------------- CONNECTION_ESTABLISHED -- |
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod ncp;
pub mod safe_converter;
pub mod tcp;
