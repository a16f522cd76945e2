use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::ncp::connection_packets::CONNECTION_REQUEST_PACKET_LEN;
use crate::ncp::packet_header::DEFAULT_PROTOCOL_ID;

/// Turns a host string and a port into a socket address. Apart from literal IP addresses, this
///  understands `"any"` (the IPv4 wildcard address) and `"localhost"` (the IPv4 loopback address).
pub fn parse_endpoint(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip = match host.trim() {
        "any" | "*" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        "any6" => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other.parse()
            .map_err(|e| anyhow!("invalid host {:?}: {}", other, e))?,
    };
    Ok(SocketAddr::new(ip, port))
}

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Frames with a length prefix bigger than this are treated as a protocol violation, and
    ///  the connection is closed. A misbehaving or compromised peer could otherwise make us
    ///  allocate arbitrary amounts of memory.
    pub max_frame_len: usize,

    /// The size of the buffer a single socket read goes into. Frames bigger than this are
    ///  reassembled from several reads.
    pub receive_buffer_size: usize,

    pub no_delay: bool,

    /// Backlog of the listening socket, i.e. the number of connections the OS queues before
    ///  they are accepted
    pub connection_queue_length: u32,

    /// If set, an empty frame is sent on a connection that did not send anything for this long.
    ///  Receivers drop empty frames, so this keeps NAT bindings and idle detection happy without
    ///  bothering the application.
    pub keepalive_interval: Option<Duration>,

    pub connect_timeout: Option<Duration>,

    pub event_channel_capacity: usize,
}

impl TcpConfig {
    pub fn new() -> TcpConfig {
        TcpConfig {
            max_frame_len: 16*1024*1024,
            receive_buffer_size: 8192,
            no_delay: true,
            connection_queue_length: 128,
            keepalive_interval: None,
            connect_timeout: Some(Duration::from_secs(10)),
            event_channel_capacity: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_len == 0 || self.max_frame_len > i32::MAX as usize {
            bail!("max frame length must be between 1 and {}", i32::MAX);
        }
        if self.receive_buffer_size < 16 {
            bail!("receive buffer is too small");
        }
        if self.connection_queue_length == 0 {
            bail!("connection queue length must be positive");
        }
        if self.keepalive_interval == Some(Duration::ZERO) {
            bail!("keepalive interval must be positive");
        }
        if self.event_channel_capacity == 0 {
            bail!("event channel capacity must be positive");
        }
        Ok(())
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig::new()
    }
}

#[derive(Debug, Clone)]
pub struct NcpConfig {
    /// Packets with a different protocol id are dropped. This allows running several unrelated
    ///  NCP based protocols without them interfering.
    pub protocol_id: u16,

    /// The maximum UDP payload that is received. Bigger datagrams are truncated by the OS and
    ///  therefore fail to parse.
    pub mtu: usize,

    /// Interval between retransmissions of handshake packets
    pub handshake_send_interval: Duration,

    /// Number of times a handshake packet is sent before the connection attempt is considered
    ///  to have timed out. This is per handshake step.
    pub handshake_attempts: u32,

    /// Proof-of-work difficulty the server requires from connecting clients
    pub pow_difficulty: u8,

    /// Clients refuse to connect if a server requires more than this. Every additional bit
    ///  doubles the expected work.
    pub max_accepted_difficulty: u8,

    /// Servers derive handshake challenges from a secret and the current time bucket of this
    ///  length. A verification response is accepted for up to two of these intervals.
    pub challenge_lifetime: Duration,

    pub max_clients: usize,

    /// Connections that completed the handshake wait here until the application accepts them.
    ///  Clients completing the handshake while this is full are rejected as if the server was full.
    pub accept_queue_length: usize,

    /// Received data is acknowledged on the next tick of this interval
    pub ack_interval: Duration,

    pub retransmission_timeout: Duration,

    /// A packet that is still not acknowledged after this many retransmissions causes the
    ///  connection to be closed
    pub max_retransmissions: u32,

    /// Maximum number of unacknowledged packets. This can be at most 64 because acknowledgements
    ///  cover 64 sequence numbers.
    pub send_window_size: usize,

    /// An acknowledgement is sent as keepalive if nothing was sent for this long
    pub keepalive_interval: Duration,

    /// A connection is closed if nothing was received from the peer for this long
    pub idle_timeout: Duration,

    /// Received messages of a connection wait here until its handler is done with the previous
    ///  ones. Data packets arriving while this is full are dropped without acknowledging them.
    pub dispatch_queue_length: usize,

    pub event_channel_capacity: usize,
}

impl NcpConfig {
    pub fn new() -> NcpConfig {
        NcpConfig {
            protocol_id: DEFAULT_PROTOCOL_ID,
            mtu: 1500,
            handshake_send_interval: Duration::from_millis(42),
            handshake_attempts: 120,
            pow_difficulty: 12,
            max_accepted_difficulty: 24,
            challenge_lifetime: Duration::from_secs(30),
            max_clients: 4096,
            accept_queue_length: 128,
            ack_interval: Duration::from_millis(10),
            retransmission_timeout: Duration::from_millis(200),
            max_retransmissions: 20,
            send_window_size: 64,
            keepalive_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
            dispatch_queue_length: 256,
            event_channel_capacity: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < CONNECTION_REQUEST_PACKET_LEN {
            bail!("MTU is too small for connection requests");
        }
        if self.handshake_send_interval.is_zero() {
            bail!("handshake send interval must be positive");
        }
        if self.handshake_attempts == 0 {
            bail!("at least one handshake attempt is required");
        }
        if self.send_window_size == 0 || self.send_window_size > 64 {
            bail!("send window size must be between 1 and 64");
        }
        if self.ack_interval.is_zero() {
            bail!("ack interval must be positive");
        }
        if self.retransmission_timeout < self.ack_interval {
            bail!("retransmission timeout must not be shorter than the ack interval");
        }
        if self.idle_timeout <= self.keepalive_interval {
            bail!("idle timeout must be longer than the keepalive interval");
        }
        if self.challenge_lifetime.is_zero() {
            bail!("challenge lifetime must be positive");
        }
        if self.accept_queue_length == 0 {
            bail!("accept queue length must be positive");
        }
        if self.dispatch_queue_length == 0 {
            bail!("dispatch queue length must be positive");
        }
        if self.event_channel_capacity == 0 {
            bail!("event channel capacity must be positive");
        }
        Ok(())
    }

    /// Interval of the per-connection maintenance tick (acks, retransmission, keepalive)
    pub fn tick_interval(&self) -> Duration {
        self.ack_interval
    }
}

impl Default for NcpConfig {
    fn default() -> Self {
        NcpConfig::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::any("any", 8080, "0.0.0.0:8080")]
    #[case::star("*", 1, "0.0.0.0:1")]
    #[case::any6("any6", 99, "[::]:99")]
    #[case::localhost("localhost", 4711, "127.0.0.1:4711")]
    #[case::literal_v4("10.1.2.3", 5, "10.1.2.3:5")]
    #[case::literal_v6("::1", 6, "[::1]:6")]
    #[case::whitespace(" localhost ", 7, "127.0.0.1:7")]
    fn test_parse_endpoint(#[case] host: &str, #[case] port: u16, #[case] expected: &str) {
        let expected: SocketAddr = expected.parse().unwrap();
        assert_eq!(parse_endpoint(host, port).unwrap(), expected);
    }

    #[rstest]
    #[case::empty("")]
    #[case::garbage("not-a-host")]
    fn test_parse_endpoint_invalid(#[case] host: &str) {
        assert!(parse_endpoint(host, 1).is_err());
    }

    #[test]
    fn test_default_configs_are_valid() {
        TcpConfig::new().validate().unwrap();
        NcpConfig::new().validate().unwrap();
    }

    #[rstest]
    #[case::window_too_big(|c: &mut NcpConfig| c.send_window_size = 65)]
    #[case::window_empty(|c: &mut NcpConfig| c.send_window_size = 0)]
    #[case::small_mtu(|c: &mut NcpConfig| c.mtu = 576)]
    #[case::no_attempts(|c: &mut NcpConfig| c.handshake_attempts = 0)]
    #[case::idle_before_keepalive(|c: &mut NcpConfig| c.idle_timeout = c.keepalive_interval)]
    #[case::no_accept_queue(|c: &mut NcpConfig| c.accept_queue_length = 0)]
    #[case::no_dispatch_queue(|c: &mut NcpConfig| c.dispatch_queue_length = 0)]
    fn test_invalid_ncp_config(#[case] modify: fn(&mut NcpConfig)) {
        let mut config = NcpConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::zero_frame_len(|c: &mut TcpConfig| c.max_frame_len = 0)]
    #[case::tiny_buffer(|c: &mut TcpConfig| c.receive_buffer_size = 4)]
    #[case::zero_keepalive(|c: &mut TcpConfig| c.keepalive_interval = Some(Duration::ZERO))]
    fn test_invalid_tcp_config(#[case] modify: fn(&mut TcpConfig)) {
        let mut config = TcpConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
