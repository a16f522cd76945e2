use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

/// The sending side of a UDP socket, abstracted for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl SendSocket for UdpSocket {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!(?to, len = packet_buf.len(), "sending packet");
        self.send_to(packet_buf, to).await?;
        Ok(())
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
