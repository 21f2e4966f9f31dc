use std::net::SocketAddr;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};
use crate::config::Profile;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl SendSocket for UdpSocket {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);
        self.send_to(packet_buf, to).await?;
        Ok(())
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Binds a non-blocking UDP socket, requesting the profile's OS-level buffer sizes. The OS may
///  cap or ignore those sizes, so failing to apply them is not an error.
pub fn bind_udp_socket(addr: SocketAddr, profile: &Profile) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_recv_buffer_size(profile.rx_buffer_sz) {
        warn!("unable to set UDP receive buffer size to {}: {}", profile.rx_buffer_sz, e);
    }
    if let Err(e) = socket.set_send_buffer_size(profile.tx_buffer_sz) {
        warn!("unable to set UDP send buffer size to {}: {}", profile.tx_buffer_sz, e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    debug!("bound UDP socket to {:?} (recv buffer {:?}, send buffer {:?})", socket.local_addr().ok().and_then(|a| a.as_socket()), socket.recv_buffer_size().ok(), socket.send_buffer_size().ok());

    UdpSocket::from_std(socket.into())
}
