use std::sync::Arc;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use transport::Connection;

const TCP_READ_BUF_LEN: usize = 16 * 1024;

/// Copies bytes both ways between a TCP stream and a transport connection until both directions
///  are finished. Each direction's end is propagated: TCP EOF closes the connection's sending
///  side, the connection's EOF shuts down the TCP stream's writing side.
pub async fn relay(tcp: TcpStream, connection: Arc<Connection>) {
    let peer = connection.peer_addr();
    let (tcp_read, tcp_write) = tcp.into_split();

    let (outbound, inbound) = tokio::join!(
        tcp_to_connection(tcp_read, &connection),
        connection_to_tcp(&connection, tcp_write),
    );

    match (outbound, inbound) {
        (Ok(sent), Ok(received)) => {
            info!("relay for {:?} finished: {} bytes sent, {} bytes received", peer, sent, received);
        }
        (outbound, inbound) => {
            warn!("relay for {:?} failed (outbound: {:?}, inbound: {:?}) - aborting", peer, outbound.err(), inbound.err());
            connection.abort().await;
        }
    }
}

/// Like [relay], for a byte stream layered on top of the connection (e.g. TLS). The connection is
///  aborted if the relay fails.
pub async fn relay_stream<S>(mut tcp: TcpStream, mut stream: S, connection: Arc<Connection>)
where S: AsyncRead + AsyncWrite + Unpin
{
    let peer = connection.peer_addr();
    match copy_bidirectional(&mut tcp, &mut stream).await {
        Ok((sent, received)) => {
            info!("relay for {:?} finished: {} bytes sent, {} bytes received", peer, sent, received);
        }
        Err(e) => {
            warn!("relay for {:?} failed: {} - aborting", peer, e);
            connection.abort().await;
        }
    }
}

async fn tcp_to_connection(mut tcp_read: OwnedReadHalf, connection: &Connection) -> anyhow::Result<usize> {
    let mut buf = vec![0u8; TCP_READ_BUF_LEN];
    let mut total = 0;
    loop {
        let n = match tcp_read.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                connection.abort().await;
                return Err(e.into());
            }
        };
        if n == 0 {
            debug!("TCP EOF - closing connection to {:?}", connection.peer_addr());
            connection.close().await?;
            return Ok(total);
        }
        connection.write(&buf[..n]).await?;
        total += n;
    }
}

async fn connection_to_tcp(connection: &Connection, mut tcp_write: OwnedWriteHalf) -> anyhow::Result<usize> {
    let mut buf = vec![0u8; TCP_READ_BUF_LEN];
    let mut total = 0;
    loop {
        let n = connection.read(&mut buf).await?;
        if n == 0 {
            debug!("connection EOF from {:?} - shutting down TCP", connection.peer_addr());
            tcp_write.shutdown().await?;
            return Ok(total);
        }
        if let Err(e) = tcp_write.write_all(&buf[..n]).await {
            connection.abort().await;
            return Err(e.into());
        }
        total += n;
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use transport::secure::{dial_tls, SecureListener, self_signed_identity};
    use transport::{dial, Listener, Profile};
    use super::*;

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn test_relay() {
        timeout(Duration::from_secs(30), async {
            let listener = Listener::bind(localhost(), Profile::default()).await.unwrap();
            let client = dial(listener.local_addr(), Profile::default()).await.unwrap();
            let server = listener.accept().await.unwrap();

            let tcp_listener = TcpListener::bind(localhost()).await.unwrap();
            let mut tcp_peer = TcpStream::connect(tcp_listener.local_addr().unwrap()).await.unwrap();
            let (tcp, _) = tcp_listener.accept().await.unwrap();
            let relay_task = tokio::spawn(relay(tcp, server));

            client.write(b"hello through the tunnel").await.unwrap();
            client.close().await.unwrap();

            let mut from_tunnel = Vec::new();
            tcp_peer.write_all(b"reply").await.unwrap();
            tcp_peer.shutdown().await.unwrap();
            tcp_peer.read_to_end(&mut from_tunnel).await.unwrap();
            assert_eq!(from_tunnel, b"hello through the tunnel");

            let mut buf = [0u8; 64];
            let mut from_tcp = Vec::new();
            loop {
                let n = client.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                from_tcp.extend_from_slice(&buf[..n]);
            }
            assert_eq!(from_tcp, b"reply");

            relay_task.await.unwrap();
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_stream_over_tls() {
        timeout(Duration::from_secs(30), async {
            let identity = self_signed_identity(vec!["localhost".to_string()]).unwrap();
            let listener = SecureListener::bind(localhost(), Profile::default(), identity).await.unwrap();
            let addr = listener.local_addr();
            let client_task = tokio::spawn(async move {
                dial_tls(addr, Profile::default()).await.unwrap()
            });
            let server = listener.accept().await.unwrap();
            let mut client = client_task.await.unwrap();
            let server_connection = server.get_ref().0.connection().clone();

            let tcp_listener = TcpListener::bind(localhost()).await.unwrap();
            let mut tcp_peer = TcpStream::connect(tcp_listener.local_addr().unwrap()).await.unwrap();
            let (tcp, _) = tcp_listener.accept().await.unwrap();
            let relay_task = tokio::spawn(relay_stream(tcp, server, server_connection));

            client.write_all(b"hello through the secure tunnel").await.unwrap();
            client.shutdown().await.unwrap();

            let mut from_tunnel = Vec::new();
            tcp_peer.write_all(b"reply").await.unwrap();
            tcp_peer.shutdown().await.unwrap();
            tcp_peer.read_to_end(&mut from_tunnel).await.unwrap();
            assert_eq!(from_tunnel, b"hello through the secure tunnel");

            let mut from_tcp = Vec::new();
            client.read_to_end(&mut from_tcp).await.unwrap();
            assert_eq!(from_tcp, b"reply");

            relay_task.await.unwrap();
        }).await.unwrap();
    }
}
