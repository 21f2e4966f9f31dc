use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use crate::connection::Connection;
use crate::error::TransportResult;

const READ_CHUNK_LEN: usize = 16 * 1024;

type ReadFuture = Pin<Box<dyn Future<Output = TransportResult<Vec<u8>>> + Send>>;
type WriteFuture = Pin<Box<dyn Future<Output = TransportResult<usize>> + Send>>;
type CloseFuture = Pin<Box<dyn Future<Output = TransportResult<()>> + Send>>;

/// Adapts a [Connection] to tokio's [AsyncRead] and [AsyncWrite], e.g. for layering TLS on top
///  of it.
///
/// Shutting down the writing side closes the connection's sending direction. A write that
///  returned `Pending` is completed with the data it was first called with, as the
///  [AsyncWrite] contract expects callers to retry with the same data.
pub struct ConnectionStream {
    connection: Arc<Connection>,
    read_fut: Option<ReadFuture>,
    /// read from the connection, but not yet passed on because the caller's buffer was full
    unread: Vec<u8>,
    unread_offset: usize,
    write_fut: Option<WriteFuture>,
    close_fut: Option<CloseFuture>,
}

impl ConnectionStream {
    pub fn new(connection: Arc<Connection>) -> ConnectionStream {
        ConnectionStream {
            connection,
            read_fut: None,
            unread: Vec::new(),
            unread_offset: 0,
            write_fut: None,
            close_fut: None,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    fn copy_unread(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.unread.len() - self.unread_offset);
        buf.put_slice(&self.unread[self.unread_offset..self.unread_offset + n]);
        self.unread_offset += n;
    }
}

impl AsyncRead for ConnectionStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if this.unread_offset < this.unread.len() {
            this.copy_unread(buf);
            return Poll::Ready(Ok(()));
        }

        let connection = &this.connection;
        let fut = this.read_fut.get_or_insert_with(|| {
            let connection = connection.clone();
            let fut: ReadFuture = Box::pin(async move {
                let mut data = vec![0u8; READ_CHUNK_LEN];
                let n = connection.read(&mut data).await?;
                data.truncate(n);
                Ok(data)
            });
            fut
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.read_fut = None;

        // an empty chunk is EOF, which leaves `buf` unfilled
        this.unread = result?;
        this.unread_offset = 0;
        this.copy_unread(buf);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ConnectionStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.write_fut.is_none() && buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let connection = &this.connection;
        let fut = this.write_fut.get_or_insert_with(|| {
            let connection = connection.clone();
            let data = buf.to_vec();
            let fut: WriteFuture = Box::pin(async move {
                connection.write(&data).await
            });
            fut
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.write_fut = None;
        Poll::Ready(Ok(result?))
    }

    /// Written data is handed to the connection completely before `poll_write` returns, so
    ///  there is nothing to flush
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let connection = &this.connection;
        let fut = this.close_fut.get_or_insert_with(|| {
            let connection = connection.clone();
            let fut: CloseFuture = Box::pin(async move {
                connection.close().await
            });
            fut
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.close_fut = None;
        Poll::Ready(Ok(result?))
    }
}
