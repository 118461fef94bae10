//! Async socket adapter for one PostgreSQL session.
//!
//! [`PgSocket`] exposes the three suspension points the protocol needs:
//! connect (with a timeout), send, and receive. Send and receive are
//! readiness-driven loops over a non-blocking socket, so repeated operations
//! on one connection allocate nothing. `&mut self` on every operation
//! enforces that a socket never carries two in-flight operations.

use std::io;
use std::time::Duration;

use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{PgError, PgResult};

pub struct PgSocket {
    stream: TcpStream,
}

impl PgSocket {
    /// Connect to `host:port`, failing with [`PgError::Timeout`] if the
    /// connect does not complete in time. The timeout closes the pending
    /// socket; there is no cancellation of send or receive.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> PgResult<Self> {
        let addr = format!("{}:{}", host, port);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| PgError::Timeout)??;

        stream.set_nodelay(true)?;
        debug!(%addr, "socket connected");

        Ok(Self { stream })
    }

    /// Write the entire buffer to the socket.
    pub async fn send(&mut self, mut bytes: &[u8]) -> PgResult<()> {
        while !bytes.is_empty() {
            self.stream.ready(Interest::WRITABLE).await?;

            match self.stream.try_write(bytes) {
                Ok(n) => {
                    trace!(n, "socket send");
                    bytes = &bytes[n..];
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Perform a single receive into `buf`, returning the number of bytes
    /// read. A zero-byte read (orderly shutdown by the peer) surfaces as
    /// [`PgError::ConnectionClosed`].
    pub async fn receive(&mut self, buf: &mut [u8]) -> PgResult<usize> {
        loop {
            self.stream.ready(Interest::READABLE).await?;

            match self.stream.try_read(buf) {
                Ok(0) => return Err(PgError::ConnectionClosed),
                Ok(n) => {
                    trace!(n, "socket receive");
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Half-close the write side. Errors are reported, not retried; callers
    /// on the disposal path swallow them.
    pub async fn shutdown(&mut self) -> PgResult<()> {
        use tokio::io::AsyncWriteExt;

        self.stream.shutdown().await?;
        Ok(())
    }
}
