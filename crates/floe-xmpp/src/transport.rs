//! Transport collaborator seam.
//!
//! The core speaks to the network through the traits below so that TLS,
//! WebSocket, or in-memory test transports can be swapped in without the
//! session logic changing. A plain-TCP implementation is provided.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ClientError;

const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// Opens transport connections, yielding independently-owned read and
/// write halves so inbound dispatch and outbound sends can proceed
/// concurrently.
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    /// Connect to `host:port` and return the stream halves.
    async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>), ClientError>;
}

/// The inbound half of a transport connection.
#[async_trait]
pub trait TransportReader: Send + std::fmt::Debug + 'static {
    /// Receive the next chunk of bytes. `Ok(None)` means the peer closed
    /// the connection.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ClientError>;
}

/// The outbound half of a transport connection.
#[async_trait]
pub trait TransportWriter: Send + std::fmt::Debug + 'static {
    /// Write the whole buffer and flush. One call is one atomic unit with
    /// respect to the write-serialization lock above this layer.
    async fn send(&mut self, data: &[u8]) -> Result<(), ClientError>;

    /// Shut down the outbound side.
    async fn close(&mut self) -> Result<(), ClientError>;
}

/// Plain TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>), ClientError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ClientError::transport(format!("connect to {}:{}: {}", host, port, e)))?;

        debug!(host = %host, port = port, "TCP connection established");

        let (read_half, write_half) = stream.into_split();
        Ok((
            Box::new(TcpReader { inner: read_half }),
            Box::new(TcpWriter { inner: write_half }),
        ))
    }
}

#[derive(Debug)]
struct TcpReader {
    inner: tokio::net::tcp::OwnedReadHalf,
}

#[async_trait]
impl TransportReader for TcpReader {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ClientError> {
        let mut chunk = vec![0_u8; RECV_BUFFER_SIZE];
        let bytes_read = self.inner.read(&mut chunk).await?;

        if bytes_read == 0 {
            return Ok(None);
        }

        chunk.truncate(bytes_read);
        Ok(Some(chunk))
    }
}

#[derive(Debug)]
struct TcpWriter {
    inner: tokio::net::tcp::OwnedWriteHalf,
}

#[async_trait]
impl TransportWriter for TcpWriter {
    async fn send(&mut self, data: &[u8]) -> Result<(), ClientError> {
        if data.is_empty() {
            return Ok(());
        }

        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
