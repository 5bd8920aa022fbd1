//! PDU framing over a byte stream
//!
//! Connection-oriented PDUs are self-delimiting via the `frag_length` field
//! of the header, so any ordered byte stream (TCP, a named pipe, an
//! in-memory duplex) can carry them.

use crate::error::{Result, RpcError};
use crate::pdu::{Pdu, PduHeader};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Largest fragment accepted or sent by default
pub const DEFAULT_MAX_PDU_SIZE: usize = 65536;

/// Reads and writes whole fragments
pub struct PduTransport<T> {
    inner: T,
    max_pdu_size: usize,
    read_buf: BytesMut,
}

impl<T> PduTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_pdu_size(mut self, max_size: usize) -> Self {
        self.max_pdu_size = max_size;
        self
    }

    pub fn max_pdu_size(&self) -> usize {
        self.max_pdu_size
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: AsyncRead + Unpin> PduTransport<T> {
    /// Read one complete fragment
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        while self.read_buf.len() < PduHeader::SIZE {
            if self.fill_buf().await? == 0 {
                return Err(if self.read_buf.is_empty() {
                    RpcError::ConnectionClosed
                } else {
                    RpcError::Transport(format!(
                        "connection closed inside a PDU header ({} bytes)",
                        self.read_buf.len()
                    ))
                });
            }
        }

        let header = PduHeader::decode(&self.read_buf)?;
        let frag_length = usize::from(header.frag_length);
        if frag_length > self.max_pdu_size {
            return Err(RpcError::PduTooLarge {
                size: frag_length,
                max: self.max_pdu_size,
            });
        }

        while self.read_buf.len() < frag_length {
            if self.fill_buf().await? == 0 {
                return Err(RpcError::Transport(format!(
                    "incomplete PDU: expected {} bytes, got {}",
                    frag_length,
                    self.read_buf.len()
                )));
            }
        }

        trace!(
            "received {:?} fragment: call_id={} len={}",
            header.packet_type,
            header.call_id,
            frag_length
        );
        Ok(self.read_buf.split_to(frag_length).freeze())
    }

    /// Read and decode one fragment
    pub async fn read_pdu(&mut self) -> Result<Pdu> {
        let data = self.read_frame().await?;
        Pdu::decode(data)
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < 4096 {
            self.read_buf.reserve(8192);
        }
        Ok(self.inner.read_buf(&mut self.read_buf).await?)
    }
}

impl<T: AsyncWrite + Unpin> PduTransport<T> {
    /// Write one already encoded fragment
    pub async fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.max_pdu_size {
            return Err(RpcError::PduTooLarge {
                size: data.len(),
                max: self.max_pdu_size,
            });
        }
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Encode and write a PDU
    pub async fn write_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        let data = pdu.encode()?;
        trace!(
            "sending {:?} fragment: call_id={} len={}",
            pdu.packet_type(),
            pdu.call_id(),
            data.len()
        );
        self.write_frame(&data).await
    }

    /// Close the write half of the stream
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
