//! Raw (unparsed) fake upstream connections.

use crate::connection::{Connection, ConnectionState, RawPipe};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::net::TcpStream;

/// An accepted upstream socket exposed as an accumulating byte buffer.
///
/// Used for TCP proxying and for everything after a protocol upgrade, where
/// the proxy stops framing and just shovels bytes.
#[derive(Debug)]
pub struct FakeRawConnection {
    pipe: RawPipe,
}

impl FakeRawConnection {
    pub(crate) fn spawn(stream: TcpStream, label: String) -> Self {
        Self {
            pipe: RawPipe::spawn(stream, label),
        }
    }

    /// Wait until `count` bytes have arrived in total, across any number of reads.
    pub async fn wait_for_data(&self, count: usize, timeout: Duration) -> Result<()> {
        self.pipe.wait_for_data(count, timeout).await
    }

    /// Wait until the received bytes begin with `expected`.
    pub async fn wait_for_payload(
        &self,
        expected: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<()> {
        self.pipe.wait_for_payload(expected.as_ref(), timeout).await
    }

    /// Queue bytes for the proxy without waiting for delivery.
    pub fn write(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.pipe.write(bytes)
    }

    pub fn data(&self) -> Bytes {
        self.pipe.data()
    }
}

#[async_trait]
impl Connection for FakeRawConnection {
    fn label(&self) -> &str {
        self.pipe.label()
    }

    fn bytes_received(&self) -> usize {
        self.pipe.bytes_received()
    }

    fn state(&self) -> ConnectionState {
        self.pipe.state()
    }

    async fn close(&self) -> Result<()> {
        self.pipe.close().await
    }

    async fn wait_for_disconnect(&self, timeout: Duration) -> Result<()> {
        self.pipe.wait_for_disconnect(timeout).await
    }
}
