//! Raw TCP client: a byte tunnel through the proxy.

use crate::connection::{Connection, ConnectionState, RawPipe};
use crate::error::Result;
use crate::net::connect_with_retry;
use crate::settings::HarnessSettings;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

/// Downstream client that writes and reads unframed bytes.
///
/// Used for TCP proxying and for hand-written HTTP such as WebSocket
/// upgrades, where the exact bytes on the wire matter.
#[derive(Debug)]
pub struct IntegrationTcpClient {
    pipe: RawPipe,
}

impl IntegrationTcpClient {
    /// Open one connection to `addr`, retrying within the connect window.
    pub async fn connect(addr: SocketAddr, settings: &HarnessSettings) -> Result<Self> {
        let stream = connect_with_retry(addr, settings).await?;
        let local = stream.local_addr()?;
        debug!(%addr, %local, "tcp client connected");
        Ok(Self {
            pipe: RawPipe::spawn(stream, format!("tcp-client({local})")),
        })
    }

    pub fn write(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.pipe.write(bytes)
    }

    pub async fn wait_for_data(&self, count: usize, timeout: Duration) -> Result<()> {
        self.pipe.wait_for_data(count, timeout).await
    }

    /// Wait until the bytes received so far begin with `expected`.
    pub async fn wait_for_payload(&self, expected: impl AsRef<[u8]>, timeout: Duration) -> Result<()> {
        self.pipe.wait_for_payload(expected.as_ref(), timeout).await
    }

    pub fn data(&self) -> Bytes {
        self.pipe.data()
    }

    /// Half close: send FIN but keep reading.
    pub fn close_write(&self) -> Result<()> {
        self.pipe.close_write()
    }
}

#[async_trait]
impl Connection for IntegrationTcpClient {
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
