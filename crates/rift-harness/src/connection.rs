//! Capabilities shared by every harness connection, and the raw byte pipe
//! behind both the raw fake upstream connection and the TCP client.

use crate::error::{HarnessError, Result};
use crate::monitor::{Check, Monitor};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Lifecycle of a harness connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Our write side is shut down; reads continue.
    HalfClosed,
    Disconnected,
}

/// What every connection can do, fake or client, raw or HTTP.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Human-readable identity used in logs and errors.
    fn label(&self) -> &str;

    /// Total bytes read from the socket so far. Never decreases.
    fn bytes_received(&self) -> usize;

    fn state(&self) -> ConnectionState;

    /// Close the connection, flushing anything already queued.
    async fn close(&self) -> Result<()>;

    /// Wait until the connection is gone, closed by either side.
    async fn wait_for_disconnect(&self, timeout: Duration) -> Result<()>;
}

#[derive(Debug)]
struct PipeState {
    received: Vec<u8>,
    peer_closed: bool,
    write_shutdown: bool,
    locally_closed: bool,
    close_requested: bool,
}

impl PipeState {
    fn lifecycle(&self) -> ConnectionState {
        if self.peer_closed || self.locally_closed {
            ConnectionState::Disconnected
        } else if self.write_shutdown {
            ConnectionState::HalfClosed
        } else {
            ConnectionState::Connected
        }
    }
}

enum WriteOp {
    Data(Bytes),
    /// Send FIN; with `full` also stop reading so the socket goes away.
    Shutdown { full: bool },
}

/// An unframed, bidirectional byte pipe over one TCP socket.
///
/// A reader task appends everything that arrives to an accumulating buffer; a
/// writer task drains a queue, so `write` never blocks on delivery.
pub struct RawPipe {
    label: String,
    state: Arc<Monitor<PipeState>>,
    writes: mpsc::UnboundedSender<WriteOp>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RawPipe {
    pub fn spawn(stream: TcpStream, label: impl Into<String>) -> Self {
        let label = label.into();
        let state = Arc::new(Monitor::new(PipeState {
            received: Vec::new(),
            peer_closed: false,
            write_shutdown: false,
            locally_closed: false,
            close_requested: false,
        }));
        let (read_half, write_half) = stream.into_split();
        let (writes, queue) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&state), label.clone()));
        let writer = tokio::spawn(write_loop(
            write_half,
            queue,
            Arc::clone(&state),
            reader.abort_handle(),
            label.clone(),
        ));

        Self {
            label,
            state,
            writes,
            reader,
            writer,
        }
    }

    /// Queue bytes for the peer.
    pub fn write(&self, bytes: impl Into<Bytes>) -> Result<()> {
        let closing = self.state.read(|s| s.close_requested || s.write_shutdown);
        if closing {
            return Err(HarnessError::usage(format!(
                "{}: write after close",
                self.label
            )));
        }
        self.writes
            .send(WriteOp::Data(bytes.into()))
            .map_err(|_| HarnessError::usage(format!("{}: writer is gone", self.label)))
    }

    /// Wait until at least `count` bytes have been received in total.
    pub async fn wait_for_data(&self, count: usize, timeout: Duration) -> Result<()> {
        self.state
            .wait_until(
                &format!("{} to receive {count} bytes", self.label),
                timeout,
                |s| {
                    if s.received.len() >= count {
                        Check::Ready(())
                    } else if s.peer_closed || s.locally_closed {
                        Check::Failed(HarnessError::ConnectionClosedEarly {
                            expected: count,
                            received: s.received.len(),
                        })
                    } else {
                        Check::Pending
                    }
                },
            )
            .await
    }

    /// Wait until the received bytes begin with `expected`.
    pub async fn wait_for_payload(&self, expected: &[u8], timeout: Duration) -> Result<()> {
        self.wait_for_data(expected.len(), timeout).await?;
        self.state.read(|s| {
            if s.received.starts_with(expected) {
                Ok(())
            } else {
                Err(HarnessError::ProtocolViolation(format!(
                    "{}: expected payload {:?}, received {:?}",
                    self.label,
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&s.received[..expected.len()])
                )))
            }
        })
    }

    pub fn data(&self) -> Bytes {
        self.state.read(|s| Bytes::copy_from_slice(&s.received))
    }

    /// Shut down our write side after queued writes drain; keep reading.
    pub fn close_write(&self) -> Result<()> {
        self.shutdown(false)
    }

    fn shutdown(&self, full: bool) -> Result<()> {
        let already = self.state.update(|s| {
            let already = s.close_requested;
            s.close_requested = true;
            already
        });
        if already {
            if full {
                // A half close may still be queued; stop reading now.
                self.reader.abort();
                self.state.update(|s| s.locally_closed = true);
            }
            return Ok(());
        }
        self.writes
            .send(WriteOp::Shutdown { full })
            .map_err(|_| HarnessError::usage(format!("{}: writer is gone", self.label)))
    }
}

#[async_trait]
impl Connection for RawPipe {
    fn label(&self) -> &str {
        &self.label
    }

    fn bytes_received(&self) -> usize {
        self.state.read(|s| s.received.len())
    }

    fn state(&self) -> ConnectionState {
        self.state.read(PipeState::lifecycle)
    }

    async fn close(&self) -> Result<()> {
        let write_already_shut = self
            .state
            .read(|s| s.write_shutdown && !s.locally_closed);
        if write_already_shut {
            // Write side already gone; just stop reading.
            self.reader.abort();
            self.state.update(|s| s.locally_closed = true);
            return Ok(());
        }
        match self.shutdown(true) {
            Ok(()) => Ok(()),
            // The writer already exited because the socket died.
            Err(_) if self.state() == ConnectionState::Disconnected => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn wait_for_disconnect(&self, timeout: Duration) -> Result<()> {
        self.state
            .wait_until(&format!("{} to disconnect", self.label), timeout, |s| {
                if s.peer_closed || s.locally_closed {
                    Check::Ready(())
                } else {
                    Check::Pending
                }
            })
            .await
    }
}

impl std::fmt::Debug for RawPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawPipe")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("bytes_received", &self.bytes_received())
            .finish()
    }
}

impl Drop for RawPipe {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, state: Arc<Monitor<PipeState>>, label: String) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                debug!(%label, "peer closed");
                break;
            }
            Ok(n) => state.update(|s| s.received.extend_from_slice(&buf[..n])),
            Err(e) => {
                debug!(%label, error = %e, "read failed");
                break;
            }
        }
    }
    state.update(|s| s.peer_closed = true);
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<WriteOp>,
    state: Arc<Monitor<PipeState>>,
    reader: AbortHandle,
    label: String,
) {
    while let Some(op) = queue.recv().await {
        match op {
            WriteOp::Data(bytes) => {
                if let Err(e) = write_half.write_all(&bytes).await {
                    warn!(%label, error = %e, "write failed");
                    state.update(|s| s.peer_closed = true);
                    return;
                }
            }
            WriteOp::Shutdown { full } => {
                if let Err(e) = write_half.shutdown().await {
                    debug!(%label, error = %e, "shutdown failed");
                }
                if full {
                    reader.abort();
                    drop(write_half);
                    debug!(%label, "closed");
                    state.update(|s| {
                        s.write_shutdown = true;
                        s.locally_closed = true;
                    });
                } else {
                    debug!(%label, "write side shut down");
                    state.update(|s| s.write_shutdown = true);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::create_loopback_listener;
    use crate::settings::IpVersion;

    async fn pipe_pair() -> (RawPipe, RawPipe) {
        let listener = create_loopback_listener(IpVersion::V4).unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            RawPipe::spawn(client.unwrap(), "client"),
            RawPipe::spawn(accepted.unwrap().0, "server"),
        )
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_writes_arrive_in_order() {
        let (client, server) = pipe_pair().await;
        for chunk in ["GET ", "/ HTTP/1.1", "\r\n", "\r\n"] {
            client.write(chunk.as_bytes().to_vec()).unwrap();
        }
        server.wait_for_data(18, WAIT).await.unwrap();
        assert_eq!(&server.data()[..], b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(server.bytes_received(), 18);
    }

    #[tokio::test]
    async fn test_wait_for_data_boundary() {
        let (client, server) = pipe_pair().await;
        client.write(&b"abcde"[..]).unwrap();
        server.wait_for_data(5, WAIT).await.unwrap();

        // Already satisfied: returns with a zero timeout.
        server.wait_for_data(5, Duration::ZERO).await.unwrap();

        let err = server
            .wait_for_data(6, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        client.write(&b"f"[..]).unwrap();
        server.wait_for_data(6, WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_early() {
        let (client, server) = pipe_pair().await;
        client.write(&b"abc"[..]).unwrap();
        client.close().await.unwrap();

        let err = server.wait_for_data(10, WAIT).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::ConnectionClosedEarly {
                expected: 10,
                received: 3
            }
        ));
        server.wait_for_disconnect(WAIT).await.unwrap();
        assert_eq!(server.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_flushes_queued_writes() {
        let (client, server) = pipe_pair().await;
        client.write(&b"bye!"[..]).unwrap();
        client.close().await.unwrap();
        client.wait_for_disconnect(WAIT).await.unwrap();

        server.wait_for_disconnect(WAIT).await.unwrap();
        assert_eq!(&server.data()[..], b"bye!");
    }

    #[tokio::test]
    async fn test_write_after_close_is_usage_error() {
        let (client, _server) = pipe_pair().await;
        client.close().await.unwrap();
        let err = client.write(&b"late"[..]).unwrap_err();
        assert!(matches!(err, HarnessError::Usage(_)));
    }

    #[tokio::test]
    async fn test_half_close_keeps_reading() {
        let (client, server) = pipe_pair().await;
        client.close_write().unwrap();
        server.wait_for_disconnect(WAIT).await.unwrap();

        server.write(&b"still here"[..]).unwrap();
        client.wait_for_payload(b"still here", WAIT).await.unwrap();
        assert_eq!(client.state(), ConnectionState::HalfClosed);
    }

    #[tokio::test]
    async fn test_close_after_half_close_is_full_close() {
        let (client, server) = pipe_pair().await;
        client.close_write().unwrap();
        client.close().await.unwrap();
        client.wait_for_disconnect(WAIT).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        server.wait_for_disconnect(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_payload_mismatch_is_protocol_violation() {
        let (client, server) = pipe_pair().await;
        client.write(&b"HTTP/1.1 404"[..]).unwrap();
        let err = server
            .wait_for_payload(b"HTTP/1.1 101", WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolViolation(_)));
    }
}
