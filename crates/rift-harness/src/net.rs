//! Socket plumbing shared by fake upstreams and clients.
//!
//! - [`create_loopback_listener`] binds an ephemeral loopback port
//! - [`connect_with_retry`] connects within a bounded retry window
//! - [`CountingIo`] counts bytes crossing a hyper-driven socket

use crate::error::{HarnessError, Result};
use crate::settings::{HarnessSettings, IpVersion};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::debug;

/// Bind a TCP listener on the loopback address of `ip_version`, port 0.
///
/// IPv6 listeners are v6-only so a v4 client can never sneak in through a
/// dual-stack socket.
pub fn create_loopback_listener(ip_version: IpVersion) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::new(ip_version.loopback(), 0);
    let domain = match ip_version {
        IpVersion::V4 => Domain::IPV4,
        IpVersion::V6 => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if ip_version == IpVersion::V6 {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Connect to `addr`, retrying until the settings' connect window closes.
///
/// The proxy may still be binding when a scenario starts, so refused
/// connections are retried rather than reported immediately.
pub async fn connect_with_retry(addr: SocketAddr, settings: &HarnessSettings) -> Result<TcpStream> {
    let deadline = Instant::now() + settings.connect_timeout();
    let interval = settings.connect_retry_interval();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let failure = match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                debug!(%addr, attempts, "connected");
                return Ok(stream);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connect timed out".to_string(),
        };

        if Instant::now() + interval >= deadline {
            return Err(HarnessError::ConnectFailed {
                addr,
                attempts,
                reason: failure,
            });
        }
        debug!(%addr, attempts, reason = %failure, "connect failed, retrying");
        tokio::time::sleep(interval).await;
    }
}

/// Byte counters shared between a [`CountingIo`] and its owner.
#[derive(Debug, Default)]
pub struct ByteCounters {
    received: AtomicUsize,
    sent: AtomicUsize,
}

impl ByteCounters {
    pub fn received(&self) -> usize {
        self.received.load(Ordering::Acquire)
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Acquire)
    }
}

/// Transparent IO wrapper that counts bytes read and written.
#[derive(Debug)]
pub struct CountingIo<T> {
    inner: T,
    counters: Arc<ByteCounters>,
}

impl<T> CountingIo<T> {
    pub fn new(inner: T) -> (Self, Arc<ByteCounters>) {
        let counters = Arc::new(ByteCounters::default());
        (
            Self {
                inner,
                counters: Arc::clone(&counters),
            },
            counters,
        )
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for CountingIo<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let read = buf.filled().len() - before;
            self.counters.received.fetch_add(read, Ordering::AcqRel);
        }
        poll
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for CountingIo<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = poll {
            self.counters.sent.fetch_add(written, Ordering::AcqRel);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
