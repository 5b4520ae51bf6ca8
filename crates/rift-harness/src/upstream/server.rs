//! The fake upstream listener and its accept queue.

use super::{FakeHttpConnection, FakeRawConnection};
use crate::connection::Connection;
use crate::error::{HarnessError, Result};
use crate::monitor::{Check, Monitor};
use crate::net::create_loopback_listener;
use crate::settings::IpVersion;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct AcceptQueue {
    sockets: VecDeque<(TcpStream, SocketAddr)>,
    accepted: usize,
    closed: bool,
}

/// A listening fake backend on an ephemeral loopback port.
///
/// Connections are accepted eagerly in the background and queued; the
/// scenario then claims them one at a time, in accept order, choosing for
/// each whether it speaks HTTP or raw bytes.
pub struct FakeUpstream {
    name: String,
    addr: SocketAddr,
    pending: Arc<Monitor<AcceptQueue>>,
    connections: Mutex<Vec<Arc<dyn Connection>>>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl FakeUpstream {
    /// Bind a new fake upstream and start accepting.
    pub async fn bind(name: impl Into<String>, ip_version: IpVersion) -> Result<Self> {
        let name = name.into();
        let listener = create_loopback_listener(ip_version)?;
        let addr = listener.local_addr()?;
        info!("Fake upstream '{}' listening on {}", name, addr);

        let pending = Arc::new(Monitor::new(AcceptQueue::default()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&pending),
            shutdown_rx,
            name.clone(),
        ));

        Ok(Self {
            name,
            addr,
            pending,
            connections: Mutex::new(Vec::new()),
            shutdown_tx,
            accept_task,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Total sockets accepted so far, claimed or not.
    pub fn connection_count(&self) -> usize {
        self.pending.read(|q| q.accepted)
    }

    /// Claim the next accepted socket as an HTTP/1.1 connection.
    pub async fn wait_for_http_connection(
        &self,
        timeout: Duration,
    ) -> Result<Arc<FakeHttpConnection>> {
        let (stream, peer) = self.next_socket(timeout).await?;
        let label = self.next_label("http", peer);
        let connection = Arc::new(FakeHttpConnection::spawn(stream, label));
        self.connections
            .lock()
            .push(Arc::clone(&connection) as Arc<dyn Connection>);
        Ok(connection)
    }

    /// Claim the next accepted socket as a raw byte connection.
    pub async fn wait_for_raw_connection(
        &self,
        timeout: Duration,
    ) -> Result<Arc<FakeRawConnection>> {
        let (stream, peer) = self.next_socket(timeout).await?;
        let label = self.next_label("raw", peer);
        let connection = Arc::new(FakeRawConnection::spawn(stream, label));
        self.connections
            .lock()
            .push(Arc::clone(&connection) as Arc<dyn Connection>);
        Ok(connection)
    }

    /// Stop accepting and close every connection handed out so far.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.pending.update(|q| {
            q.sockets.clear();
            q.closed = true;
        });

        let connections: Vec<_> = self.connections.lock().drain(..).collect();
        let mut first_error = None;
        for connection in connections {
            if let Err(e) = connection.close().await {
                warn!(label = %connection.label(), error = %e, "failed to close connection");
                first_error.get_or_insert(e);
            }
        }
        debug!(name = %self.name, "fake upstream closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn next_socket(&self, timeout: Duration) -> Result<(TcpStream, SocketAddr)> {
        let name = &self.name;
        self.pending
            .wait_until(&format!("a connection on {name}"), timeout, |q| {
                if let Some(socket) = q.sockets.pop_front() {
                    Check::Ready(socket)
                } else if q.closed {
                    Check::Failed(HarnessError::usage(format!("fake upstream '{name}' is closed")))
                } else {
                    Check::Pending
                }
            })
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HarnessError::AcceptTimeout {
                        addr: self.addr,
                        timeout,
                    }
                } else {
                    e
                }
            })
    }

    fn next_label(&self, kind: &str, peer: SocketAddr) -> String {
        let index = self.connections.lock().len();
        format!("{}/{kind}#{index}({peer})", self.name)
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    pending: Arc<Monitor<AcceptQueue>>,
    mut shutdown_rx: broadcast::Receiver<()>,
    name: String,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%name, error = %e, "failed to set TCP_NODELAY");
                        }
                        debug!(%name, %peer, "accepted connection");
                        pending.update(|q| {
                            q.sockets.push_back((stream, peer));
                            q.accepted += 1;
                        });
                    }
                    Err(e) => {
                        error!("Accept error on fake upstream '{}': {}", name, e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Fake upstream '{}' shutting down", name);
                break;
            }
        }
    }
    pending.update(|q| q.closed = true);
}
