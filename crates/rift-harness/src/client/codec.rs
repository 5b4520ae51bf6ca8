//! HTTP/1.1 codec client driven through hyper's client connection.

use super::IntegrationStreamDecoder;
use crate::connection::{Connection, ConnectionState};
use crate::error::{HarnessError, Result};
use crate::headers::HeaderBlock;
use crate::monitor::{Check, Monitor};
use crate::net::{connect_with_retry, ByteCounters, CountingIo};
use crate::settings::HarnessSettings;
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as body_channel;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

type RequestBody = UnsyncBoxBody<Bytes, Infallible>;
type BodySender = body_channel::UnboundedSender<std::result::Result<Frame<Bytes>, Infallible>>;

#[derive(Debug, Default)]
struct ClientState {
    disconnected: bool,
}

/// Downstream HTTP/1.1 client; one connection, any number of sequential
/// requests.
pub struct IntegrationCodecClient {
    label: String,
    wait_timeout: Duration,
    sender: tokio::sync::Mutex<SendRequest<RequestBody>>,
    state: Arc<Monitor<ClientState>>,
    counters: Arc<ByteCounters>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    driver: JoinHandle<()>,
    requests: AtomicUsize,
}

impl IntegrationCodecClient {
    /// Open one connection to `addr` and complete the HTTP/1.1 handshake.
    pub async fn connect(addr: SocketAddr, settings: &HarnessSettings) -> Result<Self> {
        let stream = connect_with_retry(addr, settings).await?;
        let label = format!("codec-client({})", stream.local_addr()?);
        let (io, counters) = CountingIo::new(stream);
        let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;

        let state = Arc::new(Monitor::new(ClientState::default()));
        let (close_tx, close_rx) = oneshot::channel::<()>();
        let task_state = Arc::clone(&state);
        let task_label = label.clone();
        let driver = tokio::spawn(async move {
            tokio::select! {
                result = conn => match result {
                    Ok(()) => debug!(label = %task_label, "connection closed by peer"),
                    Err(e) => debug!(label = %task_label, error = %e, "connection error"),
                },
                _ = close_rx => debug!(label = %task_label, "closed locally"),
            }
            task_state.update(|s| s.disconnected = true);
        });
        debug!(%label, %addr, "codec client connected");

        Ok(Self {
            label,
            wait_timeout: settings.wait_timeout(),
            sender: tokio::sync::Mutex::new(sender),
            state,
            counters,
            close_tx: Mutex::new(Some(close_tx)),
            driver,
            requests: AtomicUsize::new(0),
        })
    }

    /// Send a request with no body. The returned decoder fills in as the
    /// response arrives.
    pub async fn make_header_only_request(
        &self,
        headers: &HeaderBlock,
    ) -> Result<Arc<IntegrationStreamDecoder>> {
        let request = headers.into_request(Empty::<Bytes>::new().boxed_unsync())?;
        self.issue(request).await
    }

    /// Send request headers and leave the body open for
    /// [`send_data`](Self::send_data).
    pub async fn start_request(
        &self,
        headers: &HeaderBlock,
    ) -> Result<(RequestEncoder, Arc<IntegrationStreamDecoder>)> {
        let (tx, rx) = body_channel::unbounded();
        let request = headers.into_request(StreamBody::new(rx).boxed_unsync())?;
        let decoder = self.issue(request).await?;
        let encoder = RequestEncoder {
            label: decoder.label().to_string(),
            tx: Mutex::new(Some(tx)),
        };
        Ok((encoder, decoder))
    }

    /// Stream `len` bytes of filler body on an in-flight request.
    pub fn send_data(&self, encoder: &RequestEncoder, len: usize, end_stream: bool) -> Result<()> {
        encoder.send_data(len, end_stream)
    }

    async fn issue(&self, request: Request<RequestBody>) -> Result<Arc<IntegrationStreamDecoder>> {
        if self.state.read(|s| s.disconnected) {
            return Err(HarnessError::usage(format!(
                "{}: request on a closed connection",
                self.label
            )));
        }
        let index = self.requests.fetch_add(1, Ordering::AcqRel);
        let decoder = Arc::new(IntegrationStreamDecoder::new(format!(
            "{}/request#{index}",
            self.label
        )));
        debug!(label = %decoder.label(), method = %request.method(), uri = %request.uri(), "sending request");

        let response = {
            let mut sender = self.sender.lock().await;
            tokio::time::timeout(self.wait_timeout, sender.ready())
                .await
                .map_err(|_| {
                    HarnessError::timeout(
                        format!("{} to accept another request", self.label),
                        self.wait_timeout,
                    )
                })??;
            sender.send_request(request)
        };
        tokio::spawn(drive_response(response, Arc::clone(&decoder)));
        Ok(decoder)
    }
}

#[async_trait]
impl Connection for IntegrationCodecClient {
    fn label(&self) -> &str {
        &self.label
    }

    fn bytes_received(&self) -> usize {
        self.counters.received()
    }

    fn state(&self) -> ConnectionState {
        if self.state.read(|s| s.disconnected) {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(tx) = self.close_tx.lock().take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn wait_for_disconnect(&self, timeout: Duration) -> Result<()> {
        self.state
            .wait_until(&format!("{} to disconnect", self.label), timeout, |s| {
                if s.disconnected {
                    Check::Ready(())
                } else {
                    Check::Pending
                }
            })
            .await
    }
}

impl Drop for IntegrationCodecClient {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive_response(
    response: impl Future<Output = hyper::Result<Response<Incoming>>>,
    decoder: Arc<IntegrationStreamDecoder>,
) {
    let response = match response.await {
        Ok(response) => response,
        Err(e) => {
            debug!(label = %decoder.label(), error = %e, "request failed");
            decoder.on_reset(e.to_string());
            return;
        }
    };

    let (parts, mut body) = response.into_parts();
    debug!(label = %decoder.label(), status = %parts.status, "response headers");
    decoder.on_headers(parts.status, parts.headers);
    loop {
        match body.frame().await {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => decoder.on_data(&data),
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        decoder.on_trailers(trailers);
                    }
                }
            },
            Some(Err(e)) => {
                debug!(label = %decoder.label(), error = %e, "response body aborted");
                decoder.on_reset(e.to_string());
                return;
            }
            None => {
                decoder.on_complete();
                return;
            }
        }
    }
}

/// Write handle for the body of a request opened with
/// [`IntegrationCodecClient::start_request`].
pub struct RequestEncoder {
    label: String,
    tx: Mutex<Option<BodySender>>,
}

impl RequestEncoder {
    /// Send `len` bytes of filler body.
    pub fn send_data(&self, len: usize, end_stream: bool) -> Result<()> {
        self.send_body(vec![b'a'; len], end_stream)
    }

    pub fn send_body(&self, data: impl Into<Bytes>, end_stream: bool) -> Result<()> {
        self.send_frame(Frame::data(data.into()), end_stream)
    }

    /// Send trailers; this ends the request.
    pub fn send_trailers(&self, trailers: &HeaderBlock) -> Result<()> {
        let map = trailers.into_header_map()?;
        self.send_frame(Frame::trailers(map), true)
    }

    fn send_frame(&self, frame: Frame<Bytes>, end_stream: bool) -> Result<()> {
        let mut tx = self.tx.lock();
        let Some(sender) = tx.as_ref() else {
            return Err(HarnessError::usage(format!(
                "{}: request body already ended",
                self.label
            )));
        };
        sender
            .unbounded_send(Ok(frame))
            .map_err(|_| HarnessError::Disconnected(self.label.clone()))?;
        if end_stream {
            tx.take();
        }
        Ok(())
    }
}
