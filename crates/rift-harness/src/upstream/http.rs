//! HTTP/1.1 fake upstream connections and their request streams.
//!
//! Each accepted socket is served by hyper's strict http1 server. Every
//! request the proxy sends becomes a [`FakeStream`]; the request body is
//! drained into the stream's state by a background task, and the response is
//! only produced when the scenario encodes it. Anything hyper refuses to
//! parse is recorded and surfaces as a protocol violation on the next
//! stream wait.

use crate::connection::{Connection, ConnectionState};
use crate::error::{HarnessError, Result};
use crate::headers::{HeaderBlock, AUTHORITY, METHOD, PATH};
use crate::monitor::{Check, Monitor};
use crate::net::{ByteCounters, CountingIo};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as body_channel;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::HOST;
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;
type BodySender = body_channel::UnboundedSender<std::result::Result<Frame<Bytes>, Infallible>>;

#[derive(Default)]
struct HttpConnState {
    streams: Vec<Arc<FakeStream>>,
    next_stream: usize,
    protocol_error: Option<String>,
    disconnected: bool,
}

/// An accepted upstream socket speaking HTTP/1.1.
pub struct FakeHttpConnection {
    label: String,
    state: Arc<Monitor<HttpConnState>>,
    counters: Arc<ByteCounters>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    serve: JoinHandle<()>,
}

impl FakeHttpConnection {
    pub(crate) fn spawn(stream: TcpStream, label: String) -> Self {
        let state = Arc::new(Monitor::new(HttpConnState::default()));
        let (io, counters) = CountingIo::new(stream);
        let (close_tx, close_rx) = oneshot::channel::<()>();

        let service_state = Arc::clone(&state);
        let service_label = label.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let state = Arc::clone(&service_state);
            let label = service_label.clone();
            async move { accept_stream(req, state, label).await }
        });

        let task_state = Arc::clone(&state);
        let task_label = label.clone();
        let serve = tokio::spawn(async move {
            let conn = http1::Builder::new().serve_connection(TokioIo::new(io), service);
            tokio::select! {
                result = conn => match result {
                    Ok(()) => debug!(label = %task_label, "connection finished"),
                    Err(e) if e.is_parse() => {
                        warn!(label = %task_label, error = %e, "malformed request");
                        task_state.update(|s| s.protocol_error = Some(e.to_string()));
                    }
                    Err(e) => debug!(label = %task_label, error = %e, "connection error"),
                },
                _ = close_rx => debug!(label = %task_label, "closed locally"),
            }
            task_state.update(|s| {
                s.disconnected = true;
                for stream in &s.streams {
                    stream.on_connection_lost();
                }
            });
        });

        Self {
            label,
            state,
            counters,
            close_tx: Mutex::new(Some(close_tx)),
            serve,
        }
    }

    /// Wait for the next request the proxy sends on this connection.
    ///
    /// Streams are handed out in arrival order, each exactly once. A request
    /// hyper could not parse fails the wait with a protocol violation.
    pub async fn wait_for_new_stream(&self, timeout: Duration) -> Result<Arc<FakeStream>> {
        let label = &self.label;
        self.state
            .wait_until(&format!("{label} to receive a new stream"), timeout, |s| {
                if let Some(stream) = s.streams.get(s.next_stream) {
                    s.next_stream += 1;
                    Check::Ready(Arc::clone(stream))
                } else if let Some(error) = &s.protocol_error {
                    Check::Failed(HarnessError::ProtocolViolation(format!("{label}: {error}")))
                } else if s.disconnected {
                    Check::Failed(HarnessError::Disconnected(label.clone()))
                } else {
                    Check::Pending
                }
            })
            .await
    }

    /// Number of requests seen so far, claimed or not.
    pub fn stream_count(&self) -> usize {
        self.state.read(|s| s.streams.len())
    }

    pub fn protocol_error(&self) -> Option<String> {
        self.state.read(|s| s.protocol_error.clone())
    }
}

#[async_trait]
impl Connection for FakeHttpConnection {
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
            // Err means the serve task already ended on its own.
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

impl std::fmt::Debug for FakeHttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeHttpConnection")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("streams", &self.stream_count())
            .finish()
    }
}

impl Drop for FakeHttpConnection {
    fn drop(&mut self) {
        self.serve.abort();
    }
}

async fn accept_stream(
    req: Request<Incoming>,
    conn: Arc<Monitor<HttpConnState>>,
    label: String,
) -> Result<Response<ResponseBody>> {
    let (parts, body) = req.into_parts();
    let (head_tx, head_rx) = oneshot::channel();
    let stream = conn.update(|s| {
        let stream = Arc::new(FakeStream::new(
            format!("{label}/stream#{}", s.streams.len()),
            parts,
            head_tx,
        ));
        s.streams.push(Arc::clone(&stream));
        stream
    });
    debug!(
        label = %stream.label,
        method = %stream.head.method,
        uri = %stream.head.uri,
        "new stream"
    );

    tokio::spawn(read_request_body(
        body,
        Arc::clone(&stream.state),
        stream.label.clone(),
    ));

    // A reset request never gets a response; failing the service ends the
    // connection.
    let what = format!("{} reset", stream.label);
    let reset = stream.state.wait_unbounded(&what, |s| match &s.reset {
        Some(reason) => Check::Ready(reason.clone()),
        None => Check::Pending,
    });
    tokio::select! {
        head = head_rx => head.map_err(|_| {
            HarnessError::usage(format!(
                "{}: stream dropped before response headers were encoded",
                stream.label
            ))
        }),
        reason = reset => {
            debug!(label = %stream.label, reason = ?reason, "stream reset before response");
            Err(HarnessError::Disconnected(stream.label.clone()))
        }
    }
}

async fn read_request_body(mut body: Incoming, state: Arc<Monitor<StreamState>>, label: String) {
    loop {
        match body.frame().await {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => state.update(|s| s.body.extend_from_slice(&data)),
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        state.update(|s| s.trailers = Some(trailers));
                    }
                }
            },
            Some(Err(e)) => {
                debug!(%label, error = %e, "request body aborted");
                state.update(|s| s.mark_reset(e.to_string()));
                return;
            }
            None => {
                state.update(StreamState::mark_end_stream);
                return;
            }
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    body: Vec<u8>,
    trailers: Option<HeaderMap>,
    end_stream: bool,
    reset: Option<String>,
}

impl StreamState {
    fn mark_end_stream(&mut self) {
        if self.reset.is_none() {
            self.end_stream = true;
        }
    }

    fn mark_reset(&mut self, reason: String) {
        if !self.end_stream && self.reset.is_none() {
            self.reset = Some(reason);
        }
    }
}

enum Encoder {
    AwaitingHeaders(oneshot::Sender<Response<ResponseBody>>),
    Streaming(BodySender),
    Finished,
}

/// One request received by a [`FakeHttpConnection`], plus the means to
/// answer it.
///
/// The request side fills in asynchronously; the `wait_for_*` methods block
/// on it. The response side is driven explicitly: headers first, then any
/// number of data frames, then optionally trailers.
pub struct FakeStream {
    label: String,
    head: Parts,
    state: Arc<Monitor<StreamState>>,
    encoder: Mutex<Encoder>,
}

impl FakeStream {
    fn new(label: String, head: Parts, head_tx: oneshot::Sender<Response<ResponseBody>>) -> Self {
        Self {
            label,
            head,
            state: Arc::new(Monitor::new(StreamState::default())),
            encoder: Mutex::new(Encoder::AwaitingHeaders(head_tx)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn path(&self) -> &str {
        self.head
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// The request head as a header block, pseudo-headers included.
    pub fn header_block(&self) -> HeaderBlock {
        let mut block = HeaderBlock::new();
        block.push(METHOD, self.head.method.as_str());
        block.push(PATH, self.path());
        if let Some(host) = self.head.headers.get(HOST) {
            block.push(AUTHORITY, String::from_utf8_lossy(host.as_bytes()));
        }
        for (name, value) in HeaderBlock::from_header_map(&self.head.headers).iter() {
            block.push(name, value);
        }
        block
    }

    /// True once the whole request, body and trailers included, has arrived.
    pub fn complete(&self) -> bool {
        self.state.read(|s| s.end_stream)
    }

    pub fn body(&self) -> Bytes {
        self.state.read(|s| Bytes::copy_from_slice(&s.body))
    }

    pub fn body_length(&self) -> usize {
        self.state.read(|s| s.body.len())
    }

    pub fn trailers(&self) -> Option<HeaderMap> {
        self.state.read(|s| s.trailers.clone())
    }

    pub fn reset_reason(&self) -> Option<String> {
        self.state.read(|s| s.reset.clone())
    }

    /// Wait until the request has fully arrived.
    ///
    /// Fails with [`HarnessError::IncompleteRequest`] if the proxy goes away
    /// first.
    pub async fn wait_for_end_stream(&self, timeout: Duration) -> Result<()> {
        self.state
            .wait_until(&format!("{} end of stream", self.label), timeout, |s| {
                if s.end_stream {
                    Check::Ready(())
                } else if s.reset.is_some() {
                    Check::Failed(HarnessError::IncompleteRequest)
                } else {
                    Check::Pending
                }
            })
            .await
    }

    /// Wait until at least `count` request body bytes have arrived.
    pub async fn wait_for_body(&self, count: usize, timeout: Duration) -> Result<()> {
        self.state
            .wait_until(
                &format!("{} to receive {count} body bytes", self.label),
                timeout,
                |s| {
                    if s.body.len() >= count {
                        Check::Ready(())
                    } else if s.end_stream || s.reset.is_some() {
                        Check::Failed(HarnessError::ConnectionClosedEarly {
                            expected: count,
                            received: s.body.len(),
                        })
                    } else {
                        Check::Pending
                    }
                },
            )
            .await
    }

    /// Wait until the request was cut off before completing.
    pub async fn wait_for_reset(&self, timeout: Duration) -> Result<()> {
        self.state
            .wait_until(&format!("{} reset", self.label), timeout, |s| {
                if s.reset.is_some() {
                    Check::Ready(())
                } else if s.end_stream {
                    Check::Failed(HarnessError::usage(format!(
                        "{}: stream completed normally",
                        self.label
                    )))
                } else {
                    Check::Pending
                }
            })
            .await
    }

    /// Send the response head. With `end_stream` the response has no body.
    pub fn encode_headers(&self, headers: &HeaderBlock, end_stream: bool) -> Result<()> {
        let mut encoder = self.encoder.lock();
        if !matches!(*encoder, Encoder::AwaitingHeaders(_)) {
            return Err(HarnessError::usage(format!(
                "{}: response headers already encoded",
                self.label
            )));
        }

        let (body, next) = if end_stream {
            (Empty::<Bytes>::new().boxed_unsync(), Encoder::Finished)
        } else {
            let (tx, rx) = body_channel::unbounded();
            (StreamBody::new(rx).boxed_unsync(), Encoder::Streaming(tx))
        };
        let response = headers.into_response(body)?;

        let Encoder::AwaitingHeaders(head_tx) = std::mem::replace(&mut *encoder, next) else {
            return Err(HarnessError::usage(format!("{}: encoder state lost", self.label)));
        };
        head_tx
            .send(response)
            .map_err(|_| HarnessError::Disconnected(self.label.clone()))
    }

    /// Send `len` bytes of filler body.
    pub fn encode_data(&self, len: usize, end_stream: bool) -> Result<()> {
        self.encode_body(vec![b'a'; len], end_stream)
    }

    pub fn encode_body(&self, data: impl Into<Bytes>, end_stream: bool) -> Result<()> {
        self.send_frame(Frame::data(data.into()), end_stream)
    }

    /// Send trailers; this always ends the response.
    pub fn encode_trailers(&self, trailers: &HeaderBlock) -> Result<()> {
        let map = trailers.into_header_map()?;
        self.send_frame(Frame::trailers(map), true)
    }

    fn send_frame(&self, frame: Frame<Bytes>, end_stream: bool) -> Result<()> {
        let mut encoder = self.encoder.lock();
        let Encoder::Streaming(tx) = &*encoder else {
            return Err(HarnessError::usage(format!(
                "{}: response body is not open",
                self.label
            )));
        };
        tx.unbounded_send(Ok(frame))
            .map_err(|_| HarnessError::Disconnected(self.label.clone()))?;
        if end_stream {
            *encoder = Encoder::Finished;
        }
        Ok(())
    }

    fn on_connection_lost(&self) {
        self.state
            .update(|s| s.mark_reset("connection closed".to_string()));
    }
}

impl std::fmt::Debug for FakeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeStream")
            .field("label", &self.label)
            .field("method", &self.head.method)
            .field("uri", &self.head.uri)
            .finish()
    }
}
