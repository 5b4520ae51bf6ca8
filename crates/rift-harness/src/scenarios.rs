//! Reusable end-to-end flows.
//!
//! Each function scripts one client/proxy/upstream exchange as an ordered
//! list of actions and runs it against a live [`ScenarioContext`]. They
//! return the handles a caller needs for assertions and assert nothing
//! themselves, so the same flow can check different proxies with different
//! expectations.
//!
//! Flows that need configuration edits come with a `configure_*` helper to
//! call before [`IntegrationTest::initialize`](crate::fixture::IntegrationTest::initialize).

use crate::client::{
    IntegrationCodecClient, IntegrationStreamDecoder, IntegrationTcpClient, RequestEncoder,
};
use crate::config::{
    cluster_name, ConfigMutator, ProxyConfig, Route, DEFAULT_HEALTH_CHECK_FILTER, HTTP_LISTENER,
};
use crate::connection::Connection;
use crate::error::Result;
use crate::fixture::ScenarioContext;
use crate::headers::{HeaderBlock, SCHEME};
use crate::sequencer::{Action, ScenarioError, Slot};
use crate::upstream::{FakeHttpConnection, FakeRawConnection, FakeStream};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;

pub const UPGRADE_REQUEST: &str = "GET /websocket/test HTTP/1.1\r\nHost: host\r\nConnection: \
                                   Upgrade\r\nUpgrade: websocket\r\n\r\n";

pub const UPGRADE_RESPONSE: &str =
    "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";

/// Size of [`UPGRADE_REQUEST`] as the upstream sees it once a proxy that
/// rewrites the path and adds its own request headers has forwarded it.
pub const REWRITTEN_UPGRADE_REQUEST_BYTES: usize = 225;

/// gRPC to HTTP/1.1 bridge; buffers the whole response before sending headers.
pub const GRPC_BRIDGE_FILTER: &str =
    "{ name: envoy.grpc_http1_bridge, config: { deprecated_v1: true } }";

/// Response body size that overflows a 1 KiB per-connection buffer limit.
pub const ENCODER_LIMIT_RESPONSE_BYTES: usize = 65 * 1024;

/// Headers used by most flows.
pub fn default_request_headers(method: &str) -> HeaderBlock {
    HeaderBlock::request(method, "/test/long/url", "host")
        .with(SCHEME, "http")
        .with("x-user-id", "123")
        .with("x-forwarded-for", "10.0.0.1")
}

/// Route `/websocket/test` to `cluster_0`, rewritten to `/websocket`, with
/// protocol upgrades allowed.
pub fn websocket_route(config: &mut ProxyConfig) {
    let Ok(http) = config.http_connection_manager_mut() else {
        return;
    };
    if let Some(vhost) = http.route_config.virtual_hosts.first_mut() {
        let mut route = Route::prefix("/websocket/test", cluster_name(0));
        route.route.prefix_rewrite = Some("/websocket".to_string());
        route.route.use_websocket = true;
        vhost.routes.push(route);
    }
}

/// Narrow the default route so it does not swallow `/websocket`, then add
/// [`websocket_route`].
pub fn configure_websocket(config: &mut ConfigMutator) -> Result<()> {
    config.set_default_host_and_route("*", "/asd")?;
    config.add_config_modifier(websocket_route)
}

pub fn configure_health_check(config: &mut ConfigMutator) -> Result<()> {
    config.add_filter(DEFAULT_HEALTH_CHECK_FILTER)
}

pub fn configure_encoder_limit(config: &mut ConfigMutator) -> Result<()> {
    config.add_filter(GRPC_BRIDGE_FILTER)?;
    config.set_buffer_limits(1024, 1024)
}

/// Handles from one HTTP request/response exchange.
#[derive(Debug)]
pub struct ExchangeOutcome {
    /// The request as the fake upstream received it.
    pub request: Arc<FakeStream>,
    /// The response as the downstream client received it.
    pub response: Arc<IntegrationStreamDecoder>,
}

#[derive(Debug)]
pub struct TwoRequestsOutcome {
    pub first: ExchangeOutcome,
    pub second: ExchangeOutcome,
}

/// Bytes seen at both ends of a tunnelled connection.
#[derive(Debug)]
pub struct TunnelOutcome {
    pub downstream_data: Bytes,
    pub upstream_data: Bytes,
}

/// Run `actions`, then read the outcome out of the slots they filled.
async fn run<T>(
    ctx: &ScenarioContext,
    actions: Vec<Action>,
    collect: impl FnOnce() -> Result<T>,
) -> std::result::Result<T, ScenarioError> {
    let count = actions.len();
    ctx.execute(actions).await?;
    collect().map_err(|source| ScenarioError {
        index: count,
        label: Some("collect outcome".to_string()),
        source,
    })
}

/// Slots shared by the steps of one HTTP exchange.
#[derive(Clone)]
struct Exchange {
    ctx: ScenarioContext,
    codec: Slot<Arc<IntegrationCodecClient>>,
    encoder: Slot<Arc<RequestEncoder>>,
    response: Slot<Arc<IntegrationStreamDecoder>>,
    upstream: Slot<Arc<FakeHttpConnection>>,
    request: Slot<Arc<FakeStream>>,
}

impl Exchange {
    fn new(ctx: &ScenarioContext) -> Self {
        Self {
            ctx: ctx.clone(),
            codec: Slot::new("codec client"),
            encoder: Slot::new("request encoder"),
            response: Slot::new("response"),
            upstream: Slot::new("upstream connection"),
            request: Slot::new("upstream request"),
        }
    }

    /// Same connections, fresh request and response.
    fn next_request(&self) -> Self {
        Self {
            encoder: Slot::new("request encoder"),
            response: Slot::new("response"),
            request: Slot::new("upstream request"),
            ..self.clone()
        }
    }

    fn step<F, Fut>(&self, label: &str, f: F) -> Action
    where
        F: FnOnce(Exchange) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let exchange = self.clone();
        Action::named(label, move || f(exchange))
    }

    fn outcome(&self) -> Result<ExchangeOutcome> {
        Ok(ExchangeOutcome {
            request: self.request.get()?,
            response: self.response.get()?,
        })
    }

    fn connect(&self) -> Action {
        self.step("connect downstream", |x| async move {
            let port = x.ctx.lookup_port(HTTP_LISTENER)?;
            x.codec.set(x.ctx.make_http_connection(port).await?);
            Ok(())
        })
    }

    fn send_header_only_request(&self) -> Action {
        self.step("send header-only request", |x| async move {
            let response = x
                .codec
                .get()?
                .make_header_only_request(&default_request_headers("GET"))
                .await?;
            x.response.set(response);
            Ok(())
        })
    }

    /// Start a request and send `len` body bytes.
    fn send_request(&self, headers: HeaderBlock, len: usize, end_stream: bool) -> Action {
        self.step("send request", move |x| async move {
            let codec = x.codec.get()?;
            let (encoder, response) = codec.start_request(&headers).await?;
            codec.send_data(&encoder, len, end_stream)?;
            x.encoder.set(Arc::new(encoder));
            x.response.set(response);
            Ok(())
        })
    }

    fn accept_upstream(&self) -> Action {
        self.step("accept upstream connection", |x| async move {
            let upstream = x.ctx.fake_upstream(0)?;
            let connection = upstream.wait_for_http_connection(x.ctx.wait_timeout()).await?;
            x.upstream.set(connection);
            Ok(())
        })
    }

    fn receive_request(&self) -> Action {
        self.step("receive upstream request", |x| async move {
            let stream = x
                .upstream
                .get()?
                .wait_for_new_stream(x.ctx.wait_timeout())
                .await?;
            stream.wait_for_end_stream(x.ctx.wait_timeout()).await?;
            x.request.set(stream);
            Ok(())
        })
    }

    /// Answer with a 200 and `len` body bytes; `len == 0` sends headers only.
    fn respond(&self, len: usize, end_stream: bool) -> Action {
        self.step("send upstream response", move |x| async move {
            let request = x.request.get()?;
            if len == 0 && end_stream {
                request.encode_headers(&HeaderBlock::response(200), true)?;
            } else {
                request.encode_headers(&HeaderBlock::response(200), false)?;
                request.encode_data(len, end_stream)?;
            }
            Ok(())
        })
    }

    fn await_response(&self) -> Action {
        self.step("wait for response", |x| async move {
            x.response
                .get()?
                .wait_for_end_stream(x.ctx.wait_timeout())
                .await
        })
    }

    /// Close downstream, then upstream, and wait for the upstream to go away.
    fn cleanup(&self) -> Vec<Action> {
        vec![
            self.step("close downstream", |x| async move { x.codec.get()?.close().await }),
            self.step("close upstream", |x| async move {
                let upstream = x.upstream.get()?;
                upstream.close().await?;
                upstream.wait_for_disconnect(x.ctx.wait_timeout()).await
            }),
        ]
    }
}

/// Header-only request answered by a header-only 200.
///
/// With `close_upstream` the upstream connection is closed explicitly;
/// without it the pooled connection is left for teardown.
pub async fn header_only_request_and_response(
    ctx: &ScenarioContext,
    close_upstream: bool,
) -> std::result::Result<ExchangeOutcome, ScenarioError> {
    let x = Exchange::new(ctx);
    let mut actions = vec![
        x.connect(),
        x.send_header_only_request(),
        x.accept_upstream(),
        x.receive_request(),
        x.respond(0, true),
        x.await_response(),
    ];
    if close_upstream {
        actions.extend(x.cleanup());
    }
    run(ctx, actions, || x.outcome()).await
}

/// Header-only `GET /healthcheck` with `connection: close`.
///
/// Needs [`configure_health_check`]. The proxy answers the health check
/// itself, then closes the downstream connection.
pub async fn connection_close(
    ctx: &ScenarioContext,
) -> std::result::Result<Arc<IntegrationStreamDecoder>, ScenarioError> {
    let x = Exchange::new(ctx);
    let actions = vec![
        x.connect(),
        x.step("send health check", |x| async move {
            let headers =
                HeaderBlock::request("GET", "/healthcheck", "host").with("connection", "close");
            let response = x.codec.get()?.make_header_only_request(&headers).await?;
            x.response.set(response);
            Ok(())
        }),
        x.await_response(),
        x.step("wait for downstream disconnect", |x| async move {
            x.codec
                .get()?
                .wait_for_disconnect(x.ctx.wait_timeout())
                .await
        }),
    ];
    run(ctx, actions, || x.response.get()).await
}

/// Write `raw` on a fresh TCP connection to `port` and return every byte
/// the proxy sends back before closing the connection.
pub async fn send_raw_http_and_wait_for_response(
    ctx: &ScenarioContext,
    port: u16,
    raw: impl Into<Bytes>,
) -> Result<Bytes> {
    let client = ctx.make_tcp_connection(port).await?;
    client.write(raw)?;
    client.wait_for_disconnect(ctx.wait_timeout()).await?;
    Ok(client.data())
}

/// POST with `request_size` body bytes answered by a 200 with
/// `response_size` body bytes. `big_header` adds a 4 KiB request header.
pub async fn request_and_response_with_body(
    ctx: &ScenarioContext,
    request_size: usize,
    response_size: usize,
    big_header: bool,
) -> std::result::Result<ExchangeOutcome, ScenarioError> {
    let mut headers = default_request_headers("POST");
    if big_header {
        headers.push("big", "a".repeat(4096));
    }

    let x = Exchange::new(ctx);
    let mut actions = vec![
        x.connect(),
        x.send_request(headers, request_size, true),
        x.accept_upstream(),
        x.receive_request(),
        x.respond(response_size, true),
        x.await_response(),
    ];
    actions.extend(x.cleanup());
    run(ctx, actions, || x.outcome()).await
}

/// The upstream sends headers and 512 body bytes, then disconnects.
///
/// Against a conforming proxy the response is left incomplete with a 200
/// status and 512 body bytes, and the downstream connection is closed.
pub async fn upstream_disconnect_before_response_complete(
    ctx: &ScenarioContext,
) -> std::result::Result<ExchangeOutcome, ScenarioError> {
    let x = Exchange::new(ctx);
    let actions = vec![
        x.connect(),
        x.send_header_only_request(),
        x.accept_upstream(),
        x.receive_request(),
        x.respond(512, false),
        x.step("wait for partial body", |x| async move {
            x.response
                .get()?
                .wait_for_body_data(512, x.ctx.wait_timeout())
                .await
        }),
        x.step("disconnect upstream", |x| async move {
            let upstream = x.upstream.get()?;
            upstream.close().await?;
            upstream.wait_for_disconnect(x.ctx.wait_timeout()).await
        }),
        x.await_response(),
        x.step("wait for downstream disconnect", |x| async move {
            x.codec
                .get()?
                .wait_for_disconnect(x.ctx.wait_timeout())
                .await
        }),
    ];
    run(ctx, actions, || x.outcome()).await
}

/// The client sends headers and part of a body, then disconnects.
///
/// The proxy is expected to give up on the upstream request and close the
/// upstream connection; neither request nor response completes.
pub async fn downstream_disconnect_before_request_complete(
    ctx: &ScenarioContext,
) -> std::result::Result<ExchangeOutcome, ScenarioError> {
    let x = Exchange::new(ctx);
    let actions = vec![
        x.connect(),
        x.send_request(default_request_headers("POST"), 1024, false),
        x.accept_upstream(),
        x.step("receive partial request", |x| async move {
            let stream = x
                .upstream
                .get()?
                .wait_for_new_stream(x.ctx.wait_timeout())
                .await?;
            stream.wait_for_body(1024, x.ctx.wait_timeout()).await?;
            x.request.set(stream);
            Ok(())
        }),
        x.step("disconnect downstream", |x| async move { x.codec.get()?.close().await }),
        x.step("wait for upstream disconnect", |x| async move {
            x.upstream
                .get()?
                .wait_for_disconnect(x.ctx.wait_timeout())
                .await
        }),
    ];
    run(ctx, actions, || x.outcome()).await
}

/// Two sequential requests on one downstream connection, both served by
/// the same upstream connection.
pub async fn two_requests(
    ctx: &ScenarioContext,
) -> std::result::Result<TwoRequestsOutcome, ScenarioError> {
    let first = Exchange::new(ctx);
    let second = first.next_request();
    let mut actions = vec![
        first.connect(),
        first.send_request(default_request_headers("POST"), 1024, true),
        first.accept_upstream(),
        first.receive_request(),
        first.respond(512, true),
        first.await_response(),
        second.send_request(default_request_headers("POST"), 512, true),
        second.receive_request(),
        second.respond(1024, true),
        second.await_response(),
    ];
    actions.extend(second.cleanup());
    run(ctx, actions, || {
        Ok(TwoRequestsOutcome {
            first: first.outcome()?,
            second: second.outcome()?,
        })
    })
    .await
}

/// Buffered response headers plus a response body larger than the buffer.
///
/// Needs [`configure_encoder_limit`]. Since the headers were never sent
/// downstream, the proxy can still answer with a 500 instead of hanging.
pub async fn encoder_limit_with_buffered_headers(
    ctx: &ScenarioContext,
) -> std::result::Result<ExchangeOutcome, ScenarioError> {
    let headers = HeaderBlock::request("POST", "/test/long/url", "host")
        .with(SCHEME, "http")
        .with("content-type", "application/grpc")
        .with("x-envoy-retry-grpc-on", "cancelled");

    let x = Exchange::new(ctx);
    let mut actions = vec![
        x.connect(),
        x.send_request(headers, 1024, true),
        x.accept_upstream(),
        x.receive_request(),
        // Body stays open: the limit has to trip before the response ends.
        x.respond(ENCODER_LIMIT_RESPONSE_BYTES, false),
        x.await_response(),
    ];
    actions.extend(x.cleanup());
    run(ctx, actions, || x.outcome()).await
}

/// Slots shared by the steps of a raw tunnel flow.
#[derive(Clone)]
struct Tunnel {
    ctx: ScenarioContext,
    client: Slot<Arc<IntegrationTcpClient>>,
    upstream: Slot<Arc<FakeRawConnection>>,
}

impl Tunnel {
    fn new(ctx: &ScenarioContext) -> Self {
        Self {
            ctx: ctx.clone(),
            client: Slot::new("tcp client"),
            upstream: Slot::new("raw upstream connection"),
        }
    }

    fn step<F, Fut>(&self, label: &str, f: F) -> Action
    where
        F: FnOnce(Tunnel) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let tunnel = self.clone();
        Action::named(label, move || f(tunnel))
    }

    fn outcome(&self) -> Result<TunnelOutcome> {
        Ok(TunnelOutcome {
            downstream_data: self.client.get()?.data(),
            upstream_data: self.upstream.get()?.data(),
        })
    }

    /// Upgrade, then exchange "hello" and "world" through the tunnel.
    fn establish(&self, upstream_header_bytes: usize) -> Vec<Action> {
        vec![
            self.step("connect downstream", |t| async move {
                let port = t.ctx.lookup_port(HTTP_LISTENER)?;
                t.client.set(t.ctx.make_tcp_connection(port).await?);
                Ok(())
            }),
            self.step("send upgrade request", |t| async move {
                t.client.get()?.write(UPGRADE_REQUEST)
            }),
            self.step("accept upstream connection", |t| async move {
                let upstream = t.ctx.fake_upstream(0)?;
                t.upstream
                    .set(upstream.wait_for_raw_connection(t.ctx.wait_timeout()).await?);
                Ok(())
            }),
            self.step("receive upgrade request", move |t| async move {
                t.upstream
                    .get()?
                    .wait_for_data(upstream_header_bytes, t.ctx.wait_timeout())
                    .await
            }),
            self.step("accept upgrade", |t| async move {
                t.upstream.get()?.write(UPGRADE_RESPONSE)
            }),
            self.step("receive upgrade response", |t| async move {
                t.client
                    .get()?
                    .wait_for_payload(UPGRADE_RESPONSE, t.ctx.wait_timeout())
                    .await
            }),
            self.step("send hello", |t| async move { t.client.get()?.write("hello") }),
            self.step("receive hello", move |t| async move {
                t.upstream
                    .get()?
                    .wait_for_data(upstream_header_bytes + "hello".len(), t.ctx.wait_timeout())
                    .await
            }),
            self.step("send world", |t| async move { t.upstream.get()?.write("world") }),
        ]
    }
}

/// WebSocket upgrade through the proxy, then the client disconnects.
///
/// `upstream_header_bytes` is the size of the upgrade request as forwarded
/// by the proxy under test (see [`REWRITTEN_UPGRADE_REQUEST_BYTES`]). Needs
/// [`configure_websocket`].
pub async fn websocket_downstream_disconnect(
    ctx: &ScenarioContext,
    upstream_header_bytes: usize,
) -> std::result::Result<TunnelOutcome, ScenarioError> {
    let t = Tunnel::new(ctx);
    let mut actions = t.establish(upstream_header_bytes);
    actions.extend([
        t.step("receive world", |t| async move {
            let expected = format!("{UPGRADE_RESPONSE}world");
            t.client
                .get()?
                .wait_for_payload(expected, t.ctx.wait_timeout())
                .await
        }),
        t.step("send bye", |t| async move { t.client.get()?.write("bye!") }),
        t.step("disconnect downstream", |t| async move { t.client.get()?.close().await }),
        t.step("receive bye", move |t| async move {
            t.upstream
                .get()?
                .wait_for_data(
                    upstream_header_bytes + "hello".len() + "bye!".len(),
                    t.ctx.wait_timeout(),
                )
                .await
        }),
        t.step("wait for upstream disconnect", |t| async move {
            t.upstream
                .get()?
                .wait_for_disconnect(t.ctx.wait_timeout())
                .await
        }),
    ]);
    run(ctx, actions, || t.outcome()).await
}

/// WebSocket upgrade through the proxy, then the upstream disconnects.
///
/// The client should end up with exactly the upgrade response plus "world".
pub async fn websocket_upstream_disconnect(
    ctx: &ScenarioContext,
    upstream_header_bytes: usize,
) -> std::result::Result<TunnelOutcome, ScenarioError> {
    let t = Tunnel::new(ctx);
    let mut actions = t.establish(upstream_header_bytes);
    actions.extend([
        t.step("disconnect upstream", |t| async move {
            let upstream = t.upstream.get()?;
            upstream.close().await?;
            upstream.wait_for_disconnect(t.ctx.wait_timeout()).await
        }),
        t.step("wait for downstream disconnect", |t| async move {
            t.client
                .get()?
                .wait_for_disconnect(t.ctx.wait_timeout())
                .await
        }),
    ]);
    run(ctx, actions, || t.outcome()).await
}
