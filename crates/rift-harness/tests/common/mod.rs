//! Shared helpers for integration tests.
//!
//! Two in-process proxies stand in for the system under test:
//! - [`RelayLauncher`]: a transparent TCP relay from every listener to the
//!   cluster of the first route
//! - [`BufferingProxyLauncher`]: an HTTP/1.1 proxy that buffers whole
//!   responses and answers 500 when one outgrows the cluster buffer limit;
//!   it also answers a configured health check endpoint itself

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rift_harness::config::{ClusterConfig, ProxyConfig};
use rift_harness::launcher::{ProxyHandle, ProxyLauncher};
use rift_harness::{HarnessError, HarnessSettings, IntegrationTest, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

pub fn settings() -> HarnessSettings {
    HarnessSettings {
        wait_timeout_ms: 5_000,
        connect_timeout_ms: 2_000,
        ..Default::default()
    }
}

pub fn relay_fixture() -> IntegrationTest {
    rift_harness::logging::init_test_logging();
    IntegrationTest::new(settings(), RelayLauncher)
}

pub fn buffering_fixture() -> IntegrationTest {
    rift_harness::logging::init_test_logging();
    IntegrationTest::new(settings(), BufferingProxyLauncher)
}

/// Upstream address for the cluster the first route points at.
fn default_cluster(config: &ProxyConfig) -> Result<ClusterConfig> {
    let name = config
        .listeners
        .iter()
        .filter_map(|l| l.http.as_ref())
        .flat_map(|http| &http.route_config.virtual_hosts)
        .flat_map(|vhost| &vhost.routes)
        .map(|route| route.route.cluster.clone())
        .next()
        .or_else(|| config.clusters.first().map(|c| c.name.clone()))
        .ok_or_else(|| HarnessError::Launch("no cluster to proxy to".into()))?;
    config
        .cluster(&name)
        .cloned()
        .ok_or_else(|| HarnessError::Launch(format!("unknown cluster '{name}'")))
}

fn cluster_addr(cluster: &ClusterConfig) -> Result<SocketAddr> {
    let host = cluster
        .hosts
        .first()
        .ok_or_else(|| HarnessError::Launch(format!("cluster '{}' has no hosts", cluster.name)))?;
    let ip = host
        .address
        .parse()
        .map_err(|e| HarnessError::Launch(format!("bad host address '{}': {e}", host.address)))?;
    Ok(SocketAddr::new(ip, host.port))
}

async fn bind_listeners(config: &ProxyConfig) -> Result<Vec<(String, TcpListener)>> {
    let mut bound = Vec::new();
    for listener in &config.listeners {
        let addr = format!("{}:{}", listener.address, listener.port);
        let addr: SocketAddr = addr
            .parse()
            .or_else(|_| format!("[{}]:{}", listener.address, listener.port).parse())
            .map_err(|e| HarnessError::Launch(format!("bad listener address: {e}")))?;
        bound.push((listener.name.clone(), TcpListener::bind(addr).await?));
    }
    Ok(bound)
}

struct InProcessProxy {
    ports: HashMap<String, u16>,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl ProxyHandle for InProcessProxy {
    fn listener_port(&self, name: &str) -> Option<u16> {
        self.ports.get(name).copied()
    }

    async fn shutdown(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

/// Byte-for-byte relay; every downstream connection gets its own upstream
/// connection.
pub struct RelayLauncher;

#[async_trait]
impl ProxyLauncher for RelayLauncher {
    async fn launch(&self, config: &ProxyConfig) -> Result<Box<dyn ProxyHandle>> {
        let upstream = cluster_addr(&default_cluster(config)?)?;
        let mut ports = HashMap::new();
        let mut tasks = Vec::new();
        for (name, listener) in bind_listeners(config).await? {
            ports.insert(name, listener.local_addr()?.port());
            tasks.push(tokio::spawn(relay_loop(listener, upstream)));
        }
        Ok(Box::new(InProcessProxy { ports, tasks }))
    }
}

async fn relay_loop(listener: TcpListener, upstream: SocketAddr) {
    let mut connections = JoinSet::new();
    while let Ok((mut downstream, _)) = listener.accept().await {
        connections.spawn(async move {
            let Ok(mut upstream) = TcpStream::connect(upstream).await else {
                return;
            };
            let _ = downstream.set_nodelay(true);
            let _ = upstream.set_nodelay(true);
            let _ = tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await;
        });
    }
}

/// Buffers each upstream response in full before answering downstream.
///
/// The response buffer is capped by the cluster's per-connection buffer
/// limit; a response that outgrows it is replaced by a local 500, which is
/// possible because no response headers have gone downstream yet.
pub struct BufferingProxyLauncher;

#[async_trait]
impl ProxyLauncher for BufferingProxyLauncher {
    async fn launch(&self, config: &ProxyConfig) -> Result<Box<dyn ProxyHandle>> {
        let cluster = default_cluster(config)?;
        let target = Arc::new(Target {
            addr: cluster_addr(&cluster)?,
            limit: cluster.per_connection_buffer_limit_bytes.map(|l| l as usize),
            health_check: health_check_endpoint(config),
        });
        let mut ports = HashMap::new();
        let mut tasks = Vec::new();
        for (name, listener) in bind_listeners(config).await? {
            ports.insert(name, listener.local_addr()?.port());
            tasks.push(tokio::spawn(buffering_loop(listener, Arc::clone(&target))));
        }
        Ok(Box::new(InProcessProxy { ports, tasks }))
    }
}

struct Target {
    addr: SocketAddr,
    limit: Option<usize>,
    health_check: Option<String>,
}

/// Endpoint of a non-pass-through health check filter, if one is configured.
fn health_check_endpoint(config: &ProxyConfig) -> Option<String> {
    config
        .listeners
        .iter()
        .filter_map(|l| l.http.as_ref())
        .flat_map(|http| &http.filters)
        .find(|f| f.name == "envoy.health_check" && f.config["pass_through_mode"] == false)
        .and_then(|f| f.config["endpoint"].as_str().map(str::to_string))
}

async fn buffering_loop(listener: TcpListener, target: Arc<Target>) {
    let mut connections = JoinSet::new();
    while let Ok((stream, _)) = listener.accept().await {
        let target = Arc::clone(&target);
        connections.spawn(async move {
            let service = service_fn(move |req| {
                let target = Arc::clone(&target);
                async move { Ok::<_, HarnessError>(forward(req, &target).await) }
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}

async fn forward(req: Request<Incoming>, target: &Target) -> Response<Full<Bytes>> {
    if target.health_check.as_deref() == Some(req.uri().path()) {
        return local_reply(StatusCode::OK, String::new());
    }
    match try_forward(req, target).await {
        Ok(response) => response,
        Err(e) => local_reply(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn try_forward(req: Request<Incoming>, target: &Target) -> Result<Response<Full<Bytes>>> {
    let (mut parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    parts.headers.remove(hyper::header::TRANSFER_ENCODING);
    parts.headers.remove(hyper::header::CONTENT_LENGTH);
    let upstream_req = Request::from_parts(parts, Full::new(body));

    let stream = TcpStream::connect(target.addr).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let driver = tokio::spawn(conn);

    let response = sender.send_request(upstream_req).await?;
    let (parts, mut body) = response.into_parts();
    let mut buffered = BytesMut::new();
    while let Some(frame) = body.frame().await {
        if let Ok(data) = frame?.into_data() {
            buffered.extend_from_slice(&data);
            if target.limit.is_some_and(|limit| buffered.len() > limit) {
                driver.abort();
                return Ok(local_reply(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    String::new(),
                ));
            }
        }
    }

    let mut response = Response::from_parts(parts, Full::new(buffered.freeze()));
    response.headers_mut().remove(hyper::header::TRANSFER_ENCODING);
    response.headers_mut().remove(hyper::header::CONTENT_LENGTH);
    Ok(response)
}

fn local_reply(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}
