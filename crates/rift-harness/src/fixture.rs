//! Scenario fixture: fake upstreams, proxy lifecycle and client bookkeeping.
//!
//! [`IntegrationTest`] owns everything a scenario needs. Configure it through
//! [`config`](IntegrationTest::config), call
//! [`initialize`](IntegrationTest::initialize), drive the scenario through
//! the returned [`ScenarioContext`], and finish with
//! [`teardown`](IntegrationTest::teardown), which closes clients, then fake
//! upstreams, then the proxy.

use crate::client::{IntegrationCodecClient, IntegrationTcpClient};
use crate::config::{ConfigMutator, ProxyConfig};
use crate::connection::Connection;
use crate::error::{HarnessError, Result};
use crate::launcher::{ProxyHandle, ProxyLauncher};
use crate::sequencer::{Action, ActionSequencer, ScenarioError};
use crate::settings::HarnessSettings;
use crate::upstream::FakeUpstream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owner of one scenario's fake upstreams, proxy and clients.
pub struct IntegrationTest {
    settings: HarnessSettings,
    mutator: ConfigMutator,
    launcher: Box<dyn ProxyLauncher>,
    proxy: Option<Box<dyn ProxyHandle>>,
    context: Option<ScenarioContext>,
}

impl IntegrationTest {
    pub fn new(settings: HarnessSettings, launcher: impl ProxyLauncher + 'static) -> Self {
        Self {
            settings,
            mutator: ConfigMutator::new(),
            launcher: Box::new(launcher),
            proxy: None,
            context: None,
        }
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    /// Configuration edits for the proxy. Edits registered after
    /// [`initialize`](Self::initialize) are rejected.
    pub fn config(&mut self) -> &mut ConfigMutator {
        &mut self.mutator
    }

    /// Bind the fake upstreams, build and edit the configuration, and launch
    /// the proxy.
    pub async fn initialize(&mut self) -> Result<ScenarioContext> {
        if self.context.is_some() {
            return Err(HarnessError::usage("fixture is already initialized"));
        }
        self.settings.validate()?;
        let ip_version = self.settings.ip_version;

        let mut upstreams = Vec::with_capacity(self.settings.fake_upstream_count);
        for i in 0..self.settings.fake_upstream_count {
            upstreams.push(Arc::new(
                FakeUpstream::bind(format!("upstream{i}"), ip_version).await?,
            ));
        }
        let addrs: Vec<SocketAddr> = upstreams.iter().map(|u| u.local_addr()).collect();

        let config = self
            .mutator
            .apply(ProxyConfig::baseline(&addrs, ip_version))?;
        debug!(
            listeners = config.listeners.len(),
            clusters = config.clusters.len(),
            "launching proxy"
        );
        let proxy = self.launcher.launch(&config).await?;

        let ports = config
            .listeners
            .iter()
            .filter_map(|l| proxy.listener_port(&l.name).map(|port| (l.name.clone(), port)))
            .collect::<HashMap<_, _>>();
        info!("Proxy ready, listeners: {:?}", ports);
        self.proxy = Some(proxy);

        let context = ScenarioContext {
            inner: Arc::new(ContextInner {
                settings: self.settings.clone(),
                config,
                upstreams,
                ports,
                clients: Mutex::new(Vec::new()),
            }),
        };
        self.context = Some(context.clone());
        Ok(context)
    }

    /// The live scenario context; a usage error before initialization.
    pub fn context(&self) -> Result<ScenarioContext> {
        self.context
            .clone()
            .ok_or_else(|| HarnessError::usage("fixture is not initialized"))
    }

    /// Close every client, then every fake upstream, then stop the proxy.
    ///
    /// Keeps going past failures so every resource is released; the first
    /// failure is returned.
    pub async fn teardown(&mut self) -> Result<()> {
        let mut first_error = None;
        let mut record = |result: Result<()>| {
            if let Err(e) = result {
                warn!("Teardown step failed: {}", e);
                first_error.get_or_insert(e);
            }
        };

        if let Some(context) = self.context.take() {
            let clients: Vec<_> = context.inner.clients.lock().drain(..).collect();
            for client in clients {
                record(client.close().await);
            }
            for upstream in &context.inner.upstreams {
                record(upstream.close().await);
            }
        }
        if let Some(mut proxy) = self.proxy.take() {
            record(proxy.shutdown().await);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct ContextInner {
    settings: HarnessSettings,
    config: ProxyConfig,
    upstreams: Vec<Arc<FakeUpstream>>,
    ports: HashMap<String, u16>,
    clients: Mutex<Vec<Arc<dyn Connection>>>,
}

/// Cheap handle to a running scenario, cloned into actions.
#[derive(Clone)]
pub struct ScenarioContext {
    inner: Arc<ContextInner>,
}

impl ScenarioContext {
    pub fn settings(&self) -> &HarnessSettings {
        &self.inner.settings
    }

    pub fn wait_timeout(&self) -> Duration {
        self.inner.settings.wait_timeout()
    }

    /// The configuration the proxy was launched with.
    pub fn proxy_config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Bound port of the named proxy listener.
    pub fn lookup_port(&self, name: &str) -> Result<u16> {
        self.inner
            .ports
            .get(name)
            .copied()
            .ok_or_else(|| HarnessError::usage(format!("no proxy listener named '{name}'")))
    }

    pub fn fake_upstream(&self, index: usize) -> Result<Arc<FakeUpstream>> {
        self.inner.upstreams.get(index).cloned().ok_or_else(|| {
            HarnessError::usage(format!(
                "no fake upstream #{index} ({} configured)",
                self.inner.upstreams.len()
            ))
        })
    }

    pub fn upstream_count(&self) -> usize {
        self.inner.upstreams.len()
    }

    /// Open an HTTP/1.1 client connection to the proxy on `port`.
    pub async fn make_http_connection(&self, port: u16) -> Result<Arc<IntegrationCodecClient>> {
        let client =
            Arc::new(IntegrationCodecClient::connect(self.proxy_addr(port), self.settings()).await?);
        self.register(Arc::clone(&client) as Arc<dyn Connection>);
        Ok(client)
    }

    /// Open a raw TCP client connection to the proxy on `port`.
    pub async fn make_tcp_connection(&self, port: u16) -> Result<Arc<IntegrationTcpClient>> {
        let client =
            Arc::new(IntegrationTcpClient::connect(self.proxy_addr(port), self.settings()).await?);
        self.register(Arc::clone(&client) as Arc<dyn Connection>);
        Ok(client)
    }

    /// Run `actions` in order, stopping at the first failure.
    pub async fn execute(
        &self,
        actions: impl IntoIterator<Item = Action>,
    ) -> std::result::Result<(), ScenarioError> {
        ActionSequencer::new().execute(actions).await
    }

    fn proxy_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.inner.settings.ip_version.loopback(), port)
    }

    fn register(&self, client: Arc<dyn Connection>) {
        self.inner.clients.lock().push(client);
    }
}
