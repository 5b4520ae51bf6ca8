//! The seam between the harness and the proxy under test.
//!
//! The harness never knows how a proxy is started. A [`ProxyLauncher`] takes
//! the final configuration document and returns a [`ProxyHandle`] once the
//! proxy is ready to accept connections; the handle reports where each
//! named listener ended up and shuts the proxy down at teardown.

use crate::config::ProxyConfig;
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ProxyLauncher: Send + Sync {
    /// Start a proxy configured by `config`. Must not return before every
    /// listener in `config` is bound.
    async fn launch(&self, config: &ProxyConfig) -> Result<Box<dyn ProxyHandle>>;
}

/// A running proxy.
#[async_trait]
pub trait ProxyHandle: Send + Sync {
    /// Port bound for the listener called `name`, if there is one.
    fn listener_port(&self, name: &str) -> Option<u16>;

    /// Stop the proxy and wait until it is gone.
    async fn shutdown(&mut self) -> Result<()>;
}
