//! Listener, filter chain and cluster configuration.

use super::routing::RouteConfiguration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Name the fixture looks the bound port up by (e.g. "http").
    pub name: String,
    pub address: String,
    /// 0 lets the proxy pick an ephemeral port.
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_connection_buffer_limit_bytes: Option<u32>,
    /// HTTP connection manager; absent for plain TCP listeners.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConnectionManagerConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HttpConnectionManagerConfig {
    #[serde(default = "default_stat_prefix")]
    pub stat_prefix: String,
    /// Filters in request order; the router is expected last.
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    pub route_config: RouteConfiguration,
}

fn default_stat_prefix() -> String {
    "config_test".to_string()
}

/// A named HTTP filter with an opaque, filter-specific config block.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FilterConfig {
    pub name: String,
    #[serde(default)]
    pub config: serde_yaml::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_connection_buffer_limit_bytes: Option<u32>,
    pub hosts: Vec<HostAddress>,
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HostAddress {
    pub address: String,
    pub port: u16,
}
