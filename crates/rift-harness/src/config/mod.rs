//! Configuration document handed to the proxy under test.
//!
//! [`ProxyConfig::baseline`] produces the starting document: one HTTP
//! listener named "http" routing everything to `cluster_0`, and one cluster
//! per fake upstream. Scenarios then register edits on a [`ConfigMutator`],
//! which applies them in order right before launch.

mod listener;
mod mutator;
mod routing;

use crate::error::{HarnessError, Result};
use crate::settings::IpVersion;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;

pub use listener::{
    ClusterConfig, FilterConfig, HostAddress, HttpConnectionManagerConfig, ListenerConfig,
};
pub use mutator::ConfigMutator;
pub use routing::{Route, RouteAction, RouteConfiguration, RouteMatch, VirtualHost};

/// Name of the baseline HTTP listener.
pub const HTTP_LISTENER: &str = "http";

pub const ROUTER_FILTER: &str = "envoy.router";

/// Request buffering filter with generous limits.
pub const DEFAULT_BUFFER_FILTER: &str =
    "{ name: envoy.buffer, config: { max_request_bytes: 5242880, max_request_time_s: 120 } }";

/// Health check filter answering `/healthcheck` itself.
pub const DEFAULT_HEALTH_CHECK_FILTER: &str =
    "{ name: envoy.health_check, config: { pass_through_mode: false, endpoint: /healthcheck } }";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl ProxyConfig {
    /// The document every scenario starts from.
    pub fn baseline(upstreams: &[SocketAddr], ip_version: IpVersion) -> Self {
        let loopback = ip_version.loopback().to_string();
        let clusters = upstreams
            .iter()
            .enumerate()
            .map(|(i, addr)| ClusterConfig {
                name: cluster_name(i),
                connect_timeout_ms: 5000,
                per_connection_buffer_limit_bytes: None,
                hosts: vec![HostAddress {
                    address: addr.ip().to_string(),
                    port: addr.port(),
                }],
            })
            .collect();

        let listener = ListenerConfig {
            name: HTTP_LISTENER.to_string(),
            address: loopback,
            port: 0,
            per_connection_buffer_limit_bytes: None,
            http: Some(HttpConnectionManagerConfig {
                stat_prefix: "config_test".to_string(),
                filters: vec![FilterConfig {
                    name: ROUTER_FILTER.to_string(),
                    config: serde_yaml::Value::Null,
                }],
                route_config: RouteConfiguration {
                    name: "route_config_0".to_string(),
                    virtual_hosts: vec![VirtualHost {
                        name: "integration".to_string(),
                        domains: vec!["*".to_string()],
                        routes: vec![Route::prefix("/", cluster_name(0))],
                    }],
                },
            }),
        };

        Self {
            listeners: vec![listener],
            clusters,
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ProxyConfig = serde_yaml::from_str(yaml)
            .map_err(|e| HarnessError::Config(format!("invalid proxy config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| HarnessError::Config(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| HarnessError::Config(e.to_string()))
    }

    pub fn listener(&self, name: &str) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|l| l.name == name)
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// The HTTP connection manager of the baseline listener.
    pub fn http_connection_manager_mut(&mut self) -> Result<&mut HttpConnectionManagerConfig> {
        self.listeners
            .iter_mut()
            .find(|l| l.name == HTTP_LISTENER)
            .and_then(|l| l.http.as_mut())
            .ok_or_else(|| {
                HarnessError::Config(format!("no HTTP listener named '{HTTP_LISTENER}'"))
            })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let mut listener_names = HashSet::new();
        for listener in &self.listeners {
            if listener.name.is_empty() {
                return Err(HarnessError::Config("listener name must not be empty".into()));
            }
            if !listener_names.insert(listener.name.as_str()) {
                return Err(HarnessError::Config(format!(
                    "duplicate listener name '{}'",
                    listener.name
                )));
            }
            if listener.per_connection_buffer_limit_bytes == Some(0) {
                return Err(HarnessError::Config(format!(
                    "listener '{}': buffer limit must be greater than 0",
                    listener.name
                )));
            }
        }

        let mut cluster_names = HashSet::new();
        for cluster in &self.clusters {
            if !cluster_names.insert(cluster.name.as_str()) {
                return Err(HarnessError::Config(format!(
                    "duplicate cluster name '{}'",
                    cluster.name
                )));
            }
            if cluster.hosts.is_empty() {
                return Err(HarnessError::Config(format!(
                    "cluster '{}' has no hosts",
                    cluster.name
                )));
            }
            if cluster.per_connection_buffer_limit_bytes == Some(0) {
                return Err(HarnessError::Config(format!(
                    "cluster '{}': buffer limit must be greater than 0",
                    cluster.name
                )));
            }
        }

        // Every route must point at a defined cluster
        for listener in &self.listeners {
            let Some(http) = &listener.http else {
                continue;
            };
            for vhost in &http.route_config.virtual_hosts {
                for route in &vhost.routes {
                    if !cluster_names.contains(route.route.cluster.as_str()) {
                        return Err(HarnessError::Config(format!(
                            "route in virtual host '{}' references unknown cluster '{}'",
                            vhost.name, route.route.cluster
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

pub fn cluster_name(index: usize) -> String {
    format!("cluster_{index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstreams() -> Vec<SocketAddr> {
        vec![
            "127.0.0.1:10001".parse().unwrap(),
            "127.0.0.1:10002".parse().unwrap(),
        ]
    }

    #[test]
    fn test_baseline_shape() {
        let config = ProxyConfig::baseline(&upstreams(), IpVersion::V4);
        config.validate().unwrap();

        let listener = config.listener("http").unwrap();
        assert_eq!(listener.address, "127.0.0.1");
        assert_eq!(listener.port, 0);
        let http = listener.http.as_ref().unwrap();
        assert_eq!(http.filters.len(), 1);
        assert_eq!(http.filters[0].name, ROUTER_FILTER);
        let vhost = &http.route_config.virtual_hosts[0];
        assert_eq!(vhost.domains, vec!["*"]);
        assert_eq!(vhost.routes[0].match_config.prefix.as_deref(), Some("/"));
        assert_eq!(vhost.routes[0].route.cluster, "cluster_0");

        assert_eq!(config.clusters.len(), 2);
        assert_eq!(config.cluster("cluster_1").unwrap().hosts[0].port, 10002);
    }

    #[test]
    fn test_baseline_v6_listener() {
        let config = ProxyConfig::baseline(&["[::1]:9000".parse().unwrap()], IpVersion::V6);
        assert_eq!(config.listener("http").unwrap().address, "::1");
        assert_eq!(config.clusters[0].hosts[0].address, "::1");
    }

    #[test]
    fn test_yaml_round_trip_keeps_filters() {
        let mut config = ProxyConfig::baseline(&upstreams(), IpVersion::V4);
        let filter: FilterConfig = serde_yaml::from_str(DEFAULT_BUFFER_FILTER).unwrap();
        config.http_connection_manager_mut().unwrap().filters.insert(0, filter);

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("envoy.buffer"));
        assert!(yaml.contains("max_request_bytes: 5242880"));
        let parsed = ProxyConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_json_rendering() {
        let config = ProxyConfig::baseline(&upstreams(), IpVersion::V4);
        let json: serde_json::Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(json["listeners"][0]["name"], "http");
        assert_eq!(json["clusters"][1]["name"], "cluster_1");
    }

    #[test]
    fn test_unknown_cluster_rejected() {
        let mut config = ProxyConfig::baseline(&upstreams(), IpVersion::V4);
        config.http_connection_manager_mut().unwrap().route_config.virtual_hosts[0]
            .routes
            .push(Route::prefix("/other", "cluster_9"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cluster_9"));
    }

    #[test]
    fn test_duplicate_listener_rejected() {
        let mut config = ProxyConfig::baseline(&upstreams(), IpVersion::V4);
        let copy = config.listeners[0].clone();
        config.listeners.push(copy);
        assert!(matches!(config.validate(), Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_health_check_filter_parses() {
        let filter: FilterConfig = serde_yaml::from_str(DEFAULT_HEALTH_CHECK_FILTER).unwrap();
        assert_eq!(filter.name, "envoy.health_check");
        assert_eq!(filter.config["endpoint"], "/healthcheck");
        assert_eq!(filter.config["pass_through_mode"], false);
    }
}
