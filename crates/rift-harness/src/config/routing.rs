//! Route table configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouteConfiguration {
    pub name: String,
    #[serde(default)]
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VirtualHost {
    pub name: String,
    /// Host patterns; `*` matches any authority.
    pub domains: Vec<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// One route; routes in a virtual host are tried in order.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Route {
    #[serde(rename = "match")]
    pub match_config: RouteMatch,
    pub route: RouteAction,
}

impl Route {
    pub fn prefix(prefix: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            match_config: RouteMatch {
                prefix: Some(prefix.into()),
                path: None,
            },
            route: RouteAction {
                cluster: cluster.into(),
                prefix_rewrite: None,
                use_websocket: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct RouteMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouteAction {
    pub cluster: String,
    /// Replaces the matched prefix before forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_rewrite: Option<String>,
    /// Allow the route to switch protocols via `Upgrade: websocket`.
    #[serde(default)]
    pub use_websocket: bool,
}
