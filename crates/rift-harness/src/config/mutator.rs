//! Ordered edits applied to the proxy configuration before launch.

use super::{FilterConfig, ProxyConfig};
use crate::error::{HarnessError, Result};
use tracing::debug;

type ConfigEdit = Box<dyn FnOnce(&mut ProxyConfig) -> Result<()> + Send>;

/// Collects configuration edits and applies them once, in registration order.
///
/// After [`apply`](Self::apply) the mutator is finalized: the proxy has been
/// configured, so further edits could never take effect and are rejected
/// with a usage error.
#[derive(Default)]
pub struct ConfigMutator {
    edits: Vec<(String, ConfigEdit)>,
    finalized: bool,
}

impl ConfigMutator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an HTTP filter, given as a YAML descriptor, at the front of the
    /// chain so it runs before the router.
    pub fn add_filter(&mut self, descriptor: &str) -> Result<()> {
        let filter: FilterConfig = serde_yaml::from_str(descriptor)
            .map_err(|e| HarnessError::Config(format!("invalid filter descriptor: {e}")))?;
        self.add_filter_config(filter)
    }

    pub fn add_filter_config(&mut self, filter: FilterConfig) -> Result<()> {
        let label = format!("add filter '{}'", filter.name);
        self.push(label, move |config| {
            config.http_connection_manager_mut()?.filters.insert(0, filter);
            Ok(())
        })
    }

    /// Per-connection buffer limits: `downstream` on every listener,
    /// `upstream` on every cluster.
    pub fn set_buffer_limits(&mut self, downstream: u32, upstream: u32) -> Result<()> {
        self.push(
            format!("buffer limits {downstream}/{upstream}"),
            move |config| {
                for listener in &mut config.listeners {
                    listener.per_connection_buffer_limit_bytes = Some(downstream);
                }
                for cluster in &mut config.clusters {
                    cluster.per_connection_buffer_limit_bytes = Some(upstream);
                }
                Ok(())
            },
        )
    }

    /// Replace the default virtual host's domain and its first route's prefix.
    pub fn set_default_host_and_route(&mut self, host: &str, prefix: &str) -> Result<()> {
        let host = host.to_string();
        let prefix = prefix.to_string();
        self.push(
            format!("default host '{host}' route '{prefix}'"),
            move |config| {
                let vhost = config
                    .http_connection_manager_mut()?
                    .route_config
                    .virtual_hosts
                    .first_mut()
                    .ok_or_else(|| HarnessError::Config("no default virtual host".into()))?;
                match vhost.domains.first_mut() {
                    Some(domain) => *domain = host,
                    None => vhost.domains.push(host),
                }
                let route = vhost
                    .routes
                    .first_mut()
                    .ok_or_else(|| {
                        HarnessError::Config("default virtual host has no routes".into())
                    })?;
                route.match_config.prefix = Some(prefix);
                route.match_config.path = None;
                Ok(())
            },
        )
    }

    /// Register an arbitrary document transform.
    pub fn add_config_modifier(
        &mut self,
        modifier: impl FnOnce(&mut ProxyConfig) + Send + 'static,
    ) -> Result<()> {
        let label = format!("config modifier #{}", self.edits.len());
        self.push(label, move |config| {
            modifier(config);
            Ok(())
        })
    }

    /// Apply every edit to `baseline` in registration order, validate, and
    /// finalize the mutator.
    pub fn apply(&mut self, mut baseline: ProxyConfig) -> Result<ProxyConfig> {
        if self.finalized {
            return Err(HarnessError::usage("configuration was already applied"));
        }
        self.finalized = true;

        for (label, edit) in self.edits.drain(..) {
            debug!(edit = %label, "applying config edit");
            edit(&mut baseline)
                .map_err(|e| HarnessError::Config(format!("edit '{label}' failed: {e}")))?;
        }
        baseline.validate()?;
        Ok(baseline)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn pending_edits(&self) -> usize {
        self.edits.len()
    }

    fn push(
        &mut self,
        label: String,
        edit: impl FnOnce(&mut ProxyConfig) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        if self.finalized {
            return Err(HarnessError::usage(format!(
                "cannot {label}: the proxy is already configured"
            )));
        }
        self.edits.push((label, Box::new(edit)));
        Ok(())
    }
}

impl std::fmt::Debug for ConfigMutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigMutator")
            .field(
                "edits",
                &self.edits.iter().map(|(label, _)| label).collect::<Vec<_>>(),
            )
            .field("finalized", &self.finalized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Route, DEFAULT_BUFFER_FILTER, DEFAULT_HEALTH_CHECK_FILTER, ROUTER_FILTER};
    use crate::error::FailureKind;
    use crate::settings::IpVersion;

    fn baseline() -> ProxyConfig {
        ProxyConfig::baseline(&["127.0.0.1:9000".parse().unwrap()], IpVersion::V4)
    }

    #[test]
    fn test_filters_prepend_in_order() {
        let mut mutator = ConfigMutator::new();
        mutator.add_filter(DEFAULT_BUFFER_FILTER).unwrap();
        mutator.add_filter(DEFAULT_HEALTH_CHECK_FILTER).unwrap();
        let mut config = mutator.apply(baseline()).unwrap();

        let names: Vec<_> = config
            .http_connection_manager_mut()
            .unwrap()
            .filters
            .iter()
            .map(|f| f.name.clone())
            .collect();
        assert_eq!(names, vec!["envoy.health_check", "envoy.buffer", ROUTER_FILTER]);
    }

    #[test]
    fn test_buffer_limits() {
        let mut mutator = ConfigMutator::new();
        mutator.set_buffer_limits(1024, 2048).unwrap();
        let config = mutator.apply(baseline()).unwrap();
        assert_eq!(config.listeners[0].per_connection_buffer_limit_bytes, Some(1024));
        assert_eq!(config.clusters[0].per_connection_buffer_limit_bytes, Some(2048));
    }

    #[test]
    fn test_edits_apply_in_registration_order() {
        let mut mutator = ConfigMutator::new();
        mutator.set_default_host_and_route("*", "/asd").unwrap();
        mutator
            .add_config_modifier(|config| {
                let vhost = &mut config.listeners[0].http.as_mut().unwrap().route_config.virtual_hosts[0];
                // Sees the edit registered before it.
                assert_eq!(vhost.routes[0].match_config.prefix.as_deref(), Some("/asd"));
                vhost.routes.push(Route::prefix("/websocket/test", "cluster_0"));
            })
            .unwrap();
        let config = mutator.apply(baseline()).unwrap();
        let routes = &config.listeners[0].http.as_ref().unwrap().route_config.virtual_hosts[0].routes;
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[1].match_config.prefix.as_deref(), Some("/websocket/test"));
    }

    #[test]
    fn test_late_edits_rejected() {
        let mut mutator = ConfigMutator::new();
        let started = mutator.apply(baseline()).unwrap();
        assert!(mutator.is_finalized());

        let err = mutator.set_buffer_limits(1, 1).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Usage);
        assert!(mutator.add_filter(DEFAULT_BUFFER_FILTER).is_err());
        assert!(mutator.add_config_modifier(|_| {}).is_err());
        assert!(mutator.apply(baseline()).is_err());
        assert_eq!(mutator.pending_edits(), 0);
        assert_eq!(started, baseline());
    }

    #[test]
    fn test_bad_descriptor_is_config_error() {
        let mut mutator = ConfigMutator::new();
        let err = mutator.add_filter("{ config: [").unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
        assert_eq!(mutator.pending_edits(), 0);
    }

    #[test]
    fn test_edit_breaking_validation_fails_apply() {
        let mut mutator = ConfigMutator::new();
        mutator
            .add_config_modifier(|config| config.clusters.clear())
            .unwrap();
        let err = mutator.apply(baseline()).unwrap_err();
        assert!(err.to_string().contains("unknown cluster"));
    }
}
