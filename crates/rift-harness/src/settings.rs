//! Harness settings: timeouts, connect retry window, IP version.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding [`HarnessSettings::ip_version`].
pub const ENV_IP_VERSION: &str = "RIFT_HARNESS_IP_VERSION";
/// Environment variable overriding [`HarnessSettings::wait_timeout_ms`].
pub const ENV_WAIT_TIMEOUT_MS: &str = "RIFT_HARNESS_WAIT_TIMEOUT_MS";

/// Upper bound for every timeout setting: one day.
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Loopback flavour used for fake upstreams, listeners and clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

impl IpVersion {
    pub fn loopback(&self) -> IpAddr {
        match self {
            IpVersion::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpVersion::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }

    /// Wildcard address as written into proxy listener configs.
    pub fn any_address(&self) -> &'static str {
        match self {
            IpVersion::V4 => "0.0.0.0",
            IpVersion::V6 => "::",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IpVersion::V4 => "v4",
            IpVersion::V6 => "v6",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "v4" | "ipv4" | "4" => Ok(IpVersion::V4),
            "v6" | "ipv6" | "6" => Ok(IpVersion::V6),
            other => Err(HarnessError::Config(format!(
                "unsupported ip version '{other}', expected v4 or v6"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessSettings {
    /// Default bound for every wait that does not pass its own timeout
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// Total window for client connect retries
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_connect_retry_interval_ms")]
    pub connect_retry_interval_ms: u64,

    #[serde(default)]
    pub ip_version: IpVersion,

    /// Number of fake upstreams bound by the fixture
    #[serde(default = "default_fake_upstream_count")]
    pub fake_upstream_count: usize,
}

fn default_wait_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_connect_retry_interval_ms() -> u64 {
    50
}

fn default_fake_upstream_count() -> usize {
    1
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            wait_timeout_ms: default_wait_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retry_interval_ms: default_connect_retry_interval_ms(),
            ip_version: IpVersion::default(),
            fake_upstream_count: default_fake_upstream_count(),
        }
    }
}

impl HarnessSettings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let settings: HarnessSettings = serde_yaml::from_str(&contents)
            .map_err(|e| HarnessError::Config(format!("invalid harness settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `RIFT_HARNESS_*` environment overrides on top of these settings.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup(ENV_IP_VERSION) {
            self.ip_version = IpVersion::parse(&value)?;
        }
        if let Some(value) = lookup(ENV_WAIT_TIMEOUT_MS) {
            self.wait_timeout_ms = value.parse().map_err(|_| {
                HarnessError::Config(format!("{ENV_WAIT_TIMEOUT_MS} must be an integer, got '{value}'"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.wait_timeout_ms == 0 || self.wait_timeout_ms > MAX_TIMEOUT_MS {
            return Err(HarnessError::Config(format!(
                "wait_timeout_ms ({}) must be in 1..={MAX_TIMEOUT_MS}",
                self.wait_timeout_ms
            )));
        }
        if self.connect_timeout_ms > MAX_TIMEOUT_MS {
            return Err(HarnessError::Config(format!(
                "connect_timeout_ms ({}) must be at most {MAX_TIMEOUT_MS}",
                self.connect_timeout_ms
            )));
        }
        if self.connect_retry_interval_ms == 0 || self.connect_retry_interval_ms > self.connect_timeout_ms {
            return Err(HarnessError::Config(format!(
                "connect_retry_interval_ms ({}) must be in 1..={}",
                self.connect_retry_interval_ms, self.connect_timeout_ms
            )));
        }
        if self.fake_upstream_count == 0 {
            return Err(HarnessError::Config(
                "at least one fake upstream is required".to_string(),
            ));
        }
        Ok(())
    }

    // Accessors clamp so unvalidated settings still yield usable deadlines.

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms.min(MAX_TIMEOUT_MS))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.min(MAX_TIMEOUT_MS))
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms.min(MAX_TIMEOUT_MS))
    }
}
