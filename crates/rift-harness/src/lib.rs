//! End-to-end integration testing for HTTP/TCP reverse proxies.
//!
//! A real client drives traffic into the proxy under test, scriptable fake
//! upstreams stand in for its backends, and an action sequencer runs the
//! steps of a scenario strictly in order.

// ===== Core =====
pub mod error;
pub mod monitor;
pub mod sequencer;
pub mod settings;

// ===== Wire plumbing =====
pub mod connection;
pub mod headers;
pub mod net;

// ===== Both ends of the proxy =====
pub mod client;
pub mod upstream;

// ===== Proxy configuration and lifecycle =====
pub mod config;
pub mod fixture;
pub mod launcher;

pub mod logging;
pub mod scenarios;

pub use error::{FailureKind, HarnessError, Result};
pub use fixture::{IntegrationTest, ScenarioContext};
pub use sequencer::{Action, ActionSequencer, ScenarioError, Slot};
pub use settings::{HarnessSettings, IpVersion};
