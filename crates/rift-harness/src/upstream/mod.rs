//! Scriptable fake upstreams standing in for the proxy's backends.
//!
//! A [`FakeUpstream`] owns a listening socket and an accept task. Each
//! accepted socket waits in a queue until the scenario claims it as either
//! an HTTP connection ([`FakeHttpConnection`], one [`FakeStream`] per
//! request) or a raw byte connection ([`FakeRawConnection`]).
//!
//! ## Module Structure
//!
//! - `server`: listener, accept loop, connection ownership
//! - `http`: hyper-backed HTTP/1.1 connections and streams
//! - `raw`: unframed byte connections

mod http;
mod raw;
mod server;

pub use http::{FakeHttpConnection, FakeStream};
pub use raw::FakeRawConnection;
pub use server::FakeUpstream;
