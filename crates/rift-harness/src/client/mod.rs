//! Downstream clients that drive traffic into the proxy.
//!
//! - [`IntegrationCodecClient`]: HTTP/1.1 requests, one
//!   [`IntegrationStreamDecoder`] per request
//! - [`IntegrationTcpClient`]: raw bytes

mod codec;
mod decoder;
mod tcp;

pub use codec::{IntegrationCodecClient, RequestEncoder};
pub use decoder::IntegrationStreamDecoder;
pub use tcp::IntegrationTcpClient;
