//! Per-request response collector for the codec client.

use crate::error::{HarnessError, Result};
use crate::monitor::{Check, Monitor};
use bytes::Bytes;
use hyper::{HeaderMap, StatusCode};
use std::time::Duration;

#[derive(Debug, Default)]
struct DecoderState {
    head: Option<(StatusCode, HeaderMap)>,
    body: Vec<u8>,
    trailers: Option<HeaderMap>,
    complete: bool,
    reset: Option<String>,
}

/// Collects one response as it arrives: head, body bytes, trailers.
///
/// `complete` flips to true exactly once, when the end of the response is
/// observed. A response cut off by a disconnect records a reset reason
/// instead and never becomes complete.
#[derive(Debug)]
pub struct IntegrationStreamDecoder {
    label: String,
    state: Monitor<DecoderState>,
}

impl IntegrationStreamDecoder {
    pub(crate) fn new(label: String) -> Self {
        Self {
            label,
            state: Monitor::new(DecoderState::default()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once the whole response has arrived. Never reverts.
    pub fn complete(&self) -> bool {
        self.state.read(|s| s.complete)
    }

    /// Response status; a usage error before the head has arrived.
    pub fn status(&self) -> Result<StatusCode> {
        self.state.read(|s| {
            s.head
                .as_ref()
                .map(|(status, _)| *status)
                .ok_or_else(|| self.no_headers_yet())
        })
    }

    /// Response headers; a usage error before the head has arrived.
    pub fn headers(&self) -> Result<HeaderMap> {
        self.state.read(|s| {
            s.head
                .as_ref()
                .map(|(_, headers)| headers.clone())
                .ok_or_else(|| self.no_headers_yet())
        })
    }

    pub fn body(&self) -> Bytes {
        self.state.read(|s| Bytes::copy_from_slice(&s.body))
    }

    pub fn body_length(&self) -> usize {
        self.state.read(|s| s.body.len())
    }

    pub fn trailers(&self) -> Option<HeaderMap> {
        self.state.read(|s| s.trailers.clone())
    }

    pub fn reset_reason(&self) -> Option<String> {
        self.state.read(|s| s.reset.clone())
    }

    pub async fn wait_for_headers(&self, timeout: Duration) -> Result<()> {
        self.state
            .wait_until(&format!("{} response headers", self.label), timeout, |s| {
                if s.head.is_some() {
                    Check::Ready(())
                } else if s.reset.is_some() {
                    Check::Failed(HarnessError::Disconnected(self.label.clone()))
                } else {
                    Check::Pending
                }
            })
            .await
    }

    /// Wait until at least `count` body bytes have arrived.
    pub async fn wait_for_body_data(&self, count: usize, timeout: Duration) -> Result<()> {
        self.state
            .wait_until(
                &format!("{} to receive {count} body bytes", self.label),
                timeout,
                |s| {
                    if s.body.len() >= count {
                        Check::Ready(())
                    } else if s.complete || s.reset.is_some() {
                        Check::Failed(HarnessError::ConnectionClosedEarly {
                            expected: count,
                            received: s.body.len(),
                        })
                    } else {
                        Check::Pending
                    }
                },
            )
            .await
    }

    /// Wait until the response ends, normally or by disconnect.
    ///
    /// A disconnect is not an error here; check [`complete`](Self::complete)
    /// to tell the two apart.
    pub async fn wait_for_end_stream(&self, timeout: Duration) -> Result<()> {
        self.state
            .wait_until(&format!("{} end of stream", self.label), timeout, |s| {
                if s.complete || s.reset.is_some() {
                    Check::Ready(())
                } else {
                    Check::Pending
                }
            })
            .await
    }

    pub async fn wait_for_reset(&self, timeout: Duration) -> Result<()> {
        self.state
            .wait_until(&format!("{} reset", self.label), timeout, |s| {
                if s.reset.is_some() {
                    Check::Ready(())
                } else if s.complete {
                    Check::Failed(HarnessError::usage(format!(
                        "{}: response completed normally",
                        self.label
                    )))
                } else {
                    Check::Pending
                }
            })
            .await
    }

    fn no_headers_yet(&self) -> HarnessError {
        HarnessError::usage(format!(
            "{}: response headers have not arrived",
            self.label
        ))
    }

    pub(crate) fn on_headers(&self, status: StatusCode, headers: HeaderMap) {
        self.state.update(|s| s.head = Some((status, headers)));
    }

    pub(crate) fn on_data(&self, data: &[u8]) {
        self.state.update(|s| s.body.extend_from_slice(data));
    }

    pub(crate) fn on_trailers(&self, trailers: HeaderMap) {
        self.state.update(|s| s.trailers = Some(trailers));
    }

    pub(crate) fn on_complete(&self) {
        self.state.update(|s| {
            if s.reset.is_none() {
                s.complete = true;
            }
        });
    }

    pub(crate) fn on_reset(&self, reason: String) {
        self.state.update(|s| {
            if !s.complete && s.reset.is_none() {
                s.reset = Some(reason);
            }
        });
    }
}
