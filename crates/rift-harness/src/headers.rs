//! Ordered header blocks with HTTP/2-style pseudo headers.
//!
//! Scenarios describe request and response heads as flat lists such as
//! `[(":method", "GET"), (":path", "/"), (":authority", "host")]`. This module
//! turns those lists into hyper requests and responses and back.

use crate::error::{HarnessError, Result};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::{Method, Request, Response, StatusCode};

pub const METHOD: &str = ":method";
pub const PATH: &str = ":path";
pub const AUTHORITY: &str = ":authority";
pub const SCHEME: &str = ":scheme";
pub const STATUS: &str = ":status";

/// An ordered list of header entries, pseudo headers included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    entries: Vec<(String, String)>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// `:method`, `:path` and `:authority` in one go.
    pub fn request(method: &str, path: &str, authority: &str) -> Self {
        Self::new()
            .with(METHOD, method)
            .with(PATH, path)
            .with(AUTHORITY, authority)
    }

    pub fn response(status: u16) -> Self {
        Self::new().with(STATUS, status.to_string())
    }

    /// Builder-style append.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into().to_ascii_lowercase(), value.into()));
    }

    /// First value for `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn regular(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(k, _)| !k.starts_with(':'))
    }

    fn header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in self.regular() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HarnessError::usage(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HarnessError::usage(format!("invalid value for '{name}': {e}")))?;
            map.append(name, value);
        }
        Ok(map)
    }

    /// Build a request; `:authority` becomes `Host` unless one is already set.
    pub fn into_request<B>(&self, body: B) -> Result<Request<B>> {
        let method = self.get(METHOD).unwrap_or("GET");
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| HarnessError::usage(format!("invalid method '{method}': {e}")))?;
        let path = self.get(PATH).unwrap_or("/");

        let mut headers = self.header_map()?;
        if let Some(authority) = self.get(AUTHORITY) {
            if !headers.contains_key(HOST) {
                let value = HeaderValue::from_str(authority).map_err(|e| {
                    HarnessError::usage(format!("invalid authority '{authority}': {e}"))
                })?;
                headers.insert(HOST, value);
            }
        }

        let mut request = Request::builder()
            .method(method)
            .uri(path)
            .body(body)
            .map_err(|e| HarnessError::usage(format!("invalid request head: {e}")))?;
        *request.headers_mut() = headers;
        Ok(request)
    }

    /// Build a response; `:status` is mandatory.
    pub fn into_response<B>(&self, body: B) -> Result<Response<B>> {
        let status = self
            .get(STATUS)
            .ok_or_else(|| HarnessError::usage("response headers need a :status"))?;
        let status = status
            .parse::<u16>()
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| HarnessError::usage(format!("invalid :status '{status}'")))?;

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = self.header_map()?;
        Ok(response)
    }

    /// Flatten a plain header map (used for trailers).
    pub fn into_header_map(&self) -> Result<HeaderMap> {
        self.header_map()
    }

    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut block = Self::new();
        for (name, value) in map {
            block.push(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
        }
        block
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderBlock {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut block = Self::new();
        for (k, v) in iter {
            block.push(k, v);
        }
        block
    }
}

impl<const N: usize> From<[(&str, &str); N]> for HeaderBlock {
    fn from(entries: [(&str, &str); N]) -> Self {
        entries.into_iter().collect()
    }
}
