//! Forwarding one intercepted request to the real upstream.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::{Bytes, to_bytes};
use axum::extract::Request;
use axum::http::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::form_urlencoded;

use super::routes::Route;
use crate::error::{Error, Result};

pub const VERSION_PARAM: &str = "cv";
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

// Hop-by-hop or recomputed by the client; accept-encoding is dropped so the
// client negotiates (and decodes) compression itself.
const STRIPPED_HEADERS: [axum::http::HeaderName; 5] =
    [HOST, CONTENT_LENGTH, CONNECTION, TRANSFER_ENCODING, ACCEPT_ENCODING];

/// Where the version token goes for a given method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPlacement {
    Query,
    FormBody,
    Unsupported,
}

impl TokenPlacement {
    pub fn for_method(method: &Method) -> Self {
        match *method {
            Method::GET | Method::HEAD | Method::DELETE => TokenPlacement::Query,
            Method::POST | Method::PUT | Method::PATCH => TokenPlacement::FormBody,
            _ => TokenPlacement::Unsupported,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path plus optional query, relative to the upstream origin.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct Forwarder {
    client: reqwest::Client,
    target_host: String,
    origin: String,
}

impl Forwarder {
    /// Upstream TLS certificates are not verified: the upstream is dialled
    /// by IP, which the certificate cannot be checked against.
    pub fn new(target_host: impl Into<String>, upstream: SocketAddr) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Tls(format!("build upstream client: {e}")))?;
        Ok(Self {
            client,
            target_host: target_host.into(),
            origin: format!("https://{upstream}"),
        })
    }

    /// Sends the request upstream once and returns the status and the decoded,
    /// possibly rewritten body.
    pub async fn exchange(&self, route: Route, request: Request) -> Result<(StatusCode, Value)> {
        let (parts, body) = request.into_parts();
        let body = to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| Error::UpstreamTransport(format!("read request body: {e}")))?;

        let outbound = self.prepare(&parts, body, route.version_token())?;
        debug!(url = %outbound.path_and_query, "forwarding");

        let mut builder = self
            .client
            .request(outbound.method, format!("{}{}", self.origin, outbound.path_and_query))
            .headers(outbound.headers);
        if !outbound.body.is_empty() {
            builder = builder.body(outbound.body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        let mut value = decode_body(&bytes)?;
        if let Some(rule) = route.rewrite_rule() {
            rule.apply(&mut value);
        }
        Ok((status, value))
    }

    /// Builds the request that goes upstream, applying the version token.
    pub fn prepare(&self, parts: &Parts, body: Bytes, token: Option<&str>) -> Result<OutboundRequest> {
        let mut headers = parts.headers.clone();
        for name in &STRIPPED_HEADERS {
            headers.remove(name);
        }
        let host = HeaderValue::from_str(&self.target_host)
            .map_err(|e| Error::Config(format!("invalid target host: {e}")))?;
        headers.insert(HOST, host);

        let path = parts.uri.path();
        let mut query = parts.uri.query().map(str::to_owned);
        let mut body = body;

        if let Some(token) = token {
            match TokenPlacement::for_method(&parts.method) {
                TokenPlacement::Query => query = Some(override_query(query.as_deref(), token)),
                TokenPlacement::FormBody if accepts_form(&headers) => {
                    body = Bytes::from(override_form(&body, token));
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
                }
                TokenPlacement::FormBody => {
                    debug!(content_type = ?headers.get(CONTENT_TYPE), "body is not a form, token skipped");
                }
                TokenPlacement::Unsupported => {}
            }
        }

        let path_and_query = match query.filter(|q| !q.is_empty()) {
            Some(q) => format!("{path}?{q}"),
            None => path.to_owned(),
        };
        Ok(OutboundRequest {
            method: parts.method.clone(),
            path_and_query,
            headers,
            body,
        })
    }
}

/// A body can carry the token when it is a form or has no declared type.
fn accepts_form(headers: &HeaderMap) -> bool {
    match headers.get(CONTENT_TYPE).map(HeaderValue::to_str) {
        None => true,
        Some(Ok(value)) => value
            .split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE)),
        Some(Err(_)) => false,
    }
}

/// Replaces every `cv` pair in a query string with a single `cv=<token>`.
pub fn override_query(query: Option<&str>, token: &str) -> String {
    override_pairs(query.unwrap_or_default().as_bytes(), token)
}

/// Same as [`override_query`], for a form-encoded body.
pub fn override_form(body: &[u8], token: &str) -> String {
    override_pairs(body, token)
}

fn override_pairs(input: &[u8], token: &str) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in form_urlencoded::parse(input) {
        if key != VERSION_PARAM {
            serializer.append_pair(&key, &value);
        }
    }
    serializer.append_pair(VERSION_PARAM, token);
    serializer.finish()
}

/// An empty body decodes to `null`; anything else must be JSON.
pub fn decode_body(bytes: &[u8]) -> Result<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).map_err(|e| Error::UpstreamDecode(e.to_string()))
}
