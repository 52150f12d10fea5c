//! Error types shared by the certificate authority, the proxy and the
//! lifecycle coordinator.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Key generation failed or the key size was rejected.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Encoding or signing a certificate failed.
    #[error("certificate build error: {0}")]
    CertificateBuild(String),

    /// The OS trust store refused the root certificate.
    #[error("trust store install via {installer} failed: {message}")]
    TrustInstall {
        installer: &'static str,
        message: String,
    },

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The persisted root, leaf and key do not belong together.
    #[error("trust bundle is inconsistent: {0}")]
    Bundle(String),

    #[error("preflight check failed: {0}")]
    Preflight(#[from] PreflightError),

    #[error("TLS setup error: {0}")]
    Tls(String),

    /// Forwarding to upstream failed before a response was read.
    #[error("{0}")]
    UpstreamTransport(String),

    /// Upstream answered with a body that is not JSON.
    #[error("upstream body is not valid JSON: {0}")]
    UpstreamDecode(String),

    /// In-flight requests were still running when the drain window closed.
    #[error("graceful shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("resolve error: {0}")]
    Resolve(String),

    #[error("hosts file error: {0}")]
    Hosts(String),
}

#[derive(thiserror::Error, Debug)]
pub enum PreflightError {
    #[error("{host} resolves to {resolved}, local redirect is not in place")]
    RedirectMismatch { host: String, resolved: IpAddr },

    #[error("could not resolve {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{addr} is already in use: {source}")]
    PortInUse {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::UpstreamDecode(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::UpstreamTransport(value.to_string())
    }
}

impl From<rcgen::Error> for Error {
    fn from(value: rcgen::Error) -> Self {
        Error::CertificateBuild(value.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "reason": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn transport_failure_is_500_with_reason() {
        let response = Error::UpstreamTransport("connection refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({ "reason": "connection refused" }));
    }

    #[tokio::test]
    async fn decode_failure_is_502() {
        let response = Error::UpstreamDecode("expected value".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
