//! Finding the real address of the target host.
//!
//! The local redirect points the host at loopback, so the system resolver is
//! of no use here. Both backends ask a public service directly.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioResolver;
use hickory_resolver::config::{NameServerConfig, NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::{ResolverKind, Settings};
use crate::error::{Error, Result};

const DOH_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON DNS-over-HTTPS (`?name=<host>&short=true` answering `["1.2.3.4"]`).
#[derive(Debug, Clone)]
pub struct DohResolver {
    endpoint: String,
    client: reqwest::Client,
    client_subnet: Option<IpAddr>,
}

#[derive(Deserialize)]
struct ClientIp {
    ip: String,
}

impl DohResolver {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DOH_TIMEOUT)
            .build()
            .map_err(|e| Error::Resolve(format!("build DoH client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
            client_subnet: None,
        })
    }

    /// Sends `ip` as `edns_client_subnet` so the answer is near the caller.
    pub fn with_client_subnet(mut self, ip: IpAddr) -> Self {
        self.client_subnet = Some(ip);
        self
    }

    /// Our public address as reported by `endpoint` (`?type=0` answering
    /// `{"ip": "..."}`).
    pub async fn lookup_client_ip(&self, endpoint: &str) -> Result<IpAddr> {
        let answer: ClientIp = self
            .client
            .get(endpoint)
            .query(&[("type", "0")])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Resolve(format!("query {endpoint}: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Resolve(format!("decode client address: {e}")))?;
        answer
            .ip
            .trim()
            .parse()
            .map_err(|e| Error::Resolve(format!("client address {:?}: {e}", answer.ip)))
    }

    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        let mut request = self
            .client
            .get(&self.endpoint)
            .query(&[("name", host), ("short", "true")]);
        if let Some(subnet) = self.client_subnet {
            request = request.query(&[("edns_client_subnet", subnet.to_string())]);
        }
        let answers: Vec<String> = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Resolve(format!("query {}: {e}", self.endpoint)))?
            .json()
            .await
            .map_err(|e| Error::Resolve(format!("decode DoH answer: {e}")))?;

        first_address(&answers).ok_or_else(|| Error::Resolve(format!("no address for {host}")))
    }
}

/// Plain DNS against one nameserver.
#[derive(Clone)]
pub struct DnsResolver {
    inner: Arc<TokioResolver>,
}

impl DnsResolver {
    pub fn new(nameserver: SocketAddr) -> Self {
        let group = NameServerConfigGroup::from(vec![NameServerConfig::new(
            nameserver,
            Protocol::Udp,
        )]);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let inner = TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
            .build();
        Self {
            inner: Arc::new(inner),
        }
    }

    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        // A records only; lookup_ip would consult the hosts file.
        let lookup = self
            .inner
            .ipv4_lookup(host)
            .await
            .map_err(|e| Error::Resolve(format!("lookup {host}: {e}")))?;
        lookup
            .iter()
            .next()
            .map(|a| IpAddr::V4(a.0))
            .ok_or_else(|| Error::Resolve(format!("no address for {host}")))
    }
}

#[derive(Clone)]
pub enum UpstreamResolver {
    Doh(DohResolver),
    Dns(DnsResolver),
    Fixed(IpAddr),
}

impl UpstreamResolver {
    /// Builds the configured backend. For DoH the client subnet is looked up
    /// first; without it the query goes out plain.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(match settings.resolver.kind {
            ResolverKind::Doh => {
                let doh = DohResolver::new(&settings.host_dns)?;
                let endpoint = &settings.resolver.client_ip_endpoint;
                if endpoint.is_empty() {
                    UpstreamResolver::Doh(doh)
                } else {
                    match doh.lookup_client_ip(endpoint).await {
                        Ok(ip) => {
                            info!(%ip, "client subnet for DoH");
                            UpstreamResolver::Doh(doh.with_client_subnet(ip))
                        }
                        Err(e) => {
                            warn!("client subnet unknown: {e}");
                            UpstreamResolver::Doh(doh)
                        }
                    }
                }
            }
            ResolverKind::Dns => UpstreamResolver::Dns(DnsResolver::new(settings.resolver.nameserver)),
            ResolverKind::Fixed => UpstreamResolver::Fixed(settings.default_ip),
        })
    }

    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        match self {
            UpstreamResolver::Doh(doh) => doh.resolve(host).await,
            UpstreamResolver::Dns(dns) => dns.resolve(host).await,
            UpstreamResolver::Fixed(ip) => Ok(*ip),
        }
    }

    /// Resolves `host`, falling back to `default` on any failure.
    pub async fn resolve_or(&self, host: &str, default: IpAddr) -> IpAddr {
        match self.resolve(host).await {
            Ok(ip) => {
                info!(host, %ip, "upstream resolved");
                ip
            }
            Err(e) => {
                error!(host, fallback = %default, "upstream resolution failed, using fallback: {e}");
                default
            }
        }
    }
}

// Short answers may lead with CNAME targets.
fn first_address(answers: &[String]) -> Option<IpAddr> {
    answers.iter().find_map(|answer| answer.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_cname_entries() {
        let answers = vec![
            "service.mkey.163.com.edgekey.net.".to_string(),
            "42.186.193.21".to_string(),
            "42.186.193.22".to_string(),
        ];
        assert_eq!(first_address(&answers), Some("42.186.193.21".parse().unwrap()));
        assert_eq!(first_address(&[]), None);
    }

    #[tokio::test]
    async fn fixed_resolver_never_fails() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        let resolver = UpstreamResolver::Fixed(ip);
        assert_eq!(resolver.resolve_or("example.com", "1.1.1.1".parse().unwrap()).await, ip);
    }

    async fn serve_http(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn doh_sends_discovered_client_subnet() {
        use axum::extract::Query;
        use axum::routing::get;
        use std::collections::HashMap;

        let router = axum::Router::new()
            .route(
                "/ip",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("type").map(String::as_str), Some("0"));
                    axum::Json(serde_json::json!({ "ip": "203.0.113.7" }))
                }),
            )
            .route(
                "/resolve",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    let near = q.get("edns_client_subnet").map(String::as_str) == Some("203.0.113.7");
                    let ip = if near { "10.9.8.7" } else { "10.0.0.1" };
                    axum::Json(serde_json::json!(["edge.example.net.", ip]))
                }),
            );
        let base = serve_http(router).await;

        let mut settings = Settings::default();
        settings.host_dns = format!("{base}/resolve");
        settings.resolver.client_ip_endpoint = format!("{base}/ip");
        let resolver = UpstreamResolver::from_settings(&settings).await.unwrap();
        assert_eq!(resolver.resolve("example.com").await.unwrap(), "10.9.8.7".parse::<IpAddr>().unwrap());

        settings.resolver.client_ip_endpoint = format!("{base}/missing");
        let resolver = UpstreamResolver::from_settings(&settings).await.unwrap();
        assert_eq!(resolver.resolve("example.com").await.unwrap(), "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn fixed_kind_uses_default_ip() {
        let mut settings = Settings::default();
        settings.resolver.kind = ResolverKind::Fixed;
        let resolver = UpstreamResolver::from_settings(&settings).await.unwrap();
        assert_eq!(resolver.resolve("example.com").await.unwrap(), settings.default_ip);
    }

    #[tokio::test]
    async fn unreachable_doh_falls_back() {
        let resolver = UpstreamResolver::Doh(DohResolver::new("http://127.0.0.1:9/resolve").unwrap());
        let fallback: IpAddr = "42.186.193.21".parse().unwrap();
        assert_eq!(resolver.resolve_or("example.com", fallback).await, fallback);
    }
}
