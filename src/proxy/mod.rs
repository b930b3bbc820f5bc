//! Outbound proxy transport
//!
//! The process holds exactly one [`Transport`], created at startup and
//! shared by every code path that dials pods, so keep-alive connections
//! established early (e.g. while probing) serve later data requests.
//! Callers never construct their own clients.

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::config::ActivatorConfig;
use crate::error::{ActivatorError, Result};
use crate::handler::{ChannelBody, PASSTHROUGH_LB_HEADER};
use crate::revision::{Protocol, Revision};

/// Shared HTTP clients for both protocols the pods may speak.
#[derive(Debug)]
pub struct Transport {
    http1: reqwest::Client,
    h2c: reqwest::Client,
    tls_enabled: bool,
}

impl Transport {
    pub fn new(config: &ActivatorConfig) -> Result<Self> {
        let ca = match &config.system_internal_tls {
            Some(tls) => {
                let pem = std::fs::read(&tls.ca_file).map_err(|e| {
                    ActivatorError::Tls(format!("Failed to read CA bundle {}: {}", tls.ca_file, e))
                })?;
                Some(reqwest::Certificate::from_pem(&pem).map_err(|e| {
                    ActivatorError::Tls(format!("Failed to parse CA bundle: {}", e))
                })?)
            }
            None => None,
        };

        let base = |http2: bool| {
            let mut builder = reqwest::Client::builder()
                .pool_max_idle_per_host(config.max_idle_proxy_conns_per_host);
            if http2 {
                builder = builder.http2_prior_knowledge();
            }
            if let Some(cert) = &ca {
                builder = builder.add_root_certificate(cert.clone());
            }
            builder
                .build()
                .map_err(|e| ActivatorError::Config(format!("Failed to build transport: {}", e)))
        };

        Ok(Self {
            http1: base(false)?,
            h2c: base(true)?,
            tls_enabled: config.system_internal_tls.is_some(),
        })
    }

    pub fn client(&self, protocol: Protocol) -> &reqwest::Client {
        match protocol {
            Protocol::Http1 => &self.http1,
            Protocol::H2c => &self.h2c,
        }
    }

    /// Whether pods are dialed over TLS
    pub fn tls_enabled(&self) -> bool {
        self.tls_enabled
    }
}

/// A request prepared for forwarding: headers pruned once, body
/// buffered so a connection-refused attempt can be replayed against a
/// fresh pod.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: http::Method,
    pub path_and_query: String,
    pub headers: http::HeaderMap,
    pub body: Bytes,
    pub protocol: Protocol,
    pub scheme: &'static str,
    pub host_override: Option<String>,
}

impl ProxyRequest {
    pub fn new(
        parts: &http::request::Parts,
        body: Bytes,
        revision: &Revision,
        transport: &Transport,
        host_override: Option<String>,
        headers_to_remove: &[String],
    ) -> Self {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        // Scheme follows the system-internal TLS setting, but only for
        // revisions whose pods actually expose the TLS port.
        let scheme = if transport.tls_enabled() && revision.tls_port_enabled {
            "https"
        } else {
            "http"
        };
        Self {
            method: parts.method.clone(),
            path_and_query,
            headers: prune_headers(&parts.headers, headers_to_remove),
            body,
            protocol: revision.protocol,
            scheme,
            host_override,
        }
    }
}

/// Response metadata plus a streaming body.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: http::StatusCode,
    pub headers: http::HeaderMap,
    pub body: ChannelBody,
}

/// Forward a prepared request to the chosen destination. Resolves once
/// response headers arrive; the body streams through a small channel
/// pumped by a background task. A connection-level failure before any
/// response bytes maps to the retryable [`ActivatorError::PodUnavailable`].
pub async fn forward(
    transport: &Transport,
    request: &ProxyRequest,
    dest: &str,
) -> Result<ForwardedResponse> {
    let url = format!("{}://{}{}", request.scheme, dest, request.path_and_query);
    let mut builder = transport
        .client(request.protocol)
        .request(request.method.clone(), &url);
    for (key, value) in request.headers.iter() {
        builder = builder.header(key, value);
    }
    if let Some(host) = &request.host_override {
        // An explicit Host plus the passthrough header tells downstream
        // load balancers to honor direct pod addressing.
        builder = builder
            .header(http::header::HOST, host.as_str())
            .header(PASSTHROUGH_LB_HEADER, "true");
    }
    builder = builder.body(request.body.clone());

    // The clients carry no deadline of their own; request timing is
    // enforced upstream by the timeout handler.
    let response = builder.send().await.map_err(|e| {
        if e.is_connect() {
            ActivatorError::PodUnavailable(format!("{}: {}", dest, e))
        } else {
            ActivatorError::Http(e)
        }
    })?;

    let status = response.status();
    let headers = response.headers().clone();

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            }
        }
    });

    Ok(ForwardedResponse {
        status,
        headers,
        body: ChannelBody::new(rx),
    })
}

/// Check if a header is hop-by-hop and must not be forwarded
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn prune_headers(headers: &http::HeaderMap, headers_to_remove: &[String]) -> http::HeaderMap {
    let mut pruned = http::HeaderMap::with_capacity(headers.len());
    for (key, value) in headers.iter() {
        let name = key.as_str();
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
            continue;
        }
        if headers_to_remove.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            continue;
        }
        pruned.insert(key.clone(), value.clone());
    }
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::RevisionKey;
    use std::time::Duration;

    fn revision(protocol: Protocol, tls_port: bool) -> Revision {
        Revision {
            key: RevisionKey::new("default", "hello-00001"),
            container_concurrency: 10,
            timeout: Duration::from_secs(300),
            response_start_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            protocol,
            tls_port_enabled: tls_port,
        }
    }

    fn parts(uri: &str, headers: &[(&str, &str)]) -> http::request::Parts {
        let mut builder = http::Request::builder().method("POST").uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn transport() -> Transport {
        Transport::new(&ActivatorConfig::default()).unwrap()
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("Upgrade"));

        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("X-Custom-Header"));
    }

    #[tokio::test]
    async fn test_proxy_request_prunes_headers() {
        let parts = parts(
            "http://gw/api?x=1",
            &[
                ("content-type", "application/json"),
                ("connection", "keep-alive"),
                ("host", "hello.default.example.com"),
                ("x-internal-token", "secret"),
            ],
        );
        let req = ProxyRequest::new(
            &parts,
            Bytes::from("{}"),
            &revision(Protocol::Http1, false),
            &transport(),
            None,
            &["X-Internal-Token".to_string()],
        );

        assert_eq!(req.path_and_query, "/api?x=1");
        assert!(req.headers.contains_key("content-type"));
        assert!(!req.headers.contains_key("connection"));
        assert!(!req.headers.contains_key("host"));
        assert!(!req.headers.contains_key("x-internal-token"));
        assert_eq!(req.scheme, "http");
    }

    #[tokio::test]
    async fn test_scheme_follows_tls_and_revision() {
        let cfg = ActivatorConfig::default();
        let plain = Transport::new(&cfg).unwrap();
        let parts = parts("http://gw/", &[]);

        // No system-internal TLS: always http.
        let req = ProxyRequest::new(
            &parts,
            Bytes::new(),
            &revision(Protocol::Http1, true),
            &plain,
            None,
            &[],
        );
        assert_eq!(req.scheme, "http");
    }

    #[tokio::test]
    async fn test_proxy_request_defaults_root_path() {
        let parts = parts("http://gw", &[]);
        let req = ProxyRequest::new(
            &parts,
            Bytes::new(),
            &revision(Protocol::H2c, false),
            &transport(),
            None,
            &[],
        );
        assert_eq!(req.path_and_query, "/");
        assert_eq!(req.protocol, Protocol::H2c);
    }

    #[tokio::test]
    async fn test_forward_refused_connection_is_retryable() {
        let t = transport();
        let parts = parts("http://gw/", &[]);
        let req = ProxyRequest::new(
            &parts,
            Bytes::new(),
            &revision(Protocol::Http1, false),
            &t,
            None,
            &[],
        );
        // Port 9 is unassigned on loopback; the dial is refused.
        let err = forward(&t, &req, "127.0.0.1:9").await.unwrap_err();
        assert!(err.retryable(), "expected retryable error, got {}", err);
    }

    #[test]
    fn test_transport_missing_ca_file() {
        let cfg = ActivatorConfig {
            system_internal_tls: Some(crate::config::InternalTlsConfig {
                ca_file: "/nonexistent/ca.pem".into(),
            }),
            ..ActivatorConfig::default()
        };
        let err = Transport::new(&cfg).unwrap_err();
        assert!(matches!(err, ActivatorError::Tls(_)));
    }
}
