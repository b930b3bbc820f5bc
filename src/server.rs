//! Network listeners
//!
//! Binds the HTTP, h2c, optional HTTPS, and admin listeners, serves the
//! handler chain on each, and supports graceful shutdown: accept loops
//! stop on signal, in-flight connections finish draining.

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

use crate::config::{ActivatorConfig, TlsConfig};
use crate::error::{ActivatorError, Result};
use crate::handler::{text_response, Body, BoxError, HealthState, HttpHandler};
use crate::observability::ActivatorMetrics;

/// How connections on a listener are terminated
#[derive(Clone)]
pub enum ConnMode {
    Http1,
    H2c,
    Tls(TlsAcceptor),
}

/// Running listener set
pub struct Servers {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Servers {
    /// Stop accepting and drain in-flight connections.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("Servers shut down");
    }
}

/// Bind and serve every configured listener.
pub async fn start(
    config: &ActivatorConfig,
    chain: Arc<dyn HttpHandler>,
    admin: Arc<AdminHandler>,
) -> Result<Servers> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    let bind = |port: u16| async move {
        TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| ActivatorError::Other(format!("Failed to bind port {}: {}", port, e)))
    };

    handles.push(serve_listener(
        "http1",
        bind(config.http_port).await?,
        ConnMode::Http1,
        chain.clone(),
        shutdown_rx.clone(),
    ));
    handles.push(serve_listener(
        "h2c",
        bind(config.h2c_port).await?,
        ConnMode::H2c,
        chain.clone(),
        shutdown_rx.clone(),
    ));
    if let Some(tls) = &config.tls {
        handles.push(serve_listener(
            "https",
            bind(config.https_port).await?,
            ConnMode::Tls(tls_acceptor(tls)?),
            chain.clone(),
            shutdown_rx.clone(),
        ));
    }
    handles.push(serve_listener(
        "admin",
        bind(config.admin_port).await?,
        ConnMode::Http1,
        admin,
        shutdown_rx.clone(),
    ));

    Ok(Servers {
        shutdown_tx,
        handles,
    })
}

/// Accept loop for one listener. On shutdown the loop stops accepting,
/// the listener socket closes, and every live connection is asked to
/// finish gracefully before the task returns.
pub fn serve_listener(
    name: &'static str,
    listener: TcpListener,
    mode: ConnMode,
    chain: Arc<dyn HttpHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let addr = listener.local_addr().ok();
    tracing::info!(listener = name, address = ?addr, "Listening");

    tokio::spawn(async move {
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                accepted = listener.accept() => {
                    let (stream, _remote) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(listener = name, error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    conns.spawn(handle_connection(
                        name,
                        stream,
                        mode.clone(),
                        chain.clone(),
                        shutdown.clone(),
                    ));
                }
                // Reap finished connection tasks as we go.
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        }
        drop(listener);
        tracing::info!(listener = name, "Draining connections");
        while conns.join_next().await.is_some() {}
    })
}

async fn handle_connection(
    name: &'static str,
    stream: TcpStream,
    mode: ConnMode,
    chain: Arc<dyn HttpHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let service = service_fn(move |req: Request<Incoming>| {
        let chain = chain.clone();
        async move { Ok::<_, Infallible>(chain.handle(to_chain_request(req)).await) }
    });

    match mode {
        ConnMode::Http1 => {
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            tokio::pin!(conn);
            tokio::select! {
                result = conn.as_mut() => log_conn_end(name, result),
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    conn.as_mut().graceful_shutdown();
                    log_conn_end(name, conn.await);
                }
            }
        }
        ConnMode::H2c => {
            let conn = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);
            tokio::select! {
                result = conn.as_mut() => log_conn_end(name, result),
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    conn.as_mut().graceful_shutdown();
                    log_conn_end(name, conn.await);
                }
            }
        }
        ConnMode::Tls(acceptor) => {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(listener = name, error = %e, "TLS handshake failed");
                    return;
                }
            };
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service)
                .with_upgrades();
            tokio::pin!(conn);
            tokio::select! {
                result = conn.as_mut() => log_conn_end(name, result),
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    conn.as_mut().graceful_shutdown();
                    log_conn_end(name, conn.await);
                }
            }
        }
    }
}

fn log_conn_end(name: &'static str, result: std::result::Result<(), hyper::Error>) {
    if let Err(e) = result {
        tracing::debug!(listener = name, error = %e, "Connection ended");
    }
}

/// Acceptor for the HTTPS listener, built from the configured PEM
/// material. Serving certificates are rotated by restarting the pod;
/// nothing is reloaded at runtime.
fn tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let read = |path: &String, what: &str| {
        std::fs::read(path)
            .map_err(|e| ActivatorError::Tls(format!("Failed to read {} {}: {}", what, path, e)))
    };
    let cert_pem = read(&tls.cert_file, "certificate chain")?;
    let key_pem = read(&tls.key_file, "private key")?;

    let mut cert_slice = cert_pem.as_slice();
    let certs = rustls_pemfile::certs(&mut cert_slice)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            ActivatorError::Tls(format!("Bad certificate chain in {}: {}", tls.cert_file, e))
        })?;
    if certs.is_empty() {
        return Err(ActivatorError::Tls(format!(
            "{} holds no certificates",
            tls.cert_file
        )));
    }

    let mut key_slice = key_pem.as_slice();
    let key = rustls_pemfile::private_key(&mut key_slice)
        .map_err(|e| ActivatorError::Tls(format!("Bad private key in {}: {}", tls.key_file, e)))?
        .ok_or_else(|| {
            ActivatorError::Tls(format!("{} holds no private key", tls.key_file))
        })?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ActivatorError::Tls(format!("Unusable serving certificate: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn to_chain_request(req: Request<Incoming>) -> Request<Body> {
    req.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed_unsync())
}

/// Admin surface: Prometheus metrics and health endpoints.
pub struct AdminHandler {
    metrics: Arc<ActivatorMetrics>,
    health: Arc<HealthState>,
}

impl AdminHandler {
    pub fn new(metrics: Arc<ActivatorMetrics>, health: Arc<HealthState>) -> Arc<Self> {
        Arc::new(Self { metrics, health })
    }
}

#[async_trait]
impl HttpHandler for AdminHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        match req.uri().path() {
            "/metrics" => Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(crate::handler::full_body(self.metrics.render_prometheus()))
                .unwrap(),
            "/healthz/ready" => match self.health.readiness() {
                Ok(()) => text_response(StatusCode::OK, "ready"),
                Err(e) => text_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
            },
            "/healthz/live" => text_response(StatusCode::OK, "alive"),
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        }
    }
}
