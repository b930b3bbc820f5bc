//! Configuration types for the activator
//!
//! The activator is configured from a TOML file plus the `POD_NAME` and
//! `POD_IP` environment variables. Every knob has a default so an empty
//! file is a valid configuration apart from the topology source.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ActivatorError, Result};

/// How the activator decides whether pod IPs are directly dialable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshCompatibilityMode {
    /// Assume a mesh is present; pod IPs are dialable only when the mesh
    /// is known to expose them.
    Enabled,
    /// Assume no mesh; always dial pod IPs directly.
    Disabled,
    /// Follow `enable_mesh_pod_addressability`.
    Auto,
}

impl Default for MeshCompatibilityMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// Certificate material for the HTTPS listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain file
    pub cert_file: String,
    /// PEM private key file
    pub key_file: String,
}

/// TLS towards revision pods (system-internal traffic)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalTlsConfig {
    /// PEM bundle with the CA that signed the pods' serving certificates
    pub ca_file: String,
}

/// Top-level activator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatorConfig {
    /// Plain HTTP/1.1 listener port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTP/2 cleartext listener port
    #[serde(default = "default_h2c_port")]
    pub h2c_port: u16,

    /// HTTPS listener port, served only when `tls` is set
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Admin listener port (metrics, health probes)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Certificate for the HTTPS listener
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Autoscaler stat sink hostname
    #[serde(default = "default_autoscaler_host")]
    pub autoscaler_host: String,

    /// Autoscaler stat sink port
    #[serde(default = "default_autoscaler_port")]
    pub autoscaler_port: u16,

    /// Stat reporting window in seconds
    #[serde(default = "default_reporting_period")]
    pub reporting_period_secs: u64,

    /// Bounded stat buffer between the reporter and the sink
    #[serde(default = "default_stat_buffer")]
    pub stat_buffer: usize,

    /// Idle connection pool size of the shared proxy transport
    #[serde(default = "default_max_idle_proxy_conns")]
    pub max_idle_proxy_conns: usize,

    /// Idle connections kept per pod
    #[serde(default = "default_max_idle_proxy_conns_per_host")]
    pub max_idle_proxy_conns_per_host: usize,

    /// Whether the network allows dialing pod IPs even under a mesh
    #[serde(default = "default_true")]
    pub enable_mesh_pod_addressability: bool,

    /// Mesh compatibility switch
    #[serde(default)]
    pub mesh_compatibility_mode: MeshCompatibilityMode,

    /// Dial pods over TLS using the given CA bundle
    #[serde(default)]
    pub system_internal_tls: Option<InternalTlsConfig>,

    /// Seconds to keep failing readiness before shutting servers down
    #[serde(default = "default_drain_timeout")]
    pub cluster_drain_timeout_secs: u64,

    /// Connection-refusal retries against freshly selected pods
    #[serde(default = "default_max_proxy_retries")]
    pub max_proxy_retries: u32,

    /// Delay between proxy retries in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Per-revision bound on queued waiters
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Override the Host header on forwarded requests
    #[serde(default)]
    pub host_override: Option<String>,

    /// Headers stripped from forwarded requests
    #[serde(default)]
    pub headers_to_remove: Vec<String>,

    /// Topology file watched for revision, endpoint, and routing state
    #[serde(default)]
    pub topology_file: Option<String>,
}

impl ActivatorConfig {
    /// Load configuration from a TOML file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ActivatorError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ActivatorError::Config(format!("Failed to parse TOML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        let ports = [
            self.http_port,
            self.h2c_port,
            self.https_port,
            self.admin_port,
        ];
        for (i, a) in ports.iter().enumerate() {
            if ports[i + 1..].contains(a) {
                return Err(ActivatorError::Config(format!(
                    "Listener port {} is used more than once",
                    a
                )));
            }
        }
        if self.reporting_period_secs == 0 {
            return Err(ActivatorError::Config(
                "reporting_period_secs must be at least 1".into(),
            ));
        }
        if self.stat_buffer == 0 {
            return Err(ActivatorError::Config(
                "stat_buffer must be at least 1".into(),
            ));
        }
        if self.max_queue_depth == 0 {
            return Err(ActivatorError::Config(
                "max_queue_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// WebSocket URL of the autoscaler stat sink
    pub fn autoscaler_url(&self) -> String {
        format!("ws://{}:{}", self.autoscaler_host, self.autoscaler_port)
    }

    /// Stat reporting window
    pub fn reporting_period(&self) -> Duration {
        Duration::from_secs(self.reporting_period_secs)
    }

    /// Sleep between the drain signal and server shutdown
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_drain_timeout_secs)
    }

    /// Delay between proxy retries
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Resolve the ingress-dependent routing decision to a single flag:
    /// true means the throttler targets pod IPs directly, false means it
    /// targets each revision's private service.
    pub fn pod_addressability(&self) -> bool {
        match self.mesh_compatibility_mode {
            MeshCompatibilityMode::Disabled => true,
            MeshCompatibilityMode::Enabled => false,
            MeshCompatibilityMode::Auto => self.enable_mesh_pod_addressability,
        }
    }
}

impl Default for ActivatorConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            h2c_port: default_h2c_port(),
            https_port: default_https_port(),
            admin_port: default_admin_port(),
            tls: None,
            autoscaler_host: default_autoscaler_host(),
            autoscaler_port: default_autoscaler_port(),
            reporting_period_secs: default_reporting_period(),
            stat_buffer: default_stat_buffer(),
            max_idle_proxy_conns: default_max_idle_proxy_conns(),
            max_idle_proxy_conns_per_host: default_max_idle_proxy_conns_per_host(),
            enable_mesh_pod_addressability: true,
            mesh_compatibility_mode: MeshCompatibilityMode::default(),
            system_internal_tls: None,
            cluster_drain_timeout_secs: default_drain_timeout(),
            max_proxy_retries: default_max_proxy_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_queue_depth: default_max_queue_depth(),
            host_override: None,
            headers_to_remove: Vec::new(),
            topology_file: None,
        }
    }
}

fn default_http_port() -> u16 {
    8012
}

fn default_h2c_port() -> u16 {
    8013
}

fn default_https_port() -> u16 {
    8112
}

fn default_admin_port() -> u16 {
    8010
}

fn default_autoscaler_host() -> String {
    "autoscaler".to_string()
}

fn default_autoscaler_port() -> u16 {
    8080
}

fn default_reporting_period() -> u64 {
    1
}

fn default_stat_buffer() -> usize {
    100
}

fn default_max_idle_proxy_conns() -> usize {
    1000
}

fn default_max_idle_proxy_conns_per_host() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_drain_timeout() -> u64 {
    45
}

fn default_max_proxy_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_max_queue_depth() -> usize {
    10_000
}
