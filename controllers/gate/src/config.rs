//! Process configuration.
//!
//! Settings come from environment variables; cluster-wide VM settings live
//! in the `MaroonedPodsConfig` resource instead (see `sizing::VmDefaults`).

use std::net::SocketAddr;
use std::time::Duration;

use crds::labels::DEFAULT_NAMESPACE;

use crate::error::ControllerError;

/// Worker tasks draining the queue.
pub const DEFAULT_WORKER_THREADS: usize = 3;
/// Seconds between warm pool reconciliations.
pub const DEFAULT_POOL_RECONCILE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_CONTROLLER_NAME: &str = "maroonedpods-controller";
pub const DEFAULT_JOIN_ENDPOINT: &str = "192.168.66.101:6443";
pub const DEFAULT_JOIN_TOKEN: &str = "abcdef.1234567890123456";

/// How a freshly booted node VM joins the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinConfig {
    /// `host:port` of the API server
    pub api_server_endpoint: String,
    /// kubeadm bootstrap token
    pub token: String,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            api_server_endpoint: DEFAULT_JOIN_ENDPOINT.to_string(),
            token: DEFAULT_JOIN_TOKEN.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub worker_threads: usize,
    /// Namespace pool VMIs are created in
    pub pool_namespace: String,
    pub pool_reconcile_interval: Duration,
    pub metrics_addr: SocketAddr,
    /// Reporting controller name on emitted events
    pub controller_name: String,
    pub join: JoinConfig,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let worker_threads = parse_var("WORKER_THREADS", &var("WORKER_THREADS", &DEFAULT_WORKER_THREADS.to_string()))?;
        if worker_threads == 0 {
            return Err(ControllerError::InvalidConfig(
                "WORKER_THREADS must be at least 1".to_string(),
            ));
        }
        let interval_secs: u64 = parse_var(
            "POOL_RECONCILE_INTERVAL_SECS",
            &var("POOL_RECONCILE_INTERVAL_SECS", &DEFAULT_POOL_RECONCILE_INTERVAL_SECS.to_string()),
        )?;
        if interval_secs == 0 {
            return Err(ControllerError::InvalidConfig(
                "POOL_RECONCILE_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            worker_threads,
            pool_namespace: var("POOL_NAMESPACE", DEFAULT_NAMESPACE),
            pool_reconcile_interval: Duration::from_secs(interval_secs),
            metrics_addr: parse_var("METRICS_ADDR", &var("METRICS_ADDR", DEFAULT_METRICS_ADDR))?,
            controller_name: var("CONTROLLER_NAME", DEFAULT_CONTROLLER_NAME),
            join: JoinConfig {
                api_server_endpoint: var("KUBEADM_JOIN_ENDPOINT", DEFAULT_JOIN_ENDPOINT),
                token: var("KUBEADM_JOIN_TOKEN", DEFAULT_JOIN_TOKEN),
            },
        })
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, ControllerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ControllerError::InvalidConfig(format!("{key}={value:?}: {e}")))
}
