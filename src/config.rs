//! Coordinator and node configuration
//!
//! [`BootstrapConfig`] drives the election; [`NodeSettings`] describes the
//! node being provisioned. Both are assembled once at startup (CLI values,
//! then cloud metadata) and are not mutated afterwards.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::{Error, Result};

/// Store key holding the published shared assets
pub const DEFAULT_ASSET_KEY: &str = "cpboot-asset-key";

/// Store key of the election lock
pub const DEFAULT_LOCK_KEY: &str = "cpboot-asset-lock";

/// Wait between election attempts while another node holds the lock
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(20);

/// Lifetime of the election lock if its holder never releases it
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(120);

/// Longest lock TTL a store can represent (lease durations are `i32` seconds)
pub const MAX_LOCK_TTL: Duration = Duration::from_secs(i32::MAX as u64);

/// Default pod network CIDR handed to the network overlay
pub const DEFAULT_POD_NETWORK_CIDR: &str = "10.244.0.0/16";

/// Default network overlay
pub const DEFAULT_NETWORK_PROVIDER: &str = "cilium";

/// What the process does once bootstrap has succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Return to the caller (one-shot runs, tests)
    Exit,
    /// Stay alive as a long-lived supervisory process
    #[default]
    Park,
}

impl CompletionMode {
    /// Map the `--exit-on-completion` flag to a mode
    pub fn from_exit_flag(exit_on_completion: bool) -> Self {
        if exit_on_completion {
            Self::Exit
        } else {
            Self::Park
        }
    }
}

/// Election settings for one coordinating process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    /// Cluster identity
    pub cluster_name: String,
    /// Wait between attempts under lock contention
    pub backoff: Duration,
    /// TTL of the election lock
    pub lock_ttl: Duration,
    /// Store key of the shared asset record
    pub asset_key: String,
    /// Store key of the election lock
    pub lock_key: String,
    /// Terminate or park after success
    pub completion: CompletionMode,
}

impl BootstrapConfig {
    /// Config with default timings and keys
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            backoff: DEFAULT_BACKOFF,
            lock_ttl: DEFAULT_LOCK_TTL,
            asset_key: DEFAULT_ASSET_KEY.to_string(),
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            completion: CompletionMode::default(),
        }
    }

    /// Override the backoff interval
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the lock TTL
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Override both store keys
    pub fn with_keys(mut self, asset_key: impl Into<String>, lock_key: impl Into<String>) -> Self {
        self.asset_key = asset_key.into();
        self.lock_key = lock_key.into();
        self
    }

    /// Override the completion behaviour
    pub fn with_completion(mut self, completion: CompletionMode) -> Self {
        self.completion = completion;
        self
    }

    /// Reject configurations the election cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.asset_key.is_empty() || self.lock_key.is_empty() {
            return Err(Error::config("asset and lock keys must not be empty"));
        }
        if self.asset_key == self.lock_key {
            return Err(Error::config("asset key and lock key must differ"));
        }
        if self.lock_ttl.is_zero() {
            return Err(Error::config("lock TTL must be greater than zero"));
        }
        if self.lock_ttl > MAX_LOCK_TTL {
            return Err(Error::config(format!(
                "lock TTL must not exceed {}s",
                MAX_LOCK_TTL.as_secs()
            )));
        }
        Ok(())
    }
}

/// Description of the node being provisioned
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSettings {
    /// Cloud provider to fetch node data from (none = use CLI values only)
    pub cloud_provider: Option<String>,
    /// Cluster name
    pub cluster_name: String,
    /// Node name registered with the API server
    pub node_name: String,
    /// Control-plane endpoint
    pub api_server: Option<Url>,
    /// Kubernetes version to deploy
    pub kube_version: String,
    /// Pod network CIDR
    pub pod_network_cidr: String,
    /// Network overlay name
    pub network_provider: String,
    /// Persistent cluster CA certificate
    pub ca_cert: PathBuf,
    /// Persistent cluster CA key
    pub ca_key: PathBuf,
    /// Extra API server flags
    pub apiserver_extra_args: BTreeMap<String, String>,
    /// Extra controller-manager flags
    pub controller_manager_extra_args: BTreeMap<String, String>,
    /// Extra scheduler flags
    pub scheduler_extra_args: BTreeMap<String, String>,
    /// Extra kubelet flags, passed through verbatim
    pub kubelet_extra_args: String,
    /// Labels for this node
    pub node_labels: BTreeMap<String, String>,
    /// Taints for this node (`key -> value[:Effect]`)
    pub node_taints: BTreeMap<String, String>,
}

impl NodeSettings {
    /// Control-plane endpoint, required for master bootstrap
    pub fn require_api_server(&self) -> Result<&Url> {
        self.api_server
            .as_ref()
            .ok_or_else(|| Error::config("no API server URL configured"))
    }

    /// API server host without port
    pub fn api_host(&self) -> Result<String> {
        let url = self.require_api_server()?;
        url.host_str()
            .map(str::to_string)
            .ok_or_else(|| Error::config(format!("API server URL {} has no host", url)))
    }

    /// API server port, 443 when the URL has none
    pub fn api_port(&self) -> Result<u16> {
        Ok(self.require_api_server()?.port().unwrap_or(443))
    }

    /// `host:port` endpoint used in kubeconfigs and manifests
    pub fn control_plane_endpoint(&self) -> Result<String> {
        Ok(format!("{}:{}", self.api_host()?, self.api_port()?))
    }
}

/// Parse an API server URL, rejecting empty input
pub fn parse_api_server(raw: &str) -> Result<Url> {
    if raw.trim().is_empty() {
        return Err(Error::config("empty API server URL"));
    }
    Url::parse(raw).map_err(|e| Error::config(format!("error parsing API server {}: {}", raw, e)))
}
