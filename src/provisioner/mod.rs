//! Provisioning capabilities used by the bootstrap sequences
//!
//! The coordinator never touches certificates, manifests or the node agent
//! directly. It drives them through [`Provisioner`], which production wires
//! to [`KubeadmProvisioner`] and tests replace with a mock.

mod kubeadm;
mod kubeadm_config;

use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::assets::SharedAssets;
use crate::Result;

pub use kubeadm::{KubeadmProvisioner, Layout};
pub(crate) use kubeadm::write_file;
pub use kubeadm_config::{parse_taint, render_kubeadm_config, Taint};

/// Identity a client credential is issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientRole {
    /// Cluster administrator
    Admin,
    /// The node agent (kubelet) of this node
    NodeAgent,
    /// kube-controller-manager
    ControllerManager,
    /// kube-scheduler
    Scheduler,
}

impl ClientRole {
    /// All roles, in generation order
    pub const ALL: [ClientRole; 4] = [
        ClientRole::Admin,
        ClientRole::NodeAgent,
        ClientRole::ControllerManager,
        ClientRole::Scheduler,
    ];

    /// Kubeconfig file name
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Admin => "admin.conf",
            Self::NodeAgent => "kubelet.conf",
            Self::ControllerManager => "controller-manager.conf",
            Self::Scheduler => "scheduler.conf",
        }
    }

    /// Certificate common name
    pub fn client_name(&self, node_name: &str) -> String {
        match self {
            Self::Admin => "kubernetes-admin".to_string(),
            Self::NodeAgent => format!("system:node:{}", node_name),
            Self::ControllerManager => "system:kube-controller-manager".to_string(),
            Self::Scheduler => "system:kube-scheduler".to_string(),
        }
    }

    /// Certificate organization, if any
    pub fn organization(&self) -> Option<&'static str> {
        match self {
            Self::Admin => Some("system:masters"),
            Self::NodeAgent => Some("system:nodes"),
            Self::ControllerManager | Self::Scheduler => None,
        }
    }
}

impl std::fmt::Display for ClientRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Admin => "admin",
            Self::NodeAgent => "node-agent",
            Self::ControllerManager => "controller-manager",
            Self::Scheduler => "scheduler",
        };
        f.write_str(name)
    }
}

/// Everything the bootstrap sequences ask of the node
///
/// Each operation must be safe to repeat: a second leader taking over after
/// a crashed first one runs the same steps over whatever the first left on
/// disk.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Place the cluster CA where PKI generation expects it
    async fn stage_ca(&self) -> Result<()>;

    /// Generate the control-plane PKI (reuses material already on disk)
    async fn generate_pki(&self) -> Result<()>;

    /// Write the static control-plane manifests
    async fn write_manifests(&self) -> Result<()>;

    /// Load the material every control-plane node must share
    async fn load_shared_assets(&self) -> Result<SharedAssets>;

    /// Write shared material received from the primary to disk
    async fn persist_shared_assets(&self, assets: &SharedAssets) -> Result<()>;

    /// Generate a client credential, returning the kubeconfig path
    async fn generate_client_credentials(&self, role: ClientRole) -> Result<PathBuf>;

    /// Start the node agent, in control-plane or worker mode
    async fn start_node_agent(&self, control_plane: bool) -> Result<()>;

    /// Apply cluster add-ons (DNS, proxy)
    async fn apply_addons(&self) -> Result<()>;

    /// Label and taint this node as control plane
    async fn mark_control_plane(&self) -> Result<()>;

    /// Install the pod network overlay
    async fn install_network(&self) -> Result<()>;

    /// Issue join tokens for follower nodes
    async fn deploy_tokens(&self) -> Result<()>;
}
