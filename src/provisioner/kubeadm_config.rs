//! kubeadm configuration rendering
//!
//! Node settings are translated into a kubeadm `InitConfiguration` plus
//! `ClusterConfiguration` document pair (v1beta3), which every kubeadm phase
//! is then pointed at with `--config`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::config::NodeSettings;
use crate::{Error, Result};

const KUBEADM_API_VERSION: &str = "kubeadm.k8s.io/v1beta3";
const DEFAULT_SERVICE_SUBNET: &str = "10.96.0.0/12";
const DEFAULT_DNS_DOMAIN: &str = "cluster.local";

/// A node taint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Taint value (may be empty)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// NoSchedule, PreferNoSchedule or NoExecute
    pub effect: String,
}

impl Taint {
    /// Kubelet `--register-with-taints` form
    pub fn to_flag(&self) -> String {
        if self.value.is_empty() {
            format!("{}:{}", self.key, self.effect)
        } else {
            format!("{}={}:{}", self.key, self.value, self.effect)
        }
    }
}

/// Build a taint from a `key -> value[:Effect]` entry (effect defaults to NoSchedule)
pub fn parse_taint(key: &str, raw: &str) -> Result<Taint> {
    let (value, effect) = match raw.rsplit_once(':') {
        Some((value, effect)) => (value, effect),
        None => (raw, "NoSchedule"),
    };
    match effect {
        "NoSchedule" | "PreferNoSchedule" | "NoExecute" => Ok(Taint {
            key: key.to_string(),
            value: value.to_string(),
            effect: effect.to_string(),
        }),
        other => Err(Error::config(format!(
            "taint {} has unknown effect {}",
            key, other
        ))),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitConfiguration {
    api_version: &'static str,
    kind: &'static str,
    node_registration: NodeRegistration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeRegistration {
    name: String,
    taints: Vec<Taint>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfiguration {
    api_version: &'static str,
    kind: &'static str,
    cluster_name: String,
    kubernetes_version: String,
    control_plane_endpoint: String,
    certificates_dir: String,
    networking: Networking,
    api_server: ApiServer,
    controller_manager: Component,
    scheduler: Component,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Networking {
    pod_subnet: String,
    service_subnet: &'static str,
    dns_domain: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiServer {
    cert_s_a_ns: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    extra_args: BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Component {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    extra_args: BTreeMap<String, String>,
}

/// Render the kubeadm config for this node
pub fn render_kubeadm_config(settings: &NodeSettings, pki_dir: &Path) -> Result<String> {
    if settings.kube_version.is_empty() {
        return Err(Error::config("no Kubernetes version configured"));
    }

    let taints = settings
        .node_taints
        .iter()
        .map(|(key, raw)| parse_taint(key, raw))
        .collect::<Result<Vec<_>>>()?;

    let init = InitConfiguration {
        api_version: KUBEADM_API_VERSION,
        kind: "InitConfiguration",
        node_registration: NodeRegistration {
            name: settings.node_name.clone(),
            taints,
        },
    };

    let cluster = ClusterConfiguration {
        api_version: KUBEADM_API_VERSION,
        kind: "ClusterConfiguration",
        cluster_name: settings.cluster_name.clone(),
        kubernetes_version: settings.kube_version.clone(),
        control_plane_endpoint: settings.control_plane_endpoint()?,
        certificates_dir: pki_dir.display().to_string(),
        networking: Networking {
            pod_subnet: settings.pod_network_cidr.clone(),
            service_subnet: DEFAULT_SERVICE_SUBNET,
            dns_domain: DEFAULT_DNS_DOMAIN,
        },
        api_server: ApiServer {
            cert_s_a_ns: vec![settings.api_host()?],
            extra_args: settings.apiserver_extra_args.clone(),
        },
        controller_manager: Component {
            extra_args: settings.controller_manager_extra_args.clone(),
        },
        scheduler: Component {
            extra_args: settings.scheduler_extra_args.clone(),
        },
    };

    let render = |e: serde_yaml::Error| Error::config(format!("failed to render kubeadm config: {}", e));
    let init = serde_yaml::to_string(&init).map_err(render)?;
    let cluster = serde_yaml::to_string(&cluster).map_err(render)?;
    Ok(format!("{}---\n{}", init, cluster))
}
