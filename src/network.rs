//! Pod network overlay
//!
//! Overlay manifests are rendered with `helm template` from chart tarballs in
//! a local charts directory (control-plane nodes may be air-gapped) and then
//! applied like any other manifest.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::info;

use crate::exec;
use crate::{Error, Result};

/// Default charts directory
pub const DEFAULT_CHARTS_DIR: &str = "/opt/cpboot/charts";

/// Supported network overlays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkProvider {
    /// Cilium
    Cilium,
    /// Calico via the tigera operator
    Calico,
    /// Flannel
    Flannel,
}

impl FromStr for NetworkProvider {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cilium" => Ok(Self::Cilium),
            "calico" => Ok(Self::Calico),
            "flannel" => Ok(Self::Flannel),
            other => Err(Error::config(format!("unknown network provider: {}", other))),
        }
    }
}

impl std::fmt::Display for NetworkProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.release_name())
    }
}

impl NetworkProvider {
    /// Helm release name
    pub fn release_name(&self) -> &'static str {
        match self {
            Self::Cilium => "cilium",
            Self::Calico => "calico",
            Self::Flannel => "flannel",
        }
    }

    /// Prefix of the chart tarball in the charts directory
    pub fn chart_prefix(&self) -> &'static str {
        match self {
            Self::Cilium => "cilium-",
            Self::Calico => "tigera-operator-",
            Self::Flannel => "flannel-",
        }
    }

    /// Namespace the overlay is installed into
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Cilium => "kube-system",
            Self::Calico => "tigera-operator",
            Self::Flannel => "kube-flannel",
        }
    }

    /// `--set` values for the pod CIDR
    pub fn values(&self, pod_cidr: &str) -> Vec<String> {
        let sets: Vec<String> = match self {
            Self::Cilium => vec![
                "ipam.mode=kubernetes".to_string(),
                format!("ipam.operator.clusterPoolIPv4PodCIDRList={{{}}}", pod_cidr),
                "hubble.enabled=false".to_string(),
                "prometheus.enabled=false".to_string(),
                "operator.prometheus.enabled=false".to_string(),
            ],
            Self::Calico => vec![format!(
                "installation.calicoNetwork.ipPools[0].cidr={}",
                pod_cidr
            )],
            Self::Flannel => vec![format!("podCidr={}", pod_cidr)],
        };
        sets.into_iter()
            .flat_map(|s| ["--set".to_string(), s])
            .collect()
    }

    /// Render the overlay manifests
    pub async fn render(&self, charts_dir: &Path, pod_cidr: &str) -> Result<Vec<String>> {
        let chart = find_chart(charts_dir, self.chart_prefix())?;
        let chart = chart.display().to_string();

        let mut args = exec::args([
            "template",
            self.release_name(),
            chart.as_str(),
            "--namespace",
            self.namespace(),
        ]);
        args.extend(self.values(pod_cidr));

        let rendered = exec::run("install-network", "helm", &args, None).await?;
        let mut manifests = Vec::new();
        if self.namespace() != "kube-system" {
            manifests.push(namespace_manifest(self.namespace()));
        }
        manifests.extend(split_documents(&rendered));

        info!(
            provider = %self,
            count = manifests.len(),
            "Rendered network overlay manifests"
        );
        Ok(manifests)
    }
}

/// Find a chart tarball by prefix
fn find_chart(charts_dir: &Path, prefix: &str) -> Result<PathBuf> {
    let dir = std::fs::read_dir(charts_dir).map_err(|e| {
        Error::generation(
            "install-network",
            format!("failed to read charts dir {}: {}", charts_dir.display(), e),
        )
    })?;

    for entry in dir.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(prefix) && name.ends_with(".tgz") {
            return Ok(entry.path());
        }
    }

    Err(Error::generation(
        "install-network",
        format!("no {} chart found in {}", prefix, charts_dir.display()),
    ))
}

/// `helm template` never renders the release namespace itself
fn namespace_manifest(name: &str) -> String {
    format!("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {}", name)
}

/// Split `helm template` output into resource documents
pub fn split_documents(yaml: &str) -> Vec<String> {
    yaml.split("\n---")
        .map(|doc| doc.trim().trim_start_matches("---").trim())
        .filter(|doc| !doc.is_empty() && doc.contains("kind:"))
        .map(str::to_string)
        .collect()
}
