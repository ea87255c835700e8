//! Node and cluster metadata from the cloud platform
//!
//! When a cloud provider is configured, the node's cluster name, API
//! endpoint, Kubernetes version, labels, taints and component flags come
//! from the platform rather than the command line. The platform publishes
//! them as a node-data document (YAML or JSON) that [`FileMetadata`] reads.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{parse_api_server, NodeSettings};
use crate::{Error, Result};

/// Extra component flags as published by the platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeArgs {
    /// API server flags (`k=v,k2=v2`)
    pub api_server_extra_args: String,
    /// Controller-manager flags
    pub controller_manager_extra_args: String,
    /// Scheduler flags
    pub scheduler_extra_args: String,
    /// Kubelet flags, verbatim
    pub kubelet_extra_args: String,
}

/// Metadata for this node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeData {
    /// Cluster name
    pub cluster_name: String,
    /// Control-plane endpoint URL
    #[serde(rename = "kubeAPIURL")]
    pub kube_api_url: String,
    /// Kubernetes version
    pub kube_version: String,
    /// Node labels
    pub labels: BTreeMap<String, String>,
    /// Node taints
    pub taints: BTreeMap<String, String>,
    /// Component flags
    pub kube_args: KubeArgs,
}

/// Source of [`NodeData`]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudMetadata: Send + Sync {
    /// Fetch node data from the platform
    async fn fetch(&self) -> Result<NodeData>;
}

/// Reads node data from a document on disk
pub struct FileMetadata {
    path: PathBuf,
}

impl FileMetadata {
    /// Read from `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CloudMetadata for FileMetadata {
    async fn fetch(&self) -> Result<NodeData> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::cloud_metadata(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        // YAML is a superset of JSON, so this accepts either
        serde_yaml::from_str(&content).map_err(|e| {
            Error::cloud_metadata(format!("failed to parse {}: {}", self.path.display(), e))
        })
    }
}

/// Merge platform node data into the settings
///
/// Without a configured provider the settings are returned unchanged.
pub async fn update_cloud_config<C: CloudMetadata + ?Sized>(
    mut settings: NodeSettings,
    source: &C,
) -> Result<NodeSettings> {
    let Some(provider) = settings.cloud_provider.clone() else {
        info!("No cloud provider specified - not loading node data");
        return Ok(settings);
    };

    let nd = source.fetch().await.map_err(|e| {
        Error::cloud_metadata(format!(
            "error getting node data from cloud provider {}: {}",
            provider, e
        ))
    })?;

    if nd.kube_api_url.is_empty() {
        return Err(Error::cloud_metadata(
            "empty API server obtained from cloud provider",
        ));
    }
    let api_server = parse_api_server(&nd.kube_api_url)
        .map_err(|e| Error::cloud_metadata(e.to_string()))?;
    if nd.kube_version.is_empty() {
        return Err(Error::cloud_metadata(
            "empty kube version obtained from cloud provider",
        ));
    }

    info!(
        provider = %provider,
        cluster = %nd.cluster_name,
        api_server = %api_server,
        version = %nd.kube_version,
        "Loaded node data from cloud provider"
    );

    settings.cluster_name = nd.cluster_name;
    settings.api_server = Some(api_server);
    settings.kube_version = nd.kube_version;
    settings.node_labels = nd.labels;
    settings.node_taints = nd.taints;
    settings.apiserver_extra_args = parse_extra_args(&nd.kube_args.api_server_extra_args);
    settings.controller_manager_extra_args =
        parse_extra_args(&nd.kube_args.controller_manager_extra_args);
    settings.scheduler_extra_args = parse_extra_args(&nd.kube_args.scheduler_extra_args);
    settings.kubelet_extra_args = nd.kube_args.kubelet_extra_args;
    Ok(settings)
}

/// Parse `"k=v,k2 v2,flag"` into a flag map
///
/// Each comma-separated item splits on `=` or spaces; a lone key maps to an
/// empty value and items with more than two fields are skipped.
pub fn parse_extra_args(args: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for item in args.split(',') {
        let fields: Vec<&str> = item
            .split(|c| c == '=' || c == ' ')
            .filter(|f| !f.is_empty())
            .collect();
        match fields.as_slice() {
            [key] => {
                map.insert(key.to_string(), String::new());
            }
            [key, value] => {
                map.insert(key.to_string(), value.to_string());
            }
            _ => {}
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    fn settings_with_provider() -> NodeSettings {
        NodeSettings {
            cloud_provider: Some("aws".to_string()),
            cluster_name: "from-cli".to_string(),
            ..Default::default()
        }
    }

    fn node_data() -> NodeData {
        NodeData {
            cluster_name: "prod-eu".to_string(),
            kube_api_url: "https://kube.prod-eu.example.com".to_string(),
            kube_version: "v1.31.2".to_string(),
            labels: BTreeMap::from([("role".to_string(), "master".to_string())]),
            taints: BTreeMap::from([(
                "dedicated".to_string(),
                "master:NoSchedule".to_string(),
            )]),
            kube_args: KubeArgs {
                api_server_extra_args: "audit-log-maxage=30,v=2".to_string(),
                controller_manager_extra_args: String::new(),
                scheduler_extra_args: "v 4".to_string(),
                kubelet_extra_args: "--max-pods=110".to_string(),
            },
        }
    }

    #[rstest]
    #[case("", &[])]
    #[case("a=b", &[("a", "b")])]
    #[case("a=b,c=d", &[("a", "b"), ("c", "d")])]
    #[case("a b", &[("a", "b")])]
    #[case("flag", &[("flag", "")])]
    #[case("a=b=c,d=e", &[("d", "e")])]
    #[case("a=b,,c", &[("a", "b"), ("c", "")])]
    fn extra_args_parse(#[case] input: &str, #[case] expected: &[(&str, &str)]) {
        let expected: BTreeMap<String, String> = expected
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(parse_extra_args(input), expected);
    }

    #[tokio::test]
    async fn without_provider_settings_are_unchanged() {
        let mut source = MockCloudMetadata::new();
        source.expect_fetch().never();

        let settings = NodeSettings {
            cluster_name: "local".to_string(),
            ..Default::default()
        };
        let updated = update_cloud_config(settings.clone(), &source).await.unwrap();
        assert_eq!(updated, settings);
    }

    #[tokio::test]
    async fn node_data_overrides_cli_values() {
        let mut source = MockCloudMetadata::new();
        source.expect_fetch().times(1).returning(|| Ok(node_data()));

        let updated = update_cloud_config(settings_with_provider(), &source)
            .await
            .unwrap();

        assert_eq!(updated.cluster_name, "prod-eu");
        assert_eq!(updated.api_host().unwrap(), "kube.prod-eu.example.com");
        assert_eq!(updated.kube_version, "v1.31.2");
        assert_eq!(updated.node_labels.get("role").unwrap(), "master");
        assert_eq!(
            updated.apiserver_extra_args.get("audit-log-maxage").unwrap(),
            "30"
        );
        assert_eq!(updated.scheduler_extra_args.get("v").unwrap(), "4");
        assert!(updated.controller_manager_extra_args.is_empty());
        assert_eq!(updated.kubelet_extra_args, "--max-pods=110");
    }

    #[tokio::test]
    async fn empty_api_url_is_rejected() {
        let mut source = MockCloudMetadata::new();
        source.expect_fetch().returning(|| {
            Ok(NodeData {
                kube_api_url: String::new(),
                ..node_data()
            })
        });

        let err = update_cloud_config(settings_with_provider(), &source)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty API server"));
    }

    #[tokio::test]
    async fn empty_kube_version_is_rejected() {
        let mut source = MockCloudMetadata::new();
        source.expect_fetch().returning(|| {
            Ok(NodeData {
                kube_version: String::new(),
                ..node_data()
            })
        });

        let err = update_cloud_config(settings_with_provider(), &source)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("kube version"));
    }

    #[tokio::test]
    async fn fetch_failure_names_the_provider() {
        let mut source = MockCloudMetadata::new();
        source
            .expect_fetch()
            .returning(|| Err(Error::cloud_metadata("instance metadata timeout")));

        let err = update_cloud_config(settings_with_provider(), &source)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("aws"));
        assert!(err.to_string().contains("instance metadata timeout"));
    }

    #[tokio::test]
    async fn file_metadata_reads_yaml_document() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "clusterName: dev\nkubeAPIURL: https://10.0.0.1:6443\nkubeVersion: v1.30.0\nlabels:\n  zone: a\nkubeArgs:\n  kubeletExtraArgs: --v=2"
        )
        .unwrap();

        let nd = FileMetadata::new(file.path()).fetch().await.unwrap();
        assert_eq!(nd.cluster_name, "dev");
        assert_eq!(nd.kube_api_url, "https://10.0.0.1:6443");
        assert_eq!(nd.labels.get("zone").unwrap(), "a");
        assert_eq!(nd.kube_args.kubelet_extra_args, "--v=2");
        assert!(nd.taints.is_empty());
    }

    #[tokio::test]
    async fn missing_metadata_file_is_a_cloud_error() {
        let err = FileMetadata::new("/nonexistent/node-data.yaml")
            .fetch()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CloudMetadata(_)));
    }
}
