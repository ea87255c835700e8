//! kubeadm-backed provisioner
//!
//! PKI, static manifests, client kubeconfigs and add-ons are produced by
//! individual `kubeadm init phase` invocations against a rendered config file.
//! Every phase overwrites or reuses what is already on disk, so a node that
//! restarts mid-bootstrap can run the whole sequence again.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::kubeadm_config::{parse_taint, render_kubeadm_config};
use super::{ClientRole, Provisioner};
use crate::assets::SharedAssets;
use crate::config::NodeSettings;
use crate::network::{NetworkProvider, DEFAULT_CHARTS_DIR};
use crate::token::{BootstrapToken, DEFAULT_TOKEN_TTL};
use crate::{exec, kubectl};
use crate::{Error, Result};

const SA_PUB: &str = "sa.pub";
const SA_KEY: &str = "sa.key";
const FRONT_PROXY_CA: &str = "front-proxy-ca.crt";
const FRONT_PROXY_CA_KEY: &str = "front-proxy-ca.key";
const CA_CERT: &str = "ca.crt";
const CA_KEY: &str = "ca.key";

const PUBLIC_MODE: u32 = 0o644;
const PRIVATE_MODE: u32 = 0o600;

/// Where the provisioner reads and writes on the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Kubeconfig directory (`/etc/kubernetes`)
    pub kubernetes_dir: PathBuf,
    /// PKI directory (`/etc/kubernetes/pki`)
    pub pki_dir: PathBuf,
    /// Rendered kubeadm config
    pub kubeadm_config: PathBuf,
    /// systemd drop-in carrying kubelet flags
    pub kubelet_dropin: PathBuf,
    /// File the issued join token is written to
    pub token_file: PathBuf,
    /// Directory holding network overlay charts
    pub charts_dir: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            kubernetes_dir: PathBuf::from("/etc/kubernetes"),
            pki_dir: PathBuf::from("/etc/kubernetes/pki"),
            kubeadm_config: PathBuf::from("/etc/cpboot/kubeadm.yaml"),
            kubelet_dropin: PathBuf::from("/etc/systemd/system/kubelet.service.d/20-cpboot.conf"),
            token_file: PathBuf::from("/etc/cpboot/bootstrap-token"),
            charts_dir: PathBuf::from(DEFAULT_CHARTS_DIR),
        }
    }
}

impl Layout {
    /// Default layout relocated under `root`
    pub fn under(root: &Path) -> Self {
        let rebase = |p: PathBuf| root.join(p.strip_prefix("/").unwrap_or(&p));
        let d = Self::default();
        Self {
            kubernetes_dir: rebase(d.kubernetes_dir),
            pki_dir: rebase(d.pki_dir),
            kubeadm_config: rebase(d.kubeadm_config),
            kubelet_dropin: rebase(d.kubelet_dropin),
            token_file: rebase(d.token_file),
            charts_dir: rebase(d.charts_dir),
        }
    }

    fn pki(&self, name: &str) -> PathBuf {
        self.pki_dir.join(name)
    }

    fn kubeconfig(&self, role: ClientRole) -> PathBuf {
        self.kubernetes_dir.join(role.file_name())
    }
}

/// Provisioner driving kubeadm, kubectl, helm and systemd on the local node
pub struct KubeadmProvisioner {
    settings: NodeSettings,
    layout: Layout,
    network: NetworkProvider,
    token_ttl: Duration,
}

impl KubeadmProvisioner {
    /// Create a provisioner for `settings` using `layout`
    pub fn new(settings: NodeSettings, layout: Layout) -> Result<Self> {
        let network = settings.network_provider.parse()?;
        Ok(Self {
            settings,
            layout,
            network,
            token_ttl: DEFAULT_TOKEN_TTL,
        })
    }

    /// Override the lifetime of issued join tokens
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Filesystem layout in use
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Render the kubeadm config and return its path as an argument
    async fn write_config(&self) -> Result<String> {
        let rendered = render_kubeadm_config(&self.settings, &self.layout.pki_dir)?;
        write_file(&self.layout.kubeadm_config, rendered.as_bytes(), PRIVATE_MODE).await?;
        Ok(self.layout.kubeadm_config.display().to_string())
    }

    async fn kubeadm_phase(&self, step: &str, phase: &[&str]) -> Result<String> {
        let config = self.write_config().await?;
        let mut args = exec::args(["init", "phase"]);
        args.extend(exec::args(phase.iter().copied()));
        args.extend(exec::args(["--config", config.as_str()]));
        exec::run(step, "kubeadm", &args, None).await
    }

    fn admin_kubeconfig(&self) -> PathBuf {
        self.layout.kubeconfig(ClientRole::Admin)
    }
}

#[async_trait]
impl Provisioner for KubeadmProvisioner {
    async fn stage_ca(&self) -> Result<()> {
        let step = "stage-ca";
        for source in [&self.settings.ca_cert, &self.settings.ca_key] {
            if !source.exists() {
                return Err(Error::generation(
                    step,
                    format!("cluster CA {} not found", source.display()),
                ));
            }
        }

        tokio::fs::create_dir_all(&self.layout.pki_dir).await?;

        let cert = self.layout.pki(CA_CERT);
        tokio::fs::copy(&self.settings.ca_cert, &cert).await.map_err(|e| {
            Error::generation(step, format!("failed to copy CA certificate: {}", e))
        })?;

        // The key stays on its persistent volume; pki/ca.key only points at it
        let key = self.layout.pki(CA_KEY);
        if tokio::fs::symlink_metadata(&key).await.is_ok() {
            tokio::fs::remove_file(&key).await?;
        }
        tokio::fs::symlink(&self.settings.ca_key, &key)
            .await
            .map_err(|e| Error::generation(step, format!("failed to link CA key: {}", e)))?;

        info!(cert = %cert.display(), key = %key.display(), "Staged cluster CA");
        Ok(())
    }

    async fn generate_pki(&self) -> Result<()> {
        self.kubeadm_phase("generate-pki", &["certs", "all"]).await?;
        info!(dir = %self.layout.pki_dir.display(), "Generated control-plane PKI");
        Ok(())
    }

    async fn write_manifests(&self) -> Result<()> {
        self.kubeadm_phase("write-manifests", &["control-plane", "all"])
            .await?;
        info!("Wrote control-plane static manifests");
        Ok(())
    }

    async fn load_shared_assets(&self) -> Result<SharedAssets> {
        let read = |name: &'static str| {
            let path = self.layout.pki(name);
            async move {
                tokio::fs::read_to_string(&path).await.map_err(|e| {
                    Error::generation(
                        "load-shared-assets",
                        format!("{} could not be loaded: {}", path.display(), e),
                    )
                })
            }
        };

        let assets = SharedAssets {
            front_proxy_ca: read(FRONT_PROXY_CA).await?,
            front_proxy_ca_key: read(FRONT_PROXY_CA_KEY).await?,
            sa_pub: read(SA_PUB).await?,
            sa_key: read(SA_KEY).await?,
        };
        assets.validate()?;
        Ok(assets)
    }

    async fn persist_shared_assets(&self, assets: &SharedAssets) -> Result<()> {
        let files = [
            (FRONT_PROXY_CA, &assets.front_proxy_ca, PUBLIC_MODE),
            (FRONT_PROXY_CA_KEY, &assets.front_proxy_ca_key, PRIVATE_MODE),
            (SA_PUB, &assets.sa_pub, PUBLIC_MODE),
            (SA_KEY, &assets.sa_key, PRIVATE_MODE),
        ];
        for (name, contents, mode) in files {
            write_file(&self.layout.pki(name), contents.as_bytes(), mode).await?;
        }
        info!(dir = %self.layout.pki_dir.display(), "Persisted shared assets");
        Ok(())
    }

    async fn generate_client_credentials(&self, role: ClientRole) -> Result<PathBuf> {
        let step = "client-credentials";
        let config = self.write_config().await?;
        let client_name = role.client_name(&self.settings.node_name);

        let mut args = exec::args([
            "kubeconfig",
            "user",
            "--config",
            config.as_str(),
            "--client-name",
            client_name.as_str(),
        ]);
        if let Some(org) = role.organization() {
            args.extend(exec::args(["--org", org]));
        }

        let kubeconfig = exec::run(step, "kubeadm", &args, None).await?;
        let path = self.layout.kubeconfig(role);
        write_file(&path, kubeconfig.as_bytes(), PRIVATE_MODE).await?;

        info!(%role, path = %path.display(), "Generated client credentials");
        Ok(path)
    }

    async fn start_node_agent(&self, control_plane: bool) -> Result<()> {
        let step = "start-node-agent";
        let dropin = kubelet_dropin(&self.settings)?;
        write_file(&self.layout.kubelet_dropin, dropin.as_bytes(), PUBLIC_MODE).await?;
        exec::run(step, "systemctl", &exec::args(["daemon-reload"]), None).await?;

        if control_plane {
            // Writes the kubelet config and flags, then restarts the unit
            self.kubeadm_phase(step, &["kubelet-start"]).await?;
        } else {
            exec::run(
                step,
                "systemctl",
                &exec::args(["enable", "--now", "kubelet"]),
                None,
            )
            .await?;
        }

        info!(control_plane, node = %self.settings.node_name, "Node agent started");
        Ok(())
    }

    async fn apply_addons(&self) -> Result<()> {
        let admin = self.admin_kubeconfig().display().to_string();
        self.kubeadm_phase("apply-addons", &["addon", "all", "--kubeconfig", admin.as_str()])
            .await?;
        info!("Applied cluster add-ons");
        Ok(())
    }

    async fn mark_control_plane(&self) -> Result<()> {
        self.kubeadm_phase("mark-control-plane", &["mark-control-plane"])
            .await?;
        info!(node = %self.settings.node_name, "Marked node as control plane");
        Ok(())
    }

    async fn install_network(&self) -> Result<()> {
        let manifests = self
            .network
            .render(&self.layout.charts_dir, &self.settings.pod_network_cidr)
            .await?;
        kubectl::apply_manifests("install-network", &self.admin_kubeconfig(), &manifests).await?;
        info!(provider = %self.network, "Installed network overlay");
        Ok(())
    }

    async fn deploy_tokens(&self) -> Result<()> {
        let token = BootstrapToken::generate()?;
        let manifest = token.secret_manifest(&self.settings.cluster_name, self.token_ttl)?;
        kubectl::apply_manifests("deploy-tokens", &self.admin_kubeconfig(), &[manifest]).await?;

        let line = format!("{}\n", token.as_token_string());
        write_file(&self.layout.token_file, line.as_bytes(), PRIVATE_MODE).await?;

        info!(token_id = token.id(), path = %self.layout.token_file.display(), "Deployed join token");
        Ok(())
    }
}

/// systemd drop-in setting `KUBELET_EXTRA_ARGS` for this node
pub(crate) fn kubelet_dropin(settings: &NodeSettings) -> Result<String> {
    let mut args: Vec<String> = Vec::new();
    if !settings.kubelet_extra_args.trim().is_empty() {
        args.push(settings.kubelet_extra_args.trim().to_string());
    }
    if !settings.node_labels.is_empty() {
        let labels: Vec<String> = settings
            .node_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        args.push(format!("--node-labels={}", labels.join(",")));
    }
    if !settings.node_taints.is_empty() {
        let taints = settings
            .node_taints
            .iter()
            .map(|(k, v)| parse_taint(k, v).map(|t| t.to_flag()))
            .collect::<Result<Vec<_>>>()?;
        args.push(format!("--register-with-taints={}", taints.join(",")));
    }

    Ok(format!(
        "[Service]\nEnvironment=\"KUBELET_EXTRA_ARGS={}\"\n",
        args.join(" ")
    ))
}

/// Open `path` for writing with `mode` already applied
///
/// New files are created with `mode`; an existing file is narrowed to `mode`
/// before it is truncated, so key material is never readable more widely.
async fn open_with_mode(path: &Path, mode: u32) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::symlink_metadata(path).await.is_ok() {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .await?;
    Ok(file)
}

/// Write `contents` to `path` with `mode`, creating parent directories
pub(crate) async fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut file = open_with_mode(path, mode).await?;
    file.write_all(contents).await?;
    file.flush().await?;
    // umask may have stripped bits from a new public file
    file.set_permissions(std::fs::Permissions::from_mode(mode))
        .await?;
    debug!(path = %path.display(), mode = %format!("{:o}", mode), "Wrote file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::fixtures::sample_assets;
    use std::collections::BTreeMap;

    fn settings(root: &Path) -> NodeSettings {
        NodeSettings {
            cluster_name: "prod".to_string(),
            node_name: "cp-1".to_string(),
            kube_version: "v1.31.2".to_string(),
            pod_network_cidr: "10.244.0.0/16".to_string(),
            network_provider: "cilium".to_string(),
            ca_cert: root.join("secrets/ca.crt"),
            ca_key: root.join("secrets/ca.key"),
            ..Default::default()
        }
    }

    fn provisioner(root: &Path) -> KubeadmProvisioner {
        KubeadmProvisioner::new(settings(root), Layout::under(root)).unwrap()
    }

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn layout_is_relocatable() {
        let layout = Layout::under(Path::new("/tmp/node"));
        assert_eq!(layout.pki_dir, PathBuf::from("/tmp/node/etc/kubernetes/pki"));
        assert_eq!(
            layout.kubeconfig(ClientRole::Scheduler),
            PathBuf::from("/tmp/node/etc/kubernetes/scheduler.conf")
        );
    }

    #[test]
    fn unknown_network_provider_fails_construction() {
        let mut s = settings(Path::new("/"));
        s.network_provider = "weave".to_string();
        assert!(KubeadmProvisioner::new(s, Layout::default()).is_err());
    }

    #[test]
    fn token_ttl_defaults_to_a_day_and_can_be_overridden() {
        let root = Path::new("/tmp/node");
        assert_eq!(provisioner(root).token_ttl, DEFAULT_TOKEN_TTL);

        let p = provisioner(root).with_token_ttl(Duration::from_secs(3600));
        assert_eq!(p.token_ttl, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn stage_ca_copies_cert_and_links_key() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("secrets")).unwrap();
        std::fs::write(root.join("secrets/ca.crt"), "cert").unwrap();
        std::fs::write(root.join("secrets/ca.key"), "key").unwrap();

        let p = provisioner(root);
        p.stage_ca().await.unwrap();
        // Running twice replaces the existing link instead of failing
        p.stage_ca().await.unwrap();

        let cert = p.layout().pki_dir.join("ca.crt");
        let key = p.layout().pki_dir.join("ca.key");
        assert_eq!(std::fs::read_to_string(&cert).unwrap(), "cert");
        assert!(!std::fs::symlink_metadata(&cert).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_link(&key).unwrap(), root.join("secrets/ca.key"));
        assert_eq!(std::fs::read_to_string(&key).unwrap(), "key");
    }

    #[tokio::test]
    async fn stage_ca_without_source_is_a_generation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = provisioner(dir.path()).stage_ca().await.unwrap_err();
        assert!(matches!(err, Error::Generation { ref step, .. } if step == "stage-ca"));
    }

    #[tokio::test]
    async fn persisted_assets_load_back_with_restricted_key_modes() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let assets = sample_assets();

        p.persist_shared_assets(&assets).await.unwrap();
        assert_eq!(p.load_shared_assets().await.unwrap(), assets);

        let pki = &p.layout().pki_dir;
        assert_eq!(mode(&pki.join("sa.key")), 0o600);
        assert_eq!(mode(&pki.join("front-proxy-ca.key")), 0o600);
        assert_eq!(mode(&pki.join("sa.pub")), 0o644);
        assert_eq!(mode(&pki.join("front-proxy-ca.crt")), 0o644);
    }

    #[tokio::test]
    async fn new_key_file_is_private_before_any_byte_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pki/sa.key");

        let file = open_with_mode(&path, PRIVATE_MODE).await.unwrap();
        assert_eq!(mode(&path), 0o600);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        drop(file);
    }

    #[tokio::test]
    async fn existing_readable_file_is_narrowed_before_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin.conf");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let file = open_with_mode(&path, PRIVATE_MODE).await.unwrap();
        assert_eq!(mode(&path), 0o600);
        drop(file);

        write_file(&path, b"new", PRIVATE_MODE).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        assert_eq!(mode(&path), 0o600);
    }

    #[tokio::test]
    async fn loading_incomplete_pki_names_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let assets = sample_assets();
        p.persist_shared_assets(&assets).await.unwrap();
        std::fs::remove_file(p.layout().pki_dir.join("sa.key")).unwrap();

        let err = p.load_shared_assets().await.unwrap_err();
        assert!(err.to_string().contains("sa.key could not be loaded"));
    }

    #[tokio::test]
    async fn loading_swapped_material_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let p = provisioner(dir.path());
        let mut assets = sample_assets();
        std::mem::swap(&mut assets.sa_pub, &mut assets.sa_key);
        p.persist_shared_assets(&assets).await.unwrap();

        assert!(matches!(
            p.load_shared_assets().await,
            Err(Error::Codec(_))
        ));
    }

    #[test]
    fn dropin_carries_labels_taints_and_extra_args() {
        let s = NodeSettings {
            kubelet_extra_args: "--max-pods=50".to_string(),
            node_labels: BTreeMap::from([
                ("pool".to_string(), "control".to_string()),
                ("zone".to_string(), "a".to_string()),
            ]),
            node_taints: BTreeMap::from([("dedicated".to_string(), "cp:NoExecute".to_string())]),
            ..Default::default()
        };
        let dropin = kubelet_dropin(&s).unwrap();
        assert!(dropin.starts_with("[Service]\n"));
        assert!(dropin.contains(
            "KUBELET_EXTRA_ARGS=--max-pods=50 --node-labels=pool=control,zone=a --register-with-taints=dedicated=cp:NoExecute"
        ));
    }

    #[test]
    fn dropin_without_settings_is_empty() {
        let dropin = kubelet_dropin(&NodeSettings::default()).unwrap();
        assert_eq!(dropin, "[Service]\nEnvironment=\"KUBELET_EXTRA_ARGS=\"\n");
    }
}
