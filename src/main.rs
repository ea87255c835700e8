//! cpboot - control-plane bootstrap coordinator

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use cpboot::cloud::{parse_extra_args, update_cloud_config, FileMetadata};
use cpboot::compute::{setup_compute, DEFAULT_TOKEN_ENV_FILE};
use cpboot::config::{
    parse_api_server, BootstrapConfig, CompletionMode, NodeSettings, DEFAULT_ASSET_KEY,
    DEFAULT_BACKOFF, DEFAULT_LOCK_KEY, DEFAULT_LOCK_TTL, DEFAULT_NETWORK_PROVIDER,
    DEFAULT_POD_NETWORK_CIDR,
};
use cpboot::coordinator::Coordinator;
use cpboot::network::DEFAULT_CHARTS_DIR;
use cpboot::provisioner::{KubeadmProvisioner, Layout};
use cpboot::store::{KubeStore, MemoryStore, Store};
use cpboot::telemetry::{init_logging, LogFormat};
use cpboot::token::DEFAULT_TOKEN_TTL;

/// cpboot - bootstrap control-plane and compute nodes
#[derive(Parser, Debug)]
#[command(name = "cpboot", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, env = "CPBOOT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap a control-plane node
    ///
    /// Races the other control-plane nodes for the bootstrap lock. The winner
    /// generates and publishes the shared assets; everyone else waits for
    /// them and joins as a secondary.
    ///
    /// The kube store coordinates through an already running cluster named
    /// by --store-kubeconfig, never the cluster being bootstrapped. The
    /// memory store only works for a single node.
    Master(MasterArgs),

    /// Bootstrap a compute node
    Compute(NodeArgs),
}

/// Settings shared by every node type
#[derive(Args, Debug)]
struct NodeArgs {
    /// Cluster name
    #[arg(long, env = "CPBOOT_CLUSTER_NAME", default_value = "kubernetes")]
    cluster_name: String,

    /// Name this node registers with
    #[arg(long, env = "CPBOOT_NODE_NAME")]
    node_name: String,

    /// Cloud provider publishing node data (omit to use flags only)
    #[arg(long, env = "CPBOOT_CLOUD_PROVIDER")]
    cloud_provider: Option<String>,

    /// Node data document written by the cloud provider
    #[arg(long, env = "CPBOOT_NODE_DATA_FILE", default_value = "/etc/cpboot/node-data.yaml")]
    node_data_file: PathBuf,

    /// Control-plane endpoint URL
    #[arg(long, env = "CPBOOT_API_SERVER")]
    api_server: Option<String>,

    /// Kubernetes version
    #[arg(long, env = "CPBOOT_KUBE_VERSION", default_value = "")]
    kube_version: String,

    /// Extra kubelet flags
    #[arg(long, env = "CPBOOT_KUBELET_EXTRA_ARGS", default_value = "")]
    kubelet_extra_args: String,

    /// Node labels (`k=v,k2=v2`)
    #[arg(long, env = "CPBOOT_NODE_LABELS", default_value = "")]
    node_labels: String,

    /// Node taints (`key=value:Effect,...`)
    #[arg(long, env = "CPBOOT_NODE_TAINTS", default_value = "")]
    node_taints: String,

    /// Token environment file for the join tooling
    #[arg(long, env = "CPBOOT_TOKEN_ENV_FILE", default_value = DEFAULT_TOKEN_ENV_FILE)]
    token_env_file: PathBuf,

    /// Return after bootstrap instead of staying alive
    #[arg(long, env = "CPBOOT_EXIT_ON_COMPLETION")]
    exit_on_completion: bool,
}

/// Store backend for the election
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreBackend {
    /// Secrets and Leases in a Kubernetes API server
    Kube,
    /// Process-local store (single node only)
    Memory,
}

/// Control-plane node arguments
#[derive(Args, Debug)]
struct MasterArgs {
    #[command(flatten)]
    node: NodeArgs,

    /// Store backend
    #[arg(long, env = "CPBOOT_STORE", value_enum, default_value_t = StoreBackend::Kube)]
    store: StoreBackend,

    /// Kubeconfig of the existing cluster that holds the store records
    /// (required for the kube backend)
    #[arg(long, env = "CPBOOT_STORE_KUBECONFIG")]
    store_kubeconfig: Option<PathBuf>,

    /// Namespace holding the store records (kube backend)
    #[arg(long, env = "CPBOOT_STORE_NAMESPACE", default_value = "kube-system")]
    store_namespace: String,

    /// Seconds to wait between attempts while another node holds the lock
    #[arg(long, env = "CPBOOT_BACKOFF_SECS", default_value_t = DEFAULT_BACKOFF.as_secs())]
    backoff_secs: u64,

    /// Seconds before an unreleased lock expires
    #[arg(long, env = "CPBOOT_LOCK_TTL_SECS", default_value_t = DEFAULT_LOCK_TTL.as_secs())]
    lock_ttl_secs: u64,

    /// Store key of the shared asset record
    #[arg(long, env = "CPBOOT_ASSET_KEY", default_value = DEFAULT_ASSET_KEY)]
    asset_key: String,

    /// Store key of the bootstrap lock
    #[arg(long, env = "CPBOOT_LOCK_KEY", default_value = DEFAULT_LOCK_KEY)]
    lock_key: String,

    /// Persistent cluster CA certificate
    #[arg(long, env = "CPBOOT_CA_CERT", default_value = "/etc/cpboot/ca/ca.crt")]
    ca_cert: PathBuf,

    /// Persistent cluster CA key
    #[arg(long, env = "CPBOOT_CA_KEY", default_value = "/etc/cpboot/ca/ca.key")]
    ca_key: PathBuf,

    /// Lifetime of the join token issued for follower nodes
    #[arg(long, env = "CPBOOT_TOKEN_TTL_SECS", default_value_t = DEFAULT_TOKEN_TTL.as_secs())]
    token_ttl_secs: u64,

    /// Pod network CIDR
    #[arg(long, env = "CPBOOT_POD_NETWORK_CIDR", default_value = DEFAULT_POD_NETWORK_CIDR)]
    pod_network_cidr: String,

    /// Network overlay (cilium, calico, flannel)
    #[arg(long, env = "CPBOOT_NETWORK_PROVIDER", default_value = DEFAULT_NETWORK_PROVIDER)]
    network_provider: String,

    /// Directory with network overlay chart tarballs
    #[arg(long, env = "CPBOOT_CHARTS_DIR", default_value = DEFAULT_CHARTS_DIR)]
    charts_dir: PathBuf,

    /// Extra API server flags (`k=v,k2=v2`)
    #[arg(long, env = "CPBOOT_APISERVER_EXTRA_ARGS", default_value = "")]
    apiserver_extra_args: String,

    /// Extra controller-manager flags
    #[arg(long, env = "CPBOOT_CONTROLLER_MANAGER_EXTRA_ARGS", default_value = "")]
    controller_manager_extra_args: String,

    /// Extra scheduler flags
    #[arg(long, env = "CPBOOT_SCHEDULER_EXTRA_ARGS", default_value = "")]
    scheduler_extra_args: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The kube client needs a process-wide TLS provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_logging(cli.log_format);

    match cli.command {
        Commands::Master(args) => run_master(args).await,
        Commands::Compute(args) => run_compute(args).await,
    }
}

/// Settings from flags, then refreshed from cloud node data
async fn node_settings(args: &NodeArgs) -> anyhow::Result<NodeSettings> {
    let api_server = args
        .api_server
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(parse_api_server)
        .transpose()?;

    let settings = NodeSettings {
        cloud_provider: args.cloud_provider.clone().filter(|p| !p.is_empty()),
        cluster_name: args.cluster_name.clone(),
        node_name: args.node_name.clone(),
        api_server,
        kube_version: args.kube_version.clone(),
        kubelet_extra_args: args.kubelet_extra_args.clone(),
        node_labels: parse_extra_args(&args.node_labels),
        node_taints: parse_extra_args(&args.node_taints),
        ..Default::default()
    };

    let metadata = FileMetadata::new(&args.node_data_file);
    Ok(update_cloud_config(settings, &metadata).await?)
}

async fn run_master(args: MasterArgs) -> anyhow::Result<()> {
    let mut settings = node_settings(&args.node).await?;
    settings.pod_network_cidr = args.pod_network_cidr.clone();
    settings.network_provider = args.network_provider.clone();
    settings.ca_cert = args.ca_cert.clone();
    settings.ca_key = args.ca_key.clone();
    // Cloud node data takes precedence over flags
    if settings.apiserver_extra_args.is_empty() {
        settings.apiserver_extra_args = parse_extra_args(&args.apiserver_extra_args);
    }
    if settings.controller_manager_extra_args.is_empty() {
        settings.controller_manager_extra_args =
            parse_extra_args(&args.controller_manager_extra_args);
    }
    if settings.scheduler_extra_args.is_empty() {
        settings.scheduler_extra_args = parse_extra_args(&args.scheduler_extra_args);
    }
    settings.require_api_server()?;

    let config = BootstrapConfig::new(settings.cluster_name.clone())
        .with_backoff(Duration::from_secs(args.backoff_secs))
        .with_lock_ttl(Duration::from_secs(args.lock_ttl_secs))
        .with_keys(args.asset_key.clone(), args.lock_key.clone())
        .with_completion(CompletionMode::from_exit_flag(args.node.exit_on_completion));
    config.validate()?;

    let store: Arc<dyn Store> = match args.store {
        StoreBackend::Kube => {
            let kubeconfig = require_store_kubeconfig(args.store_kubeconfig.as_deref())?;
            Arc::new(
                KubeStore::from_kubeconfig(kubeconfig, &args.store_namespace, &settings.node_name)
                    .await?,
            )
        }
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };

    let layout = Layout {
        charts_dir: args.charts_dir.clone(),
        ..Layout::default()
    };

    info!(
        cluster = %config.cluster_name,
        node = %settings.node_name,
        store = ?args.store,
        "Starting control-plane bootstrap"
    );

    let provisioner = Arc::new(
        KubeadmProvisioner::new(settings, layout)?
            .with_token_ttl(Duration::from_secs(args.token_ttl_secs)),
    );
    let role = Coordinator::new(config, store, provisioner).run().await?;
    info!(%role, "Bootstrap finished");
    Ok(())
}

/// The kube store has no ambient default: the cluster being bootstrapped
/// cannot host its own election
fn require_store_kubeconfig(path: Option<&Path>) -> anyhow::Result<&Path> {
    path.ok_or_else(|| {
        anyhow::anyhow!(
            "--store-kubeconfig is required with --store kube: the store must live in an \
             existing cluster, not the one being bootstrapped"
        )
    })
}

async fn run_compute(args: NodeArgs) -> anyhow::Result<()> {
    let settings = node_settings(&args).await?;
    info!(node = %settings.node_name, "Starting compute node bootstrap");

    let provisioner = KubeadmProvisioner::new(
        NodeSettings {
            network_provider: DEFAULT_NETWORK_PROVIDER.to_string(),
            ..settings.clone()
        },
        Layout::default(),
    )?;
    setup_compute(
        &settings,
        &provisioner,
        &args.token_env_file,
        CompletionMode::from_exit_flag(args.exit_on_completion),
    )
    .await?;
    Ok(())
}
