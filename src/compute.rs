//! Compute (worker) node setup
//!
//! Compute nodes take no part in the election. They record where the control
//! plane lives for the join tooling, start the node agent in worker mode and
//! then follow the same completion behaviour as control-plane nodes.

use std::path::Path;

use tracing::info;

use crate::config::{CompletionMode, NodeSettings};
use crate::coordinator::complete;
use crate::provisioner::{write_file, Provisioner};
use crate::Result;

/// Default location of the token environment file
pub const DEFAULT_TOKEN_ENV_FILE: &str = "/etc/cpboot/token.env";

/// Render the environment file consumed by the join tooling
pub fn token_env(settings: &NodeSettings) -> Result<String> {
    let api_server = settings.require_api_server()?;
    let mut env = format!("CPBOOT_API_SERVER={}\n", api_server);
    if let Some(provider) = &settings.cloud_provider {
        env.push_str(&format!("CPBOOT_CLOUD_PROVIDER={}\n", provider));
    }
    Ok(env)
}

/// Bring up a compute node
pub async fn setup_compute(
    settings: &NodeSettings,
    provisioner: &dyn Provisioner,
    token_env_file: &Path,
    completion: CompletionMode,
) -> Result<()> {
    let env = token_env(settings)?;
    write_file(token_env_file, env.as_bytes(), 0o600).await?;
    info!(path = %token_env_file.display(), "Wrote token environment");

    provisioner.start_node_agent(false).await?;
    info!(node = %settings.node_name, "Compute node ready");

    complete(completion).await;
    Ok(())
}
