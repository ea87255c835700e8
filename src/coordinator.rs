//! Election and asset sharing between control-plane nodes
//!
//! Every control-plane node runs the same loop against the shared store:
//!
//! 1. If the asset record exists, decode it and bootstrap as a secondary.
//! 2. If it is missing, try to take the bootstrap lock.
//! 3. The lock winner generates the cluster-wide assets, brings up its own
//!    control plane and publishes the record with create-if-absent.
//! 4. Everyone else waits out the backoff interval and starts over.
//!
//! # Failure model
//!
//! There is no in-process retry after a failure. A primary that fails
//! releases the lock so another node can take over immediately; a primary
//! that crashes leaves the lock to expire at its TTL. Any store error other
//! than a missing asset record ends the loop.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::assets;
use crate::config::{BootstrapConfig, CompletionMode};
use crate::provisioner::{ClientRole, Provisioner};
use crate::store::{Store, StoreError};
use crate::Result;

/// Part a node played in bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Generated and published the shared assets
    Primary,
    /// Consumed assets published by another node
    Secondary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

/// Bootstrap coordinator for one control-plane node
pub struct Coordinator {
    config: BootstrapConfig,
    store: Arc<dyn Store>,
    provisioner: Arc<dyn Provisioner>,
}

impl Coordinator {
    /// Create a coordinator
    pub fn new(
        config: BootstrapConfig,
        store: Arc<dyn Store>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            config,
            store,
            provisioner,
        }
    }

    /// Bootstrap this node, then apply the configured completion mode
    ///
    /// In [`CompletionMode::Park`] this only returns on error.
    pub async fn run(&self) -> Result<Role> {
        self.config.validate()?;
        let role = self.create_or_get_shared_assets().await?;
        complete(self.config.completion).await;
        Ok(role)
    }

    /// Run the election loop until this node is bootstrapped
    pub async fn create_or_get_shared_assets(&self) -> Result<Role> {
        let cfg = &self.config;
        info!(cluster = %cfg.cluster_name, asset_key = %cfg.asset_key, "Looking for shared assets");

        loop {
            match self.store.get(&cfg.asset_key).await {
                Ok(payload) => {
                    info!(cluster = %cfg.cluster_name, "Shared assets found, bootstrapping as secondary");
                    self.bootstrap_secondary(&payload).await?;
                    info!(role = %Role::Secondary, "Control plane node bootstrapped");
                    return Ok(Role::Secondary);
                }
                Err(StoreError::KeyMissing(_)) => {
                    debug!(key = %cfg.asset_key, "No shared assets published yet");
                }
                Err(e) => {
                    error!(error = %e, key = %cfg.asset_key, "Failed to read shared assets");
                    return Err(e.into());
                }
            }

            let acquired = self
                .store
                .get_or_create_lock(&cfg.lock_key, cfg.lock_ttl)
                .await
                .inspect_err(|e| error!(error = %e, key = %cfg.lock_key, "Failed to take bootstrap lock"))?;

            if acquired {
                info!(
                    lock = %cfg.lock_key,
                    ttl_secs = cfg.lock_ttl.as_secs(),
                    "Bootstrap lock acquired, generating shared assets"
                );
                self.run_primary().await?;
                info!(role = %Role::Primary, "Control plane node bootstrapped");
                return Ok(Role::Primary);
            }

            info!(
                backoff_secs = cfg.backoff.as_secs_f64(),
                "Another node holds the bootstrap lock, waiting"
            );
            tokio::time::sleep(cfg.backoff).await;
        }
    }

    /// Generate, publish, and release the lock on failure
    async fn run_primary(&self) -> Result<()> {
        let result: Result<()> = async {
            let payload = self.bootstrap_once().await?;
            self.store
                .put_if_absent(&self.config.asset_key, &payload)
                .await?;
            info!(key = %self.config.asset_key, "Published shared assets");
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            error!(error = %e, "Primary bootstrap failed, releasing bootstrap lock");
            // Cleanup failures are logged inside; the original error wins
            let _ = self.cleanup(true, false).await;
        }
        result
    }

    /// Primary sequence: generate everything and return the encoded record
    ///
    /// Nothing is written to the store here.
    pub async fn bootstrap_once(&self) -> Result<String> {
        let p = &self.provisioner;

        p.stage_ca().await?;
        p.generate_pki().await?;
        p.write_manifests().await?;

        let shared = p.load_shared_assets().await?;
        let payload = assets::encode(&shared)?;
        debug!(bytes = payload.len(), "Encoded shared assets");

        for role in ClientRole::ALL {
            p.generate_client_credentials(role).await?;
        }

        p.start_node_agent(true).await?;
        p.apply_addons().await?;
        p.mark_control_plane().await?;
        p.install_network().await?;
        p.deploy_tokens().await?;

        Ok(payload)
    }

    /// Secondary sequence: apply a record published by the primary
    pub async fn bootstrap_secondary(&self, payload: &str) -> Result<()> {
        let shared = assets::decode(payload)
            .inspect_err(|e| error!(error = %e, "Published shared assets are unusable"))?;
        let p = &self.provisioner;

        p.stage_ca().await?;
        p.persist_shared_assets(&shared).await?;
        p.generate_pki().await?;
        p.write_manifests().await?;

        for role in ClientRole::ALL {
            p.generate_client_credentials(role).await?;
        }

        p.start_node_agent(true).await?;
        p.mark_control_plane().await?;
        Ok(())
    }

    /// Remove the lock and/or asset record
    ///
    /// Both deletions are attempted. Failures are logged and the first one
    /// is returned.
    pub async fn cleanup(&self, release_lock: bool, delete_assets: bool) -> Result<()> {
        let mut first_err = None;

        if release_lock {
            match self.store.delete(&self.config.lock_key).await {
                Ok(()) => info!(key = %self.config.lock_key, "Released bootstrap lock"),
                Err(e) => {
                    warn!(error = %e, key = %self.config.lock_key, "Failed to release bootstrap lock");
                    first_err.get_or_insert(e);
                }
            }
        }

        if delete_assets {
            match self.store.delete(&self.config.asset_key).await {
                Ok(()) => info!(key = %self.config.asset_key, "Deleted shared assets"),
                Err(e) => {
                    warn!(error = %e, key = %self.config.asset_key, "Failed to delete shared assets");
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Return, or park the caller forever
pub async fn complete(mode: CompletionMode) {
    match mode {
        CompletionMode::Exit => info!("Bootstrap complete, exiting"),
        CompletionMode::Park => {
            info!("Bootstrap complete, parking");
            std::future::pending::<()>().await;
        }
    }
}
