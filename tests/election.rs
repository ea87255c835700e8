//! Multi-node election over a shared in-memory store
//!
//! These tests tell the story of several control-plane nodes booting at once
//! against the same store: exactly one generates and publishes the shared
//! assets, and every other node bootstraps from what it published.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

use cpboot::assets::SharedAssets;
use cpboot::config::{BootstrapConfig, CompletionMode, DEFAULT_ASSET_KEY, DEFAULT_LOCK_KEY};
use cpboot::coordinator::{Coordinator, Role};
use cpboot::provisioner::{ClientRole, Provisioner};
use cpboot::store::{MemoryStore, Store, StoreError};
use cpboot::{Error, Result};

// =============================================================================
// Test Fixtures
// =============================================================================

fn generate_assets() -> SharedAssets {
    let ca_key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, "front-proxy-ca");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = params.self_signed(&ca_key).unwrap();

    let sa_key = KeyPair::generate().unwrap();
    SharedAssets {
        front_proxy_ca: ca.pem(),
        front_proxy_ca_key: ca_key.serialize_pem(),
        sa_pub: sa_key.public_key_pem(),
        sa_key: sa_key.serialize_pem(),
    }
}

/// Provisioner that mints real assets and records what it was asked to do
#[derive(Default)]
struct FakeNode {
    fail_pki: bool,
    generated: Mutex<Option<SharedAssets>>,
    persisted: Mutex<Option<SharedAssets>>,
    tokens_deployed: AtomicUsize,
}

impl FakeNode {
    fn failing() -> Self {
        Self {
            fail_pki: true,
            ..Default::default()
        }
    }

    fn assets_in_use(&self) -> Option<SharedAssets> {
        let generated = self.generated.lock().unwrap().clone();
        generated.or_else(|| self.persisted.lock().unwrap().clone())
    }
}

#[async_trait]
impl Provisioner for FakeNode {
    async fn stage_ca(&self) -> Result<()> {
        Ok(())
    }

    async fn generate_pki(&self) -> Result<()> {
        if self.fail_pki {
            return Err(Error::generation("generate-pki", "simulated failure"));
        }
        let mut generated = self.generated.lock().unwrap();
        if generated.is_none() && self.persisted.lock().unwrap().is_none() {
            *generated = Some(generate_assets());
        }
        Ok(())
    }

    async fn write_manifests(&self) -> Result<()> {
        Ok(())
    }

    async fn load_shared_assets(&self) -> Result<SharedAssets> {
        self.generated
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::generation("load-shared-assets", "nothing generated"))
    }

    async fn persist_shared_assets(&self, assets: &SharedAssets) -> Result<()> {
        *self.persisted.lock().unwrap() = Some(assets.clone());
        Ok(())
    }

    async fn generate_client_credentials(&self, role: ClientRole) -> Result<PathBuf> {
        Ok(PathBuf::from(role.file_name()))
    }

    async fn start_node_agent(&self, _control_plane: bool) -> Result<()> {
        Ok(())
    }

    async fn apply_addons(&self) -> Result<()> {
        Ok(())
    }

    async fn mark_control_plane(&self) -> Result<()> {
        Ok(())
    }

    async fn install_network(&self) -> Result<()> {
        Ok(())
    }

    async fn deploy_tokens(&self) -> Result<()> {
        self.tokens_deployed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Store wrapper counting successful publications
struct CountingStore {
    inner: Arc<MemoryStore>,
    publishes: AtomicUsize,
}

#[async_trait]
impl Store for CountingStore {
    async fn get(&self, key: &str) -> std::result::Result<String, StoreError> {
        self.inner.get(key).await
    }

    async fn get_or_create_lock(
        &self,
        key: &str,
        ttl: Duration,
    ) -> std::result::Result<bool, StoreError> {
        self.inner.get_or_create_lock(key, ttl).await
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> std::result::Result<(), StoreError> {
        self.inner.put_if_absent(key, value).await?;
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

fn config() -> BootstrapConfig {
    BootstrapConfig::new("race")
        .with_backoff(Duration::from_millis(10))
        .with_completion(CompletionMode::Exit)
}

// =============================================================================
// Story Tests
// =============================================================================

/// Story: five nodes boot together and agree on one set of assets
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn story_racing_nodes_elect_exactly_one_primary() {
    let store = Arc::new(CountingStore {
        inner: Arc::new(MemoryStore::new()),
        publishes: AtomicUsize::new(0),
    });

    let nodes: Vec<Arc<FakeNode>> = (0..5).map(|_| Arc::new(FakeNode::default())).collect();
    let mut handles = Vec::new();
    for node in &nodes {
        let coordinator = Coordinator::new(config(), store.clone(), node.clone());
        handles.push(tokio::spawn(async move { coordinator.run().await }));
    }

    let mut roles = Vec::new();
    for handle in handles {
        roles.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(roles.iter().filter(|r| **r == Role::Primary).count(), 1);
    assert_eq!(roles.iter().filter(|r| **r == Role::Secondary).count(), 4);
    assert_eq!(store.publishes.load(Ordering::SeqCst), 1);

    // Only the primary issues join tokens
    let tokens: usize = nodes
        .iter()
        .map(|n| n.tokens_deployed.load(Ordering::SeqCst))
        .sum();
    assert_eq!(tokens, 1);

    // Every node ends up holding the primary's assets
    let primary = roles.iter().position(|r| *r == Role::Primary).unwrap();
    let primary_assets = nodes[primary].assets_in_use().unwrap();
    for node in &nodes {
        assert_eq!(node.assets_in_use().unwrap(), primary_assets);
    }
}

/// Story: a primary that fails hands the election to the next node
#[tokio::test]
async fn story_failed_primary_lets_next_node_take_over() {
    let store = Arc::new(MemoryStore::new());

    let first = Coordinator::new(config(), store.clone(), Arc::new(FakeNode::failing()));
    let err = first.run().await.unwrap_err();
    assert!(matches!(err, Error::Generation { .. }));
    assert!(!store.contains(DEFAULT_LOCK_KEY));
    assert!(!store.contains(DEFAULT_ASSET_KEY));

    let second = Coordinator::new(config(), store.clone(), Arc::new(FakeNode::default()));
    assert_eq!(second.run().await.unwrap(), Role::Primary);
    assert!(store.contains(DEFAULT_ASSET_KEY));
}

/// Story: a node that crashed holding the lock is replaced once the TTL runs out
#[tokio::test(start_paused = true)]
async fn story_crashed_lock_holder_expires_after_ttl() {
    let store = Arc::new(MemoryStore::new());
    assert!(store
        .get_or_create_lock(DEFAULT_LOCK_KEY, Duration::from_secs(30))
        .await
        .unwrap());

    let started = tokio::time::Instant::now();
    let cfg = config()
        .with_backoff(Duration::from_secs(20))
        .with_lock_ttl(Duration::from_secs(30));
    let coordinator = Coordinator::new(cfg, store.clone(), Arc::new(FakeNode::default()));

    assert_eq!(coordinator.run().await.unwrap(), Role::Primary);
    assert!(started.elapsed() >= Duration::from_secs(30));
}

/// Story: a node arriving after bootstrap goes straight to secondary
#[tokio::test]
async fn story_late_node_reuses_published_assets() {
    let store = Arc::new(MemoryStore::new());

    let primary = Arc::new(FakeNode::default());
    Coordinator::new(config(), store.clone(), primary.clone())
        .run()
        .await
        .unwrap();

    let late = Arc::new(FakeNode::default());
    let role = Coordinator::new(config(), store.clone(), late.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(role, Role::Secondary);
    assert_eq!(late.assets_in_use(), primary.assets_in_use());
    assert_eq!(late.tokens_deployed.load(Ordering::SeqCst), 0);
}
