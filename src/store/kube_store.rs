//! Store backed by a Kubernetes API server
//!
//! Values live in Secrets (the shared assets contain private keys) and locks
//! are coordination.k8s.io/v1 Leases, both named after the store key.
//!
//! # Atomicity
//!
//! - Create-if-absent maps to `create`: the API server answers 409 Conflict
//!   when the object already exists.
//! - A lock is created the same way. An existing Lease whose
//!   `renewTime + leaseDurationSeconds` has passed is taken over with a
//!   `replace` carrying the observed resourceVersion, so two nodes racing
//!   for the same expired lease cannot both win.
//! - Leases are never renewed: an abandoned lock expires after its TTL.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use super::{Store, StoreError};

/// Data field holding the value inside a Secret
pub const VALUE_FIELD: &str = "value";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "cpboot";

/// Store using Secrets and Leases in one namespace
pub struct KubeStore {
    client: Client,
    namespace: String,
    identity: String,
}

impl KubeStore {
    /// Create a store in `namespace`; `identity` is recorded as lease holder
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Create a store against the cluster named by an explicit kubeconfig
    ///
    /// The coordinating cluster must already be running; it cannot be the
    /// control plane this node is about to bootstrap.
    pub async fn from_kubeconfig(
        kubeconfig: &Path,
        namespace: &str,
        identity: &str,
    ) -> Result<Self, StoreError> {
        let raw = Kubeconfig::read_from(kubeconfig).map_err(|e| {
            StoreError::Unavailable(format!(
                "failed to read store kubeconfig {}: {}",
                kubeconfig.display(),
                e
            ))
        })?;
        let config = Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
            .await
            .map_err(|e| StoreError::Unavailable(format!("invalid store kubeconfig: {}", e)))?;
        let client = Client::try_from(config).map_err(unavailable)?;
        Ok(Self::new(client, namespace, identity))
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn leases(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn metadata(&self, name: &str, resource_version: Option<String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            resource_version,
            ..Default::default()
        }
    }

    fn lease(
        &self,
        key: &str,
        ttl: Duration,
        now: chrono::DateTime<Utc>,
        transitions: i32,
        resource_version: Option<String>,
    ) -> Result<Lease, StoreError> {
        Ok(Lease {
            metadata: self.metadata(key, resource_version),
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(lease_duration_seconds(ttl)?),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        })
    }

    /// Replace an existing lease if it has expired
    async fn take_over_if_expired(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let api = self.leases();
        let existing = match api.get(key).await {
            Ok(lease) => lease,
            // Deleted between our create and get; let the caller retry
            Err(e) if is_status(&e, 404) => return Ok(false),
            Err(e) => return Err(unavailable(e)),
        };

        let now = Utc::now();
        let spec = existing.spec.as_ref();
        let renew_time = spec.and_then(|s| s.renew_time.as_ref());
        let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
        let is_expired = match (renew_time, duration_secs) {
            (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
            _ => true,
        };

        if !is_expired {
            debug!(
                key,
                holder = ?spec.and_then(|s| s.holder_identity.as_ref()),
                "Lock held by another node"
            );
            return Ok(false);
        }

        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1;
        let lease = self.lease(
            key,
            ttl,
            now,
            transitions,
            existing.metadata.resource_version.clone(),
        )?;

        match api.replace(key, &PostParams::default(), &lease).await {
            Ok(_) => {
                info!(key, identity = %self.identity, transitions, "Took over expired lock");
                Ok(true)
            }
            Err(e) if is_status(&e, 409) => {
                debug!(key, "Lock takeover conflict");
                Ok(false)
            }
            Err(e) => Err(unavailable(e)),
        }
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get(&self, key: &str) -> Result<String, StoreError> {
        let secret = match self.secrets().get(key).await {
            Ok(secret) => secret,
            Err(e) if is_status(&e, 404) => return Err(StoreError::KeyMissing(key.to_string())),
            Err(e) => return Err(unavailable(e)),
        };

        let bytes = secret
            .data
            .and_then(|mut data| data.remove(VALUE_FIELD))
            .ok_or_else(|| {
                StoreError::Unavailable(format!("secret {} has no {} field", key, VALUE_FIELD))
            })?;

        String::from_utf8(bytes.0)
            .map_err(|e| StoreError::Unavailable(format!("secret {} is not UTF-8: {}", key, e)))
    }

    async fn get_or_create_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let lease = self.lease(key, ttl, Utc::now(), 0, None)?;

        match self.leases().create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(key, identity = %self.identity, "Created lock");
                Ok(true)
            }
            Err(e) if is_status(&e, 409) => self.take_over_if_expired(key, ttl).await,
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let secret = Secret {
            metadata: self.metadata(key, None),
            data: Some(BTreeMap::from([(
                VALUE_FIELD.to_string(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        match self.secrets().create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 409) => Err(StoreError::KeyExists(key.to_string())),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.leases().delete(key, &DeleteParams::default()).await {
            Ok(_) => debug!(key, "Deleted lease"),
            Err(e) if is_status(&e, 404) => {}
            Err(e) => return Err(unavailable(e)),
        }
        match self.secrets().delete(key, &DeleteParams::default()).await {
            Ok(_) => debug!(key, "Deleted secret"),
            Err(e) if is_status(&e, 404) => {}
            Err(e) => return Err(unavailable(e)),
        }
        Ok(())
    }
}

/// Lease duration in whole seconds (at least one)
fn lease_duration_seconds(ttl: Duration) -> Result<i32, StoreError> {
    i32::try_from(ttl.as_secs().max(1)).map_err(|_| {
        StoreError::Unavailable(format!(
            "lock TTL of {}s does not fit a lease duration",
            ttl.as_secs()
        ))
    })
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

fn unavailable(err: kube::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}
