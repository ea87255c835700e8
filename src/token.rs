//! Bootstrap tokens for follower nodes
//!
//! Tokens use the kubeadm format `[a-z0-9]{6}.[a-z0-9]{16}`: a public id and a
//! secret. They are published to the cluster as `bootstrap-token-<id>`
//! Secrets, which the API server's bootstrap authenticator reads.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{Error, Result};

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;

/// Group every kubeadm join token carries
pub const DEFAULT_NODE_TOKEN_GROUP: &str = "system:bootstrappers:kubeadm:default-node-token";

/// Default token lifetime
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A kubeadm-format bootstrap token
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    id: String,
    secret: String,
}

impl BootstrapToken {
    /// Generate a new random token
    pub fn generate() -> Result<Self> {
        Ok(Self {
            id: random_string(TOKEN_ID_LEN)?,
            secret: random_string(TOKEN_SECRET_LEN)?,
        })
    }

    /// Parse `id.secret`
    pub fn parse(s: &str) -> Result<Self> {
        let (id, secret) = s
            .split_once('.')
            .ok_or_else(|| Error::config("bootstrap token must be <id>.<secret>"))?;
        let valid = |part: &str, len: usize| {
            part.len() == len && part.bytes().all(|b| TOKEN_ALPHABET.contains(&b))
        };
        if !valid(id, TOKEN_ID_LEN) || !valid(secret, TOKEN_SECRET_LEN) {
            return Err(Error::config("bootstrap token does not match [a-z0-9]{6}.[a-z0-9]{16}"));
        }
        Ok(Self {
            id: id.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Public token id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full token as presented by joining nodes
    pub fn as_token_string(&self) -> String {
        format!("{}.{}", self.id, self.secret)
    }

    /// Render the `bootstrap-token-<id>` Secret for `cluster_name`
    pub fn secret_manifest(&self, cluster_name: &str, ttl: Duration) -> Result<String> {
        let expiration = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| Error::config(format!("invalid token TTL: {}", e)))?;

        let mut data = BTreeMap::new();
        data.insert(
            "description".to_string(),
            format!("Follower join token for cluster {}", cluster_name),
        );
        data.insert("token-id".to_string(), self.id.clone());
        data.insert("token-secret".to_string(), self.secret.clone());
        data.insert("expiration".to_string(), expiration.to_rfc3339());
        data.insert("usage-bootstrap-authentication".to_string(), "true".to_string());
        data.insert("usage-bootstrap-signing".to_string(), "true".to_string());
        data.insert(
            "auth-extra-groups".to_string(),
            format!(
                "{},system:bootstrappers:{}",
                DEFAULT_NODE_TOKEN_GROUP, cluster_name
            ),
        );

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(format!("bootstrap-token-{}", self.id)),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            type_: Some("bootstrap.kubernetes.io/token".to_string()),
            string_data: Some(data),
            ..Default::default()
        };

        serde_yaml::to_string(&secret)
            .map_err(|e| Error::generation("deploy-tokens", format!("failed to render token secret: {}", e)))
    }
}

impl std::fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose the secret half in debug output
        f.debug_struct("BootstrapToken")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Uniform random string over the token alphabet
fn random_string(len: usize) -> Result<String> {
    // Rejection sampling: 252 is the largest multiple of 36 below 256
    let limit = (256 / TOKEN_ALPHABET.len() * TOKEN_ALPHABET.len()) as u8;
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 32];

    while out.len() < len {
        aws_lc_rs::rand::fill(&mut buf)
            .map_err(|_| Error::generation("deploy-tokens", "random generation failed"))?;
        for b in buf {
            if out.len() == len {
                break;
            }
            if b < limit {
                out.push(TOKEN_ALPHABET[(b as usize) % TOKEN_ALPHABET.len()] as char);
            }
        }
    }
    Ok(out)
}
