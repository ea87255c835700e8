//! Shared asset bundle and its transport codec
//!
//! The bundle holds everything that must be identical on every control-plane
//! node: the service-account signing key pair and the front-proxy CA with its
//! key. It travels through the store as a JSON document of PEM strings.
//!
//! Decoding always validates, so a record that parses but carries unusable
//! material (wrong PEM type, a front-proxy certificate that is not a CA) is
//! rejected before any of it reaches disk.

use serde::{Deserialize, Serialize};
use x509_parser::prelude::*;

use crate::{Error, Result};

/// Cluster-wide secrets generated once by the primary
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedAssets {
    /// Front-proxy CA certificate (PEM)
    pub front_proxy_ca: String,
    /// Front-proxy CA private key (PEM)
    pub front_proxy_ca_key: String,
    /// Service-account public key (PEM)
    pub sa_pub: String,
    /// Service-account private key (PEM)
    pub sa_key: String,
}

impl std::fmt::Debug for SharedAssets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.debug_struct("SharedAssets")
            .field("front_proxy_ca_bytes", &self.front_proxy_ca.len())
            .field("sa_pub_bytes", &self.sa_pub.len())
            .finish_non_exhaustive()
    }
}

impl SharedAssets {
    /// Check every field is PEM of the expected type and the front-proxy
    /// certificate is a CA
    pub fn validate(&self) -> Result<()> {
        expect_pem("service account public key", &self.sa_pub, is_public_key_tag)?;
        expect_pem("service account private key", &self.sa_key, is_private_key_tag)?;
        expect_pem(
            "front proxy CA key",
            &self.front_proxy_ca_key,
            is_private_key_tag,
        )?;

        let der = expect_pem("front proxy CA", &self.front_proxy_ca, |tag| {
            tag == "CERTIFICATE"
        })?;
        let (_, cert) = X509Certificate::from_der(&der).map_err(|e| {
            Error::codec(format!("front proxy CA could not be parsed: {}", e))
        })?;
        if !cert.is_ca() {
            return Err(Error::codec(
                "front proxy certificate loaded but it is not a CA",
            ));
        }
        Ok(())
    }
}

/// Serialize the bundle for publication
pub fn encode(assets: &SharedAssets) -> Result<String> {
    serde_json::to_string(assets)
        .map_err(|e| Error::codec(format!("failed to encode shared assets: {}", e)))
}

/// Deserialize and validate a published bundle
pub fn decode(payload: &str) -> Result<SharedAssets> {
    let assets: SharedAssets = serde_json::from_str(payload)
        .map_err(|e| Error::codec(format!("failed to decode shared assets: {}", e)))?;
    assets.validate()?;
    Ok(assets)
}

fn expect_pem(what: &str, data: &str, tag_ok: impl Fn(&str) -> bool) -> Result<Vec<u8>> {
    let block = ::pem::parse(data.as_bytes())
        .map_err(|e| Error::codec(format!("{} is not valid PEM: {}", what, e)))?;
    if !tag_ok(block.tag()) {
        return Err(Error::codec(format!(
            "{} has unexpected PEM type {}",
            what,
            block.tag()
        )));
    }
    Ok(block.into_contents())
}

fn is_private_key_tag(tag: &str) -> bool {
    tag.ends_with("PRIVATE KEY")
}

fn is_public_key_tag(tag: &str) -> bool {
    tag.ends_with("PUBLIC KEY")
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::SharedAssets;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    fn certificate_pem(is_ca: bool, key: &KeyPair) -> String {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "front-proxy-ca");
        params.is_ca = if is_ca {
            IsCa::Ca(BasicConstraints::Unconstrained)
        } else {
            IsCa::NoCa
        };
        params.self_signed(key).unwrap().pem()
    }

    /// A valid bundle with freshly generated material
    pub(crate) fn sample_assets() -> SharedAssets {
        let ca_key = KeyPair::generate().unwrap();
        let sa_key = KeyPair::generate().unwrap();
        SharedAssets {
            front_proxy_ca: certificate_pem(true, &ca_key),
            front_proxy_ca_key: ca_key.serialize_pem(),
            sa_pub: sa_key.public_key_pem(),
            sa_key: sa_key.serialize_pem(),
        }
    }

    /// A bundle whose front-proxy certificate is a leaf, not a CA
    pub(crate) fn non_ca_assets() -> SharedAssets {
        let key = KeyPair::generate().unwrap();
        SharedAssets {
            front_proxy_ca: certificate_pem(false, &key),
            ..sample_assets()
        }
    }
}
