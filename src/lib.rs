//! cpboot - control-plane bootstrap coordinator
//!
//! Brings up a multi-node Kubernetes control plane where exactly one node
//! generates the cluster-wide secrets (service-account signing keys and the
//! front-proxy CA) and every other control-plane node picks them up from a
//! shared store.
//!
//! # Architecture
//!
//! - Nodes race for a TTL-bounded lock in the store; the winner is the primary
//! - The primary generates PKI, brings up its control plane and publishes the
//!   shared assets with create-if-absent
//! - Losers back off and re-check; once the record exists they bootstrap as
//!   secondaries from it
//! - A failed primary releases the lock; a crashed one lets it expire
//!
//! # Modules
//!
//! - [`coordinator`] - Election loop and the primary/secondary sequences
//! - [`store`] - Shared store abstraction with in-memory and Kubernetes backends
//! - [`assets`] - Shared asset bundle and its codec
//! - [`provisioner`] - Provisioning capabilities and the kubeadm implementation
//! - [`cloud`] - Node data from the cloud platform
//! - [`network`] - Pod network overlays
//! - [`token`] - Join tokens for follower nodes
//! - [`compute`] - Compute node setup
//! - [`config`] - Election and node settings
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod assets;
pub mod cloud;
pub mod compute;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exec;
pub mod kubectl;
pub mod network;
pub mod provisioner;
pub mod store;
pub mod telemetry;
pub mod token;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
