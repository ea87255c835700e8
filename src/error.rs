//! Error types for the bootstrap coordinator
//!
//! Errors are grouped by how the coordinator reacts to them: store errors
//! drive or abort the election, codec errors mean the published record is
//! unusable, and generation errors come from the provisioner steps.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for bootstrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Distributed store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Shared asset record could not be encoded, decoded or validated
    #[error("codec error: {0}")]
    Codec(String),

    /// A provisioning step failed
    #[error("generation error [{step}]: {message}")]
    Generation {
        /// Step that failed (e.g. "generate-pki", "start-node-agent")
        step: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Node data from the cloud provider was missing or invalid
    #[error("cloud metadata error: {0}")]
    CloudMetadata(String),

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a codec error with the given message
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a generation error for a provisioning step
    pub fn generation(step: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Generation {
            step: step.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a cloud metadata error with the given message
    pub fn cloud_metadata(msg: impl Into<String>) -> Self {
        Self::CloudMetadata(msg.into())
    }
}
