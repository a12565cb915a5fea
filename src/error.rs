//! Error types for the kubicd control plane

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::ConfigError;
use crate::mtls::MtlsError;
use crate::pki::PkiError;

/// Main error type for kubicd operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Filesystem error on a specific path
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path being read or written
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// External command (kubectl, kustomize, helm, kubeadm, salt) failed
    #[error("{program} failed: {message}")]
    Command {
        /// Program that was invoked
        program: String,
        /// Captured stderr, or the spawn error
        message: String,
    },

    /// Persisted fingerprint store could not be read or written
    #[error("fingerprint store {}: {message}", path.display())]
    Store {
        /// Store file
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// Invalid caller input
    #[error("validation error: {0}")]
    Validation(String),

    /// Cluster lifecycle collaborator failure
    #[error("cluster error: {0}")]
    Cluster(String),

    /// A reconciliation pass is already running
    #[error("an update pass is already in progress")]
    ReconcileInProgress,

    /// The caller went away before the operation finished
    #[error("operation cancelled")]
    Cancelled,

    /// gRPC server failure
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// PKI error
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// mTLS configuration error
    #[error(transparent)]
    Mtls(#[from] MtlsError),

    /// Configuration loading error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Create an I/O error for `path`
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a command failure for `program`
    pub fn command(program: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            message: msg.into(),
        }
    }

    /// Create a store error for the store file at `path`
    pub fn store(path: impl AsRef<Path>, msg: impl Into<String>) -> Self {
        Self::Store {
            path: path.as_ref().to_path_buf(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a cluster error with the given message
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }
}
