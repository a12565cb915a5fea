//! kubic-control - control-plane daemon for kubeadm clusters
//!
//! `kubicd` lets an operator drive cluster lifecycle actions (bootstrap, node
//! join/remove/reboot, upgrade, kubeconfig retrieval) over mutually
//! authenticated gRPC, and keeps a tracked set of deployed resources in sync
//! with their on-disk definitions.
//!
//! # Architecture
//!
//! - Every RPC passes the [`gate`]: client certificate chain verification,
//!   identity extraction, RBAC authorization and one audit record per call.
//! - Lifecycle RPCs are delegated to a [`cluster::ClusterManager`].
//! - Deployment RPCs go to the [`deploy`] executor, which applies manifests,
//!   kustomize overlays and helm charts and records content fingerprints in
//!   per-mechanism [`store`]s.
//! - The [`reconcile`] pass recomputes fingerprints and re-applies whatever
//!   drifted.
//!
//! # Modules
//!
//! - [`proto`] - gRPC protocol definitions
//! - [`service`] - gRPC handlers
//! - [`gate`] - Authentication, authorization and audit
//! - [`cluster`] - Cluster lifecycle collaborator (kubeadm)
//! - [`deploy`] - Deployment executor
//! - [`reconcile`] - Drift reconciliation
//! - [`store`] - Fingerprint stores
//! - [`hasher`] - Content fingerprints
//! - [`pki`] - Control-plane CA and certificate issuance
//! - [`mtls`] - TLS configuration for server and client
//! - [`config`] - Layered configuration
//! - [`client`] - kubicctl connection helpers
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod client;
pub mod cluster;
pub mod config;
pub mod deploy;
pub mod error;
pub mod exec;
pub mod gate;
pub mod hasher;
pub mod mtls;
pub mod pki;
pub mod proto;
pub mod reconcile;
pub mod service;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

pub use config::{DEFAULT_PORT, DEFAULT_SERVER_NAME};
