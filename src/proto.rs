//! gRPC protocol definitions for the kubicd control plane
//!
//! This module contains the generated Protobuf and gRPC code for the two
//! services exposed by the daemon:
//!
//! - `Kubeadm`: cluster lifecycle (bootstrap, node management, upgrade, kubeconfig)
//! - `Deployment`: tracked deployments (plain manifests, kustomize overlays,
//!   helm charts) and the update-all reconciliation pass
//!
//! Every unary call answers with a [`StatusReply`]; `InitMaster` streams one
//! [`StatusReply`] per progress step.
//!
//! # Example
//!
//! ```ignore
//! use kubic_control::proto::kubeadm_client::KubeadmClient;
//!
//! let mut client = KubeadmClient::new(channel);
//! let reply = client
//!     .add_node(AddNodeRequest { node_names: vec!["worker-1".into()] })
//!     .await?
//!     .into_inner();
//! ```

#![allow(missing_docs)] // Generated code doesn't have docs
#![allow(clippy::doc_overindented_list_items)] // Generated proto docs have formatting issues

/// Generated protobuf and gRPC code
pub mod kubic {
    /// Version 1 of the control-plane protocol
    pub mod v1 {
        tonic::include_proto!("kubic.v1");
    }
}

// Re-export commonly used types at the module level for convenience
pub use kubic::v1::*;

impl StatusReply {
    /// Successful reply carrying `message`
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// Failed reply carrying a human-readable reason
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reply_constructors_set_success_flag() {
        let ok = StatusReply::ok("done");
        assert!(ok.success);
        assert_eq!(ok.message, "done");

        let failed = StatusReply::failed("kubectl apply failed");
        assert!(!failed.success);
        assert_eq!(failed.message, "kubectl apply failed");
    }
}
