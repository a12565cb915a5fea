//! Authenticated call gate
//!
//! Every RPC passes through [`CallGate`] before its handler runs:
//!
//! 1. The peer must have presented a certificate chain; otherwise the call
//!    fails with `Unauthenticated`.
//! 2. The chain must verify against the configured trust anchor; otherwise
//!    `Unauthenticated`.
//! 3. The leaf's Common Name becomes the caller [`Identity`].
//! 4. The [`AccessPolicy`] must allow the identity to call the operation;
//!    otherwise `PermissionDenied`.
//! 5. After the handler finished, one [`audit::AuditRecord`] is written.
//!
//! Rejected calls are audited too, with [`audit::Outcome::Rejected`].

pub mod audit;
pub mod rbac;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use rustls::pki_types::CertificateDer;
use tonic::Status;
use tracing::{debug, warn};

use crate::pki::TrustAnchor;
use crate::proto::StatusReply;

pub use audit::{AuditRecord, AuditSink, Outcome, TracingAuditSink};
pub use rbac::RbacPolicy;

/// Privileged operations exposed by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Bootstrap the first control-plane node
    InitMaster,
    /// Join nodes
    AddNodes,
    /// Drain and delete nodes
    RemoveNodes,
    /// Drain, reboot and uncordon nodes
    RebootNodes,
    /// Upgrade Kubernetes
    Upgrade,
    /// Fetch the admin kubeconfig
    FetchCredentials,
    /// Deploy a plain manifest
    DeployFile,
    /// Deploy a kustomize overlay
    DeployKustomize,
    /// Deploy a helm chart
    DeployHelm,
    /// Run a reconciliation pass
    UpdateAll,
}

impl Operation {
    /// Every operation
    pub const ALL: [Operation; 10] = [
        Operation::InitMaster,
        Operation::AddNodes,
        Operation::RemoveNodes,
        Operation::RebootNodes,
        Operation::Upgrade,
        Operation::FetchCredentials,
        Operation::DeployFile,
        Operation::DeployKustomize,
        Operation::DeployHelm,
        Operation::UpdateAll,
    ];

    /// Name used in policies and audit records
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::InitMaster => "init-master",
            Operation::AddNodes => "add-nodes",
            Operation::RemoveNodes => "remove-nodes",
            Operation::RebootNodes => "reboot-nodes",
            Operation::Upgrade => "upgrade",
            Operation::FetchCredentials => "fetch-credentials",
            Operation::DeployFile => "deploy-file",
            Operation::DeployKustomize => "deploy-kustomize",
            Operation::DeployHelm => "deploy-helm",
            Operation::UpdateAll => "update-all",
        }
    }

    /// Inverse of [`Operation::as_str`]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated caller, taken from the client certificate's Common Name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Wrap a verified Common Name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decides whether an identity may call an operation
#[cfg_attr(test, automock)]
pub trait AccessPolicy: Send + Sync {
    /// True when `identity` may call `operation`
    fn is_allowed(&self, identity: &Identity, operation: Operation) -> bool;
}

/// Maps a handler result onto an audit outcome
pub trait CallOutcome {
    /// Audit outcome of this result
    fn outcome(&self) -> Outcome;
}

impl CallOutcome for StatusReply {
    fn outcome(&self) -> Outcome {
        if self.success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// A call that passed the gate and still owes its audit record
///
/// Call [`AdmittedCall::finish`] when the handler is done. Dropping an
/// unfinished call records a failure.
pub struct AdmittedCall {
    operation: Operation,
    identity: Identity,
    started_at: DateTime<Utc>,
    start: Instant,
    audit: Arc<dyn AuditSink>,
    finished: bool,
}

impl AdmittedCall {
    /// Caller identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Operation being served
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Write the audit record for this call
    pub fn finish(mut self, outcome: Outcome) {
        self.write(outcome);
    }

    fn write(&mut self, outcome: Outcome) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.audit.record(AuditRecord {
            operation: self.operation,
            identity: Some(self.identity.clone()),
            started_at: self.started_at,
            duration: self.start.elapsed(),
            outcome,
        });
    }
}

impl Drop for AdmittedCall {
    fn drop(&mut self) {
        if !self.finished {
            warn!(operation = %self.operation, identity = %self.identity, "call ended without an outcome");
            self.write(Outcome::Failure);
        }
    }
}

/// Authentication, authorization and auditing in front of every handler
#[derive(Clone)]
pub struct CallGate {
    trust_anchor: TrustAnchor,
    policy: Arc<dyn AccessPolicy>,
    audit: Arc<dyn AuditSink>,
}

impl CallGate {
    /// Create a gate
    pub fn new(
        trust_anchor: TrustAnchor,
        policy: Arc<dyn AccessPolicy>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            trust_anchor,
            policy,
            audit,
        }
    }

    /// Verify the peer's certificate chain and return the caller identity
    pub fn authenticate(&self, peer_certs: Option<&[CertificateDer<'_>]>) -> Result<Identity, Status> {
        let chain = peer_certs.ok_or_else(|| Status::unauthenticated("no peer credentials"))?;
        if chain.is_empty() {
            return Err(Status::unauthenticated("no client certificate presented"));
        }

        let name = self.trust_anchor.verify_chain(chain).map_err(|e| {
            debug!(error = %e, "client certificate rejected");
            Status::unauthenticated("client certificate could not be verified")
        })?;
        Ok(Identity::new(name))
    }

    /// Authenticate, authorize and start the audit clock for `operation`
    ///
    /// A rejection is audited before it is returned.
    pub fn admit(
        &self,
        operation: Operation,
        peer_certs: Option<&[CertificateDer<'_>]>,
    ) -> Result<AdmittedCall, Status> {
        let started_at = Utc::now();
        let start = Instant::now();

        let identity = match self.authenticate(peer_certs) {
            Ok(identity) => identity,
            Err(status) => {
                self.reject(operation, None, started_at, start.elapsed(), &status);
                return Err(status);
            }
        };

        if !self.policy.is_allowed(&identity, operation) {
            let status = Status::permission_denied(format!("{identity} may not call {operation}"));
            self.reject(operation, Some(identity), started_at, start.elapsed(), &status);
            return Err(status);
        }

        debug!(%operation, %identity, "call admitted");
        Ok(AdmittedCall {
            operation,
            identity,
            started_at,
            start,
            audit: Arc::clone(&self.audit),
            finished: false,
        })
    }

    fn reject(
        &self,
        operation: Operation,
        identity: Option<Identity>,
        started_at: DateTime<Utc>,
        duration: Duration,
        status: &Status,
    ) {
        warn!(%operation, identity = ?identity.as_ref().map(Identity::as_str), reason = status.message(), "call rejected");
        self.audit.record(AuditRecord {
            operation,
            identity,
            started_at,
            duration,
            outcome: Outcome::Rejected(status.code()),
        });
    }

    /// Run `handler` behind the gate and audit its result
    pub async fn run<T, F, Fut>(
        &self,
        operation: Operation,
        peer_certs: Option<&[CertificateDer<'_>]>,
        handler: F,
    ) -> Result<T, Status>
    where
        T: CallOutcome,
        F: FnOnce(Identity) -> Fut,
        Fut: Future<Output = T>,
    {
        let call = self.admit(operation, peer_certs)?;
        let result = handler(call.identity().clone()).await;
        call.finish(result.outcome());
        Ok(result)
    }
}
