//! Cluster lifecycle collaborator
//!
//! The control-plane service hands every lifecycle RPC to a
//! [`ClusterManager`]. [`KubeadmManager`] is the default implementation; it
//! runs kubeadm locally, reaches other nodes through salt and deploys the pod
//! network through the deployment executor so the network manifest is tracked
//! like any other.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::deploy::Deployer;
use crate::exec;
use crate::{Error, Result};

/// Default pod network add-on
pub const DEFAULT_POD_NETWORK: &str = "flannel";

/// Parameters for bootstrapping the first control-plane node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitParams {
    /// Pod network add-on; empty selects [`DEFAULT_POD_NETWORK`]
    pub pod_network: String,
    /// Kubernetes version; empty for the kubeadm default
    pub kubernetes_version: String,
    /// API server advertise address; empty for the kubeadm default
    pub advertise_address: String,
    /// Shared control-plane endpoint; empty for a single master
    pub control_plane_endpoint: String,
}

/// Cluster lifecycle actions
///
/// Each action returns the message reported back to the caller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterManager: Send + Sync {
    /// Bootstrap the first control-plane node
    ///
    /// Progress messages go to `progress`. Once `cancel` fires no further
    /// steps are started; steps already performed are not undone.
    async fn init_master(
        &self,
        params: InitParams,
        progress: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<String>;

    /// Join `nodes` as workers
    async fn add_nodes(&self, nodes: &[String]) -> Result<String>;

    /// Drain and delete `nodes`
    async fn remove_nodes(&self, nodes: &[String]) -> Result<String>;

    /// Drain, reboot and uncordon `nodes`
    async fn reboot_nodes(&self, nodes: &[String]) -> Result<String>;

    /// Upgrade the control plane to `version`
    async fn upgrade(&self, version: &str) -> Result<String>;

    /// Admin kubeconfig contents
    async fn fetch_kubeconfig(&self) -> Result<String>;
}

/// Manifest, relative to the shared manifest directory, of a pod network
fn pod_network_manifest(network: &str) -> Option<&'static str> {
    match network {
        "flannel" => Some("flannel/kube-flannel.yaml"),
        "cilium" => Some("cilium/cilium.yaml"),
        "weave" => Some("weave/weave.yaml"),
        _ => None,
    }
}

fn pod_network_cidr(network: &str) -> Option<&'static str> {
    match network {
        "flannel" => Some("10.244.0.0/16"),
        "cilium" => Some("10.217.0.0/16"),
        _ => None,
    }
}

fn kubeadm_init_args(params: &InitParams, network: &str) -> Vec<String> {
    let mut args = vec!["init".to_string()];
    if let Some(cidr) = pod_network_cidr(network) {
        args.push(format!("--pod-network-cidr={cidr}"));
    }
    if !params.kubernetes_version.is_empty() {
        args.push(format!("--kubernetes-version={}", params.kubernetes_version));
    }
    if !params.advertise_address.is_empty() {
        args.push(format!(
            "--apiserver-advertise-address={}",
            params.advertise_address
        ));
    }
    if !params.control_plane_endpoint.is_empty() {
        args.push(format!(
            "--control-plane-endpoint={}",
            params.control_plane_endpoint
        ));
        args.push("--upload-certs".to_string());
    }
    args
}

/// kubeadm + kubectl + salt implementation of [`ClusterManager`]
pub struct KubeadmManager {
    kubeconfig: PathBuf,
    manifest_dir: PathBuf,
    deployer: Arc<Deployer>,
}

impl KubeadmManager {
    /// Manager using the admin `kubeconfig`, pod network manifests from
    /// `manifest_dir`, and `deployer` to track the network deployment
    pub fn new(
        kubeconfig: impl Into<PathBuf>,
        manifest_dir: impl Into<PathBuf>,
        deployer: Arc<Deployer>,
    ) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            manifest_dir: manifest_dir.into(),
            deployer,
        }
    }

    fn kubeconfig_flag(&self) -> String {
        format!("--kubeconfig={}", self.kubeconfig.display())
    }

    async fn kubectl(&self, args: &[&str]) -> Result<String> {
        let kubeconfig = self.kubeconfig_flag();
        let mut full = vec![kubeconfig.as_str()];
        full.extend_from_slice(args);
        exec::run_text("kubectl", full).await
    }

    async fn salt(&self, node: &str, args: &[&str]) -> Result<String> {
        let mut full = vec![node];
        full.extend_from_slice(args);
        exec::run_text("salt", full)
            .await
            .map_err(|e| Error::cluster(format!("{node}: {e}")))
    }

    async fn drain(&self, node: &str) -> Result<()> {
        self.kubectl(&[
            "drain",
            node,
            "--delete-emptydir-data",
            "--force",
            "--ignore-daemonsets",
        ])
        .await
        .map_err(|e| Error::cluster(format!("{node}: {e}")))?;
        Ok(())
    }
}

async fn report(
    progress: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    message: impl Into<String>,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    progress
        .send(message.into())
        .await
        .map_err(|_| Error::Cancelled)
}

fn require_nodes(nodes: &[String]) -> Result<()> {
    if nodes.is_empty() || nodes.iter().any(|n| n.trim().is_empty()) {
        return Err(Error::validation("no nodes specified"));
    }
    Ok(())
}

#[async_trait]
impl ClusterManager for KubeadmManager {
    #[instrument(skip(self, progress, cancel))]
    async fn init_master(
        &self,
        params: InitParams,
        progress: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let network = if params.pod_network.is_empty() {
            DEFAULT_POD_NETWORK
        } else {
            params.pod_network.as_str()
        };
        let manifest = pod_network_manifest(network)
            .ok_or_else(|| Error::validation(format!("unsupported pod network '{network}'")))?;

        report(&progress, &cancel, "Initializing kubernetes master with kubeadm").await?;
        exec::run("kubeadm", kubeadm_init_args(&params, network)).await?;
        info!("kubeadm init finished");

        report(&progress, &cancel, format!("Deploying pod network {network}")).await?;
        let manifest = self.manifest_dir.join(manifest);
        self.deployer
            .deploy_file(&manifest.to_string_lossy())
            .await?;

        report(&progress, &cancel, format!("Pod network {network} deployed")).await?;
        Ok("Kubernetes master was successfully setup".to_string())
    }

    #[instrument(skip(self))]
    async fn add_nodes(&self, nodes: &[String]) -> Result<String> {
        require_nodes(nodes)?;

        let join = exec::run_text("kubeadm", ["token", "create", "--print-join-command"]).await?;
        let join = join.trim();
        if join.is_empty() {
            return Err(Error::cluster("kubeadm returned an empty join command"));
        }

        for node in nodes.iter().map(String::as_str) {
            self.salt(node, &["cmd.run", join]).await?;
            info!(node = %node, "node joined");
        }
        Ok(format!("Nodes joined: {}", nodes.join(", ")))
    }

    #[instrument(skip(self))]
    async fn remove_nodes(&self, nodes: &[String]) -> Result<String> {
        require_nodes(nodes)?;

        for node in nodes.iter().map(String::as_str) {
            self.drain(node).await?;
            self.kubectl(&["delete", "node", node])
                .await
                .map_err(|e| Error::cluster(format!("{node}: {e}")))?;
            if let Err(e) = self.salt(node, &["cmd.run", "kubeadm reset --force"]).await {
                warn!(node = %node, error = %e, "kubeadm reset on removed node failed");
            }
            info!(node = %node, "node removed");
        }
        Ok(format!("Nodes removed: {}", nodes.join(", ")))
    }

    #[instrument(skip(self))]
    async fn reboot_nodes(&self, nodes: &[String]) -> Result<String> {
        require_nodes(nodes)?;

        for node in nodes.iter().map(String::as_str) {
            self.drain(node).await?;
            self.salt(node, &["system.reboot"]).await?;
            self.kubectl(&["uncordon", node])
                .await
                .map_err(|e| Error::cluster(format!("{node}: {e}")))?;
            info!(node = %node, "node rebooted");
        }
        Ok(format!("Nodes rebooted: {}", nodes.join(", ")))
    }

    #[instrument(skip(self))]
    async fn upgrade(&self, version: &str) -> Result<String> {
        let version = version.trim();
        if version.is_empty() {
            return Err(Error::validation("no kubernetes version specified"));
        }
        exec::run("kubeadm", ["upgrade", "apply", version, "--yes"]).await?;
        Ok(format!("Kubernetes upgraded to {version}"))
    }

    async fn fetch_kubeconfig(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.kubeconfig)
            .await
            .map_err(|e| Error::io(&self.kubeconfig, e))
    }
}
