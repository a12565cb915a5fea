//! External deployment tools
//!
//! The executor never talks to the cluster itself; it drives kubectl,
//! kustomize and helm through [`DeployTools`] so the apply procedures can be
//! exercised against a mock.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::exec;
use crate::store::ChartRelease;
use crate::Result;

/// Cluster-apply and build collaborators used by the deployment executor
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeployTools: Send + Sync {
    /// `kubectl apply -f <path>`
    async fn apply_manifest(&self, path: &Path) -> Result<()>;

    /// `kustomize build <overlay_dir>`; returns the built manifest
    async fn build_overlay(&self, overlay_dir: &Path) -> Result<Vec<u8>>;

    /// `helm template` for `release`; returns the rendered manifests
    async fn render_chart(&self, release: &ChartRelease) -> Result<Vec<u8>>;

    /// `helm upgrade --install` for `release`
    async fn install_chart(&self, release: &ChartRelease) -> Result<()>;

    /// Create a generic secret with a single literal entry
    async fn create_secret(&self, namespace: &str, name: &str, key: &str, value: &str)
        -> Result<()>;
}

// =============================================================================
// Real Implementation
// =============================================================================

/// [`DeployTools`] backed by the kubectl, kustomize and helm binaries
pub struct CommandTools {
    kubeconfig: PathBuf,
}

impl CommandTools {
    /// Tools operating on the cluster reachable through `kubeconfig`
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }

    fn kubeconfig_flag(&self) -> String {
        format!("--kubeconfig={}", self.kubeconfig.display())
    }

    fn chart_args(&self, release: &ChartRelease) -> Vec<String> {
        let mut args = vec![
            release.release_name.clone(),
            release.chart.clone(),
            self.kubeconfig_flag(),
        ];
        if !release.values_path.is_empty() {
            args.push("--values".to_string());
            args.push(release.values_path.clone());
        }
        if !release.namespace.is_empty() {
            args.push("--namespace".to_string());
            args.push(release.namespace.clone());
        }
        args
    }
}

#[async_trait]
impl DeployTools for CommandTools {
    async fn apply_manifest(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "kubectl apply");
        let kubeconfig = self.kubeconfig_flag();
        let path = path.to_string_lossy().into_owned();
        exec::run("kubectl", [kubeconfig.as_str(), "apply", "-f", path.as_str()]).await?;
        Ok(())
    }

    async fn build_overlay(&self, overlay_dir: &Path) -> Result<Vec<u8>> {
        exec::run("kustomize", [Path::new("build"), overlay_dir]).await
    }

    async fn render_chart(&self, release: &ChartRelease) -> Result<Vec<u8>> {
        let mut args = vec!["template".to_string()];
        args.extend(self.chart_args(release));
        exec::run("helm", args).await
    }

    async fn install_chart(&self, release: &ChartRelease) -> Result<()> {
        info!(chart = %release.chart, release = %release.release_name, "helm upgrade --install");
        let mut args = vec!["upgrade".to_string(), "--install".to_string()];
        args.extend(self.chart_args(release));
        if !release.namespace.is_empty() {
            args.push("--create-namespace".to_string());
        }
        exec::run("helm", args).await?;
        Ok(())
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        info!(namespace, name, "kubectl create secret");
        let kubeconfig = self.kubeconfig_flag();
        let literal = format!("--from-literal={key}={value}");
        exec::run(
            "kubectl",
            [
                kubeconfig.as_str(),
                "create",
                "secret",
                "generic",
                "-n",
                namespace,
                name,
                literal.as_str(),
            ],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_args_skip_empty_parameters() {
        let tools = CommandTools::new("/etc/kubernetes/admin.conf");
        let args = tools.chart_args(&ChartRelease {
            chart: "stable/redis".to_string(),
            release_name: "cache".to_string(),
            values_path: String::new(),
            namespace: String::new(),
        });
        assert_eq!(
            args,
            vec![
                "cache".to_string(),
                "stable/redis".to_string(),
                "--kubeconfig=/etc/kubernetes/admin.conf".to_string(),
            ]
        );
    }

    #[test]
    fn chart_args_include_values_and_namespace() {
        let tools = CommandTools::new("/root/.kube/config");
        let args = tools.chart_args(&ChartRelease {
            chart: "nginx-ingress".to_string(),
            release_name: "ingress".to_string(),
            values_path: "/etc/values.yaml".to_string(),
            namespace: "ingress".to_string(),
        });
        assert!(args.windows(2).any(|w| w == ["--values", "/etc/values.yaml"]));
        assert!(args.windows(2).any(|w| w == ["--namespace", "ingress"]));
    }
}
