//! Deployment executor
//!
//! Applies tracked resources through one of three mechanisms and records the
//! fingerprint of the applied content in that mechanism's store:
//!
//! - **Manifest**: `kubectl apply -f <file>`; fingerprint of the file bytes
//! - **Overlay**: synthesize a kustomize overlay, build it, apply the build
//!   output; fingerprint of the build output
//! - **Chart**: `helm upgrade --install`; fingerprint of the `helm template`
//!   rendering of the same release
//!
//! A store entry is written only after the apply succeeded. Each mechanism has
//! its own critical section so a direct deploy and a reconciliation pass never
//! interleave read-modify-write cycles on the same store.
//!
//! Overlay workspaces are rebuilt in a staging directory and swapped into
//! place only when build and apply succeeded, so a failed re-deploy leaves the
//! previous workspace intact.

pub mod overlay;
pub mod tools;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::hasher::Fingerprint;
use crate::reconcile::TrackedMechanism;
use crate::store::{ChartRelease, FingerprintStore, Mechanism, ResourceRecord, TomlFileStore};
use crate::{Error, Result};

pub use tools::{CommandTools, DeployTools};

/// Directory under the state directory holding overlay workspaces
pub const KUSTOMIZE_DIR: &str = "kustomize";

/// The three fingerprint stores
#[derive(Clone)]
pub struct Stores {
    /// Plain manifests
    pub manifest: Arc<dyn FingerprintStore>,
    /// Kustomize overlays
    pub overlay: Arc<dyn FingerprintStore>,
    /// Helm charts
    pub chart: Arc<dyn FingerprintStore>,
}

impl Stores {
    /// TOML file stores under `state_dir`
    pub fn on_disk(state_dir: &Path) -> Self {
        Self {
            manifest: Arc::new(TomlFileStore::new(state_dir, Mechanism::Manifest)),
            overlay: Arc::new(TomlFileStore::new(state_dir, Mechanism::Overlay)),
            chart: Arc::new(TomlFileStore::new(state_dir, Mechanism::Chart)),
        }
    }

    /// Store for `mechanism`
    pub fn get(&self, mechanism: Mechanism) -> &Arc<dyn FingerprintStore> {
        match mechanism {
            Mechanism::Manifest => &self.manifest,
            Mechanism::Overlay => &self.overlay,
            Mechanism::Chart => &self.chart,
        }
    }
}

/// Applies resources and keeps the fingerprint stores current
pub struct Deployer {
    tools: Arc<dyn DeployTools>,
    stores: Stores,
    state_dir: PathBuf,
    base_dir: PathBuf,
    manifest_lock: Mutex<()>,
    overlay_lock: Mutex<()>,
    chart_lock: Mutex<()>,
}

impl Deployer {
    /// Create an executor
    ///
    /// Overlay workspaces live under `<state_dir>/kustomize`; overlay bases are
    /// linked from `<base_dir>/<service>`.
    pub fn new(
        tools: Arc<dyn DeployTools>,
        stores: Stores,
        state_dir: impl Into<PathBuf>,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tools,
            stores,
            state_dir: state_dir.into(),
            base_dir: base_dir.into(),
            manifest_lock: Mutex::new(()),
            overlay_lock: Mutex::new(()),
            chart_lock: Mutex::new(()),
        }
    }

    /// The fingerprint stores
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Reconciliation adapters, one per mechanism, in reconciliation order
    pub fn tracked_mechanisms(self: &Arc<Self>) -> Vec<Arc<dyn TrackedMechanism>> {
        Mechanism::ALL
            .into_iter()
            .map(|mechanism| {
                Arc::new(Tracked {
                    deployer: Arc::clone(self),
                    mechanism,
                }) as Arc<dyn TrackedMechanism>
            })
            .collect()
    }

    fn workspace_root(&self) -> PathBuf {
        self.state_dir.join(KUSTOMIZE_DIR)
    }

    /// Live workspace of an overlay service
    pub fn workspace(&self, service: &str) -> PathBuf {
        self.workspace_root().join(service)
    }

    fn staging(&self, service: &str) -> PathBuf {
        self.workspace_root().join(format!(".{service}.staging"))
    }

    fn retired(&self, service: &str) -> PathBuf {
        self.workspace_root().join(format!(".{service}.old"))
    }

    // =========================================================================
    // Manifest
    // =========================================================================

    /// Apply a manifest file and track it
    #[instrument(skip(self))]
    pub async fn deploy_file(&self, path: &str) -> Result<ResourceRecord> {
        if path.trim().is_empty() {
            return Err(Error::validation("no manifest path specified"));
        }
        let _guard = self.manifest_lock.lock().await;
        self.apply_file(path).await
    }

    async fn apply_file(&self, path: &str) -> Result<ResourceRecord> {
        let file = Path::new(path);
        let content = tokio::fs::read(file).await.map_err(|e| Error::io(file, e))?;

        self.tools.apply_manifest(file).await?;

        let record = ResourceRecord::new(path, Fingerprint::of(&content));
        self.stores.manifest.upsert(record.clone()).await?;
        info!(path, fingerprint = %record.fingerprint, "manifest applied");
        Ok(record)
    }

    // =========================================================================
    // Overlay
    // =========================================================================

    /// Synthesize, build and apply the overlay for `service`, then track it
    #[instrument(skip(self))]
    pub async fn deploy_overlay(&self, service: &str, argument: &str) -> Result<ResourceRecord> {
        overlay::validate_service_name(service)?;
        let files = overlay::synthesize(service, argument)?;

        let base = self.base_dir.join(service);
        if !tokio::fs::metadata(&base).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(Error::validation(format!(
                "no kustomize base for service '{service}' in {}",
                self.base_dir.display()
            )));
        }

        let _guard = self.overlay_lock.lock().await;

        let staging = self.staging(service);
        remove_dir_if_present(&staging).await?;

        match self.build_in_staging(service, &base, &staging, &files).await {
            Ok(record) => Ok(record),
            Err(e) => {
                if let Err(cleanup) = remove_dir_if_present(&staging).await {
                    warn!(service, error = %cleanup, "failed to remove overlay staging directory");
                }
                Err(e)
            }
        }
    }

    async fn build_in_staging(
        &self,
        service: &str,
        base: &Path,
        staging: &Path,
        files: &[overlay::OverlayFile],
    ) -> Result<ResourceRecord> {
        let overlay_dir = staging.join("overlay");
        tokio::fs::create_dir_all(&overlay_dir)
            .await
            .map_err(|e| Error::io(&overlay_dir, e))?;

        let base_link = staging.join("base");
        symlink_dir(base, &base_link).await?;

        for file in files {
            let path = overlay_dir.join(file.name);
            tokio::fs::write(&path, &file.content)
                .await
                .map_err(|e| Error::io(&path, e))?;
        }

        let output = self.tools.build_overlay(&overlay_dir).await?;
        let built = staging.join(format!("{service}.yaml"));
        tokio::fs::write(&built, &output)
            .await
            .map_err(|e| Error::io(&built, e))?;

        let workspace = self.workspace(service);
        let first_deployment = !tokio::fs::try_exists(workspace.join(format!("{service}.yaml")))
            .await
            .unwrap_or(false);

        self.tools.apply_manifest(&built).await?;

        if first_deployment && overlay::needs_memberlist_secret(service) {
            self.tools
                .create_secret(
                    overlay::METALLB_NAMESPACE,
                    overlay::MEMBERLIST_SECRET,
                    "secretkey",
                    &overlay::memberlist_key(),
                )
                .await?;
        }

        self.swap_into_place(service, staging, &workspace).await?;

        let record = ResourceRecord::new(service, Fingerprint::of(&output));
        self.stores.overlay.upsert(record.clone()).await?;
        info!(service, fingerprint = %record.fingerprint, "overlay applied");
        Ok(record)
    }

    async fn swap_into_place(&self, service: &str, staging: &Path, workspace: &Path) -> Result<()> {
        let retired = self.retired(service);
        remove_dir_if_present(&retired).await?;

        let had_workspace = tokio::fs::try_exists(workspace).await.unwrap_or(false);
        if had_workspace {
            tokio::fs::rename(workspace, &retired)
                .await
                .map_err(|e| Error::io(workspace, e))?;
        }

        if let Err(e) = tokio::fs::rename(staging, workspace).await {
            if had_workspace {
                if let Err(restore) = tokio::fs::rename(&retired, workspace).await {
                    warn!(service, error = %restore, "failed to restore previous overlay workspace");
                }
            }
            return Err(Error::io(workspace, e));
        }

        if had_workspace {
            if let Err(e) = remove_dir_if_present(&retired).await {
                warn!(service, error = %e, "failed to remove retired overlay workspace");
            }
        }
        debug!(service, workspace = %workspace.display(), "overlay workspace swapped");
        Ok(())
    }

    async fn build_existing_overlay(&self, service: &str) -> Result<Vec<u8>> {
        let overlay_dir = self.workspace(service).join("overlay");
        if !tokio::fs::try_exists(&overlay_dir).await.unwrap_or(false) {
            return Err(Error::validation(format!(
                "overlay workspace for '{service}' is missing"
            )));
        }
        self.tools.build_overlay(&overlay_dir).await
    }

    async fn reapply_overlay(&self, service: &str) -> Result<ResourceRecord> {
        let _guard = self.overlay_lock.lock().await;

        let output = self.build_existing_overlay(service).await?;
        let built = self.workspace(service).join(format!("{service}.yaml"));
        tokio::fs::write(&built, &output)
            .await
            .map_err(|e| Error::io(&built, e))?;

        self.tools.apply_manifest(&built).await?;

        let record = ResourceRecord::new(service, Fingerprint::of(&output));
        self.stores.overlay.upsert(record.clone()).await?;
        info!(service, fingerprint = %record.fingerprint, "overlay re-applied");
        Ok(record)
    }

    // =========================================================================
    // Chart
    // =========================================================================

    /// Install or upgrade a helm release and track it
    ///
    /// An empty release name defaults to the chart's base name so that later
    /// upgrades target the same release.
    #[instrument(skip(self), fields(chart = %release.chart))]
    pub async fn deploy_chart(&self, mut release: ChartRelease) -> Result<ResourceRecord> {
        if release.chart.trim().is_empty() {
            return Err(Error::validation("no chart specified"));
        }
        if release.release_name.is_empty() {
            release.release_name = default_release_name(&release.chart);
        }
        let _guard = self.chart_lock.lock().await;
        self.apply_chart(release).await
    }

    async fn apply_chart(&self, release: ChartRelease) -> Result<ResourceRecord> {
        let rendered = self.tools.render_chart(&release).await?;
        self.tools.install_chart(&release).await?;

        let record = ResourceRecord::chart(release, Fingerprint::of(&rendered));
        self.stores.chart.upsert(record.clone()).await?;
        info!(chart = %record.identity, fingerprint = %record.fingerprint, "chart installed");
        Ok(record)
    }
}

fn default_release_name(chart: &str) -> String {
    let name = chart.rsplit('/').next().unwrap_or(chart);
    name.strip_suffix(".tgz").unwrap_or(name).to_string()
}

async fn remove_dir_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

#[cfg(unix)]
async fn symlink_dir(target: &Path, link: &Path) -> Result<()> {
    tokio::fs::symlink(target, link)
        .await
        .map_err(|e| Error::io(link, e))
}

#[cfg(not(unix))]
async fn symlink_dir(_target: &Path, link: &Path) -> Result<()> {
    Err(Error::io(
        link,
        std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "overlay workspaces require symlinks",
        ),
    ))
}

/// One mechanism of a [`Deployer`] seen by the reconciler
struct Tracked {
    deployer: Arc<Deployer>,
    mechanism: Mechanism,
}

#[async_trait]
impl TrackedMechanism for Tracked {
    fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    async fn tracked(&self) -> Result<Vec<ResourceRecord>> {
        Ok(self.deployer.stores.get(self.mechanism).load().await?.records())
    }

    async fn current_fingerprint(&self, record: &ResourceRecord) -> Result<Fingerprint> {
        match self.mechanism {
            Mechanism::Manifest => Fingerprint::of_file(Path::new(&record.identity)).await,
            Mechanism::Overlay => {
                // A concurrent deploy swaps the workspace under this lock.
                let _guard = self.deployer.overlay_lock.lock().await;
                Ok(Fingerprint::of(
                    self.deployer.build_existing_overlay(&record.identity).await?,
                ))
            }
            Mechanism::Chart => {
                let release = chart_release(record)?;
                Ok(Fingerprint::of(self.deployer.tools.render_chart(&release).await?))
            }
        }
    }

    async fn reapply(&self, record: &ResourceRecord) -> Result<()> {
        match self.mechanism {
            Mechanism::Manifest => {
                let _guard = self.deployer.manifest_lock.lock().await;
                self.deployer.apply_file(&record.identity).await?;
            }
            Mechanism::Overlay => {
                self.deployer.reapply_overlay(&record.identity).await?;
            }
            Mechanism::Chart => {
                let release = chart_release(record)?;
                let _guard = self.deployer.chart_lock.lock().await;
                self.deployer.apply_chart(release).await?;
            }
        }
        Ok(())
    }
}

fn chart_release(record: &ResourceRecord) -> Result<ChartRelease> {
    record.release.clone().ok_or_else(|| {
        Error::validation(format!("chart record '{}' has no release parameters", record.identity))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tools::MockDeployTools;

    struct Harness {
        dir: tempfile::TempDir,
        state: PathBuf,
        base: PathBuf,
        stores: Stores,
        manifest: Arc<MemoryStore>,
        overlay: Arc<MemoryStore>,
        chart: Arc<MemoryStore>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let state = dir.path().join("state");
            let base = dir.path().join("k8s-yaml");
            std::fs::create_dir_all(base.join("metallb")).unwrap();
            std::fs::create_dir_all(base.join("hello-kubic")).unwrap();

            let manifest = Arc::new(MemoryStore::new(Mechanism::Manifest));
            let overlay = Arc::new(MemoryStore::new(Mechanism::Overlay));
            let chart = Arc::new(MemoryStore::new(Mechanism::Chart));
            let stores = Stores {
                manifest: manifest.clone(),
                overlay: overlay.clone(),
                chart: chart.clone(),
            };
            Self {
                dir,
                state,
                base,
                stores,
                manifest,
                overlay,
                chart,
            }
        }

        fn deployer(&self, tools: MockDeployTools) -> Deployer {
            Deployer::new(Arc::new(tools), self.stores.clone(), &self.state, &self.base)
        }

        fn write_manifest(&self, name: &str, content: &str) -> String {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path.to_string_lossy().into_owned()
        }
    }

    fn ingress() -> ChartRelease {
        ChartRelease {
            chart: "nginx-ingress".to_string(),
            release_name: "ingress".to_string(),
            values_path: String::new(),
            namespace: "ingress".to_string(),
        }
    }

    // ==========================================================================
    // Story: Plain Manifests
    // ==========================================================================

    #[tokio::test]
    async fn story_applied_manifest_is_tracked_with_content_fingerprint() {
        let h = Harness::new();
        let path = h.write_manifest("app.yaml", "kind: Deployment\n");

        let mut tools = MockDeployTools::new();
        tools.expect_apply_manifest().times(1).returning(|_| Ok(()));

        let record = h.deployer(tools).deploy_file(&path).await.unwrap();

        assert_eq!(record.fingerprint, Fingerprint::of("kind: Deployment\n"));
        assert_eq!(
            h.manifest.snapshot().get(&path).unwrap().fingerprint,
            Fingerprint::of("kind: Deployment\n")
        );
    }

    #[tokio::test]
    async fn story_failed_apply_leaves_store_untouched() {
        let h = Harness::new();
        let path = h.write_manifest("app.yaml", "kind: Deployment\n");

        let mut tools = MockDeployTools::new();
        tools
            .expect_apply_manifest()
            .returning(|_| Err(Error::command("kubectl", "connection refused")));

        let err = h.deployer(tools).deploy_file(&path).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(h.manifest.snapshot().is_empty());
    }

    #[tokio::test]
    async fn story_missing_manifest_is_not_applied() {
        let h = Harness::new();
        let mut tools = MockDeployTools::new();
        tools.expect_apply_manifest().never();

        let err = h
            .deployer(tools)
            .deploy_file("/nonexistent/app.yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    // ==========================================================================
    // Story: Overlays
    // ==========================================================================

    #[tokio::test]
    async fn story_first_metallb_deploy_builds_workspace_and_creates_secret() {
        let h = Harness::new();

        let mut tools = MockDeployTools::new();
        tools
            .expect_build_overlay()
            .times(1)
            .returning(|dir| {
                let config = std::fs::read_to_string(dir.join("layer2-config.yaml")).unwrap();
                assert!(config.contains("10.0.0.10-10.0.0.20"));
                Ok(b"kind: ConfigMap\n".to_vec())
            });
        tools.expect_apply_manifest().times(1).returning(|_| Ok(()));
        tools
            .expect_create_secret()
            .withf(|ns, name, key, _| ns == "metallb-system" && name == "memberlist" && key == "secretkey")
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let deployer = h.deployer(tools);
        deployer
            .deploy_overlay("metallb", "10.0.0.10-10.0.0.20")
            .await
            .unwrap();

        let workspace = deployer.workspace("metallb");
        assert_eq!(
            std::fs::read(workspace.join("metallb.yaml")).unwrap(),
            b"kind: ConfigMap\n"
        );
        assert_eq!(
            std::fs::read_link(workspace.join("base")).unwrap(),
            h.base.join("metallb")
        );
        assert!(!deployer.staging("metallb").exists());
        assert_eq!(
            h.overlay.snapshot().get("metallb").unwrap().fingerprint,
            Fingerprint::of("kind: ConfigMap\n")
        );
    }

    #[tokio::test]
    async fn story_redeploy_replaces_workspace_without_new_secret() {
        let h = Harness::new();

        let mut tools = MockDeployTools::new();
        let mut builds = 0;
        tools.expect_build_overlay().times(2).returning(move |_| {
            builds += 1;
            Ok(format!("build {builds}\n").into_bytes())
        });
        tools.expect_apply_manifest().times(2).returning(|_| Ok(()));
        tools
            .expect_create_secret()
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let deployer = h.deployer(tools);
        deployer.deploy_overlay("metallb", "10.0.0.1-10.0.0.5").await.unwrap();
        deployer.deploy_overlay("metallb", "10.0.0.1-10.0.0.9").await.unwrap();

        let config = std::fs::read_to_string(
            deployer.workspace("metallb").join("overlay/layer2-config.yaml"),
        )
        .unwrap();
        assert!(config.contains("10.0.0.1-10.0.0.9"));
        assert_eq!(
            h.overlay.snapshot().get("metallb").unwrap().fingerprint,
            Fingerprint::of("build 2\n")
        );
    }

    #[tokio::test]
    async fn story_failed_redeploy_keeps_previous_workspace_and_fingerprint() {
        let h = Harness::new();

        let mut tools = MockDeployTools::new();
        let mut builds = 0;
        tools.expect_build_overlay().times(2).returning(move |_| {
            builds += 1;
            if builds == 1 {
                Ok(b"v1\n".to_vec())
            } else {
                Err(Error::command("kustomize", "accumulating resources"))
            }
        });
        tools.expect_apply_manifest().times(1).returning(|_| Ok(()));

        let deployer = h.deployer(tools);
        deployer.deploy_overlay("hello-kubic", "NodePort").await.unwrap();
        let err = deployer
            .deploy_overlay("hello-kubic", "10.0.0.42")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("kustomize failed"));

        let workspace = deployer.workspace("hello-kubic");
        assert!(workspace.join("overlay/patch_NodePort.yaml").exists());
        assert!(!workspace.join("overlay/patch_LoadBalancerIP.yaml").exists());
        assert_eq!(std::fs::read(workspace.join("hello-kubic.yaml")).unwrap(), b"v1\n");
        assert!(!deployer.staging("hello-kubic").exists());
        assert_eq!(
            h.overlay.snapshot().get("hello-kubic").unwrap().fingerprint,
            Fingerprint::of("v1\n")
        );
    }

    #[tokio::test]
    async fn story_failed_first_deploy_leaves_no_workspace() {
        let h = Harness::new();

        let mut tools = MockDeployTools::new();
        tools
            .expect_build_overlay()
            .returning(|_| Ok(b"kind: Service\n".to_vec()));
        tools
            .expect_apply_manifest()
            .returning(|_| Err(Error::command("kubectl", "forbidden")));

        let deployer = h.deployer(tools);
        assert!(deployer.deploy_overlay("hello-kubic", "").await.is_err());
        assert!(!deployer.workspace("hello-kubic").exists());
        assert!(!deployer.staging("hello-kubic").exists());
        assert!(h.overlay.snapshot().is_empty());
    }

    #[tokio::test]
    async fn story_unknown_base_is_rejected_before_any_tool_runs() {
        let h = Harness::new();
        let mut tools = MockDeployTools::new();
        tools.expect_build_overlay().never();
        tools.expect_apply_manifest().never();

        let err = h
            .deployer(tools)
            .deploy_overlay("dashboard", "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    // ==========================================================================
    // Story: Charts
    // ==========================================================================

    #[tokio::test]
    async fn story_chart_install_tracks_rendered_output_and_parameters() {
        let h = Harness::new();

        let mut tools = MockDeployTools::new();
        tools
            .expect_render_chart()
            .returning(|_| Ok(b"kind: Deployment\n".to_vec()));
        tools.expect_install_chart().times(1).returning(|_| Ok(()));

        h.deployer(tools).deploy_chart(ingress()).await.unwrap();

        let record = h.chart.snapshot().get("nginx-ingress").unwrap();
        assert_eq!(record.release, Some(ingress()));
        assert_eq!(record.fingerprint, Fingerprint::of("kind: Deployment\n"));
    }

    #[tokio::test]
    async fn story_failed_chart_install_keeps_previous_fingerprint() {
        let h = Harness::new();
        let previous = ResourceRecord::chart(ingress(), Fingerprint::of("old"));
        h.chart.upsert(previous.clone()).await.unwrap();

        let mut tools = MockDeployTools::new();
        tools
            .expect_render_chart()
            .returning(|_| Ok(b"new".to_vec()));
        tools
            .expect_install_chart()
            .returning(|_| Err(Error::command("helm", "UPGRADE FAILED")));

        assert!(h.deployer(tools).deploy_chart(ingress()).await.is_err());
        assert_eq!(h.chart.snapshot().get("nginx-ingress"), Some(previous));
    }

    #[tokio::test]
    async fn story_empty_release_name_defaults_to_chart_name() {
        let h = Harness::new();

        let mut tools = MockDeployTools::new();
        tools.expect_render_chart().returning(|_| Ok(Vec::new()));
        tools
            .expect_install_chart()
            .withf(|release| release.release_name == "redis")
            .returning(|_| Ok(()));

        let release = ChartRelease {
            chart: "charts/redis.tgz".to_string(),
            ..Default::default()
        };
        let record = h.deployer(tools).deploy_chart(release).await.unwrap();
        assert_eq!(record.release.unwrap().release_name, "redis");
    }

    // ==========================================================================
    // Story: Reconciliation Waits For Overlay Deploys
    // ==========================================================================

    #[tokio::test]
    async fn story_overlay_fingerprint_waits_for_a_deploy_in_progress() {
        let h = Harness::new();

        let mut tools = MockDeployTools::new();
        tools
            .expect_build_overlay()
            .returning(|_| Ok(b"kind: Service\n".to_vec()));
        tools.expect_apply_manifest().returning(|_| Ok(()));

        let deployer = Arc::new(h.deployer(tools));
        deployer.deploy_overlay("hello-kubic", "").await.unwrap();

        let tracked = Tracked {
            deployer: deployer.clone(),
            mechanism: Mechanism::Overlay,
        };
        let record = h.overlay.snapshot().get("hello-kubic").unwrap();

        // Holding the lock stands in for a deploy midway through its swap.
        let guard = deployer.overlay_lock.lock().await;
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            tracked.current_fingerprint(&record),
        )
        .await;
        assert!(pending.is_err(), "fingerprint computed while a deploy held the workspace");
        drop(guard);

        assert_eq!(
            tracked.current_fingerprint(&record).await.unwrap(),
            Fingerprint::of("kind: Service\n")
        );
    }

    #[test]
    fn default_release_names() {
        assert_eq!(default_release_name("stable/nginx-ingress"), "nginx-ingress");
        assert_eq!(default_release_name("/srv/charts/redis.tgz"), "redis");
        assert_eq!(default_release_name("redis"), "redis");
    }
}
