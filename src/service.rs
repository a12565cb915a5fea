//! Control-plane gRPC service
//!
//! [`ControlPlane`] implements both generated services. Every handler runs
//! behind the [`CallGate`]; gate rejections surface as gRPC status codes,
//! everything else (collaborator failures, bad input) as a
//! `StatusReply { success: false, message }`.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{error, info, instrument};

use crate::cluster::{ClusterManager, InitParams};
use crate::deploy::Deployer;
use crate::gate::{CallGate, CallOutcome, Operation};
use crate::mtls::ServerMtlsConfig;
use crate::proto::deployment_server::{Deployment, DeploymentServer};
use crate::proto::kubeadm_server::{Kubeadm, KubeadmServer};
use crate::proto::{
    AddNodeRequest, DeployFileRequest, DeployHelmRequest, DeployKustomizeRequest, Empty,
    InitRequest, RebootNodeRequest, RemoveNodeRequest, StatusReply, UpdateRequest, Version,
};
use crate::reconcile::{Mode, Reconciler};
use crate::store::ChartRelease;
use crate::Result;

type PeerCerts = Option<Arc<Vec<CertificateDer<'static>>>>;

fn chain(certs: &PeerCerts) -> Option<&[CertificateDer<'static>]> {
    certs.as_deref().map(Vec::as_slice)
}

fn to_reply(operation: Operation, result: Result<String>) -> StatusReply {
    match result {
        Ok(message) => StatusReply::ok(message),
        Err(e) => {
            error!(%operation, error = %e, "operation failed");
            StatusReply::failed(e.to_string())
        }
    }
}

/// Handlers for the `Kubeadm` and `Deployment` services
#[derive(Clone)]
pub struct ControlPlane {
    gate: CallGate,
    cluster: Arc<dyn ClusterManager>,
    deployer: Arc<Deployer>,
    reconciler: Arc<Reconciler>,
}

impl ControlPlane {
    /// Assemble the service
    pub fn new(
        gate: CallGate,
        cluster: Arc<dyn ClusterManager>,
        deployer: Arc<Deployer>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            gate,
            cluster,
            deployer,
            reconciler,
        }
    }

    /// The two tonic services, ready for `Server::add_service`
    pub fn into_services(self) -> (KubeadmServer<Self>, DeploymentServer<Self>) {
        (KubeadmServer::new(self.clone()), DeploymentServer::new(self))
    }

    /// Serve on `addr` until `shutdown` fires
    pub async fn serve_with_mtls(
        self,
        addr: SocketAddr,
        mtls_config: &ServerMtlsConfig,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let tls_config = mtls_config.to_tonic_config()?;
        let (kubeadm, deployment) = self.into_services();

        info!(%addr, "Starting gRPC server with mTLS");

        Server::builder()
            .tls_config(tls_config)?
            .add_service(kubeadm)
            .add_service(deployment)
            .serve_with_shutdown(addr, shutdown.cancelled_owned())
            .await?;

        info!("gRPC server stopped");
        Ok(())
    }

    async fn node_action(
        &self,
        operation: Operation,
        certs: PeerCerts,
        nodes: Vec<String>,
    ) -> std::result::Result<Response<StatusReply>, Status> {
        let reply = self
            .gate
            .run(operation, chain(&certs), |identity| async move {
                if nodes.is_empty() {
                    return StatusReply::failed("no nodes specified");
                }
                info!(%operation, %identity, nodes = ?nodes, "node action");
                let result = match operation {
                    Operation::AddNodes => self.cluster.add_nodes(&nodes).await,
                    Operation::RemoveNodes => self.cluster.remove_nodes(&nodes).await,
                    _ => self.cluster.reboot_nodes(&nodes).await,
                };
                to_reply(operation, result)
            })
            .await?;
        Ok(Response::new(reply))
    }
}

#[tonic::async_trait]
impl Kubeadm for ControlPlane {
    type InitMasterStream =
        Pin<Box<dyn Stream<Item = std::result::Result<StatusReply, Status>> + Send + 'static>>;

    #[instrument(skip(self, request))]
    async fn init_master(
        &self,
        request: Request<InitRequest>,
    ) -> std::result::Result<Response<Self::InitMasterStream>, Status> {
        let certs = request.peer_certs();
        let call = self.gate.admit(Operation::InitMaster, chain(&certs))?;
        let req = request.into_inner();
        let params = InitParams {
            pod_network: req.pod_network,
            kubernetes_version: req.kubernetes_version,
            advertise_address: req.advertise_address,
            control_plane_endpoint: req.control_plane_endpoint,
        };
        info!(identity = %call.identity(), ?params, "bootstrapping control plane");

        let (tx, rx) = mpsc::channel::<std::result::Result<StatusReply, Status>>(16);
        let (progress_tx, mut progress_rx) = mpsc::channel::<String>(16);
        let cancel = CancellationToken::new();
        let cluster = Arc::clone(&self.cluster);

        tokio::spawn(async move {
            // Caller went away: stop starting new steps.
            let watch_tx = tx.clone();
            let watch_cancel = cancel.clone();
            let watcher = tokio::spawn(async move {
                watch_tx.closed().await;
                watch_cancel.cancel();
            });

            let forward_tx = tx.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(message) = progress_rx.recv().await {
                    if forward_tx.send(Ok(StatusReply::ok(message))).await.is_err() {
                        break;
                    }
                }
            });

            let result = cluster.init_master(params, progress_tx, cancel).await;
            let _ = forwarder.await;
            watcher.abort();

            let final_reply = to_reply(Operation::InitMaster, result);
            let outcome = final_reply.outcome();
            if tx.send(Ok(final_reply)).await.is_err() {
                info!("bootstrap caller disconnected before completion");
            }
            call.finish(outcome);
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn add_node(
        &self,
        request: Request<AddNodeRequest>,
    ) -> std::result::Result<Response<StatusReply>, Status> {
        let certs = request.peer_certs();
        self.node_action(Operation::AddNodes, certs, request.into_inner().node_names)
            .await
    }

    async fn remove_node(
        &self,
        request: Request<RemoveNodeRequest>,
    ) -> std::result::Result<Response<StatusReply>, Status> {
        let certs = request.peer_certs();
        self.node_action(Operation::RemoveNodes, certs, request.into_inner().node_names)
            .await
    }

    async fn reboot_node(
        &self,
        request: Request<RebootNodeRequest>,
    ) -> std::result::Result<Response<StatusReply>, Status> {
        let certs = request.peer_certs();
        self.node_action(Operation::RebootNodes, certs, request.into_inner().node_names)
            .await
    }

    async fn upgrade_kubernetes(
        &self,
        request: Request<Version>,
    ) -> std::result::Result<Response<StatusReply>, Status> {
        let certs = request.peer_certs();
        let version = request.into_inner().version;
        let reply = self
            .gate
            .run(Operation::Upgrade, chain(&certs), |_| async move {
                to_reply(Operation::Upgrade, self.cluster.upgrade(&version).await)
            })
            .await?;
        Ok(Response::new(reply))
    }

    async fn fetch_kubeconfig(
        &self,
        request: Request<Empty>,
    ) -> std::result::Result<Response<StatusReply>, Status> {
        let certs = request.peer_certs();
        let reply = self
            .gate
            .run(Operation::FetchCredentials, chain(&certs), |_| async move {
                to_reply(Operation::FetchCredentials, self.cluster.fetch_kubeconfig().await)
            })
            .await?;
        Ok(Response::new(reply))
    }
}

#[tonic::async_trait]
impl Deployment for ControlPlane {
    async fn deploy_file(
        &self,
        request: Request<DeployFileRequest>,
    ) -> std::result::Result<Response<StatusReply>, Status> {
        let certs = request.peer_certs();
        let path = request.into_inner().path;
        let reply = self
            .gate
            .run(Operation::DeployFile, chain(&certs), |_| async move {
                let result = self
                    .deployer
                    .deploy_file(&path)
                    .await
                    .map(|record| format!("{} deployed", record.identity));
                to_reply(Operation::DeployFile, result)
            })
            .await?;
        Ok(Response::new(reply))
    }

    async fn deploy_kustomize(
        &self,
        request: Request<DeployKustomizeRequest>,
    ) -> std::result::Result<Response<StatusReply>, Status> {
        let certs = request.peer_certs();
        let req = request.into_inner();
        let reply = self
            .gate
            .run(Operation::DeployKustomize, chain(&certs), |_| async move {
                let result = self
                    .deployer
                    .deploy_overlay(&req.service, &req.argument)
                    .await
                    .map(|record| format!("{} deployed", record.identity));
                to_reply(Operation::DeployKustomize, result)
            })
            .await?;
        Ok(Response::new(reply))
    }

    async fn deploy_helm(
        &self,
        request: Request<DeployHelmRequest>,
    ) -> std::result::Result<Response<StatusReply>, Status> {
        let certs = request.peer_certs();
        let req = request.into_inner();
        let release = ChartRelease {
            chart: req.chart,
            release_name: req.release_name,
            values_path: req.values_path,
            namespace: req.namespace,
        };
        let reply = self
            .gate
            .run(Operation::DeployHelm, chain(&certs), |_| async move {
                let result = self.deployer.deploy_chart(release).await.map(|record| {
                    let name = record
                        .release
                        .map(|r| r.release_name)
                        .unwrap_or_default();
                    format!("{} installed as {}", record.identity, name)
                });
                to_reply(Operation::DeployHelm, result)
            })
            .await?;
        Ok(Response::new(reply))
    }

    async fn update_all(
        &self,
        request: Request<UpdateRequest>,
    ) -> std::result::Result<Response<StatusReply>, Status> {
        let certs = request.peer_certs();
        let mode = Mode::from_forced(request.into_inner().forced);
        let reply = self
            .gate
            .run(Operation::UpdateAll, chain(&certs), |_| async move {
                let result = self.reconciler.run(mode).await.map(|report| report.summary());
                to_reply(Operation::UpdateAll, result)
            })
            .await?;
        Ok(Response::new(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterManager;
    use crate::deploy::tools::MockDeployTools;
    use crate::deploy::Stores;
    use crate::gate::audit::MemoryAuditSink;
    use crate::gate::{Outcome, RbacPolicy};
    use crate::hasher::Fingerprint;
    use crate::mtls::ClientMtlsConfig;
    use crate::pki::{CertificateAuthority, TrustAnchor};
    use crate::proto::deployment_client::DeploymentClient;
    use crate::proto::kubeadm_client::KubeadmClient;
    use crate::store::{Mechanism, MemoryStore};
    use tokio_stream::StreamExt;
    use tonic::transport::{Channel, ClientTlsConfig};

    // ==========================================================================
    // Integration Tests: Real gRPC Server Over mTLS
    // ==========================================================================

    struct TestServer {
        addr: SocketAddr,
        ca: CertificateAuthority,
        audit: Arc<MemoryAuditSink>,
        manifests: Arc<MemoryStore>,
        handle: tokio::task::JoinHandle<()>,
    }

    impl TestServer {
        async fn start(cluster: impl ClusterManager + 'static, tools: MockDeployTools) -> Self {
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

            let ca = CertificateAuthority::new("Kubic-Control-CA").unwrap();
            let server_cert = ca
                .issue_server_cert(&["kubicd".to_string(), "127.0.0.1".to_string()])
                .unwrap();
            let mtls = ServerMtlsConfig::new(
                server_cert.cert_pem,
                server_cert.key_pem,
                ca.ca_cert_pem().to_string(),
            );

            let audit = Arc::new(MemoryAuditSink::default());
            let gate = CallGate::new(
                TrustAnchor::from_pem(ca.ca_cert_pem()).unwrap(),
                Arc::new(RbacPolicy::admin_only()),
                audit.clone(),
            );

            let manifests = Arc::new(MemoryStore::new(Mechanism::Manifest));
            let stores = Stores {
                manifest: manifests.clone(),
                overlay: Arc::new(MemoryStore::new(Mechanism::Overlay)),
                chart: Arc::new(MemoryStore::new(Mechanism::Chart)),
            };
            let deployer = Arc::new(Deployer::new(
                Arc::new(tools),
                stores,
                "/nonexistent/state",
                "/nonexistent/k8s-yaml",
            ));
            let reconciler = Arc::new(Reconciler::new(deployer.tracked_mechanisms()));
            let plane = ControlPlane::new(gate, Arc::new(cluster), deployer, reconciler);
            let (kubeadm, deployment) = plane.into_services();

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let tls = mtls.to_tonic_config().unwrap();

            let handle = tokio::spawn(async move {
                Server::builder()
                    .tls_config(tls)
                    .unwrap()
                    .add_service(kubeadm)
                    .add_service(deployment)
                    .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
                    .await
                    .unwrap();
            });

            tokio::time::sleep(std::time::Duration::from_millis(50)).await;

            Self {
                addr,
                ca,
                audit,
                manifests,
                handle,
            }
        }

        fn client_tls(&self, identity: &str) -> ClientTlsConfig {
            let cert = self.ca.issue_client_cert(identity).unwrap();
            ClientMtlsConfig::new(
                cert.cert_pem,
                cert.key_pem,
                self.ca.ca_cert_pem().to_string(),
                "kubicd".to_string(),
            )
            .to_tonic_config()
            .unwrap()
        }

        fn channel(&self, tls: ClientTlsConfig) -> Channel {
            Channel::from_shared(format!("https://{}", self.addr))
                .unwrap()
                .tls_config(tls)
                .unwrap()
                .connect_lazy()
        }

        fn kubeadm_as(&self, identity: &str) -> KubeadmClient<Channel> {
            KubeadmClient::new(self.channel(self.client_tls(identity)))
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.handle.abort();
        }
    }

    fn no_deploys() -> MockDeployTools {
        MockDeployTools::new()
    }

    /// Story: admin adds a worker; the collaborator receives the node list
    #[tokio::test]
    async fn integration_admin_adds_node() {
        let mut cluster = MockClusterManager::new();
        cluster
            .expect_add_nodes()
            .withf(|nodes| nodes.len() == 1 && nodes[0] == "worker-1")
            .times(1)
            .returning(|_| Ok("Nodes joined: worker-1".to_string()));
        let server = TestServer::start(cluster, no_deploys()).await;

        let reply = server
            .kubeadm_as("admin")
            .add_node(AddNodeRequest {
                node_names: vec!["worker-1".to_string()],
            })
            .await
            .unwrap()
            .into_inner();

        assert!(reply.success);
        assert_eq!(reply.message, "Nodes joined: worker-1");

        let records = server.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, Operation::AddNodes);
        assert_eq!(records[0].outcome, Outcome::Success);
    }

    /// Story: an empty node list is a caller error, not a collaborator call
    #[tokio::test]
    async fn integration_empty_node_list_fails_without_collaborator() {
        let mut cluster = MockClusterManager::new();
        cluster.expect_remove_nodes().never();
        let server = TestServer::start(cluster, no_deploys()).await;

        let reply = server
            .kubeadm_as("admin")
            .remove_node(RemoveNodeRequest { node_names: vec![] })
            .await
            .unwrap()
            .into_inner();

        assert!(!reply.success);
        assert_eq!(reply.message, "no nodes specified");
    }

    /// Story: collaborator errors become failed replies and the daemon keeps serving
    #[tokio::test]
    async fn integration_collaborator_failure_is_a_failed_reply() {
        let mut cluster = MockClusterManager::new();
        cluster
            .expect_upgrade()
            .returning(|_| Err(crate::Error::command("kubeadm", "version skew too large")));
        cluster
            .expect_fetch_kubeconfig()
            .returning(|| Ok("apiVersion: v1\nkind: Config\n".to_string()));
        let server = TestServer::start(cluster, no_deploys()).await;
        let mut client = server.kubeadm_as("admin");

        let reply = client
            .upgrade_kubernetes(Version {
                version: "v1.99.0".to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        assert!(!reply.success);
        assert!(reply.message.contains("version skew too large"));

        let reply = client.fetch_kubeconfig(Empty {}).await.unwrap().into_inner();
        assert!(reply.success);
        assert!(reply.message.contains("kind: Config"));
    }

    /// Story: a caller without a certificate is unauthenticated
    #[tokio::test]
    async fn integration_missing_client_certificate_is_unauthenticated() {
        let mut cluster = MockClusterManager::new();
        cluster.expect_fetch_kubeconfig().never();
        let server = TestServer::start(cluster, no_deploys()).await;

        let tls = ClientTlsConfig::new()
            .ca_certificate(tonic::transport::Certificate::from_pem(server.ca.ca_cert_pem()))
            .domain_name("kubicd");
        let mut client = KubeadmClient::new(server.channel(tls));

        let status = client.fetch_kubeconfig(Empty {}).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
        assert_eq!(
            server.audit.records()[0].outcome,
            Outcome::Rejected(tonic::Code::Unauthenticated)
        );
    }

    /// Story: a certificate from another CA never reaches a handler
    #[tokio::test]
    async fn integration_foreign_ca_certificate_is_rejected() {
        let mut cluster = MockClusterManager::new();
        cluster.expect_add_nodes().never();
        let server = TestServer::start(cluster, no_deploys()).await;

        let foreign = CertificateAuthority::new("Kubic-Control-CA").unwrap();
        let cert = foreign.issue_client_cert("admin").unwrap();
        let tls = ClientMtlsConfig::new(
            cert.cert_pem,
            cert.key_pem,
            server.ca.ca_cert_pem().to_string(),
            "kubicd".to_string(),
        )
        .to_tonic_config()
        .unwrap();
        let mut client = KubeadmClient::new(server.channel(tls));

        let result = client
            .add_node(AddNodeRequest {
                node_names: vec!["worker-1".to_string()],
            })
            .await;
        assert!(result.is_err());
    }

    /// Story: authenticated but unauthorized identities are denied
    #[tokio::test]
    async fn integration_non_admin_is_permission_denied() {
        let mut cluster = MockClusterManager::new();
        cluster.expect_reboot_nodes().never();
        let server = TestServer::start(cluster, no_deploys()).await;

        let status = server
            .kubeadm_as("alice")
            .reboot_node(RebootNodeRequest {
                node_names: vec!["worker-1".to_string()],
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }

    /// Story: bootstrap progress streams to the caller, then the final result
    #[tokio::test]
    async fn integration_init_master_streams_progress() {
        let mut cluster = MockClusterManager::new();
        cluster
            .expect_init_master()
            .withf(|params, _, _| params.pod_network == "cilium")
            .times(1)
            .returning(|_, progress, _| {
                progress.try_send("kubeadm init".to_string()).unwrap();
                progress.try_send("deploying cilium".to_string()).unwrap();
                Ok("master ready".to_string())
            });
        let server = TestServer::start(cluster, no_deploys()).await;

        let mut stream = server
            .kubeadm_as("admin")
            .init_master(InitRequest {
                pod_network: "cilium".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner();

        let mut messages = Vec::new();
        while let Some(reply) = stream.next().await {
            let reply = reply.unwrap();
            assert!(reply.success);
            messages.push(reply.message);
        }
        assert_eq!(messages, vec!["kubeadm init", "deploying cilium", "master ready"]);

        // The audit record is written when the stream task ends.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let records = server.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, Operation::InitMaster);
        assert_eq!(records[0].outcome, Outcome::Success);
    }

    /// Bootstrap that reports one step, then blocks until cancelled
    struct StalledBootstrap {
        cancelled: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl ClusterManager for StalledBootstrap {
        async fn init_master(
            &self,
            _params: InitParams,
            progress: mpsc::Sender<String>,
            cancel: CancellationToken,
        ) -> Result<String> {
            let _ = progress.send("kubeadm init".to_string()).await;
            cancel.cancelled().await;
            self.cancelled.notify_one();
            Err(crate::Error::Cancelled)
        }

        async fn add_nodes(&self, _nodes: &[String]) -> Result<String> {
            Err(crate::Error::cluster("not part of this story"))
        }

        async fn remove_nodes(&self, _nodes: &[String]) -> Result<String> {
            Err(crate::Error::cluster("not part of this story"))
        }

        async fn reboot_nodes(&self, _nodes: &[String]) -> Result<String> {
            Err(crate::Error::cluster("not part of this story"))
        }

        async fn upgrade(&self, _version: &str) -> Result<String> {
            Err(crate::Error::cluster("not part of this story"))
        }

        async fn fetch_kubeconfig(&self) -> Result<String> {
            Err(crate::Error::cluster("not part of this story"))
        }
    }

    /// Story: a caller hanging up mid-bootstrap cancels it and is audited once
    #[tokio::test]
    async fn integration_dropped_init_stream_cancels_bootstrap() {
        let cancelled = Arc::new(tokio::sync::Notify::new());
        let cluster = StalledBootstrap {
            cancelled: cancelled.clone(),
        };
        let server = TestServer::start(cluster, no_deploys()).await;

        let mut stream = server
            .kubeadm_as("admin")
            .init_master(InitRequest::default())
            .await
            .unwrap()
            .into_inner();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.message, "kubeadm init");
        assert!(server.audit.records().is_empty());

        drop(stream);

        tokio::time::timeout(std::time::Duration::from_secs(5), cancelled.notified())
            .await
            .expect("bootstrap was not cancelled after the caller went away");

        let mut records = server.audit.records();
        for _ in 0..100 {
            if !records.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            records = server.audit.records();
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, Operation::InitMaster);
        assert_eq!(records[0].outcome, Outcome::Failure);
    }

    /// Story: deploy a manifest and reconcile it over RPC
    #[tokio::test]
    async fn integration_deploy_file_then_update_all() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app.yaml");
        std::fs::write(&app, "kind: Namespace\n").unwrap();
        let app_id = app.to_string_lossy().into_owned();

        let mut tools = MockDeployTools::new();
        tools.expect_apply_manifest().times(2).returning(|_| Ok(()));
        let server = TestServer::start(MockClusterManager::new(), tools).await;
        let mut client = DeploymentClient::new(server.channel(server.client_tls("admin")));

        let reply = client
            .deploy_file(DeployFileRequest { path: app_id.clone() })
            .await
            .unwrap()
            .into_inner();
        assert!(reply.success, "{}", reply.message);
        assert_eq!(
            server.manifests.snapshot().get(&app_id).unwrap().fingerprint,
            Fingerprint::of("kind: Namespace\n")
        );

        let reply = client
            .update_all(UpdateRequest { forced: false })
            .await
            .unwrap()
            .into_inner();
        assert!(reply.success);
        assert_eq!(reply.message, "1 resources unchanged");

        let reply = client
            .update_all(UpdateRequest { forced: true })
            .await
            .unwrap()
            .into_inner();
        assert!(reply.success);
        assert!(reply.message.starts_with("updated "));
    }
}
