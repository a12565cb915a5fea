//! kubicctl side of the control-plane connection

use std::path::Path;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::mtls::ClientMtlsConfig;
use crate::proto::deployment_client::DeploymentClient;
use crate::proto::kubeadm_client::KubeadmClient;
use crate::proto::StatusReply;
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Clients for both daemon services over one mTLS channel
pub struct ControlClient {
    kubeadm: KubeadmClient<Channel>,
    deployment: DeploymentClient<Channel>,
}

impl ControlClient {
    /// Connect to the daemon described by `config`
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let mtls_config = ClientMtlsConfig::load(&config.tls, &config.server_name)?;
        let tls_config = mtls_config.to_tonic_config()?;

        let endpoint = config.endpoint();
        info!(%endpoint, cert = %config.tls.cert_file.display(), "Connecting to kubicd");

        let channel = Endpoint::from_shared(endpoint)?
            .connect_timeout(CONNECT_TIMEOUT)
            .tls_config(tls_config)?
            .connect()
            .await?;

        Ok(Self::from_channel(channel))
    }

    /// Wrap an established channel
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            kubeadm: KubeadmClient::new(channel.clone()),
            deployment: DeploymentClient::new(channel),
        }
    }

    /// Cluster lifecycle client
    pub fn kubeadm(&mut self) -> &mut KubeadmClient<Channel> {
        &mut self.kubeadm
    }

    /// Deployment client
    pub fn deployment(&mut self) -> &mut DeploymentClient<Channel> {
        &mut self.deployment
    }
}

/// Turn a failed reply into an error carrying the daemon's message
pub fn into_result(reply: StatusReply) -> Result<String> {
    if reply.success {
        Ok(reply.message)
    } else {
        Err(Error::cluster(reply.message))
    }
}

/// Write credentials readable by the owner only
pub fn write_private_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        // An existing file keeps its mode on open; tighten it explicitly.
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::io(path, e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| Error::io(path, e))?;
    }

    #[cfg(not(unix))]
    std::fs::write(path, contents).map_err(|e| Error::io(path, e))?;

    debug!(path = %path.display(), "wrote credentials");
    Ok(())
}
