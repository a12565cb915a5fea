//! Layered configuration for kubicd and kubicctl
//!
//! Both binaries resolve their settings the same way (highest priority first):
//!
//! 1. Command-line flags
//! 2. Local override file (`/etc/kubicd/kubicd.conf`, `~/.config/kubicctl/kubicctl.conf`)
//! 3. Distribution defaults (`/usr/share/defaults/kubicd/kubicd.conf`)
//! 4. Built-in defaults
//!
//! Files are TOML. A missing file is skipped; a file that exists but cannot be
//! parsed is an error, never silently ignored.
//!
//! ```toml
//! [global]
//! server = "0.0.0.0"
//! port = 7148
//! crtfile = "/etc/kubicd/pki/KubicD.crt"
//!
//! [deployment]
//! statedir = "/var/lib/kubic-control"
//! update_interval_secs = 3600
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default listen / connect host
pub const DEFAULT_SERVER: &str = "localhost";

/// Default gRPC port
pub const DEFAULT_PORT: u16 = 7148;

/// Name the daemon certificate is issued for and clients verify
pub const DEFAULT_SERVER_NAME: &str = "kubicd";

/// Distribution defaults for the daemon
pub const DAEMON_DEFAULTS_FILE: &str = "/usr/share/defaults/kubicd/kubicd.conf";

/// Local override for the daemon
pub const DAEMON_CONFIG_FILE: &str = "/etc/kubicd/kubicd.conf";

/// PKI directory of the daemon (and of the admin client certificate)
pub const PKI_DIR: &str = "/etc/kubicd/pki";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File exists but could not be read
    #[error("cannot read config {}: {message}", path.display())]
    Read {
        /// Config file
        path: PathBuf,
        /// Underlying error
        message: String,
    },

    /// File could not be parsed
    #[error("malformed config {}: {message}", path.display())]
    Parse {
        /// Config file
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// Resolved configuration is unusable
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Certificate, key and trust anchor used on one side of the mTLS link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    /// Own certificate
    pub cert_file: PathBuf,
    /// Own private key
    pub key_file: PathBuf,
    /// CA certificate(s) the peer must chain to
    pub ca_file: PathBuf,
}

impl TlsPaths {
    fn in_dir(dir: &Path, stem: &str, ca_stem: &str) -> Self {
        Self {
            cert_file: dir.join(format!("{stem}.crt")),
            key_file: dir.join(format!("{stem}.key")),
            ca_file: dir.join(format!("{ca_stem}.crt")),
        }
    }
}

/// `[global]` section shared by both config files
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalSection {
    server: Option<String>,
    port: Option<u16>,
    crtfile: Option<PathBuf>,
    keyfile: Option<PathBuf>,
    cafile: Option<PathBuf>,
    rbacfile: Option<PathBuf>,
    servername: Option<String>,
}

/// `[deployment]` section of the daemon config
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeploymentSection {
    statedir: Option<PathBuf>,
    basedir: Option<PathBuf>,
    kubeconfig: Option<PathBuf>,
    update_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    global: GlobalSection,
    #[serde(default)]
    deployment: DeploymentSection,
}

fn read_layer(path: &Path) -> Result<Option<ConfigFile>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    };

    toml::from_str(&content)
        .map(Some)
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Filesystem locations used by the deployment executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPaths {
    /// Holds the fingerprint stores and overlay workspaces
    pub state_dir: PathBuf,
    /// Read-only shared manifests and kustomize bases (`<base_dir>/<service>`)
    pub base_dir: PathBuf,
    /// Admin kubeconfig passed to kubectl and helm
    pub kubeconfig: PathBuf,
}

impl Default for DeploymentPaths {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/kubic-control"),
            base_dir: PathBuf::from("/usr/share/k8s-yaml"),
            kubeconfig: PathBuf::from("/etc/kubernetes/admin.conf"),
        }
    }
}

/// Command-line overrides for the daemon; `None` keeps the file value
#[derive(Debug, Default, Clone)]
pub struct DaemonOverrides {
    /// Listen host
    pub server: Option<String>,
    /// Listen port
    pub port: Option<u16>,
    /// Daemon certificate
    pub cert_file: Option<PathBuf>,
    /// Daemon key
    pub key_file: Option<PathBuf>,
    /// Client CA
    pub ca_file: Option<PathBuf>,
}

/// Resolved daemon configuration, built once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Host to listen on
    pub server: String,
    /// Port to listen on
    pub port: u16,
    /// Daemon certificate, key and client trust anchor
    pub tls: TlsPaths,
    /// RBAC policy file
    pub rbac_file: PathBuf,
    /// Deployment state locations
    pub deployment: DeploymentPaths,
    /// Interval of the scheduled incremental update pass, if enabled
    pub update_interval: Option<Duration>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            port: DEFAULT_PORT,
            tls: TlsPaths::in_dir(Path::new(PKI_DIR), "KubicD", "Kubic-Control-CA"),
            rbac_file: PathBuf::from("/etc/kubicd/rbac.conf"),
            deployment: DeploymentPaths::default(),
            update_interval: None,
        }
    }
}

impl DaemonConfig {
    /// Load from the standard system locations
    pub fn load(overrides: DaemonOverrides) -> Result<Self, ConfigError> {
        Self::load_layers(
            &[
                PathBuf::from(DAEMON_DEFAULTS_FILE),
                PathBuf::from(DAEMON_CONFIG_FILE),
            ],
            overrides,
        )
    }

    /// Apply `layers` in order (later wins), then the flag overrides
    pub fn load_layers(layers: &[PathBuf], overrides: DaemonOverrides) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for path in layers {
            let Some(file) = read_layer(path)? else {
                continue;
            };
            let ConfigFile { global, deployment } = file;

            if global.servername.is_some() {
                return Err(ConfigError::Parse {
                    path: path.clone(),
                    message: "servername is a client setting".to_string(),
                });
            }
            if let Some(v) = global.server {
                config.server = v;
            }
            if let Some(v) = global.port {
                config.port = v;
            }
            if let Some(v) = global.crtfile {
                config.tls.cert_file = v;
            }
            if let Some(v) = global.keyfile {
                config.tls.key_file = v;
            }
            if let Some(v) = global.cafile {
                config.tls.ca_file = v;
            }
            if let Some(v) = global.rbacfile {
                config.rbac_file = v;
            }
            if let Some(v) = deployment.statedir {
                config.deployment.state_dir = v;
            }
            if let Some(v) = deployment.basedir {
                config.deployment.base_dir = v;
            }
            if let Some(v) = deployment.kubeconfig {
                config.deployment.kubeconfig = v;
            }
            if let Some(secs) = deployment.update_interval_secs {
                config.update_interval = (secs > 0).then(|| Duration::from_secs(secs));
            }
        }

        if let Some(v) = overrides.server {
            config.server = v;
        }
        if let Some(v) = overrides.port {
            config.port = v;
        }
        if let Some(v) = overrides.cert_file {
            config.tls.cert_file = v;
        }
        if let Some(v) = overrides.key_file {
            config.tls.key_file = v;
        }
        if let Some(v) = overrides.ca_file {
            config.tls.ca_file = v;
        }

        Ok(config)
    }

    /// Resolve `server:port` to the socket address to bind
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        (self.server.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::Invalid(format!("cannot resolve {}: {}", self.server, e)))?
            .next()
            .ok_or_else(|| ConfigError::Invalid(format!("{} resolves to no address", self.server)))
    }
}

/// Command-line overrides for kubicctl
#[derive(Debug, Default, Clone)]
pub struct ClientOverrides {
    /// Daemon host
    pub server: Option<String>,
    /// Daemon port
    pub port: Option<u16>,
    /// User certificate
    pub cert_file: Option<PathBuf>,
    /// User key
    pub key_file: Option<PathBuf>,
    /// CA the daemon certificate must chain to
    pub ca_file: Option<PathBuf>,
}

/// Resolved kubicctl configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Daemon host
    pub server: String,
    /// Daemon port
    pub port: u16,
    /// Name expected in the daemon certificate
    pub server_name: String,
    /// User certificate, key and server trust anchor
    pub tls: TlsPaths,
}

impl ClientConfig {
    /// Load from `~/.config/kubicctl/kubicctl.conf` with admin-certificate fallback
    pub fn load(overrides: ClientOverrides) -> Result<Self, ConfigError> {
        let user_dir = dirs::home_dir().map(|home| home.join(".config").join("kubicctl"));
        Self::load_from(user_dir.as_deref(), Path::new(PKI_DIR), overrides)
    }

    /// Resolve against an explicit user config directory and admin PKI directory
    ///
    /// When no user certificate exists in `user_dir` and the config file does
    /// not name one, the admin certificate from `admin_pki_dir` is used.
    pub fn load_from(
        user_dir: Option<&Path>,
        admin_pki_dir: &Path,
        overrides: ClientOverrides,
    ) -> Result<Self, ConfigError> {
        let user_tls = user_dir.map(|dir| TlsPaths::in_dir(dir, "user", "Kubic-Control-CA"));
        let default_tls = match user_tls {
            Some(tls) if tls.cert_file.exists() => tls,
            _ => TlsPaths::in_dir(admin_pki_dir, crate::pki::ADMIN_IDENTITY, "Kubic-Control-CA"),
        };

        let mut config = Self {
            server: DEFAULT_SERVER.to_string(),
            port: DEFAULT_PORT,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            tls: default_tls,
        };

        if let Some(dir) = user_dir {
            let path = dir.join("kubicctl.conf");
            if let Some(file) = read_layer(&path)? {
                let global = file.global;
                if global.rbacfile.is_some() {
                    return Err(ConfigError::Parse {
                        path,
                        message: "rbacfile is a daemon setting".to_string(),
                    });
                }
                if let Some(v) = global.server {
                    config.server = v;
                }
                if let Some(v) = global.port {
                    config.port = v;
                }
                if let Some(v) = global.servername {
                    config.server_name = v;
                }
                if let Some(v) = global.crtfile {
                    config.tls.cert_file = v;
                }
                if let Some(v) = global.keyfile {
                    config.tls.key_file = v;
                }
                if let Some(v) = global.cafile {
                    config.tls.ca_file = v;
                }
            }
        }

        if let Some(v) = overrides.server {
            config.server = v;
        }
        if let Some(v) = overrides.port {
            config.port = v;
        }
        if let Some(v) = overrides.cert_file {
            config.tls.cert_file = v;
        }
        if let Some(v) = overrides.key_file {
            config.tls.key_file = v;
        }
        if let Some(v) = overrides.ca_file {
            config.tls.ca_file = v;
        }

        Ok(config)
    }

    /// gRPC endpoint URI of the daemon
    pub fn endpoint(&self) -> String {
        format!("https://{}:{}", self.server, self.port)
    }
}
