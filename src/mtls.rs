//! mTLS configuration for gRPC connections
//!
//! Configures TLS for both the daemon (server) and kubicctl (client) sides
//! from the certificate, key and CA paths in their configuration.

use std::path::Path;

use thiserror::Error;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};
use zeroize::Zeroizing;

use crate::config::TlsPaths;
use crate::pki::TrustAnchor;

/// mTLS configuration errors
#[derive(Debug, Error)]
pub enum MtlsError {
    /// A certificate, key or CA file could not be read
    #[error("could not read {path}: {message}")]
    Read {
        /// File that failed
        path: String,
        /// Underlying error
        message: String,
    },

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    CertificateParseError(String),
}

fn read_pem(path: &Path) -> Result<String, MtlsError> {
    std::fs::read_to_string(path).map_err(|e| MtlsError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Server-side mTLS configuration
pub struct ServerMtlsConfig {
    /// Server certificate PEM
    pub server_cert_pem: String,
    /// Server private key PEM (zeroized on drop)
    pub server_key_pem: Zeroizing<String>,
    /// CA certificate PEM for verifying clients
    pub ca_cert_pem: String,
}

impl ServerMtlsConfig {
    /// Create a new server mTLS config
    pub fn new(
        server_cert_pem: String,
        server_key_pem: Zeroizing<String>,
        ca_cert_pem: String,
    ) -> Self {
        Self {
            server_cert_pem,
            server_key_pem,
            ca_cert_pem,
        }
    }

    /// Read the daemon certificate, key and CA from disk
    pub fn load(paths: &TlsPaths) -> Result<Self, MtlsError> {
        Ok(Self::new(
            read_pem(&paths.cert_file)?,
            Zeroizing::new(read_pem(&paths.key_file)?),
            read_pem(&paths.ca_file)?,
        ))
    }

    /// Trust anchor the call gate verifies client chains against
    pub fn trust_anchor(&self) -> Result<TrustAnchor, MtlsError> {
        TrustAnchor::from_pem(&self.ca_cert_pem)
            .map_err(|e| MtlsError::CertificateParseError(e.to_string()))
    }

    /// Build a tonic ServerTlsConfig that verifies client certificates
    ///
    /// A presented certificate must chain to the CA or the handshake fails.
    /// Peers without a certificate are let through to the call gate, which
    /// answers them with `Unauthenticated`.
    pub fn to_tonic_config(&self) -> Result<ServerTlsConfig, MtlsError> {
        let identity = Identity::from_pem(&self.server_cert_pem, &*self.server_key_pem);
        let ca_cert = Certificate::from_pem(&self.ca_cert_pem);

        Ok(ServerTlsConfig::new()
            .identity(identity)
            .client_ca_root(ca_cert)
            .client_auth_optional(true))
    }
}

/// Client-side mTLS configuration
pub struct ClientMtlsConfig {
    /// Client certificate PEM
    pub client_cert_pem: String,
    /// Client private key PEM (zeroized on drop)
    pub client_key_pem: Zeroizing<String>,
    /// CA certificate PEM for verifying server
    pub ca_cert_pem: String,
    /// Server domain name for verification
    pub server_domain: String,
}

impl ClientMtlsConfig {
    /// Create a new client mTLS config
    pub fn new(
        client_cert_pem: String,
        client_key_pem: Zeroizing<String>,
        ca_cert_pem: String,
        server_domain: String,
    ) -> Self {
        Self {
            client_cert_pem,
            client_key_pem,
            ca_cert_pem,
            server_domain,
        }
    }

    /// Read the user certificate, key and CA from disk
    pub fn load(paths: &TlsPaths, server_domain: &str) -> Result<Self, MtlsError> {
        Ok(Self::new(
            read_pem(&paths.cert_file)?,
            Zeroizing::new(read_pem(&paths.key_file)?),
            read_pem(&paths.ca_file)?,
            server_domain.to_string(),
        ))
    }

    /// Build a tonic ClientTlsConfig
    pub fn to_tonic_config(&self) -> Result<ClientTlsConfig, MtlsError> {
        let identity = Identity::from_pem(&self.client_cert_pem, &*self.client_key_pem);
        let ca_cert = Certificate::from_pem(&self.ca_cert_pem);

        Ok(ClientTlsConfig::new()
            .identity(identity)
            .ca_certificate(ca_cert)
            .domain_name(&self.server_domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::CertificateAuthority;

    fn write_pki(dir: &Path) -> TlsPaths {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        ca.write_to(dir).unwrap();
        ca.issue_server_cert(&["kubicd".to_string()])
            .unwrap()
            .write_to(dir, "KubicD")
            .unwrap();
        TlsPaths {
            cert_file: dir.join("KubicD.crt"),
            key_file: dir.join("KubicD.key"),
            ca_file: dir.join("Kubic-Control-CA.crt"),
        }
    }

    #[test]
    fn test_server_tls_config_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_pki(dir.path());

        let config = ServerMtlsConfig::load(&paths).unwrap();
        assert!(config.to_tonic_config().is_ok());
        assert!(config.trust_anchor().is_ok());
    }

    #[test]
    fn test_client_tls_config_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_pki(dir.path());

        let config = ClientMtlsConfig::load(&paths, "kubicd").unwrap();
        assert_eq!(config.server_domain, "kubicd");
        assert!(config.to_tonic_config().is_ok());
    }

    #[test]
    fn test_missing_key_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = write_pki(dir.path());
        paths.key_file = dir.path().join("missing.key");

        let err = ServerMtlsConfig::load(&paths).err().unwrap();
        assert!(err.to_string().contains("missing.key"));
    }

    #[test]
    fn test_garbage_ca_is_not_a_trust_anchor() {
        let config = ServerMtlsConfig::new(
            String::new(),
            Zeroizing::new(String::new()),
            "garbage".to_string(),
        );
        assert!(matches!(
            config.trust_anchor(),
            Err(MtlsError::CertificateParseError(_))
        ));
    }
}
