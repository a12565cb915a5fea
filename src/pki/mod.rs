//! PKI operations for mTLS certificates
//!
//! kubicd is reachable only over mutual TLS. This module owns:
//!
//! - the control-plane CA used by `kubicd pki init` to issue the daemon
//!   certificate and the operator (client) certificates
//! - [`TrustAnchor`], the application-level check that a presented client
//!   chain leads back to the configured CA, and the extraction of the leaf
//!   Common Name that becomes the caller's identity
//!
//! # Security Model
//!
//! - The CA key only ever lives in the PKI directory on the control-plane node
//! - Client identity is the CN of the leaf certificate, nothing else
//! - A chain that does not verify against the trust anchor yields no identity

use std::path::Path;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

/// CA certificate validity in years
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Issued (daemon and client) certificate validity in years
pub const CERT_VALIDITY_YEARS: i64 = 2;

/// File stem of the control-plane CA inside the PKI directory
pub const CA_FILE_STEM: &str = "Kubic-Control-CA";

/// File stem of the daemon certificate inside the PKI directory
pub const DAEMON_FILE_STEM: &str = "KubicD";

/// File stem and CN of the built-in administrator certificate
pub const ADMIN_IDENTITY: &str = "admin";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Certificate chain does not lead to the trust anchor
    #[error("untrusted certificate: {0}")]
    Untrusted(String),

    /// Leaf certificate carries no usable Common Name
    #[error("client certificate has no Common Name")]
    MissingCommonName,
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("Kubic Control".to_string()),
    );
    dn
}

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// A certificate and its private key, both PEM-encoded
pub struct IssuedCertificate {
    /// Certificate PEM
    pub cert_pem: String,
    /// Private key PEM (zeroized on drop)
    pub key_pem: Zeroizing<String>,
}

impl IssuedCertificate {
    /// Write `<stem>.crt` and `<stem>.key` into `dir`; the key is made owner-only
    pub fn write_to(&self, dir: &Path, stem: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(format!("{stem}.crt")), &self.cert_pem)?;
        write_private_key(&dir.join(format!("{stem}.key")), &self.key_pem)
    }
}

#[cfg(unix)]
fn write_private_key(path: &Path, key_pem: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(key_pem.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, key_pem: &str) -> Result<()> {
    std::fs::write(path, key_pem)?;
    Ok(())
}

/// Certificate Authority for the control plane
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (we need to deserialize each time since KeyPair isn't Clone)
    ca_key_pem: Zeroizing<String>,
    /// PEM-encoded CA certificate for distribution
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pair.serialize_pem()),
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load CA from PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        // Validate key can be parsed
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;

        // Validate cert can be parsed
        let _ = parse_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pem.to_string()),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// Load CA from `<stem>.crt` / `<stem>.key` in `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(dir.join(format!("{CA_FILE_STEM}.crt")))?;
        let key_pem = Zeroizing::new(std::fs::read_to_string(
            dir.join(format!("{CA_FILE_STEM}.key")),
        )?);
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Get the CA certificate in PEM format (the trust anchor for both sides)
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Write the CA certificate and key into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        IssuedCertificate {
            cert_pem: self.ca_cert_pem.clone(),
            key_pem: self.ca_key_pem.clone(),
        }
        .write_to(dir, CA_FILE_STEM)
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Issue the daemon's TLS server certificate for the given SANs
    ///
    /// The first SAN is also used as CN. IP addresses become IP SANs.
    pub fn issue_server_cert(&self, sans: &[String]) -> Result<IssuedCertificate> {
        let common_name = sans.first().map(String::as_str).unwrap_or(DAEMON_FILE_STEM);
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        params.subject_alt_names = sans
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.to_string())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGenerationFailed(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        self.sign(params, "server")
    }

    /// Issue a client certificate whose CN is the caller identity
    pub fn issue_client_cert(&self, identity: &str) -> Result<IssuedCertificate> {
        if identity.trim().is_empty() {
            return Err(PkiError::CertificateGenerationFailed(
                "client identity must not be empty".to_string(),
            ));
        }

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(identity);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        self.sign(params, "client")
    }

    fn sign(&self, mut params: CertificateParams, kind: &str) -> Result<IssuedCertificate> {
        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate {} key: {}", kind, e))
        })?;

        // Create the Issuer from our CA certificate and key
        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign {} cert: {}", kind, e))
        })?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: Zeroizing::new(key.serialize_pem()),
        })
    }
}

/// CA certificates a client chain must lead back to
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    roots: Vec<Vec<u8>>,
}

impl TrustAnchor {
    /// Build from a PEM bundle holding one or more CA certificates
    pub fn from_pem(bundle: &str) -> Result<Self> {
        let roots: Vec<Vec<u8>> = ::pem::parse_many(bundle.as_bytes())
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA bundle: {}", e)))?
            .into_iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .map(|block| block.contents().to_vec())
            .collect();

        if roots.is_empty() {
            return Err(PkiError::ParseError(
                "CA bundle contains no certificates".to_string(),
            ));
        }

        for root in &roots {
            X509Certificate::from_der(root)
                .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;
        }

        Ok(Self { roots })
    }

    /// Verify a client chain (leaf first) and return the leaf's Common Name
    ///
    /// Each certificate must be inside its validity window and signed by the
    /// next one in the chain; the last must be signed by one of the anchors.
    /// Every certificate above the leaf must be a CA allowed to sign
    /// certificates, and the leaf must be issued for client authentication.
    pub fn verify_chain<C: AsRef<[u8]>>(&self, chain: &[C]) -> Result<String> {
        let parsed = chain
            .iter()
            .map(|der| {
                X509Certificate::from_der(der.as_ref())
                    .map(|(_, cert)| cert)
                    .map_err(|e| PkiError::ParseError(format!("failed to parse client cert: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let leaf = parsed
            .first()
            .ok_or_else(|| PkiError::Untrusted("empty certificate chain".to_string()))?;

        for cert in &parsed {
            if !cert.validity().is_valid() {
                return Err(PkiError::Untrusted(format!(
                    "certificate '{}' is outside its validity period",
                    cert.subject()
                )));
            }
        }

        if !allows_client_auth(leaf) {
            return Err(PkiError::Untrusted(format!(
                "certificate '{}' is not issued for client authentication",
                leaf.subject()
            )));
        }

        for pair in parsed.windows(2) {
            let (child, parent) = (&pair[0], &pair[1]);
            if !may_issue(parent) {
                return Err(PkiError::Untrusted(format!(
                    "certificate '{}' is not a CA and cannot sign '{}'",
                    parent.subject(),
                    child.subject()
                )));
            }
            child
                .verify_signature(Some(parent.public_key()))
                .map_err(|_| PkiError::Untrusted("broken certificate chain".to_string()))?;
        }

        let top = parsed.last().unwrap_or(leaf);
        let anchored = self.roots.iter().any(|root| {
            X509Certificate::from_der(root)
                .map(|(_, ca)| top.verify_signature(Some(ca.public_key())).is_ok())
                .unwrap_or(false)
        });
        if !anchored {
            return Err(PkiError::Untrusted(
                "signature verification against the trust anchor failed".to_string(),
            ));
        }

        common_name(leaf)
    }
}

/// CA:TRUE, and keyCertSign when a key usage extension is present
fn may_issue(cert: &X509Certificate<'_>) -> bool {
    let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);
    let may_sign = match cert.key_usage() {
        Ok(Some(usage)) => usage.value.key_cert_sign(),
        Ok(None) => true,
        Err(_) => false,
    };
    is_ca && may_sign
}

fn allows_client_auth(cert: &X509Certificate<'_>) -> bool {
    matches!(
        cert.extended_key_usage(),
        Ok(Some(eku)) if eku.value.client_auth || eku.value.any
    )
}

fn common_name(cert: &X509Certificate<'_>) -> Result<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::trim)
        .filter(|cn| !cn.is_empty())
        .map(str::to_string)
        .ok_or(PkiError::MissingCommonName)
}
