//! Overlay synthesis for kustomize-deployed services
//!
//! Each overlay workspace looks like
//!
//! ```text
//! <state>/kustomize/<service>/
//!     base -> <base_dir>/<service>
//!     overlay/kustomization.yaml
//!     overlay/<patches>.yaml
//!     <service>.yaml              # last build output
//! ```
//!
//! The overlay files are derived from the single caller-supplied argument.

use base64::Engine;
use rand::RngCore;

use crate::{Error, Result};

/// Namespace of the metallb memberlist secret
pub const METALLB_NAMESPACE: &str = "metallb-system";

/// Name of the metallb memberlist secret
pub const MEMBERLIST_SECRET: &str = "memberlist";

/// A file to be written into `overlay/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayFile {
    /// File name inside the overlay directory
    pub name: &'static str,
    /// File content
    pub content: String,
}

impl OverlayFile {
    fn new(name: &'static str, content: impl Into<String>) -> Self {
        Self {
            name,
            content: content.into(),
        }
    }
}

/// Reject service names that could escape the kustomize state directory
pub fn validate_service_name(service: &str) -> Result<()> {
    let valid = !service.is_empty()
        && !service.starts_with('.')
        && service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid service name '{service}'")))
    }
}

/// Overlay files for `service` configured by `argument`
pub fn synthesize(service: &str, argument: &str) -> Result<Vec<OverlayFile>> {
    match service {
        "metallb" => metallb(argument),
        "hello-kubic" => Ok(hello_kubic(argument)),
        _ => Ok(vec![OverlayFile::new(
            "kustomization.yaml",
            "resources:\n  - ../base\n",
        )]),
    }
}

/// Whether the first deployment of `service` also needs a generated secret
pub fn needs_memberlist_secret(service: &str) -> bool {
    service == "metallb"
}

/// Random key for the metallb memberlist secret
pub fn memberlist_key() -> String {
    let mut bytes = [0u8; 128];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn metallb(ip_range: &str) -> Result<Vec<OverlayFile>> {
    let ip_range = ip_range.trim();
    if ip_range.is_empty() {
        return Err(Error::validation("metallb requires an address range"));
    }
    if ip_range.contains(char::is_whitespace) {
        return Err(Error::validation(format!(
            "invalid metallb address range '{ip_range}'"
        )));
    }

    Ok(vec![
        OverlayFile::new(
            "kustomization.yaml",
            "resources:\n  - ../base\n  - layer2-config.yaml\n",
        ),
        OverlayFile::new(
            "layer2-config.yaml",
            format!(
                "apiVersion: v1\n\
                 kind: ConfigMap\n\
                 metadata:\n\
                 \x20 namespace: {METALLB_NAMESPACE}\n\
                 \x20 name: config\n\
                 data:\n\
                 \x20 config: |\n\
                 \x20   address-pools:\n\
                 \x20   - name: my-ip-space\n\
                 \x20     protocol: layer2\n\
                 \x20     addresses:\n\
                 \x20     - {ip_range}\n"
            ),
        ),
    ])
}

fn hello_kubic(argument: &str) -> Vec<OverlayFile> {
    if argument.eq_ignore_ascii_case("NodePort") {
        vec![
            OverlayFile::new(
                "kustomization.yaml",
                "resources:\n  - ../base\npatchesStrategicMerge:\n  - patch_NodePort.yaml\n",
            ),
            OverlayFile::new(
                "patch_NodePort.yaml",
                "apiVersion: v1\nkind: Service\nmetadata:\n  name: hello-kubic\nspec:\n  type: NodePort\n",
            ),
        ]
    } else if argument.is_empty() || argument.eq_ignore_ascii_case("LoadBalancer") {
        vec![OverlayFile::new(
            "kustomization.yaml",
            "resources:\n  - ../base\n",
        )]
    } else {
        vec![
            OverlayFile::new(
                "kustomization.yaml",
                "resources:\n  - ../base\npatchesStrategicMerge:\n  - patch_LoadBalancerIP.yaml\n",
            ),
            OverlayFile::new(
                "patch_LoadBalancerIP.yaml",
                format!(
                    "apiVersion: v1\nkind: Service\nmetadata:\n  name: hello-kubic\nspec:\n  type: LoadBalancer\n  loadBalancerIP: {argument}\n"
                ),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file<'a>(files: &'a [OverlayFile], name: &str) -> &'a str {
        &files
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("{name} not synthesized"))
            .content
    }

    #[test]
    fn metallb_writes_address_pool() {
        let files = synthesize("metallb", "192.168.1.240-192.168.1.250").unwrap();
        assert!(file(&files, "kustomization.yaml").contains("layer2-config.yaml"));
        let config = file(&files, "layer2-config.yaml");
        assert!(config.contains("namespace: metallb-system"));
        assert!(config.contains("      - 192.168.1.240-192.168.1.250\n"));
        assert!(config.contains("    address-pools:\n"));
    }

    #[test]
    fn metallb_without_range_is_rejected() {
        assert!(synthesize("metallb", "").is_err());
        assert!(synthesize("metallb", "10.0.0.1 10.0.0.2").is_err());
    }

    #[test]
    fn hello_kubic_exposure_modes() {
        let node_port = synthesize("hello-kubic", "nodeport").unwrap();
        assert!(file(&node_port, "patch_NodePort.yaml").contains("type: NodePort"));

        let lb = synthesize("hello-kubic", "LoadBalancer").unwrap();
        assert_eq!(lb.len(), 1);

        let ip = synthesize("hello-kubic", "10.0.0.42").unwrap();
        assert!(file(&ip, "patch_LoadBalancerIP.yaml").contains("loadBalancerIP: 10.0.0.42"));
    }

    #[test]
    fn unknown_services_use_base_only() {
        let files = synthesize("dashboard", "ignored").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(file(&files, "kustomization.yaml"), "resources:\n  - ../base\n");
    }

    #[test]
    fn service_names_cannot_escape_state_dir() {
        assert!(validate_service_name("metallb").is_ok());
        assert!(validate_service_name("hello-kubic").is_ok());
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name("..").is_err());
        assert!(validate_service_name(".metallb.staging").is_err());
        assert!(validate_service_name("../etc").is_err());
        assert!(validate_service_name("a/b").is_err());
    }

    #[test]
    fn memberlist_keys_are_random_base64() {
        let a = memberlist_key();
        let b = memberlist_key();
        assert_ne!(a, b);
        let decoded = base64::engine::general_purpose::STANDARD.decode(&a).unwrap();
        assert_eq!(decoded.len(), 128);
    }
}
