//! File-based authorization policy
//!
//! ```toml
//! [operations]
//! "*" = ["admin"]
//! fetch-credentials = ["admin", "alice"]
//! update-all = ["*"]
//! ```
//!
//! Keys are operation names or `"*"` for every operation; values list the
//! identities allowed to call them, `"*"` meaning any authenticated caller.
//! Without a policy file only `admin` may call anything.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use super::{AccessPolicy, Identity, Operation};
use crate::config::ConfigError;
use crate::pki::ADMIN_IDENTITY;

const ANY: &str = "*";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RbacFile {
    #[serde(default)]
    operations: BTreeMap<String, Vec<String>>,
}

/// Operation-to-identities allow list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RbacPolicy {
    rules: HashMap<String, Vec<String>>,
}

impl RbacPolicy {
    /// Every operation allowed for the admin identity only
    pub fn admin_only() -> Self {
        Self {
            rules: HashMap::from([(ANY.to_string(), vec![ADMIN_IDENTITY.to_string()])]),
        }
    }

    /// Parse a policy document
    pub fn from_toml(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let file: RbacFile = toml::from_str(content).map_err(|e| parse_error(e.to_string()))?;

        for operation in file.operations.keys() {
            if operation != ANY && Operation::from_name(operation).is_none() {
                return Err(parse_error(format!("unknown operation '{operation}'")));
            }
        }

        Ok(Self {
            rules: file.operations.into_iter().collect(),
        })
    }

    /// Load from `path`; a missing file yields [`RbacPolicy::admin_only`]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let policy = Self::from_toml(path, &content)?;
                info!(path = %path.display(), rules = policy.rules.len(), "loaded RBAC policy");
                Ok(policy)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no RBAC policy file, only admin is authorized");
                Ok(Self::admin_only())
            }
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    fn grants(&self, key: &str, identity: &Identity) -> bool {
        self.rules.get(key).is_some_and(|allowed| {
            allowed
                .iter()
                .any(|entry| entry == ANY || entry == identity.as_str())
        })
    }
}

impl AccessPolicy for RbacPolicy {
    fn is_allowed(&self, identity: &Identity, operation: Operation) -> bool {
        let allowed = self.grants(operation.as_str(), identity) || self.grants(ANY, identity);
        debug!(identity = %identity, %operation, allowed, "RBAC decision");
        allowed
    }
}
