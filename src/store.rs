//! Fingerprint stores
//!
//! One persisted table per deployment mechanism records, for every resource
//! that was applied successfully, the fingerprint of the content applied last.
//! The on-disk form is a flat TOML table under the state directory:
//!
//! ```toml
//! "/usr/share/k8s-yaml/weave/weave.yaml" = "9f86d0..."
//! "nginx-ingress" = "2c26b4..."
//! "nginx-ingress.releaseName" = "ingress"
//! "nginx-ingress.valuesPath" = "/etc/kubic/ingress-values.yaml"
//! "nginx-ingress.namespace" = "kube-system"
//! ```
//!
//! Chart records carry their install parameters as `<chart>.<param>` entries.
//! Stores are created on the first successful apply and entries are never
//! removed automatically.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::hasher::Fingerprint;
use crate::{Error, Result};

const RELEASE_NAME_KEY: &str = "releaseName";
const VALUES_PATH_KEY: &str = "valuesPath";
const NAMESPACE_KEY: &str = "namespace";

/// The three ways a tracked resource can be deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mechanism {
    /// Plain manifest file applied with `kubectl apply -f`
    Manifest,
    /// Kustomize overlay built into a manifest, then applied
    Overlay,
    /// Helm chart installed as a named release
    Chart,
}

impl Mechanism {
    /// All mechanisms in reconciliation order
    pub const ALL: [Mechanism; 3] = [Mechanism::Manifest, Mechanism::Overlay, Mechanism::Chart];

    /// File name of this mechanism's store under the state directory
    pub fn store_file(&self) -> &'static str {
        match self {
            Mechanism::Manifest => "k8s-yaml.conf",
            Mechanism::Overlay => "k8s-kustomize.conf",
            Mechanism::Chart => "k8s-helm.conf",
        }
    }

    /// Short name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::Manifest => "manifest",
            Mechanism::Overlay => "overlay",
            Mechanism::Chart => "chart",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install parameters of a helm release
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChartRelease {
    /// Chart reference, also the record identity
    pub chart: String,
    /// Release name; empty lets helm generate one
    pub release_name: String,
    /// Values file; empty for chart defaults
    pub values_path: String,
    /// Target namespace; empty for the kubeconfig default
    pub namespace: String,
}

/// One tracked resource as persisted in a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    /// Manifest path, overlay service name, or chart name
    pub identity: String,
    /// Fingerprint of the content applied last
    pub fingerprint: Fingerprint,
    /// Install parameters, chart records only
    pub release: Option<ChartRelease>,
}

impl ResourceRecord {
    /// Record for a manifest or overlay
    pub fn new(identity: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            identity: identity.into(),
            fingerprint,
            release: None,
        }
    }

    /// Record for a chart release
    pub fn chart(release: ChartRelease, fingerprint: Fingerprint) -> Self {
        Self {
            identity: release.chart.clone(),
            fingerprint,
            release: Some(release),
        }
    }
}

/// In-memory copy of one store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTable {
    mechanism: Mechanism,
    entries: BTreeMap<String, String>,
}

impl StoreTable {
    /// Empty table for `mechanism`
    pub fn new(mechanism: Mechanism) -> Self {
        Self {
            mechanism,
            entries: BTreeMap::new(),
        }
    }

    fn from_entries(mechanism: Mechanism, entries: BTreeMap<String, String>) -> Self {
        Self { mechanism, entries }
    }

    /// Raw key/value entries
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Number of tracked resources
    pub fn len(&self) -> usize {
        self.identities().count()
    }

    /// True when nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn param_suffix(key: &str) -> Option<(&str, &str)> {
        let (identity, param) = key.rsplit_once('.')?;
        matches!(param, RELEASE_NAME_KEY | VALUES_PATH_KEY | NAMESPACE_KEY).then_some((identity, param))
    }

    fn is_param_key(&self, key: &str) -> bool {
        self.mechanism == Mechanism::Chart
            && Self::param_suffix(key).is_some_and(|(identity, _)| self.entries.contains_key(identity))
    }

    fn identities(&self) -> impl Iterator<Item = &String> + '_ {
        self.entries.keys().filter(|key| !self.is_param_key(key))
    }

    fn param(&self, identity: &str, name: &str) -> String {
        self.entries
            .get(&format!("{identity}.{name}"))
            .cloned()
            .unwrap_or_default()
    }

    /// Look up the record for `identity`
    pub fn get(&self, identity: &str) -> Option<ResourceRecord> {
        if self.is_param_key(identity) {
            return None;
        }
        let fingerprint = Fingerprint::from_stored(self.entries.get(identity)?.clone());
        let release = (self.mechanism == Mechanism::Chart).then(|| ChartRelease {
            chart: identity.to_string(),
            release_name: self.param(identity, RELEASE_NAME_KEY),
            values_path: self.param(identity, VALUES_PATH_KEY),
            namespace: self.param(identity, NAMESPACE_KEY),
        });
        Some(ResourceRecord {
            identity: identity.to_string(),
            fingerprint,
            release,
        })
    }

    /// All records in enumeration order
    pub fn records(&self) -> Vec<ResourceRecord> {
        self.identities()
            .filter_map(|identity| self.get(identity))
            .collect()
    }

    /// Insert or replace a record
    pub fn upsert(&mut self, record: ResourceRecord) {
        if let Some(release) = &record.release {
            let id = &record.identity;
            self.entries
                .insert(format!("{id}.{RELEASE_NAME_KEY}"), release.release_name.clone());
            self.entries
                .insert(format!("{id}.{VALUES_PATH_KEY}"), release.values_path.clone());
            self.entries
                .insert(format!("{id}.{NAMESPACE_KEY}"), release.namespace.clone());
        }
        self.entries
            .insert(record.identity, record.fingerprint.as_str().to_string());
    }
}

/// Persistence for one mechanism's table
///
/// Every operation reads or writes the whole table. Callers serialize
/// read-modify-write cycles on a given store themselves.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Mechanism whose records this store holds
    fn mechanism(&self) -> Mechanism;

    /// Read the current table; a store that was never written is empty
    async fn load(&self) -> Result<StoreTable>;

    /// Replace the persisted table
    async fn save(&self, table: &StoreTable) -> Result<()>;

    /// Load fresh, upsert `record`, save
    async fn upsert(&self, record: ResourceRecord) -> Result<()> {
        let mut table = self.load().await?;
        table.upsert(record);
        self.save(&table).await
    }
}

/// Flat TOML file under the state directory
#[derive(Debug, Clone)]
pub struct TomlFileStore {
    mechanism: Mechanism,
    path: PathBuf,
}

impl TomlFileStore {
    /// Store for `mechanism` inside `state_dir`
    pub fn new(state_dir: &Path, mechanism: Mechanism) -> Self {
        Self {
            mechanism,
            path: state_dir.join(mechanism.store_file()),
        }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    // Dotted keys written by hand (`chart.namespace = "x"`) parse as nested
    // tables; fold them back into flat keys.
    fn flatten(
        &self,
        prefix: Option<&str>,
        table: toml::Table,
        out: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        for (key, value) in table {
            let key = match prefix {
                Some(prefix) => format!("{prefix}.{key}"),
                None => key,
            };
            match value {
                toml::Value::String(s) => {
                    out.insert(key, s);
                }
                toml::Value::Table(nested) => self.flatten(Some(&key), nested, out)?,
                other => {
                    return Err(Error::store(
                        &self.path,
                        format!("value of {key} is a {}, expected a string", other.type_str()),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FingerprintStore for TomlFileStore {
    fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    async fn load(&self) -> Result<StoreTable> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreTable::new(self.mechanism))
            }
            Err(e) => return Err(Error::io(&self.path, e)),
        };

        let table: toml::Table =
            toml::from_str(&content).map_err(|e| Error::store(&self.path, e.to_string()))?;
        let mut entries = BTreeMap::new();
        self.flatten(None, table, &mut entries)?;

        Ok(StoreTable::from_entries(self.mechanism, entries))
    }

    async fn save(&self, table: &StoreTable) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }

        let content =
            toml::to_string(table.entries()).map_err(|e| Error::store(&self.path, e.to_string()))?;

        let tmp = self.path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| Error::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::io(&self.path, e))
    }
}

/// Volatile store, for tests and dry runs
#[derive(Debug)]
pub struct MemoryStore {
    mechanism: Mechanism,
    table: Mutex<StoreTable>,
}

impl MemoryStore {
    /// Empty store for `mechanism`
    pub fn new(mechanism: Mechanism) -> Self {
        Self {
            mechanism,
            table: Mutex::new(StoreTable::new(mechanism)),
        }
    }

    /// Store pre-populated with `records`
    pub fn with_records(mechanism: Mechanism, records: impl IntoIterator<Item = ResourceRecord>) -> Self {
        let mut table = StoreTable::new(mechanism);
        for record in records {
            table.upsert(record);
        }
        Self {
            mechanism,
            table: Mutex::new(table),
        }
    }

    /// Current contents
    pub fn snapshot(&self) -> StoreTable {
        match self.table.lock() {
            Ok(table) => table.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl FingerprintStore for MemoryStore {
    fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    async fn load(&self) -> Result<StoreTable> {
        Ok(self.snapshot())
    }

    async fn save(&self, table: &StoreTable) -> Result<()> {
        let mut guard = match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = table.clone();
        Ok(())
    }
}
