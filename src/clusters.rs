//! Registry of PostgreSQL clusters an instance can be placed on.
//!
//! The registry is read from a YAML mapping (normally a Secret mounted at
//! `/etc/postgres/clusters.yaml`):
//!
//! ```yaml
//! main:
//!   host: pg-main.databases.svc
//!   port: 5432
//!   adminUser: postgres
//!   adminPassword: hunter2
//!   default: true
//! ```
//!
//! [`ClusterRegistry`] owns the parsed cache and refreshes it only when its
//! [`ClusterSource`] reports a new revision.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const DEFAULT_CLUSTERS_FILE: &str = "/etc/postgres/clusters.yaml";

/// A resolved cluster record.
#[derive(Clone, PartialEq, Eq)]
pub struct PostgresCluster {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    pub admin_password: String,
    pub is_default: bool,
}

impl fmt::Debug for PostgresCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresCluster")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("admin_user", &self.admin_user)
            .field("admin_password", &"<redacted>")
            .field("is_default", &self.is_default)
            .finish()
    }
}

/// One entry of the YAML mapping.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterEntry {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_user: Option<String>,
    pub admin_password: Option<String>,
    pub default: bool,
}

impl ClusterEntry {
    fn into_cluster(self, name: &str) -> PostgresCluster {
        PostgresCluster {
            name: name.to_string(),
            host: self.host.unwrap_or_else(|| "localhost".to_string()),
            port: self.port.unwrap_or(5432),
            admin_user: self.admin_user.unwrap_or_else(|| "postgres".to_string()),
            admin_password: self.admin_password.unwrap_or_default(),
            is_default: self.default,
        }
    }
}

/// Parse the registry document.  An empty document is an empty registry.
pub fn parse_clusters(yaml: &str) -> Result<BTreeMap<String, PostgresCluster>> {
    if yaml.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let raw: Option<BTreeMap<String, ClusterEntry>> = serde_yaml::from_str(yaml)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(name, entry)| {
            let cluster = entry.into_cluster(&name);
            (name, cluster)
        })
        .collect())
}

/// Where cluster records come from.
///
/// `revision` is the cache invalidation rule: the registry reloads whenever
/// it returns something different from the revision it last loaded.
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn revision(&self) -> Result<Option<SystemTime>>;
    async fn load(&self) -> Result<BTreeMap<String, PostgresCluster>>;
}

/// YAML file on disk, revisioned by modification time.
pub struct FileClusterSource {
    path: PathBuf,
}

impl FileClusterSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ClusterSource for FileClusterSource {
    async fn revision(&self) -> Result<Option<SystemTime>> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, PostgresCluster>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => parse_clusters(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "postgres clusters file not found");
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct Cache {
    revision: Option<SystemTime>,
    clusters: BTreeMap<String, PostgresCluster>,
}

/// Owned, lazily refreshed view of a [`ClusterSource`].
pub struct ClusterRegistry<S> {
    source: S,
    cache: Mutex<Option<Cache>>,
}

impl<S: ClusterSource> ClusterRegistry<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cache: Mutex::new(None),
        }
    }

    /// Snapshot of every known cluster, reloading if the source changed.
    pub async fn clusters(&self) -> Result<BTreeMap<String, PostgresCluster>> {
        let revision = self.source.revision().await?;
        let mut cache = self.cache.lock().await;
        if let Some(c) = cache.as_ref() {
            if c.revision == revision {
                return Ok(c.clusters.clone());
            }
        }
        let clusters = self.source.load().await?;
        info!(count = clusters.len(), "loaded postgres cluster registry");
        *cache = Some(Cache {
            revision,
            clusters: clusters.clone(),
        });
        Ok(clusters)
    }

    /// Resolve a cluster by explicit name, or the single default when `name`
    /// is `None` or empty.
    pub async fn get_cluster(&self, name: Option<&str>) -> Result<PostgresCluster> {
        let clusters = self.clusters().await?;
        resolve_cluster(&clusters, name)
    }
}

/// Resolution rules over an already loaded registry.
pub fn resolve_cluster(
    clusters: &BTreeMap<String, PostgresCluster>,
    name: Option<&str>,
) -> Result<PostgresCluster> {
    if let Some(name) = name.filter(|n| !n.is_empty()) {
        return clusters
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ClusterNotFound {
                name: name.to_string(),
                available: available_names(clusters),
            });
    }

    let defaults: Vec<&PostgresCluster> = clusters.values().filter(|c| c.is_default).collect();
    match defaults.as_slice() {
        [] => Err(Error::NoDefaultCluster),
        [one] => Ok((*one).clone()),
        many => Err(Error::AmbiguousDefaultCluster(
            many.iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        )),
    }
}

fn available_names(clusters: &BTreeMap<String, PostgresCluster>) -> String {
    if clusters.is_empty() {
        "[(none configured)]".to_string()
    } else {
        format!(
            "[{}]",
            clusters.keys().cloned().collect::<Vec<_>>().join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_take_fallbacks() {
        let clusters = parse_clusters("main:\n  host: pg\n  default: true\nspare: {}\n").unwrap();
        let main = &clusters["main"];
        assert_eq!(main.port, 5432);
        assert_eq!(main.admin_user, "postgres");
        assert!(main.is_default);
        assert_eq!(clusters["spare"].host, "localhost");
        assert!(!clusters["spare"].is_default);
    }

    #[test]
    fn empty_document_is_an_empty_registry() {
        assert!(parse_clusters("").unwrap().is_empty());
        assert!(parse_clusters("~\n").unwrap().is_empty());
    }

    #[test]
    fn debug_hides_admin_password() {
        let clusters = parse_clusters("a:\n  adminPassword: hunter2\n").unwrap();
        let dbg = format!("{:?}", clusters["a"]);
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn several_defaults_are_rejected() {
        let clusters =
            parse_clusters("a:\n  default: true\nb:\n  default: true\nc: {}\n").unwrap();
        let err = resolve_cluster(&clusters, None).unwrap_err();
        assert!(matches!(err, Error::AmbiguousDefaultCluster(ref names) if names == "a, b"));
    }

    #[test]
    fn empty_name_means_default() {
        let clusters = parse_clusters("a: {}\nb:\n  default: true\n").unwrap();
        assert_eq!(resolve_cluster(&clusters, Some("")).unwrap().name, "b");
    }
}
