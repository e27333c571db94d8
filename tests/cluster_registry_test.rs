//! Cluster resolution and cache refresh of the Postgres cluster registry.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use odoo_instance_operator::clusters::{
    parse_clusters, ClusterRegistry, ClusterSource, FileClusterSource, PostgresCluster,
};
use odoo_instance_operator::error::{Error, Result};

/// In-memory source whose revision only moves when the test says so.
#[derive(Clone, Default)]
struct FakeSource {
    doc: Arc<Mutex<String>>,
    revision: Arc<AtomicU64>,
    loads: Arc<AtomicUsize>,
}

impl FakeSource {
    fn with(doc: &str) -> Self {
        let src = Self::default();
        src.replace(doc);
        src
    }

    fn replace(&self, doc: &str) {
        *self.doc.lock().unwrap() = doc.to_string();
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterSource for FakeSource {
    async fn revision(&self) -> Result<Option<SystemTime>> {
        let rev = self.revision.load(Ordering::SeqCst);
        Ok(Some(SystemTime::UNIX_EPOCH + Duration::from_secs(rev)))
    }

    async fn load(&self) -> Result<BTreeMap<String, PostgresCluster>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let doc = self.doc.lock().unwrap().clone();
        parse_clusters(&doc)
    }
}

const TWO_CLUSTERS: &str = "\
main:
  host: pg-main
  default: true
analytics:
  host: pg-analytics
  port: 6432
";

#[tokio::test]
async fn explicit_name_wins_over_default() {
    let registry = ClusterRegistry::new(FakeSource::with(TWO_CLUSTERS));
    let c = registry.get_cluster(Some("analytics")).await.unwrap();
    assert_eq!(c.host, "pg-analytics");
    assert_eq!(c.port, 6432);
    assert!(!c.is_default);
}

#[tokio::test]
async fn no_name_resolves_the_default() {
    let registry = ClusterRegistry::new(FakeSource::with(TWO_CLUSTERS));
    assert_eq!(registry.get_cluster(None).await.unwrap().name, "main");
    assert_eq!(registry.get_cluster(Some("")).await.unwrap().name, "main");
}

#[tokio::test]
async fn unknown_name_lists_what_exists() {
    let registry = ClusterRegistry::new(FakeSource::with(TWO_CLUSTERS));
    let err = registry.get_cluster(Some("legacy")).await.unwrap_err();
    match &err {
        Error::ClusterNotFound { name, available } => {
            assert_eq!(name, "legacy");
            assert_eq!(available, "[analytics, main]");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_validation());
}

#[tokio::test]
async fn missing_default_is_an_error() {
    let registry = ClusterRegistry::new(FakeSource::with("analytics:\n  host: pg\n"));
    let err = registry.get_cluster(None).await.unwrap_err();
    assert!(matches!(err, Error::NoDefaultCluster));
}

#[tokio::test]
async fn empty_registry_reports_none_configured() {
    let registry = ClusterRegistry::new(FakeSource::with(""));
    let err = registry.get_cluster(Some("main")).await.unwrap_err();
    assert!(err.to_string().contains("(none configured)"));
    assert!(matches!(
        registry.get_cluster(None).await.unwrap_err(),
        Error::NoDefaultCluster
    ));
}

#[tokio::test]
async fn cache_is_reused_until_the_revision_moves() {
    let source = FakeSource::with(TWO_CLUSTERS);
    let registry = ClusterRegistry::new(source.clone());

    registry.get_cluster(None).await.unwrap();
    registry.get_cluster(Some("analytics")).await.unwrap();
    assert_eq!(source.loads(), 1);

    source.replace("replica:\n  host: pg-replica\n  default: true\n");
    let c = registry.get_cluster(None).await.unwrap();
    assert_eq!(c.name, "replica");
    assert_eq!(source.loads(), 2);
    assert!(registry.get_cluster(Some("main")).await.is_err());
}

#[tokio::test]
async fn file_source_reads_yaml_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "main:\n  host: pg-file\n  adminUser: admin\n  adminPassword: s3cret\n  default: true\n"
    )
    .unwrap();
    file.flush().unwrap();

    let registry = ClusterRegistry::new(FileClusterSource::new(file.path()));
    let c = registry.get_cluster(None).await.unwrap();
    assert_eq!(c.host, "pg-file");
    assert_eq!(c.admin_user, "admin");
    assert_eq!(c.admin_password, "s3cret");
}

#[tokio::test]
async fn missing_file_is_an_empty_registry() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ClusterRegistry::new(FileClusterSource::new(dir.path().join("absent.yaml")));
    assert!(registry.clusters().await.unwrap().is_empty());
}
