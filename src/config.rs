//! Operator defaults and the validated per-instance configuration.
//!
//! [`InstanceConfig::resolve`] is the only place where the raw CRD spec,
//! the cluster-wide defaults and the database cluster are combined.  Every
//! handler reads typed fields from the result.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::debug;

use crate::clusters::PostgresCluster;
use crate::controller::helpers::controller_owner_ref;
use crate::crd::odoo_instance::{DeploymentStrategyType, OdooInstance, UpgradeSpec};
use crate::error::{Error, Result};
use crate::helpers::{db_name, odoo_username};
use crate::quantity::StorageQuantity;

pub const DEFAULT_DEFAULTS_FILE: &str = "/etc/odoo/instance-defaults.yaml";
pub const FALLBACK_ODOO_IMAGE: &str = "odoo:18.0";
pub const FALLBACK_STORAGE_SIZE: &str = "2Gi";
pub const FALLBACK_STORAGE_CLASS: &str = "standard";

// ── Operator defaults ─────────────────────────────────────────────────────────

/// Cluster-wide fallbacks for values an instance spec may omit.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Defaults {
    pub odoo_image: Option<String>,
    pub filestore_size: Option<String>,
    pub storage_class: Option<String>,
    pub ingress_issuer: Option<String>,
    pub resources: Option<ResourceRequirements>,
    pub affinity: Option<Affinity>,
    pub tolerations: Vec<Toleration>,
}

impl Defaults {
    /// Fill unset fields from `fallback`.
    pub fn or(self, fallback: &Defaults) -> Defaults {
        Defaults {
            odoo_image: self.odoo_image.or_else(|| fallback.odoo_image.clone()),
            filestore_size: self
                .filestore_size
                .or_else(|| fallback.filestore_size.clone()),
            storage_class: self.storage_class.or_else(|| fallback.storage_class.clone()),
            ingress_issuer: self
                .ingress_issuer
                .or_else(|| fallback.ingress_issuer.clone()),
            resources: self.resources.or_else(|| fallback.resources.clone()),
            affinity: self.affinity.or_else(|| fallback.affinity.clone()),
            tolerations: if self.tolerations.is_empty() {
                fallback.tolerations.clone()
            } else {
                self.tolerations
            },
        }
    }
}

/// Loaded once per reconciliation.
#[async_trait]
pub trait DefaultsSource: Send + Sync {
    async fn load(&self) -> Result<Defaults>;
}

/// YAML defaults file.  A missing file yields `fallback` (usually the CLI
/// flags); a file that exists but does not parse is an error.
pub struct FileDefaults {
    path: PathBuf,
    fallback: Defaults,
}

impl FileDefaults {
    pub fn new(path: impl Into<PathBuf>, fallback: Defaults) -> Self {
        Self {
            path: path.into(),
            fallback,
        }
    }
}

#[async_trait]
impl DefaultsSource for FileDefaults {
    async fn load(&self) -> Result<Defaults> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                debug!(path = %self.path.display(), "no instance defaults file");
                return Ok(self.fallback.clone());
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(self.fallback.clone());
        }
        let parsed: Option<Defaults> = serde_yaml::from_str(&content)?;
        Ok(parsed.unwrap_or_default().or(&self.fallback))
    }
}

/// Fixed defaults, for tests and for running without a defaults file.
pub struct StaticDefaults(pub Defaults);

#[async_trait]
impl DefaultsSource for StaticDefaults {
    async fn load(&self) -> Result<Defaults> {
        Ok(self.0.clone())
    }
}

// ── Instance configuration ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct StorageConfig {
    pub size: StorageQuantity,
    pub storage_class: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GitConfig {
    pub repository: String,
    pub git_ref: Option<String>,
    pub ssh_secret: Option<String>,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IngressConfig {
    pub hosts: Vec<String>,
    pub issuer: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseConfig {
    pub cluster: PostgresCluster,
    /// Database created for this instance.
    pub name: String,
    /// Login role owned by this instance.
    pub user: String,
}

/// Module upgrade request taken from `spec.upgrade`.
pub type UpgradeRequest = UpgradeSpec;

/// Everything the handlers need, validated.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceConfig {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub generation: i64,
    pub owner: OwnerReference,
    pub image: String,
    pub image_pull_secret: Option<String>,
    pub admin_password: String,
    pub replicas: i32,
    pub strategy: DeploymentStrategyType,
    pub resources: Option<ResourceRequirements>,
    pub affinity: Option<Affinity>,
    pub tolerations: Vec<Toleration>,
    pub filestore: StorageConfig,
    pub git: Option<GitConfig>,
    pub ingress: IngressConfig,
    pub config_options: BTreeMap<String, String>,
    pub database: DatabaseConfig,
    pub upgrade: Option<UpgradeRequest>,
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty()).cloned()
}

impl InstanceConfig {
    pub fn resolve(
        instance: &OdooInstance,
        defaults: &Defaults,
        cluster: PostgresCluster,
    ) -> Result<Self> {
        let spec = &instance.spec;
        let name = instance.name_any();
        let namespace = instance
            .namespace()
            .ok_or_else(|| Error::validation(format!("{name}: instance has no namespace")))?;
        let uid = instance
            .uid()
            .ok_or_else(|| Error::validation(format!("{name}: instance has no uid")))?;

        if spec.replicas < 0 {
            return Err(Error::validation(format!(
                "replicas must not be negative, got {}",
                spec.replicas
            )));
        }

        let hosts: Vec<String> = spec
            .ingress
            .hosts
            .iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        if hosts.is_empty() {
            return Err(Error::validation("spec.ingress.hosts must list at least one host"));
        }
        let issuer = non_empty(spec.ingress.issuer.as_ref())
            .or_else(|| non_empty(defaults.ingress_issuer.as_ref()))
            .ok_or_else(|| {
                Error::validation("no spec.ingress.issuer and no default ingress issuer")
            })?;

        let default_size = non_empty(defaults.filestore_size.as_ref())
            .unwrap_or_else(|| FALLBACK_STORAGE_SIZE.to_string());
        let default_class = non_empty(defaults.storage_class.as_ref())
            .unwrap_or_else(|| FALLBACK_STORAGE_CLASS.to_string());

        let fs = spec.filestore.clone().unwrap_or_default();
        let filestore = StorageConfig {
            size: non_empty(fs.storage_size.as_ref())
                .unwrap_or_else(|| default_size.clone())
                .parse()?,
            storage_class: non_empty(fs.storage_class.as_ref())
                .unwrap_or_else(|| default_class.clone()),
        };

        let git = match &spec.git_project {
            Some(gp) => {
                if gp.repository.trim().is_empty() {
                    return Err(Error::validation("spec.gitProject.repository is empty"));
                }
                let storage = gp.storage.clone().unwrap_or_default();
                Some(GitConfig {
                    repository: gp.repository.clone(),
                    git_ref: non_empty(gp.git_ref.as_ref()),
                    ssh_secret: non_empty(gp.ssh_secret.as_ref()),
                    storage: StorageConfig {
                        size: non_empty(storage.size.as_ref())
                            .unwrap_or_else(|| default_size.clone())
                            .parse()?,
                        storage_class: non_empty(storage.storage_class.as_ref())
                            .unwrap_or_else(|| default_class.clone()),
                    },
                })
            }
            None => None,
        };

        let image = non_empty(spec.image.as_ref())
            .or_else(|| non_empty(defaults.odoo_image.as_ref()))
            .unwrap_or_else(|| FALLBACK_ODOO_IMAGE.to_string());

        Ok(Self {
            owner: controller_owner_ref(instance),
            generation: instance.metadata.generation.unwrap_or(0),
            image,
            image_pull_secret: non_empty(spec.image_pull_secret.as_ref()),
            admin_password: spec.admin_password.clone(),
            replicas: spec.replicas,
            strategy: spec
                .strategy
                .as_ref()
                .map(|s| s.strategy_type.clone())
                .unwrap_or_default(),
            resources: spec.resources.clone().or_else(|| defaults.resources.clone()),
            affinity: spec.affinity.clone().or_else(|| defaults.affinity.clone()),
            tolerations: if spec.tolerations.is_empty() {
                defaults.tolerations.clone()
            } else {
                spec.tolerations.clone()
            },
            filestore,
            git,
            ingress: IngressConfig { hosts, issuer },
            config_options: spec.config_options.clone().unwrap_or_default(),
            database: DatabaseConfig {
                cluster,
                name: db_name(&uid),
                user: odoo_username(&namespace, &name),
            },
            upgrade: spec.upgrade.clone(),
            name,
            namespace,
            uid,
        })
    }

    /// The upgrade request, if the spec holds a usable one.
    pub fn valid_upgrade(&self) -> Option<&UpgradeRequest> {
        self.upgrade.as_ref().filter(|u| u.is_valid())
    }
}

/// Database cluster named by the spec, if any.
pub fn requested_cluster(instance: &OdooInstance) -> Option<&str> {
    instance
        .spec
        .database
        .as_ref()
        .and_then(|d| d.cluster.as_deref())
        .filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::odoo_instance::{FilestoreSpec, IngressSpec, OdooInstanceSpec};
    use kube::api::ObjectMeta;
    use std::io::Write;

    fn cluster() -> PostgresCluster {
        PostgresCluster {
            name: "main".into(),
            host: "pg".into(),
            port: 5432,
            admin_user: "postgres".into(),
            admin_password: "pw".into(),
            is_default: true,
        }
    }

    fn instance() -> OdooInstance {
        let mut inst = OdooInstance::new(
            "shop",
            OdooInstanceSpec {
                image: None,
                image_pull_secret: None,
                admin_password: "admin".into(),
                replicas: 1,
                ingress: IngressSpec {
                    hosts: vec!["shop.example.com".into()],
                    issuer: None,
                },
                resources: None,
                filestore: None,
                config_options: None,
                database: None,
                git_project: None,
                strategy: None,
                upgrade: None,
                affinity: None,
                tolerations: vec![],
            },
        );
        inst.metadata = ObjectMeta {
            name: Some("shop".into()),
            namespace: Some("prod".into()),
            uid: Some("1234-abcd".into()),
            generation: Some(3),
            ..Default::default()
        };
        inst
    }

    fn defaults() -> Defaults {
        Defaults {
            ingress_issuer: Some("letsencrypt".into()),
            ..Default::default()
        }
    }

    #[test]
    fn resolve_fills_defaults() {
        let cfg = InstanceConfig::resolve(&instance(), &defaults(), cluster()).unwrap();
        assert_eq!(cfg.image, "odoo:18.0");
        assert_eq!(cfg.filestore.size.as_str(), "2Gi");
        assert_eq!(cfg.filestore.storage_class, "standard");
        assert_eq!(cfg.ingress.issuer, "letsencrypt");
        assert_eq!(cfg.database.name, "odoo_1234_abcd");
        assert_eq!(cfg.database.user, "odoo.prod.shop");
        assert_eq!(cfg.generation, 3);
        assert_eq!(cfg.owner.uid, "1234-abcd");
    }

    #[test]
    fn spec_values_win_over_defaults() {
        let mut inst = instance();
        inst.spec.image = Some("odoo:17.0".into());
        inst.spec.filestore = Some(FilestoreSpec {
            storage_size: Some("10Gi".into()),
            storage_class: Some("fast".into()),
        });
        let d = Defaults {
            odoo_image: Some("odoo:16.0".into()),
            filestore_size: Some("1Gi".into()),
            ..defaults()
        };
        let cfg = InstanceConfig::resolve(&inst, &d, cluster()).unwrap();
        assert_eq!(cfg.image, "odoo:17.0");
        assert_eq!(cfg.filestore.size.as_str(), "10Gi");
        assert_eq!(cfg.filestore.storage_class, "fast");
    }

    #[test]
    fn rejects_missing_hosts_and_issuer() {
        let mut inst = instance();
        inst.spec.ingress.hosts = vec![" ".into()];
        let err = InstanceConfig::resolve(&inst, &defaults(), cluster()).unwrap_err();
        assert!(err.is_validation());

        let err = InstanceConfig::resolve(&instance(), &Defaults::default(), cluster()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn rejects_malformed_sizes() {
        let mut inst = instance();
        inst.spec.filestore = Some(FilestoreSpec {
            storage_size: Some("lots".into()),
            storage_class: None,
        });
        let err = InstanceConfig::resolve(&inst, &defaults(), cluster()).unwrap_err();
        assert!(matches!(err, Error::Quantity(_)));
    }

    #[tokio::test]
    async fn missing_defaults_file_yields_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let src = FileDefaults::new(dir.path().join("absent.yaml"), Defaults::default());
        assert_eq!(src.load().await.unwrap(), Defaults::default());
    }

    #[tokio::test]
    async fn defaults_file_overrides_fallback() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "odooImage: odoo:17.0\nfilestoreSize: 5Gi").unwrap();
        let fallback = Defaults {
            odoo_image: Some("odoo:18.0".into()),
            storage_class: Some("ceph".into()),
            ..Default::default()
        };
        let loaded = FileDefaults::new(file.path(), fallback).load().await.unwrap();
        assert_eq!(loaded.odoo_image.as_deref(), Some("odoo:17.0"));
        assert_eq!(loaded.filestore_size.as_deref(), Some("5Gi"));
        assert_eq!(loaded.storage_class.as_deref(), Some("ceph"));
    }

    #[tokio::test]
    async fn malformed_defaults_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "odooImage: [unterminated").unwrap();
        let err = FileDefaults::new(file.path(), Defaults::default())
            .load()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }
}
