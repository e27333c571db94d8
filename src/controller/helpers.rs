//! Shared helpers for the resource handlers.
//!
//! These construct Kubernetes API objects reused by several handlers (pod
//! volumes, env vars, owner references, the job builder).  Pure naming and
//! crypto helpers live in `crate::helpers` instead.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    batch::v1::{Job, JobSpec},
    core::v1::{
        Affinity, ConfigMapVolumeSource, Container, EnvVar, EnvVarSource, LocalObjectReference,
        PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec,
        SecretKeySelector, Toleration, Volume, VolumeMount,
    },
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;

use crate::config::InstanceConfig;
use crate::error::Result;
use crate::helpers::child_name;

/// Field manager name used for patches.
pub const FIELD_MANAGER: &str = "odoo-operator";

pub const FILESTORE_PVC_SUFFIX: &str = "filestore-pvc";
pub const GIT_REPO_PVC_SUFFIX: &str = "git-repo-pvc";
pub const ODOO_CONF_SUFFIX: &str = "odoo-conf";
pub const ODOO_USER_SUFFIX: &str = "odoo-user";
pub const TLS_SUFFIX: &str = "tls";

/// Build a controller OwnerReference for any kube-rs `Resource`.
///
/// `K: Resource<DynamicType = ()>` means "any type whose Kubernetes metadata
/// is known at compile time", which is true for every struct that derives
/// `CustomResource`.
pub fn controller_owner_ref<K: Resource<DynamicType = ()>>(obj: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.name_any(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Non-controller variant for objects several instances may share.
/// The garbage collector removes them once the last owner is gone.
pub fn shared_owner_ref(owner: &OwnerReference) -> OwnerReference {
    OwnerReference {
        controller: Some(false),
        block_owner_deletion: Some(false),
        ..owner.clone()
    }
}

/// `app.kubernetes.io/*` labels carried by every child.
pub fn standard_labels(instance: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "odoo".to_string()),
        ("app.kubernetes.io/instance".to_string(), instance.to_string()),
        ("app.kubernetes.io/component".to_string(), component.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
    ])
}

/// Label selector for `list` calls.
pub fn selector(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Metadata for a child object owned by the instance.
pub fn child_meta(cfg: &InstanceConfig, name: &str, component: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(cfg.namespace.clone()),
        labels: Some(standard_labels(&cfg.name, component)),
        owner_references: Some(vec![cfg.owner.clone()]),
        ..Default::default()
    }
}

/// Serialise a typed object into the JSON body handed to the platform.
pub fn to_body<T: Serialize>(obj: &T) -> Result<Value> {
    Ok(serde_json::to_value(obj)?)
}

/// Standard Odoo pod security context (uid 100 / gid 101).
///
/// Every Odoo container and job pod runs with the same non-root identity
/// matching the official Odoo Docker image.
pub fn odoo_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_user: Some(100),
        run_as_group: Some(101),
        fs_group: Some(101),
        ..Default::default()
    }
}

/// Volumes shared by the Deployment and the upgrade job: the filestore PVC,
/// the odoo-conf ConfigMap, and the git-repo PVC when a git project is set.
pub fn odoo_volumes(cfg: &InstanceConfig) -> Vec<Volume> {
    let mut volumes = vec![
        Volume {
            name: "filestore".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: child_name(&cfg.name, FILESTORE_PVC_SUFFIX),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "odoo-conf".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: child_name(&cfg.name, ODOO_CONF_SUFFIX),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    if cfg.git.is_some() {
        volumes.push(Volume {
            name: "git-repo".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: child_name(&cfg.name, GIT_REPO_PVC_SUFFIX),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    volumes
}

/// Volume mounts matching [`odoo_volumes`].
pub fn odoo_volume_mounts(cfg: &InstanceConfig) -> Vec<VolumeMount> {
    let mut mounts = vec![
        VolumeMount {
            name: "filestore".to_string(),
            mount_path: "/var/lib/odoo".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "odoo-conf".to_string(),
            mount_path: "/etc/odoo".to_string(),
            ..Default::default()
        },
    ];
    if cfg.git.is_some() {
        mounts.push(VolumeMount {
            name: "git-repo".to_string(),
            mount_path: "/mnt/repo".to_string(),
            ..Default::default()
        });
    }
    mounts
}

/// `imagePullSecrets`, omitted when none is configured.
pub fn image_pull_secrets(cfg: &InstanceConfig) -> Option<Vec<LocalObjectReference>> {
    cfg.image_pull_secret
        .as_ref()
        .map(|name| vec![LocalObjectReference { name: name.clone() }])
}

/// Shorthand for a plain-value `EnvVar`.
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Build an `EnvVar` that reads its value from a Secret key.
pub fn secret_env(env_name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: env_name.into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.into(),
                key: key.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Connection environment understood by the Odoo image entrypoint.
/// Credentials are read from the instance's odoo-user secret.
pub fn db_env(cfg: &InstanceConfig) -> Vec<EnvVar> {
    let user_secret = child_name(&cfg.name, ODOO_USER_SUFFIX);
    vec![
        env("HOST", cfg.database.cluster.host.clone()),
        env("PORT", cfg.database.cluster.port.to_string()),
        secret_env("USER", &user_secret, "username"),
        secret_env("PASSWORD", &user_secret, "password"),
    ]
}

// ── OdooJobBuilder ──────────────────────────────────────────────────────────

/// Builder for batch/v1 `Job` resources run against an instance.
///
/// Encapsulates what every Odoo job shares (metadata, security context,
/// standard volumes, scheduling) and lets callers specify what differs.
///
/// ```ignore
/// let job = OdooJobBuilder::new("shop-upgrade-4", cfg, "upgrade")
///     .containers(vec![container])
///     .backoff_limit(2)
///     .build();
/// ```
pub struct OdooJobBuilder {
    metadata: ObjectMeta,
    pod_labels: BTreeMap<String, String>,
    pull_secrets: Option<Vec<LocalObjectReference>>,
    volumes: Vec<Volume>,
    containers: Vec<Container>,
    backoff_limit: i32,
    ttl_seconds: i32,
    affinity: Option<Affinity>,
    tolerations: Vec<Toleration>,
}

impl OdooJobBuilder {
    /// Start a job named `name`, owned by and labelled for the instance.
    pub fn new(name: &str, cfg: &InstanceConfig, component: &str) -> Self {
        let metadata = child_meta(cfg, name, component);
        Self {
            pod_labels: standard_labels(&cfg.name, component),
            metadata,
            pull_secrets: image_pull_secrets(cfg),
            volumes: odoo_volumes(cfg),
            containers: vec![],
            backoff_limit: 0,
            ttl_seconds: 900,
            affinity: cfg.affinity.clone(),
            tolerations: cfg.tolerations.clone(),
        }
    }

    pub fn containers(mut self, containers: Vec<Container>) -> Self {
        self.containers = containers;
        self
    }

    pub fn backoff_limit(mut self, limit: i32) -> Self {
        self.backoff_limit = limit;
        self
    }

    /// How long a finished job is retained before the TTL controller prunes it.
    pub fn ttl_seconds_after_finished(mut self, seconds: i32) -> Self {
        self.ttl_seconds = seconds;
        self
    }

    pub fn annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.metadata.annotations = Some(annotations);
        self
    }

    /// Consume the builder and produce a `batch/v1 Job`.
    pub fn build(self) -> Job {
        Job {
            metadata: self.metadata,
            spec: Some(JobSpec {
                backoff_limit: Some(self.backoff_limit),
                ttl_seconds_after_finished: Some(self.ttl_seconds),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        image_pull_secrets: self.pull_secrets,
                        security_context: Some(odoo_security_context()),
                        affinity: self.affinity,
                        tolerations: if self.tolerations.is_empty() {
                            None
                        } else {
                            Some(self.tolerations)
                        },
                        volumes: Some(self.volumes),
                        containers: self.containers,
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
