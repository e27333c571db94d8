use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Spec sub-types ────────────────────────────────────────────────────────────

/// IngressSpec lists the public hostnames routed to the instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct IngressSpec {
    #[serde(default)]
    pub hosts: Vec<String>,
    /// cert-manager ClusterIssuer used for the TLS certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

/// FilestoreSpec defines persistent storage for the Odoo filestore.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilestoreSpec {
    #[serde(default, alias = "size", skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// DatabaseSpec identifies which PostgreSQL cluster to use for this instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct DatabaseSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
}

/// Size and class of the volume holding the cloned git repository.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitStorageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// GitProjectSpec points at the addons repository synced next to the instance.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitProjectSpec {
    pub repository: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// Secret in the operator namespace holding the deploy key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<GitStorageSpec>,
}

/// UpgradeSpec requests a module upgrade on one database.  The controller
/// resets it to null once the upgrade job has succeeded.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct UpgradeSpec {
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub modules: Vec<String>,
}

impl UpgradeSpec {
    /// A request only counts when it names a database and at least one module.
    pub fn is_valid(&self) -> bool {
        !self.database.is_empty() && !self.modules.is_empty()
    }
}

/// DeploymentStrategyType specifies the update strategy for the Odoo Deployment.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum DeploymentStrategyType {
    #[default]
    Recreate,
    RollingUpdate,
}

/// StrategySpec defines the Deployment update strategy.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StrategySpec {
    #[serde(default, rename = "type")]
    pub strategy_type: DeploymentStrategyType,
}

// ── CRD ───────────────────────────────────────────────────────────────────────

/// OdooInstance is the Schema for the odooinstances API.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "bemade.org",
    version = "v1",
    kind = "OdooInstance",
    shortname = "odoo",
    namespaced,
    status = "OdooInstanceStatus",
    printcolumn = r#"{"name": "Image", "type": "string", "jsonPath": ".spec.image"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Upgrade", "type": "string", "jsonPath": ".status.upgrade.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OdooInstanceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,

    pub admin_password: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default)]
    pub ingress: IngressSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filestore: Option<FilestoreSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_options: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_project: Option<GitProjectSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

fn default_replicas() -> i32 {
    1
}

// ── Status ────────────────────────────────────────────────────────────────────

/// OdooInstancePhase summarises the last reconciliation.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum OdooInstancePhase {
    Provisioning,
    Ready,
    Upgrading,
    Failed,
}

impl std::fmt::Display for OdooInstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "Provisioning",
            Self::Ready => "Ready",
            Self::Upgrading => "Upgrading",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Phase of the module-upgrade state machine.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum UpgradePhase {
    #[default]
    Idle,
    /// Waiting for the git-sync job to finish.
    GateWait,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl UpgradePhase {
    /// An upgrade has been requested and is not settled yet.
    pub fn in_flight(&self) -> bool {
        matches!(self, Self::GateWait | Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::GateWait => "GateWait",
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Observed state of the most recent upgrade request.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStatus {
    #[serde(default)]
    pub phase: UpgradePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<UpgradeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// OdooInstanceStatus defines the observed state of OdooInstance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OdooInstanceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<OdooInstancePhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation whose create/update pipeline completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn upgrade_request_validity() {
        let empty = UpgradeSpec::default();
        assert!(!empty.is_valid());

        let no_modules = UpgradeSpec {
            database: "prod".into(),
            modules: vec![],
        };
        assert!(!no_modules.is_valid());

        let ok = UpgradeSpec {
            database: "prod".into(),
            modules: vec!["sale".into()],
        };
        assert!(ok.is_valid());
    }

    #[test]
    fn crd_is_served_as_bemade_v1() {
        let crd = OdooInstance::crd();
        assert_eq!(crd.spec.group, "bemade.org");
        assert_eq!(crd.spec.names.kind, "OdooInstance");
        assert_eq!(crd.spec.versions[0].name, "v1");
        assert!(crd.spec.versions[0].subresources.is_some());
    }

    #[test]
    fn filestore_accepts_size_alias() {
        let fs: FilestoreSpec = serde_json::from_value(serde_json::json!({"size": "5Gi"})).unwrap();
        assert_eq!(fs.storage_size.as_deref(), Some("5Gi"));
    }
}
