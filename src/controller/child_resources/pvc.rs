//! PersistentVolumeClaims that only ever grow.
//!
//! Most storage classes refuse to shrink a bound volume, and the ones that
//! allow it lose data.  `update` therefore compares the requested size to
//! the observed one by capacity and patches only when the request is larger.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::controller::handler::{ManagedResource, Scope};
use crate::controller::helpers::{
    child_meta, to_body, FILESTORE_PVC_SUFFIX, GIT_REPO_PVC_SUFFIX,
};
use crate::error::Result;
use crate::helpers::child_name;
use crate::platform::ResourceKind;
use crate::quantity::StorageQuantity;

pub struct StorageClaim {
    scope: Scope,
    label: &'static str,
    component: &'static str,
    suffix: &'static str,
    storage: StorageConfig,
}

impl StorageClaim {
    pub fn filestore(scope: Scope) -> Self {
        let storage = scope.instance.filestore.clone();
        Self {
            scope,
            label: "filestore-pvc",
            component: "filestore",
            suffix: FILESTORE_PVC_SUFFIX,
            storage,
        }
    }

    /// `None` when the instance has no git project.
    pub fn git_repo(scope: Scope) -> Option<Self> {
        let storage = scope.instance.git.as_ref()?.storage.clone();
        Some(Self {
            scope,
            label: "git-repo-pvc",
            component: "git-repo",
            suffix: GIT_REPO_PVC_SUFFIX,
            storage,
        })
    }
}

/// What an update should do given the requested and observed sizes.
#[derive(Debug, PartialEq, Eq)]
pub enum Resize {
    Grow,
    Keep,
}

pub fn resize_decision(requested: &StorageQuantity, observed: Option<&str>) -> Result<Resize> {
    let Some(observed) = observed else {
        return Ok(Resize::Grow);
    };
    let observed = StorageQuantity::parse(observed)?;
    if *requested > observed {
        Ok(Resize::Grow)
    } else {
        Ok(Resize::Keep)
    }
}

#[async_trait]
impl ManagedResource for StorageClaim {
    fn label(&self) -> &'static str {
        self.label
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::PersistentVolumeClaim
    }

    fn resource_name(&self) -> String {
        child_name(self.scope.name(), self.suffix)
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn desired_body(&self) -> Result<Value> {
        to_body(&PersistentVolumeClaim {
            metadata: child_meta(&self.scope.instance, &self.resource_name(), self.component),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteMany".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        self.storage.size.to_quantity(),
                    )])),
                    ..Default::default()
                }),
                storage_class_name: Some(self.storage.storage_class.clone()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn update(&self, observed: Value) -> Result<()> {
        let name = self.resource_name();
        let current = observed
            .pointer("/spec/resources/requests/storage")
            .and_then(Value::as_str);

        match resize_decision(&self.storage.size, current)? {
            Resize::Keep => {
                debug!(pvc = %name, requested = %self.storage.size, ?current, "no resize needed");
                Ok(())
            }
            Resize::Grow => {
                let patch = json!({
                    "spec": {"resources": {"requests": {"storage": self.storage.size.as_str()}}}
                });
                self.scope
                    .platform
                    .patch(self.scope.namespace(), self.kind(), &name, &patch)
                    .await?;
                info!(pvc = %name, from = ?current, to = %self.storage.size, "expanded volume claim");
                Ok(())
            }
        }
    }
}
