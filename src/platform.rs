//! Narrow, untyped view of the Kubernetes API used by the resource handlers.
//!
//! Handlers build their desired state with k8s-openapi types and hand the
//! serialised JSON to a [`PlatformClient`].  Production uses
//! [`KubePlatformClient`]; tests use `memory::InMemoryPlatform` (built with
//! the `testing` feature) or a mock.

#[cfg(any(test, feature = "testing"))]
pub mod memory;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    batch::v1::Job,
    core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service},
};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::core::TypeMeta;
use kube::Client;
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::controller::helpers::FIELD_MANAGER;
use crate::crd::odoo_instance::OdooInstance;
use crate::error::{Error, Result};

/// Every object kind the operator reads or writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Secret,
    ConfigMap,
    PersistentVolumeClaim,
    Deployment,
    Service,
    Job,
    Certificate,
    IngressRoute,
    OdooInstance,
}

impl ResourceKind {
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::Secret => ApiResource::erase::<Secret>(&()),
            Self::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            Self::PersistentVolumeClaim => ApiResource::erase::<PersistentVolumeClaim>(&()),
            Self::Deployment => ApiResource::erase::<Deployment>(&()),
            Self::Service => ApiResource::erase::<Service>(&()),
            Self::Job => ApiResource::erase::<Job>(&()),
            Self::Certificate => {
                ApiResource::from_gvk(&GroupVersionKind::gvk("cert-manager.io", "v1", "Certificate"))
            }
            Self::IngressRoute => ApiResource::from_gvk(&GroupVersionKind::gvk(
                "traefik.io",
                "v1alpha1",
                "IngressRoute",
            )),
            Self::OdooInstance => ApiResource::erase::<OdooInstance>(&()),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// CRUD over namespaced objects.  Absence is reported as `None` / `false`,
/// never as an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Create an object.  Fails with [`Error::Conflict`] if it already exists.
    async fn create(&self, namespace: &str, kind: ResourceKind, body: &Value) -> Result<Value>;

    async fn read(&self, namespace: &str, kind: ResourceKind, name: &str)
        -> Result<Option<Value>>;

    /// JSON merge patch (RFC 7386).
    async fn patch(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        patch: &Value,
    ) -> Result<Value>;

    async fn patch_status(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        patch: &Value,
    ) -> Result<Value>;

    /// Returns `false` when the object was already gone.
    async fn delete(&self, namespace: &str, kind: ResourceKind, name: &str) -> Result<bool>;

    /// List objects matching an equality label selector (`a=b,c=d`).
    async fn list(
        &self,
        namespace: &str,
        kind: ResourceKind,
        label_selector: &str,
    ) -> Result<Vec<Value>>;
}

/// [`PlatformClient`] backed by the kube-rs dynamic API.
#[derive(Clone)]
pub struct KubePlatformClient {
    client: Client,
}

impl KubePlatformClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str, kind: ResourceKind) -> (Api<DynamicObject>, ApiResource) {
        let ar = kind.api_resource();
        (
            Api::namespaced_with(self.client.clone(), namespace, &ar),
            ar,
        )
    }
}

fn conflict_or(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ref ae) if ae.code == 409 => Error::Conflict(ae.message.clone()),
        e => Error::Kube(e),
    }
}

#[async_trait]
impl PlatformClient for KubePlatformClient {
    async fn create(&self, namespace: &str, kind: ResourceKind, body: &Value) -> Result<Value> {
        let (api, ar) = self.api(namespace, kind);
        let mut obj: DynamicObject = serde_json::from_value(body.clone())?;
        obj.types.get_or_insert(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
        let created = api
            .create(&PostParams::default(), &obj)
            .await
            .map_err(conflict_or)?;
        Ok(serde_json::to_value(created)?)
    }

    async fn read(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<Value>> {
        let (api, _) = self.api(namespace, kind);
        match api.get_opt(name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(obj)?)),
            None => Ok(None),
        }
    }

    async fn patch(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        patch: &Value,
    ) -> Result<Value> {
        let (api, _) = self.api(namespace, kind);
        let patched = api
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(conflict_or)?;
        Ok(serde_json::to_value(patched)?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        patch: &Value,
    ) -> Result<Value> {
        let (api, _) = self.api(namespace, kind);
        let patched = api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(conflict_or)?;
        Ok(serde_json::to_value(patched)?)
    }

    async fn delete(&self, namespace: &str, kind: ResourceKind, name: &str) -> Result<bool> {
        let (api, _) = self.api(namespace, kind);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(%kind, %name, "already deleted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        namespace: &str,
        kind: ResourceKind,
        label_selector: &str,
    ) -> Result<Vec<Value>> {
        let (api, _) = self.api(namespace, kind);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        list.items
            .into_iter()
            .map(|o| serde_json::to_value(o).map_err(Error::from))
            .collect()
    }
}

// ── JSON helpers ─────────────────────────────────────────────────────────────

/// Apply an RFC 7386 merge patch in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(map) = target {
                for (k, v) in fields {
                    if v.is_null() {
                        map.remove(k);
                    } else {
                        merge_patch(map.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// `metadata.name` of a JSON object, if any.
pub fn object_name(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/name").and_then(Value::as_str)
}
