use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::controller::handler::{ManagedResource, Scope};
use crate::controller::helpers::{
    child_meta, shared_owner_ref, standard_labels, to_body, ODOO_USER_SUFFIX,
};
use crate::error::{Error, Result};
use crate::helpers::{child_name, generate_password};
use crate::platform::ResourceKind;

/// A secret copied from the operator namespace into the instance namespace
/// (image pull secret, git deploy key).
///
/// Several instances in one namespace may reference the same secret, so each
/// adds a non-controller owner reference and the garbage collector removes
/// the copy once the last of them is gone.
pub struct MirroredSecret {
    scope: Scope,
    label: &'static str,
    secret_name: String,
}

impl MirroredSecret {
    pub fn pull_secret(scope: Scope, secret_name: String) -> Self {
        Self {
            scope,
            label: "image-pull-secret",
            secret_name,
        }
    }

    pub fn git_secret(scope: Scope, secret_name: String) -> Self {
        Self {
            scope,
            label: "git-secret",
            secret_name,
        }
    }

    fn owner(&self) -> OwnerReference {
        shared_owner_ref(&self.scope.instance.owner)
    }
}

/// Fill a mirrored-secret skeleton with the source secret's payload.
pub fn with_source_payload(desired: Value, source: &Secret) -> Result<Value> {
    let mut secret: Secret = serde_json::from_value(desired)?;
    secret.data = source.data.clone();
    secret.type_ = source.type_.clone();
    to_body(&secret)
}

/// Owner references of `observed` with `owner` appended, or `None` when it
/// is already listed.
pub fn merged_owner_refs(
    observed: &Value,
    owner: &OwnerReference,
) -> Result<Option<Vec<OwnerReference>>> {
    let mut refs: Vec<OwnerReference> = match observed.pointer("/metadata/ownerReferences") {
        Some(v) => serde_json::from_value(v.clone())?,
        None => vec![],
    };
    if refs.iter().any(|r| r.uid == owner.uid) {
        return Ok(None);
    }
    refs.push(owner.clone());
    Ok(Some(refs))
}

#[async_trait]
impl ManagedResource for MirroredSecret {
    fn label(&self) -> &'static str {
        self.label
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Secret
    }

    fn resource_name(&self) -> String {
        self.secret_name.clone()
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn desired_body(&self) -> Result<Value> {
        let cfg = &self.scope.instance;
        to_body(&Secret {
            metadata: ObjectMeta {
                name: Some(self.secret_name.clone()),
                namespace: Some(cfg.namespace.clone()),
                labels: Some(standard_labels(&cfg.name, self.label)),
                owner_references: Some(vec![self.owner()]),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn create(&self) -> Result<()> {
        let scope = &self.scope;
        let source = scope
            .platform
            .read(&scope.operator_namespace, ResourceKind::Secret, &self.secret_name)
            .await?
            .ok_or_else(|| {
                Error::validation(format!(
                    "secret {} not found in operator namespace {}",
                    self.secret_name, scope.operator_namespace
                ))
            })?;
        let source: Secret = serde_json::from_value(source)?;
        let body = with_source_payload(self.desired_body()?, &source)?;
        scope
            .platform
            .create(scope.namespace(), ResourceKind::Secret, &body)
            .await?;
        Ok(())
    }

    /// The payload is copied once; later passes only make sure this
    /// instance is listed as an owner.
    async fn update(&self, observed: Value) -> Result<()> {
        let Some(refs) = merged_owner_refs(&observed, &self.owner())? else {
            return Ok(());
        };
        let scope = &self.scope;
        scope
            .platform
            .patch(
                scope.namespace(),
                ResourceKind::Secret,
                &self.secret_name,
                &json!({"metadata": {"ownerReferences": refs}}),
            )
            .await?;
        info!(secret = %self.secret_name, "added owner reference to shared secret");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        debug!(secret = %self.secret_name, "shared secret left to garbage collection");
        Ok(())
    }
}

/// `<name>-odoo-user`: database login generated once and never rotated.
pub struct OdooUserSecret {
    scope: Scope,
}

impl OdooUserSecret {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }
}

/// Add `username`/`password` data to the odoo-user skeleton.
pub fn with_credentials(desired: Value, username: &str, password: &str) -> Result<Value> {
    let mut secret: Secret = serde_json::from_value(desired)?;
    secret.data = Some(BTreeMap::from([
        ("username".to_string(), ByteString(username.as_bytes().to_vec())),
        ("password".to_string(), ByteString(password.as_bytes().to_vec())),
    ]));
    to_body(&secret)
}

/// Decoded value of one key of a Secret.
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
}

#[async_trait]
impl ManagedResource for OdooUserSecret {
    fn label(&self) -> &'static str {
        "odoo-user-secret"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Secret
    }

    fn resource_name(&self) -> String {
        child_name(self.scope.name(), ODOO_USER_SUFFIX)
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn desired_body(&self) -> Result<Value> {
        to_body(&Secret {
            metadata: child_meta(&self.scope.instance, &self.resource_name(), "database"),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        })
    }

    async fn create(&self) -> Result<()> {
        let body = with_credentials(
            self.desired_body()?,
            &self.scope.instance.database.user,
            &generate_password(),
        )?;
        self.scope
            .platform
            .create(self.scope.namespace(), ResourceKind::Secret, &body)
            .await?;
        Ok(())
    }

    /// Credentials are generated once.
    async fn update(&self, _observed: Value) -> Result<()> {
        Ok(())
    }
}
