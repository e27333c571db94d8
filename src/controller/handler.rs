//! The managed-resource contract.
//!
//! A [`ManagedResource`] knows how to name, describe, read and write one
//! child object.  [`Converge`] turns it into an idempotent [`Lifecycle`]
//! handler: create when missing, converge when present, treat absence on
//! delete as success.  [`Gated`] defers a handler while a [`SiblingGate`]
//! is held.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::InstanceConfig;
use crate::error::{Error, Result};
use crate::platform::{PlatformClient, ResourceKind};
use crate::postgres::PostgresManager;

/// Everything a handler may touch for one instance.
#[derive(Clone)]
pub struct Scope {
    pub platform: Arc<dyn PlatformClient>,
    pub postgres: Arc<dyn PostgresManager>,
    pub instance: Arc<InstanceConfig>,
    /// Namespace holding secrets mirrored into instance namespaces.
    pub operator_namespace: String,
}

impl Scope {
    pub fn namespace(&self) -> &str {
        &self.instance.namespace
    }

    pub fn name(&self) -> &str {
        &self.instance.name
    }
}

/// Result of driving a handler once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The resource now matches desired state.
    Converged,
    /// Nothing was done because a precondition is not met yet.
    Deferred,
}

/// One step of the instance pipeline.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn label(&self) -> &'static str;
    async fn handle_create(&self) -> Result<HandlerOutcome>;
    async fn handle_update(&self) -> Result<HandlerOutcome>;
    async fn handle_delete(&self) -> Result<()>;
}

/// Raw primitives for one child object.
///
/// `desired_body` must be pure: the same [`InstanceConfig`] always yields
/// the same JSON.  The default `create`/`update`/`delete` cover the common
/// "write the whole desired body" case; resources with a different
/// convergence policy override `update`.
#[async_trait]
pub trait ManagedResource: Send + Sync {
    fn label(&self) -> &'static str;
    fn kind(&self) -> ResourceKind;
    fn resource_name(&self) -> String;
    fn scope(&self) -> &Scope;
    fn desired_body(&self) -> Result<Value>;

    async fn read(&self) -> Result<Option<Value>> {
        let scope = self.scope();
        scope
            .platform
            .read(scope.namespace(), self.kind(), &self.resource_name())
            .await
    }

    async fn create(&self) -> Result<()> {
        let scope = self.scope();
        let body = self.desired_body()?;
        scope
            .platform
            .create(scope.namespace(), self.kind(), &body)
            .await?;
        Ok(())
    }

    /// Full replace: merge-patch the entire desired body.
    async fn update(&self, _observed: Value) -> Result<()> {
        let scope = self.scope();
        let body = self.desired_body()?;
        scope
            .platform
            .patch(scope.namespace(), self.kind(), &self.resource_name(), &body)
            .await?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let scope = self.scope();
        let name = self.resource_name();
        if !scope
            .platform
            .delete(scope.namespace(), self.kind(), &name)
            .await?
        {
            debug!(kind = %self.kind(), %name, "already absent");
        }
        Ok(())
    }
}

/// Create-if-missing / update-if-exists over a [`ManagedResource`].
pub struct Converge<R>(pub R);

impl<R: ManagedResource> Converge<R> {
    async fn ensure(&self) -> Result<HandlerOutcome> {
        let res = &self.0;
        match res.read().await? {
            Some(observed) => res.update(observed).await?,
            None => match res.create().await {
                Ok(()) => info!(
                    kind = %res.kind(),
                    name = %res.resource_name(),
                    "created"
                ),
                // Someone else created it between our read and create.
                Err(Error::Conflict(_)) => match res.read().await? {
                    Some(observed) => res.update(observed).await?,
                    None => {
                        return Err(Error::Conflict(format!(
                            "{} {} vanished after a create conflict",
                            res.kind(),
                            res.resource_name()
                        )))
                    }
                },
                Err(e) => return Err(e),
            },
        }
        Ok(HandlerOutcome::Converged)
    }
}

#[async_trait]
impl<R: ManagedResource> Lifecycle for Converge<R> {
    fn label(&self) -> &'static str {
        self.0.label()
    }

    async fn handle_create(&self) -> Result<HandlerOutcome> {
        self.ensure().await
    }

    async fn handle_update(&self) -> Result<HandlerOutcome> {
        self.ensure().await
    }

    async fn handle_delete(&self) -> Result<()> {
        self.0.delete().await
    }
}

/// Observed-state precondition.  Not a lock: the state may change right
/// after it is read, and the next pass corrects for it.
#[async_trait]
pub trait SiblingGate: Send + Sync {
    fn describe(&self) -> &'static str;
    async fn is_held(&self) -> Result<bool>;
}

/// Skip create/update while `gate` is held.  Delete always passes through.
pub struct Gated<L, G> {
    inner: L,
    gate: G,
}

impl<L, G> Gated<L, G> {
    pub fn new(inner: L, gate: G) -> Self {
        Self { inner, gate }
    }
}

#[async_trait]
impl<L: Lifecycle, G: SiblingGate> Lifecycle for Gated<L, G> {
    fn label(&self) -> &'static str {
        self.inner.label()
    }

    async fn handle_create(&self) -> Result<HandlerOutcome> {
        if self.gate.is_held().await? {
            info!(handler = self.inner.label(), gate = self.gate.describe(), "deferred");
            return Ok(HandlerOutcome::Deferred);
        }
        self.inner.handle_create().await
    }

    async fn handle_update(&self) -> Result<HandlerOutcome> {
        if self.gate.is_held().await? {
            info!(handler = self.inner.label(), gate = self.gate.describe(), "deferred");
            return Ok(HandlerOutcome::Deferred);
        }
        self.inner.handle_update().await
    }

    async fn handle_delete(&self) -> Result<()> {
        self.inner.handle_delete().await
    }
}
