//! Ordered handler pipeline and lifecycle-event dispatch.
//!
//! Handlers run in dependency order on create and update and in exact
//! reverse order on delete.  Create/update stop at the first failure;
//! delete keeps going, since the owner-reference cascade removes whatever
//! is left.

use tracing::{debug, info, warn};

use crate::config::UpgradeRequest;
use crate::controller::child_resources::{
    IngressRoute, MirroredSecret, OdooConf, OdooDeployment, OdooService, OdooUserSecret,
    PostgresRole, RouteFlavor, StorageClaim, TlsCertificate,
};
use crate::controller::handler::{Converge, HandlerOutcome, Lifecycle, Scope};
use crate::controller::upgrade_job::upgrade_handler;
use crate::crd::odoo_instance::{UpgradePhase, UpgradeStatus};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Created,
    Updated,
    Deleted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateKind {
    UpgradeRequested,
    RegularUpdate,
}

/// An update is an upgrade request only when it names a database and at
/// least one module.
pub fn classify_update(upgrade: Option<&UpgradeRequest>) -> UpdateKind {
    match upgrade {
        Some(u) if u.is_valid() => UpdateKind::UpgradeRequested,
        _ => UpdateKind::RegularUpdate,
    }
}

pub struct HandlerPipeline {
    handlers: Vec<Box<dyn Lifecycle>>,
}

impl HandlerPipeline {
    /// The instance's handlers in creation order.  Optional handlers are
    /// left out when the spec does not ask for them.
    pub fn for_instance(scope: &Scope) -> Self {
        let cfg = &scope.instance;
        let mut handlers: Vec<Box<dyn Lifecycle>> = Vec::new();

        if let Some(secret) = &cfg.image_pull_secret {
            handlers.push(Box::new(Converge(MirroredSecret::pull_secret(
                scope.clone(),
                secret.clone(),
            ))));
        }
        handlers.push(Box::new(Converge(OdooUserSecret::new(scope.clone()))));
        handlers.push(Box::new(PostgresRole::new(scope.clone())));
        if let Some(secret) = cfg.git.as_ref().and_then(|g| g.ssh_secret.clone()) {
            handlers.push(Box::new(Converge(MirroredSecret::git_secret(
                scope.clone(),
                secret,
            ))));
        }
        handlers.push(Box::new(Converge(StorageClaim::filestore(scope.clone()))));
        if let Some(claim) = StorageClaim::git_repo(scope.clone()) {
            handlers.push(Box::new(Converge(claim)));
        }
        handlers.push(Box::new(Converge(OdooConf::new(scope.clone()))));
        handlers.push(Box::new(Converge(TlsCertificate::new(scope.clone()))));
        handlers.push(Box::new(Converge(OdooDeployment::new(scope.clone()))));
        handlers.push(Box::new(Converge(OdooService::new(scope.clone()))));
        for flavor in [RouteFlavor::Http, RouteFlavor::Https, RouteFlavor::Websocket] {
            handlers.push(Box::new(Converge(IngressRoute::new(scope.clone(), flavor))));
        }

        Self { handlers }
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.label()).collect()
    }

    pub async fn create_all(&self) -> Result<()> {
        for h in &self.handlers {
            h.handle_create().await.map_err(|e| Error::Pipeline {
                handler: h.label(),
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    pub async fn update_all(&self) -> Result<()> {
        for h in &self.handlers {
            h.handle_update().await.map_err(|e| Error::Pipeline {
                handler: h.label(),
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    /// Reverse order, best effort.  Returns how many handlers failed.
    pub async fn delete_all(&self) -> usize {
        let mut failures = 0;
        for h in self.handlers.iter().rev() {
            if let Err(e) = h.handle_delete().await {
                warn!(handler = h.label(), error = %e, "delete failed, continuing");
                failures += 1;
            }
        }
        failures
    }
}

/// Routes lifecycle events for one instance.
pub struct InstanceController {
    scope: Scope,
}

impl InstanceController {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }

    pub fn pipeline(&self) -> HandlerPipeline {
        HandlerPipeline::for_instance(&self.scope)
    }

    /// Dispatch one event.  `Deferred` means the upgrade is waiting on the
    /// git-sync gate and the event should be retried later.
    pub async fn dispatch(
        &self,
        event: LifecycleEvent,
        upgrade_status: Option<&UpgradeStatus>,
    ) -> Result<HandlerOutcome> {
        let name = self.scope.name();
        match event {
            LifecycleEvent::Created => {
                info!(%name, "creating instance resources");
                self.pipeline().create_all().await?;
                Ok(HandlerOutcome::Converged)
            }
            LifecycleEvent::Updated => {
                let upgrade = self.scope.instance.upgrade.as_ref();
                match classify_update(upgrade) {
                    UpdateKind::UpgradeRequested => {
                        let Some(request) = upgrade else {
                            return Ok(HandlerOutcome::Converged);
                        };
                        if already_settled(request, upgrade_status) {
                            info!(%name, "upgrade request already settled, not retrying");
                            return Ok(HandlerOutcome::Converged);
                        }
                        info!(%name, database = %request.database, "upgrade requested");
                        self.run_upgrade(request).await
                    }
                    UpdateKind::RegularUpdate => {
                        info!(%name, "updating instance resources");
                        self.pipeline().update_all().await?;
                        Ok(HandlerOutcome::Converged)
                    }
                }
            }
            LifecycleEvent::Deleted => {
                info!(%name, "tearing down instance resources");
                let failures = self.pipeline().delete_all().await;
                if failures > 0 {
                    warn!(%name, failures, "teardown finished with errors");
                }
                Ok(HandlerOutcome::Converged)
            }
        }
    }

    /// Drive an outstanding upgrade request outside an `Updated` dispatch:
    /// after the create pipeline of an instance born with `spec.upgrade`
    /// set, or on a resync once the job of an edited-away request finished.
    /// `None` when there is nothing to start.
    pub async fn resume_upgrade(
        &self,
        upgrade_status: Option<&UpgradeStatus>,
    ) -> Result<Option<HandlerOutcome>> {
        let Some(request) = self.scope.instance.valid_upgrade() else {
            return Ok(None);
        };
        if already_settled(request, upgrade_status) {
            return Ok(None);
        }
        debug!(name = %self.scope.name(), database = %request.database, "resuming upgrade request");
        self.run_upgrade(request).await.map(Some)
    }

    async fn run_upgrade(&self, request: &UpgradeRequest) -> Result<HandlerOutcome> {
        upgrade_handler(self.scope.clone(), request.clone())
            .handle_update()
            .await
            .map_err(|e| Error::Pipeline {
                handler: "upgrade-job",
                source: Box::new(e),
            })
    }
}

/// The status already records this exact request as finished.
fn already_settled(request: &UpgradeRequest, status: Option<&UpgradeStatus>) -> bool {
    status.is_some_and(|s| {
        matches!(s.phase, UpgradePhase::Succeeded | UpgradePhase::Failed)
            && s.request.as_ref() == Some(request)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::handler::tests::scope_with;
    use crate::platform::memory::InMemoryPlatform;
    use crate::platform::ResourceKind;
    use std::sync::Arc;

    #[test]
    fn classification_needs_database_and_modules() {
        let req = |db: &str, modules: &[&str]| UpgradeRequest {
            database: db.into(),
            modules: modules.iter().map(|m| m.to_string()).collect(),
        };
        assert_eq!(classify_update(None), UpdateKind::RegularUpdate);
        assert_eq!(
            classify_update(Some(&req("", &[]))),
            UpdateKind::RegularUpdate
        );
        assert_eq!(
            classify_update(Some(&req("prod", &[]))),
            UpdateKind::RegularUpdate
        );
        assert_eq!(
            classify_update(Some(&req("", &["sale"]))),
            UpdateKind::RegularUpdate
        );
        assert_eq!(
            classify_update(Some(&req("prod", &["sale"]))),
            UpdateKind::UpgradeRequested
        );
    }

    #[test]
    fn minimal_instance_pipeline_order() {
        let scope = scope_with(Arc::new(InMemoryPlatform::new()));
        assert_eq!(
            HandlerPipeline::for_instance(&scope).labels(),
            vec![
                "odoo-user-secret",
                "postgres-role",
                "filestore-pvc",
                "odoo-conf",
                "tls-certificate",
                "deployment",
                "service",
                "ingress-route-http",
                "ingress-route-https",
                "ingress-route-websocket",
            ]
        );
    }

    #[test]
    fn settled_requests_are_not_retried() {
        let request = UpgradeRequest {
            database: "prod".into(),
            modules: vec!["sale".into()],
        };
        let status = |phase| UpgradeStatus {
            phase,
            request: Some(request.clone()),
            ..Default::default()
        };
        assert!(already_settled(&request, Some(&status(UpgradePhase::Failed))));
        assert!(already_settled(&request, Some(&status(UpgradePhase::Succeeded))));
        assert!(!already_settled(&request, Some(&status(UpgradePhase::Running))));
        assert!(!already_settled(&request, None));

        let edited = UpgradeRequest {
            database: "staging".into(),
            ..request.clone()
        };
        assert!(!already_settled(&edited, Some(&status(UpgradePhase::Failed))));
    }

    #[tokio::test]
    async fn resume_starts_only_unsettled_requests() {
        let platform = Arc::new(InMemoryPlatform::new());
        let mut scope = scope_with(platform.clone());
        assert_eq!(
            InstanceController::new(scope.clone())
                .resume_upgrade(None)
                .await
                .unwrap(),
            None
        );

        let request = UpgradeRequest {
            database: "prod".into(),
            modules: vec!["sale".into()],
        };
        let mut cfg = (*scope.instance).clone();
        cfg.upgrade = Some(request.clone());
        scope.instance = Arc::new(cfg);
        let controller = InstanceController::new(scope);

        let settled = UpgradeStatus {
            phase: UpgradePhase::Succeeded,
            request: Some(request),
            ..Default::default()
        };
        assert_eq!(controller.resume_upgrade(Some(&settled)).await.unwrap(), None);
        assert!(platform.names("prod", ResourceKind::Job).is_empty());

        assert_eq!(
            controller.resume_upgrade(None).await.unwrap(),
            Some(HandlerOutcome::Converged)
        );
        assert_eq!(
            platform.names("prod", ResourceKind::Job),
            vec!["shop-upgrade-1".to_string()]
        );
    }
}
