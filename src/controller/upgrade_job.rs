//! Module-upgrade job and the git-sync gate in front of it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Container;
use serde_json::Value;

use crate::config::{InstanceConfig, UpgradeRequest};
use crate::controller::handler::{Converge, Gated, ManagedResource, Scope, SiblingGate};
use crate::controller::helpers::{
    db_env, odoo_volume_mounts, selector, to_body, OdooJobBuilder,
};
use crate::error::Result;
use crate::platform::{object_name, ResourceKind};

pub const UPGRADE_COMPONENT: &str = "upgrade";
pub const GIT_SYNC_COMPONENT: &str = "git-sync";
pub const UPGRADE_REQUEST_ANNOTATION: &str = "bemade.org/upgrade-request";

const UPGRADE_BACKOFF_LIMIT: i32 = 2;
const UPGRADE_TTL_SECONDS: i32 = 3600;

/// `<name>-upgrade-<generation>`
pub fn upgrade_job_name(cfg: &InstanceConfig) -> String {
    format!("{}-upgrade-{}", cfg.name, cfg.generation)
}

fn component_selector(instance: &str, component: &str) -> String {
    selector(&[
        ("app.kubernetes.io/instance", instance),
        ("app.kubernetes.io/component", component),
    ])
}

// ── Job status ────────────────────────────────────────────────────────────────

/// What a batch/v1 Job's status says about its run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobOutcome {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

fn counter(job: &Value, field: &str) -> i64 {
    job.pointer(&format!("/status/{field}"))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn has_condition(job: &Value, type_: &str) -> bool {
    job.pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(type_)
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}

pub fn job_outcome(job: &Value) -> JobOutcome {
    let backoff = job
        .pointer("/spec/backoffLimit")
        .and_then(Value::as_i64)
        .unwrap_or(6);
    if counter(job, "succeeded") > 0 || has_condition(job, "Complete") {
        JobOutcome::Succeeded
    } else if has_condition(job, "Failed") || counter(job, "failed") > backoff {
        JobOutcome::Failed
    } else if counter(job, "active") > 0 {
        JobOutcome::Running
    } else {
        JobOutcome::Pending
    }
}

/// Upgrade job of `scope`'s instance that has not finished yet, if any.
pub async fn unfinished_upgrade_job(scope: &Scope) -> Result<Option<Value>> {
    let jobs = scope
        .platform
        .list(
            scope.namespace(),
            ResourceKind::Job,
            &component_selector(scope.name(), UPGRADE_COMPONENT),
        )
        .await?;
    Ok(jobs.into_iter().find(|j| !job_outcome(j).is_finished()))
}

// ── Upgrade job ───────────────────────────────────────────────────────────────

/// One-shot `odoo -u <modules> -d <database> --stop-after-init` run.
pub struct UpgradeJob {
    scope: Scope,
    request: UpgradeRequest,
}

impl UpgradeJob {
    pub fn new(scope: Scope, request: UpgradeRequest) -> Self {
        Self { scope, request }
    }
}

#[async_trait]
impl ManagedResource for UpgradeJob {
    fn label(&self) -> &'static str {
        "upgrade-job"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Job
    }

    fn resource_name(&self) -> String {
        upgrade_job_name(&self.scope.instance)
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn desired_body(&self) -> Result<Value> {
        let cfg = &self.scope.instance;
        let container = Container {
            name: format!("odoo-upgrade-{}", cfg.name),
            image: Some(cfg.image.clone()),
            command: Some(vec!["/entrypoint.sh".into(), "odoo".into()]),
            args: Some(vec![
                "-d".into(),
                self.request.database.clone(),
                "-u".into(),
                self.request.modules.join(","),
                "--no-http".into(),
                "--stop-after-init".into(),
            ]),
            env: Some(db_env(cfg)),
            volume_mounts: Some(odoo_volume_mounts(cfg)),
            resources: cfg.resources.clone(),
            ..Default::default()
        };
        let job = OdooJobBuilder::new(&self.resource_name(), cfg, UPGRADE_COMPONENT)
            .containers(vec![container])
            .backoff_limit(UPGRADE_BACKOFF_LIMIT)
            .ttl_seconds_after_finished(UPGRADE_TTL_SECONDS)
            .annotations(BTreeMap::from([(
                UPGRADE_REQUEST_ANNOTATION.to_string(),
                serde_json::to_string(&self.request)?,
            )]))
            .build();
        to_body(&job)
    }

    /// An upgrade already under way counts as present, whatever generation
    /// started it, so a spec edit mid-run never starts a second job.
    async fn read(&self) -> Result<Option<Value>> {
        if let Some(job) = unfinished_upgrade_job(&self.scope).await? {
            return Ok(Some(job));
        }
        self.scope
            .platform
            .read(self.scope.namespace(), ResourceKind::Job, &self.resource_name())
            .await
    }

    /// Jobs are immutable.
    async fn update(&self, _observed: Value) -> Result<()> {
        Ok(())
    }
}

// ── Git-sync gate ─────────────────────────────────────────────────────────────

/// Held while a git-sync job of the instance is running: it writes to the
/// repository volume the upgrade reads addons from.
pub struct GitSyncGate {
    scope: Scope,
}

impl GitSyncGate {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }

    /// Name of a running git-sync job, if any.
    pub async fn running_job(&self) -> Result<Option<String>> {
        let jobs = self
            .scope
            .platform
            .list(
                self.scope.namespace(),
                ResourceKind::Job,
                &component_selector(self.scope.name(), GIT_SYNC_COMPONENT),
            )
            .await?;
        Ok(jobs
            .iter()
            .find(|j| counter(j, "active") > 0)
            .map(|j| object_name(j).unwrap_or_default().to_string()))
    }
}

#[async_trait]
impl SiblingGate for GitSyncGate {
    fn describe(&self) -> &'static str {
        "git-sync job running"
    }

    async fn is_held(&self) -> Result<bool> {
        Ok(self.running_job().await?.is_some())
    }
}

pub type UpgradeHandler = Gated<Converge<UpgradeJob>, GitSyncGate>;

pub fn upgrade_handler(scope: Scope, request: UpgradeRequest) -> UpgradeHandler {
    Gated::new(
        Converge(UpgradeJob::new(scope.clone(), request)),
        GitSyncGate::new(scope),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::handler::tests::scope_with;
    use crate::platform::memory::InMemoryPlatform;
    use serde_json::json;
    use std::sync::Arc;

    fn request() -> UpgradeRequest {
        UpgradeRequest {
            database: "prod".into(),
            modules: vec!["sale".into(), "stock".into()],
        }
    }

    #[test]
    fn outcome_from_counters_and_conditions() {
        let job = |status: Value| json!({"spec": {"backoffLimit": 2}, "status": status});
        assert_eq!(job_outcome(&job(json!({}))), JobOutcome::Pending);
        assert_eq!(job_outcome(&job(json!({"active": 1}))), JobOutcome::Running);
        assert_eq!(job_outcome(&job(json!({"succeeded": 1}))), JobOutcome::Succeeded);
        assert_eq!(
            job_outcome(&job(json!({"active": 1, "failed": 2}))),
            JobOutcome::Running
        );
        assert_eq!(job_outcome(&job(json!({"failed": 3}))), JobOutcome::Failed);
        assert_eq!(
            job_outcome(&job(json!({"conditions": [{"type": "Failed", "status": "True"}]}))),
            JobOutcome::Failed
        );
    }

    #[test]
    fn job_runs_requested_modules_once() {
        let job = UpgradeJob::new(scope_with(Arc::new(InMemoryPlatform::new())), request());
        let body = job.desired_body().unwrap();
        assert_eq!(body["metadata"]["name"], "shop-upgrade-1");
        assert_eq!(body["spec"]["backoffLimit"], 2);
        assert_eq!(body["spec"]["ttlSecondsAfterFinished"], 3600);
        assert_eq!(body["spec"]["template"]["spec"]["restartPolicy"], "Never");
        assert_eq!(
            body["metadata"]["labels"]["app.kubernetes.io/component"],
            "upgrade"
        );
        let args = &body["spec"]["template"]["spec"]["containers"][0]["args"];
        assert_eq!(
            args,
            &json!(["-d", "prod", "-u", "sale,stock", "--no-http", "--stop-after-init"])
        );
    }

    #[tokio::test]
    async fn unfinished_job_of_earlier_generation_counts_as_present() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.insert(
            "prod",
            ResourceKind::Job,
            json!({
                "metadata": {"name": "shop-upgrade-0", "labels": {
                    "app.kubernetes.io/instance": "shop",
                    "app.kubernetes.io/component": "upgrade"
                }},
                "status": {"active": 1}
            }),
        );
        let job = UpgradeJob::new(scope_with(platform), request());
        let found = job.read().await.unwrap().unwrap();
        assert_eq!(object_name(&found), Some("shop-upgrade-0"));
    }

    #[tokio::test]
    async fn gate_holds_only_for_active_git_sync() {
        let platform = Arc::new(InMemoryPlatform::new());
        let gate = GitSyncGate::new(scope_with(platform.clone()));
        assert!(!gate.is_held().await.unwrap());

        let sync = |name: &str, status: Value| {
            json!({
                "metadata": {"name": name, "labels": {
                    "app.kubernetes.io/instance": "shop",
                    "app.kubernetes.io/component": "git-sync"
                }},
                "status": status
            })
        };
        platform.insert("prod", ResourceKind::Job, sync("shop-git-sync-1", json!({"succeeded": 1})));
        assert!(!gate.is_held().await.unwrap());

        platform.insert("prod", ResourceKind::Job, sync("shop-git-sync-2", json!({"active": 1})));
        assert_eq!(
            gate.running_job().await.unwrap().as_deref(),
            Some("shop-git-sync-2")
        );
    }
}
