//! OdooInstance controller: the kube-rs side of reconciliation.
//!
//! Turns watch events into [`LifecycleEvent`]s, resolves the instance
//! configuration, dispatches to the handler pipeline, ticks the upgrade
//! state machine and records the outcome in status and Kubernetes events.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    batch::v1::Job,
    core::v1::{ConfigMap, ObjectReference, PersistentVolumeClaim, Secret, Service},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{
    api::{Api, ResourceExt},
    runtime::{
        controller::{Action, Controller},
        events::{Event as KubeEvent, EventType, Recorder, Reporter},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
    Client, Resource,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clusters::{ClusterRegistry, FileClusterSource};
use crate::config::{requested_cluster, DefaultsSource, InstanceConfig};
use crate::crd::odoo_instance::{OdooInstance, OdooInstancePhase, UpgradePhase};
use crate::error::{Error, Result};
use crate::platform::{PlatformClient, ResourceKind};
use crate::postgres::PostgresManager;

use super::handler::{HandlerOutcome, Scope};
use super::pipeline::{InstanceController, LifecycleEvent};
use super::state_machine::{run_upgrade_machine, UpgradeTick};

pub const FINALIZER: &str = "bemade.org/odoo-cleanup";

/// Build an ObjectReference from any kube Resource.
pub fn kube_object_ref<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    ObjectReference {
        api_version: Some(K::api_version(&()).to_string()),
        kind: Some(K::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.meta().uid.clone(),
        resource_version: obj.meta().resource_version.clone(),
        ..Default::default()
    }
}

/// Publish a Kubernetes event attached to the given resource.
/// Errors are logged but never block reconciliation.
pub async fn publish_event<K: Resource<DynamicType = ()>>(
    ctx: &Context,
    obj: &K,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let rec = Recorder::new(ctx.client.clone(), ctx.reporter.clone());
    let oref = kube_object_ref(obj);
    if let Err(e) = rec
        .publish(
            &KubeEvent {
                type_,
                reason: reason.to_string(),
                note,
                action: action.to_string(),
                secondary: None,
            },
            &oref,
        )
        .await
    {
        warn!(%e, "failed to publish event");
    }
}

// ── Shared context passed to every reconcile call ─────────────────────────────

pub struct Context {
    pub client: Client,
    pub platform: Arc<dyn PlatformClient>,
    pub defaults: Arc<dyn DefaultsSource>,
    pub clusters: ClusterRegistry<FileClusterSource>,
    pub postgres: Arc<dyn PostgresManager>,
    pub operator_namespace: String,
    pub reporter: Reporter,
    /// How often an outstanding upgrade is polled.
    pub upgrade_check_interval: Duration,
}

// ── Controller entry point ────────────────────────────────────────────────────

/// Start the OdooInstance controller. Returns a future that runs forever.
pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let instances: Api<OdooInstance> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());
    let configmaps: Api<ConfigMap> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());
    let pvcs: Api<PersistentVolumeClaim> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client.clone());

    Controller::new(instances, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .owns(services, WatcherConfig::default())
        .owns(configmaps, WatcherConfig::default())
        .owns(secrets, WatcherConfig::default())
        .owns(pvcs, WatcherConfig::default())
        .owns(jobs, WatcherConfig::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((_obj, _action)) => {}
                Err(e) => {
                    let msg = format!("{e:?}");
                    if msg.contains("ObjectNotFound") {
                        debug!("reconcile: object already deleted");
                    } else {
                        warn!("reconcile failed: {msg}");
                    }
                }
            }
        })
        .await;
}

// ── Reconcile ─────────────────────────────────────────────────────────────────

async fn reconcile(instance: Arc<OdooInstance>, ctx: Arc<Context>) -> Result<Action> {
    let ns = instance.namespace().unwrap_or_default();
    let api: Api<OdooInstance> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&api, FINALIZER, instance, |event| async {
        match event {
            FinalizerEvent::Apply(instance) => reconcile_instance(&instance, &ctx).await,
            FinalizerEvent::Cleanup(instance) => cleanup_instance(&instance, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

fn error_policy(instance: Arc<OdooInstance>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = instance.name_any();
    if matches!(error, Error::Finalizer(e) if e.to_string().contains("ObjectNotFound")) {
        debug!(%name, "object already deleted, skipping requeue");
        return Action::await_change();
    }
    warn!(%name, %error, "reconcile error, requeuing in 30s");
    Action::requeue(Duration::from_secs(30))
}

/// Which lifecycle event an apply represents.  `None` is a resync of an
/// already handled generation.
pub fn classify_apply(generation: Option<i64>, observed: Option<i64>) -> Option<LifecycleEvent> {
    match observed {
        None => Some(LifecycleEvent::Created),
        Some(seen) if Some(seen) != generation => Some(LifecycleEvent::Updated),
        Some(_) => None,
    }
}

async fn resolve_config(instance: &OdooInstance, ctx: &Context) -> Result<InstanceConfig> {
    let defaults = ctx.defaults.load().await?;
    let cluster = ctx
        .clusters
        .get_cluster(requested_cluster(instance))
        .await?;
    InstanceConfig::resolve(instance, &defaults, cluster)
}

fn scope_for(cfg: InstanceConfig, ctx: &Context) -> Scope {
    Scope {
        platform: ctx.platform.clone(),
        postgres: ctx.postgres.clone(),
        instance: Arc::new(cfg),
        operator_namespace: ctx.operator_namespace.clone(),
    }
}

// ── Core reconcile logic ──────────────────────────────────────────────────────

/// What one apply pass did.  The kube glue turns it into events and a
/// requeue [`Action`].
#[derive(Clone, Debug)]
pub struct ApplyReport {
    pub previous_phase: Option<OdooInstancePhase>,
    pub phase: OdooInstancePhase,
    pub observed_generation: Option<i64>,
    pub upgrade: UpgradeTick,
    /// `None` waits for the next watch event.
    pub requeue_after: Option<Duration>,
}

/// Converge one instance through `scope.platform`: dispatch the lifecycle
/// event implied by its generation, drive any outstanding upgrade request,
/// tick the upgrade machine and write the resulting status.
pub async fn apply_instance(
    instance: &OdooInstance,
    scope: &Scope,
    upgrade_check_interval: Duration,
) -> Result<ApplyReport> {
    let name = scope.name();
    let status = instance.status.as_ref();
    let previous_phase = status.and_then(|s| s.phase.clone());
    let generation = instance.metadata.generation;
    let upgrade_status = status.and_then(|s| s.upgrade.as_ref());
    let controller = InstanceController::new(scope.clone());

    let event = classify_apply(generation, status.and_then(|s| s.observed_generation));
    let outcome = match event {
        Some(event) => Some(controller.dispatch(event, upgrade_status).await?),
        None => None,
    };

    // An Updated event already ran the upgrade handler if one was asked for.
    let resumed = match event {
        Some(LifecycleEvent::Updated) => None,
        _ => controller.resume_upgrade(upgrade_status).await?,
    };

    // Completion check runs every pass.
    let tick = run_upgrade_machine(scope, upgrade_status).await?;

    let observed_generation = match outcome {
        Some(HandlerOutcome::Converged) => generation,
        _ => status.and_then(|s| s.observed_generation),
    };
    let phase = if tick.status.phase.in_flight() {
        OdooInstancePhase::Upgrading
    } else if observed_generation.is_none() {
        OdooInstancePhase::Provisioning
    } else {
        OdooInstancePhase::Ready
    };

    let unchanged = status.is_some_and(|s| {
        s.phase.as_ref() == Some(&phase)
            && s.message.is_none()
            && s.observed_generation == observed_generation
    });
    if !unchanged {
        let patch = json!({
            "status": {
                "phase": phase,
                "message": null,
                "observedGeneration": observed_generation,
                "conditions": phase_to_conditions(&phase, generation.unwrap_or(0), None),
            }
        });
        scope
            .platform
            .patch_status(scope.namespace(), ResourceKind::OdooInstance, name, &patch)
            .await?;
    }

    let deferred = outcome == Some(HandlerOutcome::Deferred)
        || resumed == Some(HandlerOutcome::Deferred);
    let upgrade_outstanding = deferred
        || tick.status.phase.in_flight()
        || (scope.instance.valid_upgrade().is_some()
            && tick.status.phase != UpgradePhase::Failed);
    let requeue_after = if tick.transition.is_some() {
        Some(Duration::ZERO)
    } else if upgrade_outstanding {
        Some(upgrade_check_interval)
    } else {
        None
    };

    Ok(ApplyReport {
        previous_phase,
        phase,
        observed_generation,
        upgrade: tick,
        requeue_after,
    })
}

async fn reconcile_instance(instance: &OdooInstance, ctx: &Context) -> Result<Action> {
    let name = instance.name_any();
    debug!(%name, ns = ?instance.namespace(), "reconciling OdooInstance");

    let cfg = match resolve_config(instance, ctx).await {
        Ok(cfg) => cfg,
        Err(e) => return Err(fail(instance, ctx, e).await),
    };
    let scope = scope_for(cfg, ctx);
    let report = match apply_instance(instance, &scope, ctx.upgrade_check_interval).await {
        Ok(report) => report,
        Err(e) => return Err(fail(instance, ctx, e).await),
    };

    if let Some((from, to)) = report.upgrade.transition {
        let (type_, reason) = match to {
            UpgradePhase::Failed => (EventType::Warning, "UpgradeFailed"),
            UpgradePhase::Succeeded => (EventType::Normal, "UpgradeSucceeded"),
            _ => (EventType::Normal, "UpgradeProgress"),
        };
        publish_event(
            ctx,
            instance,
            type_,
            reason,
            "Upgrade",
            Some(
                report
                    .upgrade
                    .status
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Upgrade phase changed from {from} to {to}")),
            ),
        )
        .await;
    }

    if report.previous_phase.as_ref() != Some(&report.phase) {
        let prev = report
            .previous_phase
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_default();
        let phase = &report.phase;
        info!(%name, from = %prev, to = %phase, "phase changed");
        publish_event(
            ctx,
            instance,
            EventType::Normal,
            "PhaseChanged",
            "Reconcile",
            Some(format!("Phase changed from {prev} to {phase}")),
        )
        .await;
    }

    Ok(match report.requeue_after {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

/// Record a failed reconcile in status.  Returns the error for the caller
/// to propagate so the runtime retries with backoff.
async fn fail(instance: &OdooInstance, ctx: &Context, error: Error) -> Error {
    if !error.is_validation() {
        return error;
    }
    let name = instance.name_any();
    let ns = instance.namespace().unwrap_or_default();
    warn!(%name, %error, "instance configuration rejected");

    let message = error.to_string();
    let generation = instance.metadata.generation.unwrap_or(0);
    let patch = json!({
        "status": {
            "phase": OdooInstancePhase::Failed,
            "message": message,
            "conditions": phase_to_conditions(&OdooInstancePhase::Failed, generation, Some(&message)),
        }
    });
    if let Err(e) = ctx
        .platform
        .patch_status(&ns, ResourceKind::OdooInstance, &name, &patch)
        .await
    {
        warn!(%name, %e, "failed to record failure in status");
    }
    publish_event(
        ctx,
        instance,
        EventType::Warning,
        "ReconcileFailed",
        "Reconcile",
        Some(message),
    )
    .await;
    error
}

// ── Cleanup (finalizer) ──────────────────────────────────────────────────────

async fn cleanup_instance(instance: &OdooInstance, ctx: &Context) -> Result<Action> {
    let name = instance.name_any();
    info!(%name, ns = ?instance.namespace(), "cleaning up OdooInstance");

    let cfg = match resolve_config(instance, ctx).await {
        Ok(cfg) => cfg,
        Err(e) => {
            // Owner references still remove the Kubernetes children.
            warn!(%name, %e, "cannot resolve configuration, skipping teardown");
            publish_event(
                ctx,
                instance,
                EventType::Warning,
                "CleanupSkipped",
                "Finalize",
                Some(format!("Teardown skipped: {e}")),
            )
            .await;
            return Ok(Action::await_change());
        }
    };

    InstanceController::new(scope_for(cfg, ctx))
        .dispatch(LifecycleEvent::Deleted, None)
        .await?;
    publish_event(
        ctx,
        instance,
        EventType::Normal,
        "Cleanup",
        "Finalize",
        Some("Instance resources torn down".to_string()),
    )
    .await;
    Ok(Action::await_change())
}

/// Maps an OdooInstancePhase to conditions that UIs such as Rancher and
/// Lens interpret well.
pub fn phase_to_conditions(
    phase: &OdooInstancePhase,
    generation: i64,
    detail: Option<&str>,
) -> Vec<Condition> {
    use OdooInstancePhase::*;

    let (ready_status, message) = match phase {
        Ready => ("True", "All resources converged"),
        Provisioning => ("False", "Creating child resources"),
        Upgrading => ("False", "Module upgrade in progress"),
        Failed => ("False", detail.unwrap_or("Reconciliation failed")),
    };
    let progressing = matches!(phase, Provisioning | Upgrading);

    let now = Time(chrono::Utc::now());
    let reason = phase.to_string();

    vec![
        Condition {
            type_: "Ready".to_string(),
            status: ready_status.to_string(),
            reason: reason.clone(),
            message: message.to_string(),
            observed_generation: Some(generation),
            last_transition_time: now.clone(),
        },
        Condition {
            type_: "Progressing".to_string(),
            status: if progressing { "True" } else { "False" }.to_string(),
            reason,
            message: message.to_string(),
            observed_generation: Some(generation),
            last_transition_time: now,
        },
    ]
}
