//! Declarative state machine for module upgrades.
//!
//! The upgrade job is created by the pipeline (see [`super::upgrade_job`]);
//! this machine only observes it.  Transitions are a static table of
//! `(from, to, guard, actions)`.  Guards are pure functions over an
//! [`UpgradeSnapshot`] gathered once per reconcile; actions fire on the edge
//! and build the new `status.upgrade`.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::UpgradeRequest;
use crate::controller::handler::{Scope, SiblingGate};
use crate::controller::upgrade_job::{
    job_outcome, unfinished_upgrade_job, upgrade_job_name, GitSyncGate, JobOutcome,
};
use crate::crd::odoo_instance::{UpgradePhase, UpgradeStatus};
use crate::error::Result;
use crate::helpers::utc_now_rfc3339;
use crate::platform::{object_name, ResourceKind};

// ── UpgradeSnapshot ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedJob {
    pub name: String,
    pub outcome: JobOutcome,
}

/// Point-in-time view of everything the guards look at.
#[derive(Clone, Debug, Default)]
pub struct UpgradeSnapshot {
    pub phase: UpgradePhase,
    /// Valid request currently in the spec.
    pub requested: Option<UpgradeRequest>,
    /// Request recorded when the current attempt was picked up.
    pub recorded: Option<UpgradeRequest>,
    pub gate_held: bool,
    pub job: Option<ObservedJob>,
}

impl UpgradeSnapshot {
    /// All reads happen here; guard evaluation afterwards is synchronous.
    pub async fn gather(scope: &Scope, status: Option<&UpgradeStatus>) -> Result<Self> {
        let phase = status.map(|s| s.phase).unwrap_or_default();
        let requested = scope.instance.valid_upgrade().cloned();
        let recorded = status.and_then(|s| s.request.clone());

        let tracked = status
            .filter(|_| matches!(phase, UpgradePhase::Pending | UpgradePhase::Running))
            .and_then(|s| s.job_name.clone());

        let raw_job = match (&tracked, &requested) {
            (Some(name), _) => read_job(scope, name).await?,
            (None, Some(_)) => match unfinished_upgrade_job(scope).await? {
                Some(job) => Some(job),
                None => read_job(scope, &upgrade_job_name(&scope.instance)).await?,
            },
            (None, None) => None,
        };
        let job = raw_job.map(|j| ObservedJob {
            name: object_name(&j).unwrap_or_default().to_string(),
            outcome: job_outcome(&j),
        });

        let gate_held = if requested.is_some() && job.is_none() {
            GitSyncGate::new(scope.clone()).is_held().await?
        } else {
            false
        };

        Ok(Self {
            phase,
            requested,
            recorded,
            gate_held,
            job,
        })
    }

    fn requested(&self) -> bool {
        self.requested.is_some()
    }

    fn job_is(&self, outcome: JobOutcome) -> bool {
        self.job.as_ref().is_some_and(|j| j.outcome == outcome)
    }

    fn request_changed(&self) -> bool {
        self.requested != self.recorded
    }
}

async fn read_job(scope: &Scope, name: &str) -> Result<Option<Value>> {
    scope
        .platform
        .read(scope.namespace(), ResourceKind::Job, name)
        .await
}

// ── Transition actions ──────────────────────────────────────────────────────

/// One-shot actions that fire on specific edges (the "/" in UML state
/// diagrams).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionAction {
    /// Record the observed job and the request it runs.
    TrackJob,
    RecordSuccess,
    RecordFailure,
    /// Merge-patch `spec.upgrade` to null.
    ClearUpgradeRequest,
    NoteJobLost,
}

async fn execute_action(
    action: TransitionAction,
    scope: &Scope,
    snapshot: &UpgradeSnapshot,
    status: &mut UpgradeStatus,
) -> Result<()> {
    use TransitionAction::*;
    let name = scope.name();

    match action {
        TrackJob => {
            let job_name = snapshot.job.as_ref().map(|j| j.name.clone());
            if status.job_name != job_name || status.start_time.is_none() {
                status.start_time = Some(utc_now_rfc3339());
            }
            status.job_name = job_name;
            status.request = snapshot.requested.clone();
            status.completion_time = None;
            status.message = None;
        }
        RecordSuccess => {
            status.completion_time = Some(utc_now_rfc3339());
            status.message = status
                .request
                .as_ref()
                .map(|r| format!("upgraded {} on {}", r.modules.join(","), r.database));
        }
        RecordFailure => {
            let job = status.job_name.clone().unwrap_or_default();
            warn!(%name, %job, "upgrade job failed; spec.upgrade left in place");
            status.completion_time = Some(utc_now_rfc3339());
            status.message = Some(format!("upgrade job {job} failed"));
        }
        ClearUpgradeRequest => {
            // Only clear what the job actually ran.
            if scope.instance.upgrade.is_some() && scope.instance.upgrade == status.request {
                scope
                    .platform
                    .patch(
                        scope.namespace(),
                        ResourceKind::OdooInstance,
                        name,
                        &json!({"spec": {"upgrade": null}}),
                    )
                    .await?;
                info!(%name, "upgrade complete, cleared spec.upgrade");
            } else {
                info!(%name, "spec.upgrade changed during the upgrade, not clearing");
            }
        }
        NoteJobLost => {
            let job = status.job_name.take().unwrap_or_default();
            warn!(%name, %job, "upgrade job disappeared before finishing");
            status.message = Some(format!("upgrade job {job} no longer exists"));
        }
    }
    Ok(())
}

// ── Transition table ────────────────────────────────────────────────────────

/// A single row in the transition table.
pub struct Transition {
    pub from: UpgradePhase,
    pub to: UpgradePhase,
    pub guard: fn(&UpgradeSnapshot) -> bool,
    pub guard_name: &'static str,
    pub actions: &'static [TransitionAction],
}

use TransitionAction::*;
use UpgradePhase::*;

/// The complete upgrade transition table.  First matching guard wins.
pub static TRANSITIONS: &[Transition] = &[
    // ── Idle ────────────────────────────────────────────────
    Transition {
        from: Idle,
        to: Succeeded,
        guard: |s| s.requested() && s.job_is(JobOutcome::Succeeded),
        guard_name: "requested && job_succeeded",
        actions: &[TrackJob, RecordSuccess, ClearUpgradeRequest],
    },
    Transition {
        from: Idle,
        to: Failed,
        guard: |s| s.requested() && s.job_is(JobOutcome::Failed),
        guard_name: "requested && job_failed",
        actions: &[TrackJob, RecordFailure],
    },
    Transition {
        from: Idle,
        to: Running,
        guard: |s| s.requested() && s.job_is(JobOutcome::Running),
        guard_name: "requested && job_active",
        actions: &[TrackJob],
    },
    Transition {
        from: Idle,
        to: Pending,
        guard: |s| s.requested() && s.job_is(JobOutcome::Pending),
        guard_name: "requested && job_created",
        actions: &[TrackJob],
    },
    Transition {
        from: Idle,
        to: GateWait,
        guard: |s| s.requested() && s.job.is_none() && s.gate_held,
        guard_name: "requested && git_sync_running",
        actions: &[],
    },
    // ── GateWait ────────────────────────────────────────────
    Transition {
        from: GateWait,
        to: Idle,
        guard: |s| !s.requested(),
        guard_name: "!requested",
        actions: &[],
    },
    Transition {
        from: GateWait,
        to: Running,
        guard: |s| s.job_is(JobOutcome::Running),
        guard_name: "job_active",
        actions: &[TrackJob],
    },
    Transition {
        from: GateWait,
        to: Pending,
        guard: |s| s.job_is(JobOutcome::Pending),
        guard_name: "job_created",
        actions: &[TrackJob],
    },
    // ── Pending ─────────────────────────────────────────────
    Transition {
        from: Pending,
        to: Succeeded,
        guard: |s| s.job_is(JobOutcome::Succeeded),
        guard_name: "job_succeeded",
        actions: &[RecordSuccess, ClearUpgradeRequest],
    },
    Transition {
        from: Pending,
        to: Failed,
        guard: |s| s.job_is(JobOutcome::Failed),
        guard_name: "job_failed",
        actions: &[RecordFailure],
    },
    Transition {
        from: Pending,
        to: Running,
        guard: |s| s.job_is(JobOutcome::Running),
        guard_name: "job_active",
        actions: &[],
    },
    Transition {
        from: Pending,
        to: Idle,
        guard: |s| s.job.is_none(),
        guard_name: "job_missing",
        actions: &[NoteJobLost],
    },
    // ── Running ─────────────────────────────────────────────
    Transition {
        from: Running,
        to: Succeeded,
        guard: |s| s.job_is(JobOutcome::Succeeded),
        guard_name: "job_succeeded",
        actions: &[RecordSuccess, ClearUpgradeRequest],
    },
    Transition {
        from: Running,
        to: Failed,
        guard: |s| s.job_is(JobOutcome::Failed),
        guard_name: "job_failed",
        actions: &[RecordFailure],
    },
    Transition {
        from: Running,
        to: Idle,
        guard: |s| s.job.is_none(),
        guard_name: "job_missing",
        actions: &[NoteJobLost],
    },
    // ── Succeeded / Failed ──────────────────────────────────
    // Settled until the request is cleared or replaced.
    Transition {
        from: Succeeded,
        to: Idle,
        guard: |s| !s.requested() || s.request_changed(),
        guard_name: "!requested || request_changed",
        actions: &[],
    },
    Transition {
        from: Failed,
        to: Idle,
        guard: |s| !s.requested() || s.request_changed(),
        guard_name: "!requested || request_changed",
        actions: &[],
    },
];

/// First transition out of the snapshot's phase whose guard holds.
pub fn next_transition(snapshot: &UpgradeSnapshot) -> Option<&'static Transition> {
    TRANSITIONS
        .iter()
        .filter(|t| t.from == snapshot.phase)
        .find(|t| (t.guard)(snapshot))
}

// ── State machine runner ────────────────────────────────────────────────────

/// Outcome of one machine cycle.
#[derive(Clone, Debug)]
pub struct UpgradeTick {
    pub status: UpgradeStatus,
    /// `(from, to)` when an edge fired.
    pub transition: Option<(UpgradePhase, UpgradePhase)>,
}

/// Explicit nulls so the merge patch also clears fields.
fn status_patch(status: &UpgradeStatus) -> Value {
    json!({"status": {"upgrade": {
        "phase": status.phase,
        "jobName": status.job_name,
        "request": status.request,
        "startTime": status.start_time,
        "completionTime": status.completion_time,
        "message": status.message,
    }}})
}

/// Run one cycle: gather, evaluate, fire actions and persist the new phase.
pub async fn run_upgrade_machine(
    scope: &Scope,
    current: Option<&UpgradeStatus>,
) -> Result<UpgradeTick> {
    let snapshot = UpgradeSnapshot::gather(scope, current).await?;
    let mut status = current.cloned().unwrap_or_default();

    let Some(t) = next_transition(&snapshot) else {
        return Ok(UpgradeTick {
            status,
            transition: None,
        });
    };

    info!(
        name = %scope.name(),
        from = %t.from,
        to = %t.to,
        guard = t.guard_name,
        "upgrade transition"
    );
    for action in t.actions {
        execute_action(*action, scope, &snapshot, &mut status).await?;
    }
    status.phase = t.to;

    scope
        .platform
        .patch_status(
            scope.namespace(),
            ResourceKind::OdooInstance,
            scope.name(),
            &status_patch(&status),
        )
        .await?;

    Ok(UpgradeTick {
        status,
        transition: Some((t.from, t.to)),
    })
}
