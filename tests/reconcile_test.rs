//! Multi-pass reconciles against the in-memory platform: each pass reads the
//! stored instance back, the way the controller sees it after a watch event.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use common::{instance, job, scope, seed_instance, with_upgrade, NAME, NS};
use odoo_instance_operator::controller::odoo_instance::{apply_instance, ApplyReport};
use odoo_instance_operator::crd::odoo_instance::{
    OdooInstance, OdooInstancePhase, UpgradePhase, UpgradeSpec,
};
use odoo_instance_operator::platform::memory::InMemoryPlatform;
use odoo_instance_operator::platform::ResourceKind;

const POLL: Duration = Duration::from_secs(10);

struct Cluster {
    platform: Arc<InMemoryPlatform>,
}

impl Cluster {
    fn with(inst: OdooInstance) -> Self {
        let platform = Arc::new(InMemoryPlatform::new());
        seed_instance(&platform, &inst);
        Self { platform }
    }

    fn stored(&self) -> OdooInstance {
        let raw = self
            .platform
            .get(NS, ResourceKind::OdooInstance, NAME)
            .unwrap();
        serde_json::from_value(raw).unwrap()
    }

    async fn pass(&self) -> ApplyReport {
        let inst = self.stored();
        apply_instance(&inst, &scope(self.platform.clone(), &inst), POLL)
            .await
            .unwrap()
    }

    /// Passes until one asks for something other than an immediate requeue.
    async fn settle(&self) -> ApplyReport {
        for _ in 0..8 {
            let report = self.pass().await;
            if report.requeue_after != Some(Duration::ZERO) {
                return report;
            }
        }
        panic!("instance never settled");
    }

    /// A user edit: the API server bumps the generation.
    fn edit(&self, change: impl FnOnce(&mut OdooInstance)) {
        let mut inst = self.stored();
        change(&mut inst);
        inst.metadata.generation = inst.metadata.generation.map(|g| g + 1);
        seed_instance(&self.platform, &inst);
    }

    fn set_job_status(&self, name: &str, status: Value) {
        let mut j = self.platform.get(NS, ResourceKind::Job, name).unwrap();
        j["status"] = status;
        self.platform.insert(NS, ResourceKind::Job, j);
    }

    fn upgrade_jobs(&self) -> Vec<String> {
        self.platform
            .names(NS, ResourceKind::Job)
            .into_iter()
            .filter(|n| n.contains("-upgrade-"))
            .collect()
    }

    fn job_args(&self, name: &str) -> Value {
        self.platform.get(NS, ResourceKind::Job, name).unwrap()["spec"]["template"]["spec"]
            ["containers"][0]["args"]
            .clone()
    }

    fn upgrade_phase(&self) -> Option<UpgradePhase> {
        self.stored().status?.upgrade.map(|u| u.phase)
    }
}

fn request(database: &str, modules: &[&str]) -> UpgradeSpec {
    UpgradeSpec {
        database: database.into(),
        modules: modules.iter().map(|m| m.to_string()).collect(),
    }
}

#[tokio::test]
async fn plain_instance_is_provisioned_then_left_alone() {
    let cluster = Cluster::with(instance(1));

    let report = cluster.pass().await;
    assert_eq!(report.phase, OdooInstancePhase::Ready);
    assert_eq!(report.observed_generation, Some(1));
    assert_eq!(report.requeue_after, None);
    assert!(cluster.upgrade_jobs().is_empty());

    cluster.platform.clear_calls();
    let report = cluster.pass().await;
    assert_eq!(report.previous_phase, Some(OdooInstancePhase::Ready));
    assert!(cluster.platform.writes().is_empty());
}

#[tokio::test]
async fn instance_created_with_upgrade_runs_it() {
    let cluster = Cluster::with(with_upgrade(instance(1), "shop_db", &["sale"]));

    let report = cluster.pass().await;
    assert_eq!(report.observed_generation, Some(1));
    assert_eq!(
        report.upgrade.transition,
        Some((UpgradePhase::Idle, UpgradePhase::Pending))
    );
    assert_eq!(report.phase, OdooInstancePhase::Upgrading);
    assert_eq!(cluster.upgrade_jobs(), vec!["shop-upgrade-1".to_string()]);
    assert!(cluster
        .platform
        .get(NS, ResourceKind::Deployment, NAME)
        .is_some());

    let report = cluster.settle().await;
    assert_eq!(report.requeue_after, Some(POLL));
    assert_eq!(cluster.upgrade_phase(), Some(UpgradePhase::Pending));

    cluster.set_job_status("shop-upgrade-1", json!({"succeeded": 1}));
    let report = cluster.settle().await;

    assert_eq!(report.phase, OdooInstancePhase::Ready);
    assert_eq!(report.requeue_after, None);
    assert!(cluster.stored().spec.upgrade.is_none());
    assert_eq!(cluster.upgrade_jobs(), vec!["shop-upgrade-1".to_string()]);
}

#[tokio::test]
async fn request_edited_mid_run_starts_after_the_first_finishes() {
    let cluster = Cluster::with(instance(1));
    cluster.pass().await;

    cluster.edit(|i| i.spec.upgrade = Some(request("shop_db", &["sale"])));
    let report = cluster.pass().await;
    assert_eq!(report.observed_generation, Some(2));
    assert_eq!(cluster.upgrade_jobs(), vec!["shop-upgrade-2".to_string()]);
    cluster.set_job_status("shop-upgrade-2", json!({"active": 1}));
    cluster.settle().await;
    assert_eq!(cluster.upgrade_phase(), Some(UpgradePhase::Running));

    // While the first job runs no second one is started.
    cluster.edit(|i| i.spec.upgrade = Some(request("shop_db", &["sale", "stock"])));
    let report = cluster.settle().await;
    assert_eq!(report.observed_generation, Some(3));
    assert_eq!(report.requeue_after, Some(POLL));
    assert_eq!(cluster.upgrade_jobs(), vec!["shop-upgrade-2".to_string()]);

    cluster.set_job_status("shop-upgrade-2", json!({"succeeded": 1}));
    let report = cluster.settle().await;

    assert_eq!(
        cluster.upgrade_jobs(),
        vec!["shop-upgrade-2".to_string(), "shop-upgrade-3".to_string()]
    );
    assert_eq!(
        cluster.job_args("shop-upgrade-3"),
        json!(["-d", "shop_db", "-u", "sale,stock", "--no-http", "--stop-after-init"])
    );
    assert_eq!(report.upgrade.status.phase, UpgradePhase::Pending);
    assert_eq!(report.upgrade.status.job_name.as_deref(), Some("shop-upgrade-3"));
    // The edited request survives the first job's success.
    assert_eq!(
        cluster.stored().spec.upgrade,
        Some(request("shop_db", &["sale", "stock"]))
    );

    cluster.set_job_status("shop-upgrade-3", json!({"succeeded": 1}));
    let report = cluster.settle().await;
    assert_eq!(report.requeue_after, None);
    assert!(cluster.stored().spec.upgrade.is_none());
    assert_eq!(
        report.upgrade.status.message.as_deref(),
        Some("upgraded sale,stock on shop_db")
    );
}

#[tokio::test]
async fn held_gate_defers_until_git_sync_finishes() {
    let cluster = Cluster::with(instance(1));
    cluster.pass().await;
    cluster.platform.insert(
        NS,
        ResourceKind::Job,
        job("shop-git-sync-1", "git-sync", json!({"active": 1})),
    );

    cluster.edit(|i| i.spec.upgrade = Some(request("shop_db", &["sale"])));
    let report = cluster.settle().await;

    assert_eq!(cluster.upgrade_phase(), Some(UpgradePhase::GateWait));
    assert_eq!(report.phase, OdooInstancePhase::Upgrading);
    assert_eq!(report.requeue_after, Some(POLL));
    // The generation stays unobserved so the update is retried.
    assert_eq!(report.observed_generation, Some(1));
    assert!(cluster.upgrade_jobs().is_empty());

    cluster.set_job_status("shop-git-sync-1", json!({"succeeded": 1}));
    let report = cluster.pass().await;

    assert_eq!(report.observed_generation, Some(2));
    assert_eq!(
        report.upgrade.transition,
        Some((UpgradePhase::GateWait, UpgradePhase::Pending))
    );
    assert_eq!(cluster.upgrade_jobs(), vec!["shop-upgrade-2".to_string()]);
}

#[tokio::test]
async fn failed_upgrade_waits_for_a_new_request() {
    let cluster = Cluster::with(with_upgrade(instance(1), "shop_db", &["sale"]));
    cluster.pass().await;
    cluster.set_job_status("shop-upgrade-1", json!({"failed": 3}));

    let report = cluster.settle().await;
    assert_eq!(report.upgrade.status.phase, UpgradePhase::Failed);
    assert_eq!(report.requeue_after, None);
    assert_eq!(report.phase, OdooInstancePhase::Ready);
    assert!(cluster.stored().spec.upgrade.is_some());

    // Resyncs neither retry nor clear the failed request.
    cluster.platform.clear_calls();
    cluster.pass().await;
    assert!(cluster.platform.writes().is_empty());
    assert_eq!(cluster.upgrade_jobs(), vec!["shop-upgrade-1".to_string()]);

    cluster.edit(|i| i.spec.upgrade = Some(request("shop_db", &["sale", "account"])));
    let report = cluster.pass().await;
    assert_eq!(
        report.upgrade.transition,
        Some((UpgradePhase::Failed, UpgradePhase::Idle))
    );
    assert_eq!(
        cluster.upgrade_jobs(),
        vec!["shop-upgrade-1".to_string(), "shop-upgrade-2".to_string()]
    );

    let report = cluster.settle().await;
    assert_eq!(report.upgrade.status.job_name.as_deref(), Some("shop-upgrade-2"));
    assert_eq!(report.upgrade.status.phase, UpgradePhase::Pending);

    cluster.set_job_status("shop-upgrade-2", json!({"succeeded": 1}));
    let report = cluster.settle().await;
    assert_eq!(report.requeue_after, None);
    assert!(cluster.stored().spec.upgrade.is_none());
}
