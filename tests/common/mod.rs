//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use kube::api::ObjectMeta;
use serde_json::{json, Value};

use odoo_instance_operator::clusters::PostgresCluster;
use odoo_instance_operator::config::{Defaults, InstanceConfig};
use odoo_instance_operator::controller::handler::Scope;
use odoo_instance_operator::crd::odoo_instance::{
    FilestoreSpec, IngressSpec, OdooInstance, OdooInstanceSpec, UpgradeSpec,
};
use odoo_instance_operator::platform::memory::InMemoryPlatform;
use odoo_instance_operator::platform::ResourceKind;
use odoo_instance_operator::postgres::NoopPostgresManager;

pub const NS: &str = "prod";
pub const NAME: &str = "shop";

pub fn cluster() -> PostgresCluster {
    PostgresCluster {
        name: "main".into(),
        host: "pg-main.databases.svc".into(),
        port: 5432,
        admin_user: "postgres".into(),
        admin_password: "hunter2".into(),
        is_default: true,
    }
}

/// A minimal instance: one host, default storage, no git project.
pub fn instance(generation: i64) -> OdooInstance {
    OdooInstance {
        metadata: ObjectMeta {
            name: Some(NAME.into()),
            namespace: Some(NS.into()),
            uid: Some("4f1c-77aa".into()),
            generation: Some(generation),
            ..Default::default()
        },
        spec: OdooInstanceSpec {
            image: None,
            image_pull_secret: None,
            admin_password: "admin".into(),
            replicas: 1,
            ingress: IngressSpec {
                hosts: vec!["shop.example.com".into()],
                issuer: Some("letsencrypt".into()),
            },
            resources: None,
            filestore: None,
            config_options: None,
            database: None,
            git_project: None,
            strategy: None,
            upgrade: None,
            affinity: None,
            tolerations: vec![],
        },
        status: None,
    }
}

pub fn with_filestore_size(mut inst: OdooInstance, size: &str) -> OdooInstance {
    inst.spec.filestore = Some(FilestoreSpec {
        storage_size: Some(size.into()),
        storage_class: None,
    });
    inst
}

pub fn with_upgrade(mut inst: OdooInstance, database: &str, modules: &[&str]) -> OdooInstance {
    inst.spec.upgrade = Some(UpgradeSpec {
        database: database.into(),
        modules: modules.iter().map(|m| m.to_string()).collect(),
    });
    inst
}

pub fn resolve(inst: &OdooInstance) -> InstanceConfig {
    InstanceConfig::resolve(inst, &Defaults::default(), cluster()).unwrap()
}

pub fn scope(platform: Arc<InMemoryPlatform>, inst: &OdooInstance) -> Scope {
    Scope {
        platform,
        postgres: Arc::new(NoopPostgresManager),
        instance: Arc::new(resolve(inst)),
        operator_namespace: "operators".into(),
    }
}

/// Store the instance itself so status and spec patches have a target.
pub fn seed_instance(platform: &InMemoryPlatform, inst: &OdooInstance) {
    platform.insert(NS, ResourceKind::OdooInstance, serde_json::to_value(inst).unwrap());
}

pub fn job(name: &str, component: &str, status: Value) -> Value {
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {"name": name, "labels": {
            "app.kubernetes.io/instance": NAME,
            "app.kubernetes.io/component": component,
        }},
        "spec": {"backoffLimit": 2},
        "status": status,
    })
}
