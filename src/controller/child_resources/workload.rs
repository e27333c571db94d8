use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
    core::v1::{
        ConfigMap, Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
        Service, ServicePort, ServiceSpec,
    },
};
use k8s_openapi::apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString};
use kube::api::ObjectMeta;
use serde_json::{json, Value};
use tracing::info;

use crate::config::InstanceConfig;
use crate::controller::handler::{ManagedResource, Scope};
use crate::controller::helpers::{
    child_meta, db_env, image_pull_secrets, odoo_security_context, odoo_volume_mounts,
    odoo_volumes, to_body, ODOO_CONF_SUFFIX,
};
use crate::crd::odoo_instance::DeploymentStrategyType;
use crate::error::Result;
use crate::helpers::{build_odoo_conf, child_name, sha256_hex, OdooConfInput};
use crate::platform::ResourceKind;

pub const HTTP_PORT: i32 = 8069;
pub const WEBSOCKET_PORT: i32 = 8072;
pub const CONF_HASH_ANNOTATION: &str = "bemade.org/odoo-conf-hash";

/// Rendered odoo.conf for the instance.
pub fn odoo_conf(cfg: &InstanceConfig) -> String {
    build_odoo_conf(&OdooConfInput {
        admin_password: &cfg.admin_password,
        db_host: &cfg.database.cluster.host,
        db_port: cfg.database.cluster.port,
        db_name: &cfg.database.name,
        extra: &cfg.config_options,
    })
}

fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

// ── ConfigMap ─────────────────────────────────────────────────────────────────

/// `<name>-odoo-conf`, mounted at /etc/odoo.
pub struct OdooConf {
    scope: Scope,
}

impl OdooConf {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl ManagedResource for OdooConf {
    fn label(&self) -> &'static str {
        "odoo-conf"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::ConfigMap
    }

    fn resource_name(&self) -> String {
        child_name(self.scope.name(), ODOO_CONF_SUFFIX)
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn desired_body(&self) -> Result<Value> {
        let cfg = &self.scope.instance;
        to_body(&ConfigMap {
            metadata: child_meta(cfg, &self.resource_name(), "config"),
            data: Some(BTreeMap::from([("odoo.conf".to_string(), odoo_conf(cfg))])),
            ..Default::default()
        })
    }
}

// ── Deployment ────────────────────────────────────────────────────────────────

/// The Odoo web Deployment, named after the instance.
pub struct OdooDeployment {
    scope: Scope,
}

impl OdooDeployment {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }
}

fn http_probe(path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(HTTP_PORT),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ManagedResource for OdooDeployment {
    fn label(&self) -> &'static str {
        "deployment"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Deployment
    }

    fn resource_name(&self) -> String {
        self.scope.name().to_string()
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn desired_body(&self) -> Result<Value> {
        let cfg = &self.scope.instance;
        let name = &cfg.name;

        let strategy = match cfg.strategy {
            DeploymentStrategyType::Recreate => "Recreate",
            DeploymentStrategyType::RollingUpdate => "RollingUpdate",
        };

        let mut meta = child_meta(cfg, name, "odoo");
        if let Some(labels) = meta.labels.as_mut() {
            labels.extend(app_labels(name));
        }

        let mut pod_labels = meta.labels.clone().unwrap_or_default();
        pod_labels.extend(app_labels(name));

        to_body(&Deployment {
            metadata: meta,
            spec: Some(DeploymentSpec {
                replicas: Some(cfg.replicas),
                selector: LabelSelector {
                    match_labels: Some(app_labels(name)),
                    ..Default::default()
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some(strategy.to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        // Config changes roll the pods.
                        annotations: Some(BTreeMap::from([(
                            CONF_HASH_ANNOTATION.to_string(),
                            sha256_hex(&odoo_conf(cfg)),
                        )])),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        image_pull_secrets: image_pull_secrets(cfg),
                        affinity: cfg.affinity.clone(),
                        tolerations: if cfg.tolerations.is_empty() {
                            None
                        } else {
                            Some(cfg.tolerations.clone())
                        },
                        security_context: Some(odoo_security_context()),
                        volumes: Some(odoo_volumes(cfg)),
                        containers: vec![Container {
                            name: format!("odoo-{name}"),
                            image: Some(cfg.image.clone()),
                            image_pull_policy: Some("IfNotPresent".to_string()),
                            command: Some(vec!["/entrypoint.sh".to_string(), "odoo".to_string()]),
                            env: Some(db_env(cfg)),
                            ports: Some(vec![
                                ContainerPort {
                                    name: Some("http".to_string()),
                                    container_port: HTTP_PORT,
                                    ..Default::default()
                                },
                                ContainerPort {
                                    name: Some("websocket".to_string()),
                                    container_port: WEBSOCKET_PORT,
                                    ..Default::default()
                                },
                            ]),
                            volume_mounts: Some(odoo_volume_mounts(cfg)),
                            resources: cfg.resources.clone(),
                            startup_probe: Some(Probe {
                                initial_delay_seconds: Some(5),
                                period_seconds: Some(10),
                                timeout_seconds: Some(5),
                                failure_threshold: Some(30),
                                ..http_probe("/web/health")
                            }),
                            liveness_probe: Some(Probe {
                                period_seconds: Some(15),
                                timeout_seconds: Some(5),
                                failure_threshold: Some(3),
                                ..http_probe("/web/health")
                            }),
                            readiness_probe: Some(Probe {
                                period_seconds: Some(10),
                                timeout_seconds: Some(5),
                                failure_threshold: Some(3),
                                ..http_probe("/web/health")
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Scale to zero first so Odoo shuts down cleanly before the object and
    /// its ReplicaSets go away.
    async fn delete(&self) -> Result<()> {
        let scope = &self.scope;
        let name = self.resource_name();
        if self.read().await?.is_some() {
            scope
                .platform
                .patch(
                    scope.namespace(),
                    ResourceKind::Deployment,
                    &name,
                    &json!({"spec": {"replicas": 0}}),
                )
                .await?;
            info!(deployment = %name, "scaled to zero");
        }
        scope
            .platform
            .delete(scope.namespace(), ResourceKind::Deployment, &name)
            .await?;
        Ok(())
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

pub struct OdooService {
    scope: Scope,
}

impl OdooService {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl ManagedResource for OdooService {
    fn label(&self) -> &'static str {
        "service"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Service
    }

    fn resource_name(&self) -> String {
        self.scope.name().to_string()
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn desired_body(&self) -> Result<Value> {
        let cfg = &self.scope.instance;
        let name = &cfg.name;
        let mut meta = child_meta(cfg, name, "odoo");
        if let Some(labels) = meta.labels.as_mut() {
            labels.extend(app_labels(name));
        }
        to_body(&Service {
            metadata: meta,
            spec: Some(ServiceSpec {
                selector: Some(app_labels(name)),
                type_: Some("ClusterIP".to_string()),
                ports: Some(vec![
                    ServicePort {
                        name: Some("http".to_string()),
                        port: HTTP_PORT,
                        target_port: Some(IntOrString::Int(HTTP_PORT)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                    ServicePort {
                        name: Some("websocket".to_string()),
                        port: WEBSOCKET_PORT,
                        target_port: Some(IntOrString::Int(WEBSOCKET_PORT)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}
