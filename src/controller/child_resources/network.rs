//! TLS certificate and Traefik routes in front of the Odoo Service.
//!
//! Neither cert-manager nor Traefik ship Rust types, so the bodies are
//! written as JSON.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::workload::{HTTP_PORT, WEBSOCKET_PORT};
use crate::config::InstanceConfig;
use crate::controller::handler::{ManagedResource, Scope};
use crate::controller::helpers::{child_meta, to_body, TLS_SUFFIX};
use crate::error::Result;
use crate::helpers::child_name;
use crate::platform::ResourceKind;

fn tls_secret_name(cfg: &InstanceConfig) -> String {
    child_name(&cfg.name, TLS_SUFFIX)
}

/// `Host(`a`) || Host(`b`)`
pub fn host_rule(hosts: &[String]) -> String {
    hosts
        .iter()
        .map(|h| format!("Host(`{h}`)"))
        .collect::<Vec<_>>()
        .join(" || ")
}

// ── Certificate ───────────────────────────────────────────────────────────────

/// cert-manager Certificate covering every ingress host.
pub struct TlsCertificate {
    scope: Scope,
}

impl TlsCertificate {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl ManagedResource for TlsCertificate {
    fn label(&self) -> &'static str {
        "tls-certificate"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Certificate
    }

    fn resource_name(&self) -> String {
        tls_secret_name(&self.scope.instance)
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn desired_body(&self) -> Result<Value> {
        let cfg = &self.scope.instance;
        let ar = ResourceKind::Certificate.api_resource();
        Ok(json!({
            "apiVersion": ar.api_version,
            "kind": ar.kind,
            "metadata": to_body(&child_meta(cfg, &self.resource_name(), "ingress"))?,
            "spec": {
                "secretName": tls_secret_name(cfg),
                "dnsNames": cfg.ingress.hosts,
                "issuerRef": {
                    "name": cfg.ingress.issuer,
                    "kind": "ClusterIssuer",
                },
            },
        }))
    }
}

// ── IngressRoutes ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteFlavor {
    /// Plain HTTP on the `web` entry point.
    Http,
    /// HTTPS on `websecure`.
    Https,
    /// `/websocket` on `websecure`, to the longpolling port.
    Websocket,
}

impl RouteFlavor {
    fn suffix(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Websocket => "websocket",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Http => "ingress-route-http",
            Self::Https => "ingress-route-https",
            Self::Websocket => "ingress-route-websocket",
        }
    }

    fn entry_point(self) -> &'static str {
        match self {
            Self::Http => "web",
            Self::Https | Self::Websocket => "websecure",
        }
    }

    fn port(self) -> i32 {
        match self {
            Self::Websocket => WEBSOCKET_PORT,
            Self::Http | Self::Https => HTTP_PORT,
        }
    }
}

pub struct IngressRoute {
    scope: Scope,
    flavor: RouteFlavor,
}

impl IngressRoute {
    pub fn new(scope: Scope, flavor: RouteFlavor) -> Self {
        Self { scope, flavor }
    }
}

#[async_trait]
impl ManagedResource for IngressRoute {
    fn label(&self) -> &'static str {
        self.flavor.label()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::IngressRoute
    }

    fn resource_name(&self) -> String {
        child_name(self.scope.name(), self.flavor.suffix())
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn desired_body(&self) -> Result<Value> {
        let cfg = &self.scope.instance;
        let ar = ResourceKind::IngressRoute.api_resource();

        let mut rule = host_rule(&cfg.ingress.hosts);
        if self.flavor == RouteFlavor::Websocket {
            rule = format!("({rule}) && PathPrefix(`/websocket`)");
        }

        let mut spec = json!({
            "entryPoints": [self.flavor.entry_point()],
            "routes": [{
                "kind": "Rule",
                "match": rule,
                "services": [{
                    "kind": "Service",
                    "name": cfg.name,
                    "namespace": cfg.namespace,
                    "passHostHeader": true,
                    "port": self.flavor.port(),
                    "scheme": "http",
                }],
            }],
        });
        if self.flavor != RouteFlavor::Http {
            spec["tls"] = json!({"secretName": tls_secret_name(cfg)});
        }

        Ok(json!({
            "apiVersion": ar.api_version,
            "kind": ar.kind,
            "metadata": to_body(&child_meta(cfg, &self.resource_name(), "ingress"))?,
            "spec": spec,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::handler::tests::scope_with;
    use crate::platform::memory::InMemoryPlatform;
    use std::sync::Arc;

    fn scope() -> Scope {
        scope_with(Arc::new(InMemoryPlatform::new()))
    }

    #[test]
    fn host_rule_joins_hosts() {
        let hosts = vec!["a.example".to_string(), "b.example".to_string()];
        assert_eq!(host_rule(&hosts), "Host(`a.example`) || Host(`b.example`)");
    }

    #[test]
    fn websocket_route_targets_longpolling_port() {
        let body = IngressRoute::new(scope(), RouteFlavor::Websocket)
            .desired_body()
            .unwrap();
        assert_eq!(body["metadata"]["name"], "shop-websocket");
        assert_eq!(body["spec"]["entryPoints"][0], "websecure");
        assert_eq!(
            body["spec"]["routes"][0]["match"],
            "(Host(`shop.example.com`)) && PathPrefix(`/websocket`)"
        );
        assert_eq!(body["spec"]["routes"][0]["services"][0]["port"], 8072);
        assert_eq!(body["spec"]["tls"]["secretName"], "shop-tls");
    }

    #[test]
    fn http_route_has_no_tls() {
        let body = IngressRoute::new(scope(), RouteFlavor::Http)
            .desired_body()
            .unwrap();
        assert_eq!(body["spec"]["entryPoints"][0], "web");
        assert!(body["spec"].get("tls").is_none());
    }

    #[test]
    fn certificate_covers_hosts_with_cluster_issuer() {
        let body = TlsCertificate::new(scope()).desired_body().unwrap();
        assert_eq!(body["apiVersion"], "cert-manager.io/v1");
        assert_eq!(body["spec"]["dnsNames"][0], "shop.example.com");
        assert_eq!(body["spec"]["issuerRef"]["name"], "letsencrypt");
        assert_eq!(body["spec"]["issuerRef"]["kind"], "ClusterIssuer");
    }
}
