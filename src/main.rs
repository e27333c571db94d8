//! odoo-instance-operator: reconciles OdooInstance resources into the
//! Kubernetes objects and Postgres role each instance needs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::runtime::events::Reporter;
use kube::Client;
use tracing::info;
use warp::Filter;

use odoo_instance_operator::clusters::{ClusterRegistry, FileClusterSource, DEFAULT_CLUSTERS_FILE};
use odoo_instance_operator::config::{
    Defaults, FileDefaults, DEFAULT_DEFAULTS_FILE, FALLBACK_ODOO_IMAGE, FALLBACK_STORAGE_CLASS,
    FALLBACK_STORAGE_SIZE,
};
use odoo_instance_operator::controller::odoo_instance::{self, Context};
use odoo_instance_operator::platform::KubePlatformClient;
use odoo_instance_operator::postgres::PgPostgresManager;

#[derive(Parser, Debug)]
#[command(
    name = "odoo-instance-operator",
    about = "Kubernetes operator for Odoo instances"
)]
struct Args {
    /// Odoo image used when neither the instance nor the defaults file set one.
    #[arg(long, default_value = FALLBACK_ODOO_IMAGE, env = "DEFAULT_ODOO_IMAGE")]
    default_odoo_image: String,

    /// Fallback StorageClass for filestore PVCs.
    #[arg(long, default_value = FALLBACK_STORAGE_CLASS, env = "DEFAULT_STORAGE_CLASS")]
    default_storage_class: String,

    /// Fallback filestore size.
    #[arg(long, default_value = FALLBACK_STORAGE_SIZE, env = "DEFAULT_STORAGE_SIZE")]
    default_storage_size: String,

    /// Fallback cert-manager ClusterIssuer.
    #[arg(long, default_value = "", env = "DEFAULT_INGRESS_ISSUER")]
    default_ingress_issuer: String,

    /// YAML file with operator-wide instance defaults.
    #[arg(long, default_value = DEFAULT_DEFAULTS_FILE, env = "INSTANCE_DEFAULTS_FILE")]
    instance_defaults_file: String,

    /// YAML file describing the available Postgres clusters.
    #[arg(long, default_value = DEFAULT_CLUSTERS_FILE, env = "POSTGRES_CLUSTERS_FILE")]
    postgres_clusters_file: String,

    /// Namespace where the operator is deployed (for reading shared secrets).
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    operator_namespace: String,

    /// Seconds between checks of an outstanding upgrade.
    #[arg(long, default_value = "10", env = "UPGRADE_CHECK_INTERVAL")]
    upgrade_check_interval: u64,

    /// Bind address for health probe endpoints (/healthz, /readyz).
    #[arg(long, default_value = ":8081", env = "HEALTH_PROBE_BIND_ADDRESS")]
    health_probe_bind_address: String,

    /// Log format: "text" for human-readable, "json" for structured.
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,
}

impl Args {
    fn fallback_defaults(&self) -> Defaults {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Defaults {
            odoo_image: non_empty(&self.default_odoo_image),
            filestore_size: non_empty(&self.default_storage_size),
            storage_class: non_empty(&self.default_storage_class),
            ingress_issuer: non_empty(&self.default_ingress_issuer),
            ..Default::default()
        }
    }
}

/// ":8081" binds every interface.
fn parse_bind_address(raw: &str) -> anyhow::Result<SocketAddr> {
    let addr = raw
        .strip_prefix(':')
        .map(|port| format!("0.0.0.0:{port}"))
        .unwrap_or_else(|| raw.to_string());
    addr.parse()
        .with_context(|| format!("invalid --health-probe-bind-address {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn,hyper=warn,tower=warn,warp=warn".into());

    if args.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let health_addr = parse_bind_address(&args.health_probe_bind_address)?;
    let client = Client::try_default().await?;

    info!(
        image = %args.default_odoo_image,
        ns = %args.operator_namespace,
        clusters = %args.postgres_clusters_file,
        "starting odoo-instance-operator"
    );

    let defaults = FileDefaults::new(&args.instance_defaults_file, args.fallback_defaults());
    let ctx = Arc::new(Context {
        client: client.clone(),
        platform: Arc::new(KubePlatformClient::new(client)),
        defaults: Arc::new(defaults),
        clusters: ClusterRegistry::new(FileClusterSource::new(&args.postgres_clusters_file)),
        postgres: Arc::new(PgPostgresManager),
        operator_namespace: args.operator_namespace,
        reporter: Reporter {
            controller: "odoo-instance-operator".into(),
            instance: std::env::var("POD_NAME").ok(),
        },
        upgrade_check_interval: Duration::from_secs(args.upgrade_check_interval.max(1)),
    });

    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let health_routes = healthz.or(readyz);

    tokio::select! {
        _ = odoo_instance::run(ctx.clone()) => {},
        _ = warp::serve(health_routes).run(health_addr) => {},
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}
