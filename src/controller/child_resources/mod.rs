//! Child resources of an OdooInstance.
//!
//! One [`ManagedResource`](super::handler::ManagedResource) per dependent
//! object, plus the postgres role which lives outside Kubernetes.  The
//! pipeline wraps each of them in [`Converge`](super::handler::Converge).

pub mod network;
pub mod postgres_role;
pub mod pvc;
pub mod secrets;
pub mod workload;

pub use network::{IngressRoute, RouteFlavor, TlsCertificate};
pub use postgres_role::PostgresRole;
pub use pvc::StorageClaim;
pub use secrets::{MirroredSecret, OdooUserSecret};
pub use workload::{OdooConf, OdooDeployment, OdooService};
