use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The instance spec cannot be turned into a usable configuration.
    #[error("Invalid instance configuration: {0}")]
    Validation(String),

    #[error("Invalid quantity {0:?}")]
    Quantity(String),

    #[error("PostgreSQL cluster '{name}' not found. Available clusters: {available}")]
    ClusterNotFound { name: String, available: String },

    #[error("No PostgreSQL cluster available: no cluster specified and no default cluster configured")]
    NoDefaultCluster,

    #[error("Ambiguous PostgreSQL cluster: several clusters are marked default ({0})")]
    AmbiguousDefaultCluster(String),

    /// A create/update aborted part-way through the handler pipeline.
    #[error("handler {handler} failed: {source}")]
    Pipeline {
        handler: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// Write rejected because the object changed or already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Reconcile error: {0}")]
    Reconcile(String),

    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn reconcile(msg: impl Into<String>) -> Self {
        Self::Reconcile(msg.into())
    }
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Errors caused by the instance spec or operator configuration.
    /// Retrying without a spec change cannot fix them.
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Validation(_)
            | Self::Quantity(_)
            | Self::ClusterNotFound { .. }
            | Self::NoDefaultCluster
            | Self::AmbiguousDefaultCluster(_) => true,
            Self::Pipeline { source, .. } => source.is_validation(),
            _ => false,
        }
    }
}
