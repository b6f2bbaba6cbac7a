use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Optimistic-concurrency failure on a write (HTTP 409).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A dependent workload exists but cannot serve yet.
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reconcile error: {0}")]
    Reconcile(String),
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn reconcile(msg: impl Into<String>) -> Self {
        Self::Reconcile(msg.into())
    }
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Map a raw API error, turning HTTP 409 into [`Error::Conflict`].
    pub fn from_api(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref e) if e.code == 409 => Self::Conflict(e.message.clone()),
            other => Self::Kube(other),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady(_))
    }

    /// True for errors the user has to fix in the resource spec.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Yaml(_))
    }
}
