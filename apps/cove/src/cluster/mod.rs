pub mod kubectl;
pub mod workload;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use workload::Workload;

/// Stable error kinds surfaced by the cluster client. Anything the client
/// cannot classify collapses to `Unknown` with the original cause preserved
/// for logging.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("access to {0} is forbidden")]
    Forbidden(String),
    #[error("conflicting update to {0}")]
    Conflict(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("cluster connection failed: {0}")]
    Transport(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("command exited with status {0}")]
    CommandExit(i32),
    #[error("{context}: {message}")]
    Unknown { context: String, message: String },
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClusterError::Cancelled)
    }
}

/// Uniform operations over the remote cluster. The production implementation
/// drives `kubectl`; tests inject their own.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Default namespace of the active cluster context.
    async fn current_namespace(&self) -> Result<String, ClusterError>;

    /// Fetches a workload descriptor. A missing workload is reported as
    /// `NotFound`, distinguishable from every other failure.
    async fn get_workload(&self, name: &str, namespace: &str) -> Result<Workload, ClusterError>;

    /// Pushes a workload descriptor, creating or updating it.
    async fn apply_workload(&self, workload: &Workload) -> Result<(), ClusterError>;

    /// Applies an arbitrary manifest. Repeated calls with identical input are
    /// no-ops, which is what makes the ensure-style operations idempotent.
    async fn apply_manifest(&self, manifest: &serde_json::Value) -> Result<(), ClusterError>;

    /// Blocks until a pod matching `selector` is Ready and returns its name.
    /// When several pods match, the newest Ready one wins.
    async fn wait_for_pod(&self, namespace: &str, selector: &str)
        -> Result<String, ClusterError>;

    /// Attaches the caller's standard streams to a remote process. Returns
    /// when the remote process exits or `cancel` observes shutdown.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tty: bool,
        argv: &[String],
        cancel: watch::Receiver<bool>,
    ) -> Result<(), ClusterError>;
}
