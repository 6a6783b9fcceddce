use std::time::Duration;

use crate::core::{
    domain::{ArtifactRef, ExecutionLimits, LimitType, RunId},
    logs::LogSink,
    traits::artifact_store::{ArtifactSink, StoreError},
};

/// Everything a sandbox may touch for one run. Nothing else is reachable.
#[derive(Clone, Debug)]
pub struct SandboxContext {
    pub run_id: RunId,
    pub code: String,
    pub limits: ExecutionLimits,
    pub logs: LogSink,
    pub artifacts: ArtifactSink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxExit {
    /// The script ran to the end. Errors it threw are already in the log.
    Completed,
    Crashed {
        status: Option<i32>,
        msg: String,
    },
    LimitsExceeded(LimitType),
    /// Stopped by the host (timeout, cancellation or shutdown).
    Terminated,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProvisionError {
    #[error("no capacity to start a sandbox: {msg}")]
    Unavailable { msg: String },
    #[error("sandbox runtime is misconfigured: {msg}")]
    Misconfigured { msg: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait SandboxRuntime: std::fmt::Debug + Send + Sync {
    async fn provision(
        &self,
        ctx: SandboxContext,
    ) -> Result<Box<dyn SandboxInstance>, ProvisionError>;
}

/// A running sandbox bound to exactly one run.
#[mockall::automock]
#[async_trait::async_trait]
pub trait SandboxInstance: Send {
    /// Resolves when the sandbox exits on its own. Safe to drop and call again.
    async fn wait(&mut self) -> SandboxExit;

    /// Stops the whole process tree, waiting at most `grace` before killing it.
    async fn terminate(&mut self, grace: Duration) -> SandboxExit;

    /// Moves produced files into the artifact store, in creation order.
    async fn collect_artifacts(&mut self) -> Result<Vec<ArtifactRef>, SandboxError>;

    /// Releases the scratch directory and any host resources.
    async fn teardown(&mut self) -> Result<(), SandboxError>;
}
