use std::{future::Future, time::Duration};

use crate::core::{
    domain::{ArtifactRef, LimitType, RunOutcome, RunStatus},
    logs::LogSnapshot,
    traits::sandbox::{ProvisionError, SandboxContext, SandboxExit, SandboxRuntime},
};

/// How the sandbox phase of a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    Exited(SandboxExit),
    /// Wall-clock limit hit; carries the exit observed after termination.
    TimedOut(SandboxExit),
    Cancelled(SandboxExit),
}

#[derive(Debug)]
pub struct Execution {
    pub end: RunEnd,
    pub artifacts: Vec<ArtifactRef>,
    pub collect_error: Option<String>,
}

enum Stop {
    Timeout,
    Cancel,
}

/// Drives one sandbox from provisioning to teardown.
///
/// The sandbox is raced against the wall-clock limit and `cancelled`. Whatever
/// wins, produced files are collected and the instance is torn down before
/// this returns, so nothing of the run outlives the call.
#[tracing::instrument(skip_all, fields(run_id = %ctx.run_id))]
pub async fn run_in_sandbox<F>(
    sandbox: &dyn SandboxRuntime,
    ctx: SandboxContext,
    cancelled: F,
) -> Result<Execution, ProvisionError>
where
    F: Future<Output = ()> + Send,
{
    let timeout = Duration::from_millis(ctx.limits.time_ms);
    let grace = Duration::from_millis(ctx.limits.teardown_grace_ms);

    let mut instance = sandbox.provision(ctx).await?;
    tracing::debug!("Sandbox provisioned");

    tokio::pin!(cancelled);
    let finished = tokio::select! {
        exit = instance.wait() => Ok(exit),
        _ = tokio::time::sleep(timeout) => Err(Stop::Timeout),
        _ = &mut cancelled => Err(Stop::Cancel),
    };

    let end = match finished {
        Ok(exit) => RunEnd::Exited(exit),
        Err(stop) => {
            let exit = instance.terminate(grace).await;
            match stop {
                Stop::Timeout => {
                    tracing::info!("Run exceeded {:?}, terminated: {:?}", timeout, exit);
                    RunEnd::TimedOut(exit)
                }
                Stop::Cancel => {
                    tracing::info!("Run cancelled, terminated: {:?}", exit);
                    RunEnd::Cancelled(exit)
                }
            }
        }
    };

    let (artifacts, collect_error) = match instance.collect_artifacts().await {
        Ok(artifacts) => (artifacts, None),
        Err(err) => {
            tracing::error!("Cannot collect artifacts: {}", err);
            (Vec::new(), Some(err.to_string()))
        }
    };

    if let Err(err) = instance.teardown().await {
        tracing::warn!("Sandbox teardown failed: {}", err);
    }

    tracing::debug!("Sandbox finished: {:?}", end);
    Ok(Execution {
        end,
        artifacts,
        collect_error,
    })
}

impl Execution {
    pub fn into_outcome(self, logs: LogSnapshot, time_ms: u64) -> RunOutcome {
        let (status, error) = match self.end {
            RunEnd::Exited(SandboxExit::Completed) => (RunStatus::Succeeded, None),
            RunEnd::Exited(SandboxExit::Crashed { status, msg }) => (
                RunStatus::Failed,
                Some(match status {
                    Some(code) => format!("sandbox exited with status {code}: {msg}"),
                    None => format!("sandbox crashed: {msg}"),
                }),
            ),
            RunEnd::Exited(SandboxExit::LimitsExceeded(limit)) => {
                (limit.run_status(), Some(limit.describe().to_string()))
            }
            RunEnd::Exited(SandboxExit::Terminated) => (
                RunStatus::Failed,
                Some("sandbox was terminated unexpectedly".to_string()),
            ),
            RunEnd::TimedOut(_) => (
                LimitType::Time.run_status(),
                Some(format!("run exceeded the time limit of {time_ms} ms")),
            ),
            RunEnd::Cancelled(_) => (RunStatus::Cancelled, Some("run was cancelled".to_string())),
        };

        let (status, error) = match (status, self.collect_error) {
            (RunStatus::Succeeded, Some(err)) => (
                RunStatus::Failed,
                Some(format!("cannot store artifacts: {err}")),
            ),
            (status, _) => (status, error),
        };

        RunOutcome {
            status,
            logs: logs.entries,
            artifacts: self.artifacts,
            truncated: logs.truncated,
            error,
        }
    }
}
