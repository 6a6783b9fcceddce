use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{
    domain::{ExecutionLimits, Run, RunId, RunStatus, RunSummary, Submission},
    logs::LogCollector,
    pipeline::running::run_in_sandbox,
    queue::{QueueError, QueueStats, RunQueue},
    traits::{
        artifact_store::{ArtifactSink, ArtifactStore},
        sandbox::{SandboxContext, SandboxRuntime},
    },
};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_source_bytes: usize,
    pub limits: ExecutionLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidInput {
    #[error("code must not be empty")]
    Empty,
    #[error("code is {size} bytes, the limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    InvalidInput(#[from] InvalidInput),
    #[error("cannot run the script right now: {msg}")]
    ResourceUnavailable { msg: String },
    #[error("run {run_id} was cancelled before it started")]
    Cancelled { run_id: RunId },
}

#[derive(Debug)]
struct RunEntry {
    summary: RunSummary,
    cancel: CancellationToken,
}

/// Owns the lifecycle of every run: validation, admission, sandbox execution
/// and result assembly. Runs never share logs, artifacts or sandboxes.
#[derive(Debug)]
pub struct Coordinator {
    sandbox: Arc<dyn SandboxRuntime>,
    store: Arc<dyn ArtifactStore>,
    logs: LogCollector,
    queue: RunQueue,
    settings: CoordinatorSettings,
    runs: DashMap<RunId, RunEntry>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(
        sandbox: Arc<dyn SandboxRuntime>,
        store: Arc<dyn ArtifactStore>,
        logs: LogCollector,
        queue: RunQueue,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            sandbox,
            store,
            logs,
            queue,
            settings,
            runs: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Runs a submission to completion and returns the terminal run.
    ///
    /// `cancel` lets the caller abandon the run, e.g. when its client goes
    /// away. A run cancelled while executing still comes back as `Ok` with
    /// whatever logs and files it produced.
    #[tracing::instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub async fn submit(
        &self,
        submission: Submission,
        cancel: CancellationToken,
    ) -> Result<Run, SubmitError> {
        validate(&submission, self.settings.max_source_bytes)?;

        let run = Run::new(Uuid::new_v4());
        tracing::Span::current().record("run_id", tracing::field::display(run.id));
        let run_cancel = self.shutdown.child_token();
        self.track(&run, run_cancel.clone());
        tracing::info!("Run submitted: {} bytes of code", submission.code.len());

        let ticket = match self.queue.enqueue() {
            Ok(ticket) => ticket,
            Err(err) => return Err(self.reject(run, err.to_string())),
        };
        tracing::debug!("Run queued: {:?}", self.queue.stats());

        let slot = tokio::select! {
            slot = ticket.admit() => slot,
            _ = either_cancelled(&cancel, &run_cancel) => {
                return Err(self.abandon(run));
            }
        };
        let _slot = match slot {
            Ok(slot) => slot,
            Err(QueueError::Closed) => {
                return Err(self.reject(run, "service is shutting down".to_string()));
            }
            Err(err) => return Err(self.reject(run, err.to_string())),
        };

        let run = run.change_status(RunStatus::Running);
        self.update(&run);
        tracing::debug!("Run admitted: {:?}", self.queue.stats());

        let logs = self.logs.open(run.id);
        let ctx = SandboxContext {
            run_id: run.id,
            code: submission.code,
            limits: self.settings.limits.clone(),
            logs: logs.clone(),
            artifacts: ArtifactSink::new(run.id, self.store.clone()),
        };

        let execution = run_in_sandbox(
            self.sandbox.as_ref(),
            ctx,
            either_cancelled(&cancel, &run_cancel),
        )
        .await;
        let snapshot = logs.freeze();
        tracing::debug!("Log bytes held by active runs: {}", self.logs.in_flight_bytes());

        let execution = match execution {
            Ok(execution) => execution,
            Err(err) => {
                tracing::error!("Cannot provision sandbox: {}", err);
                return Err(self.reject(run, err.to_string()));
            }
        };

        let run = run.finish(execution.into_outcome(snapshot, self.settings.limits.time_ms));
        self.update(&run);
        tracing::info!(
            "Run finished: status={:?}, logs={}, files={}, duration_ms={}",
            run.status,
            run.logs.len(),
            run.artifacts.len(),
            run.duration_ms()
        );

        Ok(run)
    }

    /// Requests cancellation of a pending or running run. Returns `false`
    /// when the run is unknown or already finished, so repeating it is harmless.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.runs.get(&run_id) {
            Some(entry) if !entry.summary.status.is_terminal() => {
                tracing::info!("Cancelling run {}", run_id);
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, run_id: RunId) -> Option<RunSummary> {
        self.runs.get(&run_id).map(|entry| entry.summary.clone())
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Cancels every pending and running run and refuses new ones.
    pub fn shutdown(&self) {
        tracing::info!("Coordinator shutting down: {:?}", self.queue.stats());
        self.queue.close();
        self.shutdown.cancel();
    }

    /// Drops bookkeeping of runs that finished more than `older_than` ago.
    pub fn forget_finished(&self, older_than: Duration) -> usize {
        let Ok(older_than) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = Utc::now() - older_than;
        let before = self.runs.len();
        self.runs.retain(|_, entry| {
            entry
                .summary
                .finished_at
                .is_none_or(|finished_at| finished_at > cutoff)
        });
        before.saturating_sub(self.runs.len())
    }

    fn track(&self, run: &Run, cancel: CancellationToken) {
        self.runs.insert(
            run.id,
            RunEntry {
                summary: run.summary(),
                cancel,
            },
        );
    }

    fn update(&self, run: &Run) {
        if let Some(mut entry) = self.runs.get_mut(&run.id) {
            entry.summary = run.summary();
        }
    }

    fn reject(&self, run: Run, msg: String) -> SubmitError {
        tracing::warn!("Run rejected: {}", msg);
        let run = run.change_status(RunStatus::Rejected);
        self.update(&Run {
            error: Some(msg.clone()),
            finished_at: Some(Utc::now()),
            ..run
        });
        SubmitError::ResourceUnavailable { msg }
    }

    fn abandon(&self, run: Run) -> SubmitError {
        tracing::info!("Run cancelled while queued");
        let run_id = run.id;
        let run = run.change_status(RunStatus::Cancelled);
        self.update(&Run {
            finished_at: Some(Utc::now()),
            ..run
        });
        SubmitError::Cancelled { run_id }
    }
}

fn validate(submission: &Submission, max_source_bytes: usize) -> Result<(), InvalidInput> {
    if submission.code.trim().is_empty() {
        return Err(InvalidInput::Empty);
    }
    let size = submission.code.len();
    if size > max_source_bytes {
        return Err(InvalidInput::TooLarge {
            size,
            limit: max_source_bytes,
        });
    }
    Ok(())
}

async fn either_cancelled(first: &CancellationToken, second: &CancellationToken) {
    tokio::select! {
        _ = first.cancelled() => {}
        _ = second.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            domain::{LimitType, LogEntry, LogMode},
            logs::LogLimits,
            traits::{
                artifact_store::{MockArtifactStore, StoreError},
                sandbox::{MockSandboxRuntime, ProvisionError, SandboxExit},
            },
        },
        storage::fs::{FsArtifactStore, FsStoreSettings},
        stubs::sandbox::{SandboxStub, StubScript},
    };
    use std::time::Instant;

    fn limits(time_ms: u64) -> ExecutionLimits {
        ExecutionLimits {
            time_ms,
            teardown_grace_ms: 50,
            cpu_time_ms: None,
            memory_bytes: None,
            pids_count: None,
            scratch_size_bytes: None,
        }
    }

    fn store(dir: &tempfile::TempDir) -> Arc<dyn ArtifactStore> {
        Arc::new(
            FsArtifactStore::new(FsStoreSettings {
                root: dir.path().to_path_buf(),
                public_base_url: "http://localhost:8080".to_string(),
                retention: Duration::from_secs(60),
                max_total_bytes: 1 << 20,
            })
            .unwrap(),
        )
    }

    fn coordinator_with(
        sandbox: Arc<dyn SandboxRuntime>,
        store: Arc<dyn ArtifactStore>,
        concurrency: usize,
        time_ms: u64,
    ) -> Coordinator {
        Coordinator::new(
            sandbox,
            store,
            LogCollector::new(LogLimits {
                run_bytes: 1 << 16,
                total_bytes: 1 << 20,
            }),
            RunQueue::new(concurrency, None),
            CoordinatorSettings {
                max_source_bytes: 1024,
                limits: limits(time_ms),
            },
        )
    }

    fn stub_coordinator(
        script: StubScript,
        delay: Duration,
        dir: &tempfile::TempDir,
    ) -> (Coordinator, SandboxStub) {
        let stub = SandboxStub::new(script, delay);
        let coordinator = coordinator_with(Arc::new(stub.clone()), store(dir), 2, 5_000);
        (coordinator, stub)
    }

    #[tokio::test]
    async fn test_logs_in_emission_order() {
        let dir = tempfile::tempdir().unwrap();
        let script = StubScript::default()
            .log(LogMode::Log, &["a"])
            .log(LogMode::Error, &["b"]);
        let (coordinator, _) = stub_coordinator(script, Duration::ZERO, &dir);

        let run = coordinator
            .submit(
                Submission::new(r#"console.log("a"); console.error("b")"#),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(
            run.logs,
            vec![
                LogEntry::new(LogMode::Log, vec!["a".to_string()]),
                LogEntry::new(LogMode::Error, vec!["b".to_string()]),
            ]
        );
        assert!(run.artifacts.is_empty());
        assert!(run.error.is_none());
        assert_eq!(coordinator.status(run.id).unwrap().status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_artifacts_are_published() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let stub = SandboxStub::new(
            StubScript::default().file("document.pdf", b"%PDF-1.7"),
            Duration::ZERO,
        );
        let coordinator = coordinator_with(Arc::new(stub), store.clone(), 1, 5_000);

        let run = coordinator
            .submit(Submission::new("await page.pdf()"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.logs.is_empty());
        assert_eq!(run.artifacts.len(), 1);
        assert_eq!(run.artifacts[0].filename, "document.pdf");
        assert_eq!(run.artifacts[0].mimetype, "application/pdf");
        assert_eq!(run.artifacts[0].key.run_id, run.id);

        let stored = store.get(&run.artifacts[0].key).await.unwrap().unwrap();
        assert_eq!(stored.bytes, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn test_script_error_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let script = StubScript::default().log(LogMode::Error, &["Error: boom"]);
        let (coordinator, _) = stub_coordinator(script, Duration::ZERO, &dir);

        let run = coordinator
            .submit(Submission::new("throw new Error('boom')"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.logs[0].mode, LogMode::Error);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_logs() {
        let dir = tempfile::tempdir().unwrap();
        let stub = SandboxStub::new(
            StubScript::default().log(LogMode::Log, &["before"]),
            Duration::from_secs(30),
        );
        let stats = stub.stats();
        let coordinator = coordinator_with(Arc::new(stub), store(&dir), 1, 100);

        let started = Instant::now();
        let run = coordinator
            .submit(Submission::new("while (true) {}"), CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(run.status, RunStatus::TimedOut);
        assert_eq!(
            run.logs,
            vec![LogEntry::new(LogMode::Log, vec!["before".to_string()])]
        );
        assert!(run.error.unwrap().contains("100 ms"));
        assert_eq!(stats.terminated(), 1);
        assert_eq!(stats.torn_down(), 1);
        assert_eq!(stats.active(), 0);
        assert_eq!(coordinator.queue_stats().running, 0);
    }

    #[tokio::test]
    async fn test_sandbox_exits_map_to_status() {
        let cases = [
            (
                SandboxExit::Crashed {
                    status: Some(70),
                    msg: "harness failed".to_string(),
                },
                RunStatus::Failed,
            ),
            (SandboxExit::LimitsExceeded(LimitType::CpuTime), RunStatus::TimedOut),
            (SandboxExit::LimitsExceeded(LimitType::Ram), RunStatus::Failed),
            (SandboxExit::LimitsExceeded(LimitType::Processes), RunStatus::Failed),
            (SandboxExit::LimitsExceeded(LimitType::ScratchSize), RunStatus::Failed),
        ];

        for (exit, expected) in cases {
            let dir = tempfile::tempdir().unwrap();
            let (coordinator, _) =
                stub_coordinator(StubScript::default().exit(exit.clone()), Duration::ZERO, &dir);

            let run = coordinator
                .submit(Submission::new("1"), CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(run.status, expected, "{exit:?}");
            assert!(run.error.is_some());
        }
    }

    #[tokio::test]
    async fn test_invalid_input_never_reaches_sandbox() {
        let mut sandbox = MockSandboxRuntime::new();
        sandbox.expect_provision().times(0);
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with(Arc::new(sandbox), store(&dir), 1, 1000);

        let empty = coordinator
            .submit(Submission::new("  \n"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(empty, SubmitError::InvalidInput(InvalidInput::Empty)));

        let too_large = coordinator
            .submit(Submission::new("x".repeat(1025)), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            too_large,
            SubmitError::InvalidInput(InvalidInput::TooLarge {
                size: 1025,
                limit: 1024
            })
        ));
        assert!(coordinator.runs.is_empty());
    }

    #[tokio::test]
    async fn test_provision_failure_rejects_run() {
        let mut sandbox = MockSandboxRuntime::new();
        sandbox.expect_provision().times(1).returning(|_| {
            Err(ProvisionError::Unavailable {
                msg: "fork failed".to_string(),
            })
        });
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with(Arc::new(sandbox), store(&dir), 1, 1000);

        let err = coordinator
            .submit(Submission::new("1"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SubmitError::ResourceUnavailable { .. }));
        assert_eq!(coordinator.queue_stats().running, 0);
        let summary = coordinator.runs.iter().next().unwrap().summary.clone();
        assert_eq!(summary.status, RunStatus::Rejected);
    }

    #[tokio::test]
    async fn test_artifact_store_failure_fails_run() {
        let mut store = MockArtifactStore::new();
        store.expect_put().returning(|_, _, _, _| {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        });
        let stub = SandboxStub::new(
            StubScript::default().file("shot.png", b"png"),
            Duration::ZERO,
        );
        let coordinator = coordinator_with(Arc::new(stub), Arc::new(store), 1, 1000);

        let run = coordinator
            .submit(Submission::new("1"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.artifacts.is_empty());
        assert!(run.error.unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let stub = SandboxStub::new(
            StubScript::default().log(LogMode::Log, &["done"]),
            Duration::from_millis(100),
        );
        let stats = stub.stats();
        let coordinator = Arc::new(coordinator_with(Arc::new(stub), store(&dir), 2, 5_000));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator
                        .submit(
                            Submission::new(format!("console.log({i})")),
                            CancellationToken::new(),
                        )
                        .await
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            let run = handle.await.unwrap().unwrap();
            assert_eq!(run.status, RunStatus::Succeeded);
            assert_eq!(run.logs.len(), 1);
            ids.push(run.id);
        }

        assert_eq!(stats.provisioned(), 5);
        assert!(stats.peak() <= 2, "peak was {}", stats.peak());
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn test_cancel_running_run() {
        let dir = tempfile::tempdir().unwrap();
        let stub = SandboxStub::new(
            StubScript::default().log(LogMode::Log, &["started"]),
            Duration::from_secs(30),
        );
        let stats = stub.stats();
        let coordinator = Arc::new(coordinator_with(Arc::new(stub), store(&dir), 1, 60_000));

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .submit(Submission::new("await new Promise(() => {})"), CancellationToken::new())
                    .await
            })
        };

        let run_id = loop {
            let running = coordinator
                .runs
                .iter()
                .find(|entry| entry.summary.status == RunStatus::Running)
                .map(|entry| *entry.key());
            if let Some(run_id) = running {
                break run_id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert!(coordinator.cancel(run_id));
        let run = task.await.unwrap().unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(stats.terminated(), 1);
        assert!(!coordinator.cancel(run_id));
        assert!(!coordinator.cancel(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_run() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, stats) = {
            let stub = SandboxStub::new(StubScript::default(), Duration::from_secs(30));
            let stats = stub.stats();
            (coordinator_with(Arc::new(stub), store(&dir), 1, 60_000), stats)
        };

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let run = coordinator.submit(Submission::new("1"), cancel).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(stats.torn_down(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_runs() {
        let dir = tempfile::tempdir().unwrap();
        let stub = SandboxStub::new(StubScript::default(), Duration::from_secs(30));
        let coordinator = Arc::new(coordinator_with(Arc::new(stub), store(&dir), 1, 60_000));

        let spawn = |code: &'static str| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .submit(Submission::new(code), CancellationToken::new())
                    .await
            })
        };
        let running = spawn("first");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queued = spawn("second");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.queue_stats().waiting, 1);

        coordinator.shutdown();

        let running = running.await.unwrap().unwrap();
        assert_eq!(running.status, RunStatus::Cancelled);
        assert!(queued.await.unwrap().is_err());

        let late = coordinator
            .submit(Submission::new("third"), CancellationToken::new())
            .await;
        assert!(matches!(late, Err(SubmitError::ResourceUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_forget_finished() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = stub_coordinator(StubScript::default(), Duration::ZERO, &dir);

        let run = coordinator
            .submit(Submission::new("1"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(coordinator.forget_finished(Duration::from_secs(3600)), 0);
        assert!(coordinator.status(run.id).is_some());
        assert_eq!(coordinator.forget_finished(Duration::ZERO), 1);
        assert!(coordinator.status(run.id).is_none());
    }
}
