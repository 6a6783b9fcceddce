use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    core::{
        domain::{ArtifactRef, LogMode},
        traits::sandbox::{
            ProvisionError, SandboxContext, SandboxError, SandboxExit, SandboxInstance,
            SandboxRuntime,
        },
    },
    storage::mimetype_for,
};

#[derive(Debug, Clone)]
pub struct StubFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// What a stub sandbox pretends the script did.
#[derive(Debug, Clone)]
pub struct StubScript {
    pub logs: Vec<(LogMode, Vec<String>)>,
    pub files: Vec<StubFile>,
    pub exit: SandboxExit,
}

impl Default for StubScript {
    fn default() -> Self {
        Self {
            logs: Vec::new(),
            files: Vec::new(),
            exit: SandboxExit::Completed,
        }
    }
}

impl StubScript {
    pub fn hello() -> Self {
        Self {
            logs: vec![(LogMode::Log, vec!["Hello from the stub sandbox".to_string()])],
            ..Self::default()
        }
    }

    pub fn log(mut self, mode: LogMode, args: &[&str]) -> Self {
        self.logs
            .push((mode, args.iter().map(|arg| arg.to_string()).collect()));
        self
    }

    pub fn file(mut self, filename: &str, bytes: &[u8]) -> Self {
        self.files.push(StubFile {
            filename: filename.to_string(),
            bytes: bytes.to_vec(),
        });
        self
    }

    pub fn exit(mut self, exit: SandboxExit) -> Self {
        self.exit = exit;
        self
    }
}

#[derive(Debug, Default)]
pub struct StubStats {
    provisioned: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    terminated: AtomicUsize,
    torn_down: AtomicUsize,
}

impl StubStats {
    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::Acquire)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Highest number of sandboxes alive at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn torn_down(&self) -> usize {
        self.torn_down.load(Ordering::Acquire)
    }
}

/// Sandbox that runs nothing: it replays a fixed script after a delay.
#[derive(Debug, Clone)]
pub struct SandboxStub {
    script: StubScript,
    delay: Duration,
    stats: Arc<StubStats>,
}

impl SandboxStub {
    pub fn new(script: StubScript, delay: Duration) -> Self {
        Self {
            script,
            delay,
            stats: Arc::new(StubStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<StubStats> {
        self.stats.clone()
    }
}

#[async_trait::async_trait]
impl SandboxRuntime for SandboxStub {
    #[tracing::instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    async fn provision(
        &self,
        ctx: SandboxContext,
    ) -> Result<Box<dyn SandboxInstance>, ProvisionError> {
        tracing::debug!("Provision stub sandbox: limits={:?}", ctx.limits);
        self.stats.provisioned.fetch_add(1, Ordering::AcqRel);
        let active = self.stats.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.peak.fetch_max(active, Ordering::AcqRel);

        Ok(Box::new(StubInstance {
            ctx,
            script: self.script.clone(),
            delay: self.delay,
            stats: self.stats.clone(),
            replayed: false,
            alive: true,
        }))
    }
}

struct StubInstance {
    ctx: SandboxContext,
    script: StubScript,
    delay: Duration,
    stats: Arc<StubStats>,
    replayed: bool,
    alive: bool,
}

impl StubInstance {
    fn release(&mut self) {
        if self.alive {
            self.alive = false;
            self.stats.active.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[async_trait::async_trait]
impl SandboxInstance for StubInstance {
    async fn wait(&mut self) -> SandboxExit {
        if !self.replayed {
            self.replayed = true;
            for (mode, args) in &self.script.logs {
                self.ctx.logs.record_strings(*mode, args.clone());
            }
        }

        tokio::time::sleep(self.delay).await;
        self.release();
        tracing::debug!("Stub sandbox exited: {:?}", self.script.exit);
        self.script.exit.clone()
    }

    async fn terminate(&mut self, _grace: Duration) -> SandboxExit {
        self.stats.terminated.fetch_add(1, Ordering::AcqRel);
        self.release();
        SandboxExit::Terminated
    }

    async fn collect_artifacts(&mut self) -> Result<Vec<ArtifactRef>, SandboxError> {
        let mut artifacts = Vec::with_capacity(self.script.files.len());
        for file in &self.script.files {
            let mimetype = mimetype_for(&file.filename);
            artifacts.push(
                self.ctx
                    .artifacts
                    .put(file.bytes.clone(), &file.filename, &mimetype)
                    .await?,
            );
        }
        Ok(artifacts)
    }

    async fn teardown(&mut self) -> Result<(), SandboxError> {
        self.stats.torn_down.fetch_add(1, Ordering::AcqRel);
        self.release();
        Ok(())
    }
}

impl Drop for StubInstance {
    fn drop(&mut self) {
        self.release();
    }
}
