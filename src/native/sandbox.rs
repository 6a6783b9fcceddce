use std::{
    io,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, OnceLock},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tokio::{
    fs,
    io::{AsyncReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
    task::JoinHandle,
};

use crate::{
    constants::{
        MAX_LOG_LINE_BYTES, MONITOR_INTERVAL_MS, OVERSIZED_LINE_PLACEHOLDER,
        READER_DRAIN_TIMEOUT_MS, STDERR_TAIL_BYTES,
    },
    core::{
        domain::{ArtifactRef, ExecutionLimits, LimitType, LogMode, RunId},
        logs::LogSink,
        traits::{
            artifact_store::ArtifactSink,
            sandbox::{
                ProvisionError, SandboxContext, SandboxError, SandboxExit, SandboxInstance,
                SandboxRuntime,
            },
        },
    },
    native::{
        harness::{HarnessLine, parse_line, read_line_capped},
        isolation::{self, IsolationPolicy, LandlockSupport},
        scope::{ScopeHandle, ScopeManager},
        scratch::{self, ScratchLayout},
        tree::{self, SharedTree},
    },
    storage::mimetype_for,
};

/// System locations the sandbox may read when Landlock is enforced.
pub const SYSTEM_READ_PATHS: &[&str] = &[
    "/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc", "/proc", "/sys", "/dev", "/opt",
];

#[derive(Debug, Clone)]
pub struct NodeSandboxSettings {
    pub node_bin: PathBuf,
    /// Directory containing the `playwright` package, exported as `NODE_PATH`.
    pub node_modules: Option<PathBuf>,
    pub browsers_path: Option<PathBuf>,
    pub scratch_root: PathBuf,
    pub path_env: String,
    pub landlock: bool,
    pub readable_paths: Vec<PathBuf>,
    /// TCP ports scripts and their browsers may connect to.
    pub connect_ports: Option<Vec<u16>>,
}

/// Runs each script in its own Node process under rlimits, an optional
/// Landlock ruleset and an optional systemd scope.
#[derive(Debug)]
pub struct NodeSandbox {
    settings: NodeSandboxSettings,
    scopes: Option<ScopeManager>,
    support: LandlockSupport,
}

impl NodeSandbox {
    pub fn new(mut settings: NodeSandboxSettings, scopes: Option<ScopeManager>) -> io::Result<Self> {
        if let Some(resolved) = resolve_program(&settings.node_bin, &settings.path_env) {
            settings.node_bin = resolved;
        }
        // The script runs from its work dir, so every path handed to it must be absolute.
        std::fs::create_dir_all(&settings.scratch_root)?;
        settings.scratch_root = std::path::absolute(&settings.scratch_root)?;
        tracing::info!(
            "Node sandbox using {:?}, scratch at {:?}",
            settings.node_bin,
            settings.scratch_root
        );

        if let Err(err) = isolation::protect_host() {
            tracing::warn!("Cannot shield the host process from sandboxes: {}", err);
        }

        let support = isolation::detect_landlock();
        if settings.landlock {
            if !support.filesystem {
                tracing::warn!("Landlock is not enforced by this kernel, scripts can read and write the whole filesystem");
            } else if !support.scoping {
                tracing::warn!("Kernel lacks Landlock signal scoping, scripts can signal host processes");
            }
            if settings.connect_ports.is_some() && !support.network {
                tracing::warn!("Kernel lacks Landlock network rules, outbound TCP is unrestricted");
            }
        }
        tracing::debug!("Landlock support: {:?}", support);

        Ok(Self {
            settings,
            scopes,
            support,
        })
    }

    fn isolation_policy(&self, layout: &ScratchLayout, limits: &ExecutionLimits) -> IsolationPolicy {
        let mut readable_paths = self.settings.readable_paths.clone();
        readable_paths.extend(self.settings.node_modules.iter().cloned());
        readable_paths.extend(self.settings.browsers_path.iter().cloned());
        // <prefix>/bin/node also needs <prefix>/lib.
        if let Some(prefix) = self.settings.node_bin.parent().and_then(Path::parent) {
            readable_paths.push(prefix.to_path_buf());
        }

        IsolationPolicy {
            landlock: self.settings.landlock,
            readable_paths,
            writable_paths: vec![
                layout.root.clone(),
                PathBuf::from("/dev/shm"),
                PathBuf::from("/dev/null"),
            ],
            connect_ports: self.settings.connect_ports.clone(),
            cpu_time_secs: limits.cpu_time_ms.map(|ms| ms.div_ceil(1000).max(1)),
            max_file_bytes: limits.scratch_size_bytes,
        }
        .retain_existing()
    }

    fn command(&self, layout: &ScratchLayout, policy: IsolationPolicy) -> Command {
        let mut cmd = Command::new(&self.settings.node_bin);
        cmd.arg(&layout.harness)
            .arg(&layout.script)
            .current_dir(&layout.work)
            .env_clear()
            .env("PATH", &self.settings.path_env)
            .env("HOME", &layout.home)
            .env("TMPDIR", &layout.home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        if let Some(node_modules) = &self.settings.node_modules {
            cmd.env("NODE_PATH", node_modules);
        }
        if let Some(browsers_path) = &self.settings.browsers_path {
            cmd.env("PLAYWRIGHT_BROWSERS_PATH", browsers_path);
        }

        // SAFETY: the hook only calls setrlimit and landlock syscalls in the child.
        unsafe {
            cmd.pre_exec(move || isolation::apply(&policy));
        }
        cmd
    }

    #[tracing::instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    pub(crate) async fn start(&self, ctx: SandboxContext) -> Result<NodeInstance, ProvisionError> {
        let layout = ScratchLayout::new(&self.settings.scratch_root, ctx.run_id);
        if let Err(err) = layout.create(&ctx.code).await {
            let _ = layout.remove().await;
            return Err(ProvisionError::Unavailable {
                msg: format!("cannot prepare scratch directory: {err}"),
            });
        }

        let policy = self.isolation_policy(&layout, &ctx.limits);
        tracing::debug!("Isolation policy: {:?}", policy);
        let spawned = {
            let _spawning = tree::spawn_lock();
            self.command(&layout, policy).spawn().map(|child| {
                let root = child.id().map_or(0, |pid| pid as i32);
                (child, tree::track(ctx.run_id, root))
            })
        };
        let (mut child, processes) = match spawned {
            Ok(spawned) => spawned,
            Err(err) => {
                let _ = layout.remove().await;
                return Err(spawn_error(err));
            }
        };
        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));

        let scope = match (&self.scopes, child.id()) {
            (Some(scopes), Some(pid)) => match scopes.attach(ctx.run_id, pid, &ctx.limits).await {
                Ok(scope) => Some(scope),
                Err(err) => {
                    if let Some(pgid) = pgid {
                        let _ = killpg(pgid, Signal::SIGKILL);
                    }
                    kill_process_tree(&processes).await;
                    let _ = child.wait().await;
                    tree::untrack(ctx.run_id);
                    let _ = layout.remove().await;
                    return Err(ProvisionError::Unavailable {
                        msg: format!("cannot create systemd scope: {err}"),
                    });
                }
            },
            _ => None,
        };
        tracing::debug!("Sandbox started: pgid={:?}, scope={:?}", pgid, scope);

        let log_reader = child
            .stdout
            .take()
            .map(|stdout| spawn_log_reader(stdout, ctx.logs.clone()));
        let stderr_reader = child.stderr.take().map(spawn_stderr_reader);

        let breach = Arc::new(OnceLock::new());
        // Without a cgroup the kernel does not bound the tree, so it is polled.
        let polled = scope.is_none();
        let monitor = spawn_monitor(Monitor {
            root: layout.root.clone(),
            processes: processes.clone(),
            pgid,
            scratch_limit: ctx.limits.scratch_size_bytes,
            memory_limit: ctx.limits.memory_bytes.filter(|_| polled),
            process_limit: ctx.limits.pids_count.filter(|_| polled),
            breach: breach.clone(),
        });

        Ok(NodeInstance {
            run_id: ctx.run_id,
            child,
            pgid,
            processes,
            layout,
            scope,
            scopes: self.scopes.clone(),
            artifacts: ctx.artifacts,
            scratch_limit: ctx.limits.scratch_size_bytes,
            log_reader,
            stderr_reader,
            monitor: Some(monitor),
            breach,
            stopped_by_host: false,
            exit: None,
            torn_down: false,
        })
    }
}

#[async_trait::async_trait]
impl SandboxRuntime for NodeSandbox {
    async fn provision(
        &self,
        ctx: SandboxContext,
    ) -> Result<Box<dyn SandboxInstance>, ProvisionError> {
        Ok(Box::new(self.start(ctx).await?))
    }
}

pub(crate) struct NodeInstance {
    run_id: RunId,
    child: Child,
    pgid: Option<Pid>,
    processes: SharedTree,
    layout: ScratchLayout,
    scope: Option<ScopeHandle>,
    scopes: Option<ScopeManager>,
    artifacts: ArtifactSink,
    scratch_limit: Option<u64>,
    log_reader: Option<JoinHandle<()>>,
    stderr_reader: Option<JoinHandle<String>>,
    monitor: Option<JoinHandle<()>>,
    breach: Arc<OnceLock<LimitType>>,
    stopped_by_host: bool,
    exit: Option<SandboxExit>,
    torn_down: bool,
}

impl NodeInstance {
    fn signal_group(&self, signal: Signal) {
        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => tracing::warn!("Cannot send {} to sandbox group {}: {}", signal, pgid, err),
        }
    }

    /// Reaps leftovers of the process tree, drains the output readers and
    /// classifies the exit. Runs once per instance.
    async fn settle(&mut self, status: io::Result<ExitStatus>) -> SandboxExit {
        self.signal_group(Signal::SIGKILL);
        kill_process_tree(&self.processes).await;
        kill_scope(&self.scopes, &self.scope).await;
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        // The script may overflow the scratch directory and exit between two polls.
        if let Some(limit) = self.scratch_limit {
            if matches!(scratch::dir_size(&self.layout.root).await, Ok(size) if size > limit) {
                let _ = self.breach.set(LimitType::ScratchSize);
            }
        }

        let drain = Duration::from_millis(READER_DRAIN_TIMEOUT_MS);
        if let Some(reader) = self.log_reader.take() {
            if tokio::time::timeout(drain, reader).await.is_err() {
                tracing::warn!("Log reader did not finish in {:?}", drain);
            }
        }
        let stderr_tail = match self.stderr_reader.take() {
            Some(reader) => match tokio::time::timeout(drain, reader).await {
                Ok(Ok(tail)) => tail,
                _ => String::new(),
            },
            None => String::new(),
        };

        let exit = self.classify(status, &stderr_tail);
        tracing::debug!("Sandbox exit: {:?}", exit);
        self.exit = Some(exit.clone());
        exit
    }

    fn classify(&self, status: io::Result<ExitStatus>, stderr_tail: &str) -> SandboxExit {
        if let Some(limit) = self.breach.get() {
            return SandboxExit::LimitsExceeded(*limit);
        }
        if self.stopped_by_host {
            return SandboxExit::Terminated;
        }

        let status = match status {
            Ok(status) => status,
            Err(err) => {
                return SandboxExit::Crashed {
                    status: None,
                    msg: format!("cannot wait for sandbox: {err}"),
                };
            }
        };
        if status.success() {
            return SandboxExit::Completed;
        }

        let memory_limited = self.scope.as_ref().is_some_and(|scope| scope.memory_limited);
        match status.signal().and_then(|sig| Signal::try_from(sig).ok()) {
            Some(Signal::SIGXCPU) => SandboxExit::LimitsExceeded(LimitType::CpuTime),
            Some(Signal::SIGXFSZ) => SandboxExit::LimitsExceeded(LimitType::ScratchSize),
            Some(Signal::SIGKILL) if memory_limited => SandboxExit::LimitsExceeded(LimitType::Ram),
            signal => SandboxExit::Crashed {
                status: status.code(),
                msg: match signal {
                    Some(signal) => format!("killed by {signal}; stderr: {}", stderr_tail.trim()),
                    None => format!("stderr: {}", stderr_tail.trim()),
                },
            },
        }
    }
}

#[async_trait::async_trait]
impl SandboxInstance for NodeInstance {
    async fn wait(&mut self) -> SandboxExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let status = self.child.wait().await;
        self.settle(status).await
    }

    #[tracing::instrument(skip(self), fields(run_id = %self.run_id))]
    async fn terminate(&mut self, grace: Duration) -> SandboxExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        self.stopped_by_host = true;

        self.signal_group(Signal::SIGTERM);
        tree::lock(&self.processes).signal_all(Signal::SIGTERM);
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::debug!("Sandbox ignored SIGTERM for {:?}, killing", grace);
                self.signal_group(Signal::SIGKILL);
                kill_process_tree(&self.processes).await;
                kill_scope(&self.scopes, &self.scope).await;
                let _ = self.child.start_kill();
                self.child.wait().await
            }
        };
        self.settle(status).await
    }

    #[tracing::instrument(skip(self), fields(run_id = %self.run_id))]
    async fn collect_artifacts(&mut self) -> Result<Vec<ArtifactRef>, SandboxError> {
        let files = scratch::list_files(&self.layout.work).await?;
        let mut budget = self.scratch_limit.unwrap_or(u64::MAX);
        let mut artifacts = Vec::with_capacity(files.len());

        for file in files {
            if file.size > budget {
                tracing::warn!("Skipping {:?}: {} bytes over the scratch limit", file.path, file.size);
                continue;
            }
            budget -= file.size;

            let bytes = fs::read(&file.path).await?;
            let mimetype = mimetype_for(&file.name);
            artifacts.push(self.artifacts.put(bytes, &file.name, &mimetype).await?);
        }

        tracing::debug!("Collected {} artifacts", artifacts.len());
        Ok(artifacts)
    }

    async fn teardown(&mut self) -> Result<(), SandboxError> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        self.signal_group(Signal::SIGKILL);
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        kill_process_tree(&self.processes).await;
        tree::untrack(self.run_id);
        if let (Some(scopes), Some(scope)) = (&self.scopes, &self.scope) {
            if let Err(err) = scopes.stop(scope).await {
                tracing::debug!("Cannot stop scope {}: {}", scope.unit, err);
            }
        }
        self.layout.remove().await?;
        Ok(())
    }
}

impl Drop for NodeInstance {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        self.signal_group(Signal::SIGKILL);
        tree::lock(&self.processes).signal_all(Signal::SIGKILL);
        tree::untrack(self.run_id);
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        let root = self.layout.root.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn_blocking(move || {
                let _ = std::fs::remove_dir_all(root);
            });
        }
    }
}

async fn kill_scope(scopes: &Option<ScopeManager>, scope: &Option<ScopeHandle>) {
    if let (Some(scopes), Some(scope)) = (scopes, scope) {
        if let Err(err) = scopes.kill(scope).await {
            tracing::debug!("Cannot kill scope {}: {}", scope.unit, err);
        }
    }
}

async fn kill_process_tree(processes: &SharedTree) {
    let processes = processes.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || tree::kill_tree(&processes)).await {
        tracing::warn!("Cannot kill sandbox process tree: {}", err);
    }
}

fn spawn_error(err: io::Error) -> ProvisionError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ProvisionError::Misconfigured {
            msg: format!("cannot start node: {err}"),
        },
        _ => ProvisionError::Unavailable {
            msg: format!("cannot start node: {err}"),
        },
    }
}

/// Looks a bare program name up in `path_env` the way a shell would.
pub fn resolve_program(program: &Path, path_env: &str) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.canonicalize().ok();
    }
    path_env
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| candidate.is_file())
        .and_then(|candidate| candidate.canonicalize().ok())
}

fn spawn_log_reader(stdout: ChildStdout, logs: LogSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let overflowed = match read_line_capped(&mut reader, &mut buf, MAX_LOG_LINE_BYTES).await {
                Ok(Some(overflowed)) => overflowed,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("Cannot read sandbox stdout: {}", err);
                    break;
                }
            };

            if overflowed {
                logs.record_text(LogMode::Log, OVERSIZED_LINE_PLACEHOLDER);
                continue;
            }
            let line = String::from_utf8_lossy(&buf);
            match parse_line(line.trim_end_matches('\r')) {
                HarnessLine::Record { mode, args } => logs.record(mode, &args),
                HarnessLine::Raw(text) => logs.record_text(LogMode::Log, text),
            };
        }
        tracing::debug!(
            "Log reader finished: {} entries, truncated={}",
            logs.len(),
            logs.is_truncated()
        );
    })
}

fn spawn_stderr_reader(stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut stderr = stderr;
        let mut tail = Vec::new();
        let mut chunk = [0u8; 4096];

        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&chunk[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let cut = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..cut);
                    }
                }
            }
        }

        String::from_utf8_lossy(&tail).into_owned()
    })
}

/// Polls the limits the kernel does not enforce for this run.
struct Monitor {
    root: PathBuf,
    processes: SharedTree,
    pgid: Option<Pid>,
    scratch_limit: Option<u64>,
    memory_limit: Option<u64>,
    process_limit: Option<u32>,
    breach: Arc<OnceLock<LimitType>>,
}

impl Monitor {
    async fn check(&self) -> Option<LimitType> {
        if let Some(limit) = self.scratch_limit {
            match scratch::dir_size(&self.root).await {
                Ok(size) if size > limit => {
                    tracing::warn!("Scratch directory {:?} grew to {} bytes", self.root, size);
                    return Some(LimitType::ScratchSize);
                }
                Ok(_) => {}
                Err(err) => tracing::debug!("Cannot measure {:?}: {}", self.root, err),
            }
        }

        let processes = self.processes.clone();
        let measure_memory = self.memory_limit.is_some();
        let (count, resident) = tokio::task::spawn_blocking(move || {
            let current = tree::refresh(&processes);
            let usage = (current.len(), measure_memory.then(|| current.resident_bytes()));
            drop(current);
            usage
        })
        .await
        .ok()?;

        if let (Some(limit), Some(resident)) = (self.memory_limit, resident) {
            if resident > limit {
                tracing::warn!("Sandbox tree resident memory reached {} bytes", resident);
                return Some(LimitType::Ram);
            }
        }
        if self.process_limit.is_some_and(|limit| count > limit as usize) {
            tracing::warn!("Sandbox tree reached {} processes", count);
            return Some(LimitType::Processes);
        }
        None
    }
}

fn spawn_monitor(monitor: Monitor) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(MONITOR_INTERVAL_MS));
        loop {
            ticker.tick().await;
            let Some(limit) = monitor.check().await else {
                continue;
            };

            let _ = monitor.breach.set(limit);
            if let Some(pgid) = monitor.pgid {
                let _ = killpg(pgid, Signal::SIGKILL);
            }
            kill_process_tree(&monitor.processes).await;
            break;
        }
    })
}
