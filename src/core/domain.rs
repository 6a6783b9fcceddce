use chrono::{DateTime, Utc};
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Clone, Debug)]
pub struct Submission {
    pub code: String,
}

impl Submission {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

#[derive(Clone, Debug)]
pub struct Run {
    pub id: RunId,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub logs: Vec<LogEntry>,
    pub artifacts: Vec<ArtifactRef>,
    pub truncated: bool,
    pub error: Option<String>,
}

impl Run {
    pub fn new(id: RunId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: RunStatus::Pending,
            logs: Vec::new(),
            artifacts: Vec::new(),
            truncated: false,
            error: None,
        }
    }

    pub fn change_status(&self, status: RunStatus) -> Self {
        let started_at = match status {
            RunStatus::Running => Some(Utc::now()),
            _ => self.started_at,
        };

        Self {
            status,
            started_at,
            ..self.clone()
        }
    }

    /// Moves the run into a terminal state. Logs and artifacts are frozen from here on.
    pub fn finish(self, outcome: RunOutcome) -> Self {
        Self {
            status: outcome.status,
            logs: outcome.logs,
            artifacts: outcome.artifacts,
            truncated: outcome.truncated,
            error: outcome.error,
            finished_at: Some(Utc::now()),
            ..self
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id,
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            log_count: self.logs.len(),
            artifact_count: self.artifacts.len(),
            error: self.error.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub logs: Vec<LogEntry>,
    pub artifacts: Vec<ArtifactRef>,
    pub truncated: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RunSummary {
    pub id: RunId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_count: usize,
    pub artifact_count: usize,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Rejected,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogMode {
    Log,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogEntry {
    pub mode: LogMode,
    pub args: Vec<String>,
}

impl LogEntry {
    pub fn new(mode: LogMode, args: Vec<String>) -> Self {
        Self { mode, args }
    }

    pub fn payload_size(&self) -> u64 {
        self.args.iter().map(|arg| arg.len() as u64).sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactRef {
    pub key: ArtifactKey,
    pub public_url: String,
    pub filename: String,
    pub mimetype: String,
}

/// Storage key of an artifact: the owning run plus a per-run sequence number.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    pub run_id: RunId,
    pub seq: u64,
}

#[derive(Clone, Debug)]
pub struct ExecutionLimits {
    pub time_ms: u64,
    pub teardown_grace_ms: u64,
    pub cpu_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub pids_count: Option<u32>,
    pub scratch_size_bytes: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitType {
    Time,
    CpuTime,
    Ram,
    Processes,
    ScratchSize,
}

impl LimitType {
    /// CPU exhaustion is reported to the caller like a wall-clock timeout.
    pub fn run_status(&self) -> RunStatus {
        match self {
            LimitType::Time | LimitType::CpuTime => RunStatus::TimedOut,
            LimitType::Ram | LimitType::Processes | LimitType::ScratchSize => RunStatus::Failed,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            LimitType::Time => "wall-clock time limit exceeded",
            LimitType::CpuTime => "CPU time limit exceeded",
            LimitType::Ram => "memory limit exceeded",
            LimitType::Processes => "process count limit exceeded",
            LimitType::ScratchSize => "scratch directory size limit exceeded",
        }
    }
}
