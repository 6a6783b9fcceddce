use crate::{
    core::{domain, queue},
    http::models,
};

impl From<models::RunRequest> for domain::Submission {
    fn from(req: models::RunRequest) -> Self {
        domain::Submission::new(req.code)
    }
}

impl From<&domain::Run> for models::RunResponse {
    fn from(run: &domain::Run) -> Self {
        Self {
            run_id: run.id,
            status: run.status.into(),
            files: run.artifacts.iter().map(Into::into).collect(),
            logs: run.logs.iter().map(Into::into).collect(),
            truncated: run.truncated,
            error: run.error.clone(),
            duration_ms: run.duration_ms(),
        }
    }
}

impl From<&domain::ArtifactRef> for models::File {
    fn from(artifact: &domain::ArtifactRef) -> Self {
        Self {
            public_url: artifact.public_url.clone(),
            filename: artifact.filename.clone(),
            mimetype: artifact.mimetype.clone(),
        }
    }
}

impl From<&domain::LogEntry> for models::LogEntry {
    fn from(entry: &domain::LogEntry) -> Self {
        Self {
            mode: entry.mode.into(),
            args: entry.args.clone(),
        }
    }
}

impl From<domain::LogMode> for models::LogMode {
    fn from(mode: domain::LogMode) -> Self {
        match mode {
            domain::LogMode::Log => models::LogMode::Log,
            domain::LogMode::Error => models::LogMode::Error,
        }
    }
}

impl From<domain::RunStatus> for models::RunStatus {
    fn from(status: domain::RunStatus) -> Self {
        match status {
            domain::RunStatus::Pending => models::RunStatus::Pending,
            domain::RunStatus::Running => models::RunStatus::Running,
            domain::RunStatus::Succeeded => models::RunStatus::Succeeded,
            domain::RunStatus::Failed => models::RunStatus::Failed,
            domain::RunStatus::TimedOut => models::RunStatus::TimedOut,
            domain::RunStatus::Rejected => models::RunStatus::Rejected,
            domain::RunStatus::Cancelled => models::RunStatus::Cancelled,
        }
    }
}

impl From<domain::RunSummary> for models::RunSummary {
    fn from(summary: domain::RunSummary) -> Self {
        Self {
            run_id: summary.id,
            status: summary.status.into(),
            created_at: summary.created_at,
            started_at: summary.started_at,
            finished_at: summary.finished_at,
            log_count: summary.log_count,
            file_count: summary.artifact_count,
            error: summary.error,
        }
    }
}

impl From<queue::QueueStats> for models::QueueStats {
    fn from(stats: queue::QueueStats) -> Self {
        Self {
            capacity: stats.capacity,
            waiting: stats.waiting,
            running: stats.running,
        }
    }
}
