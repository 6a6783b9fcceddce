use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use serde_json::Value;

use crate::{
    constants::UNSERIALIZABLE_PLACEHOLDER,
    core::domain::{LogEntry, LogMode, RunId},
};

#[derive(Clone, Debug)]
pub struct LogLimits {
    pub run_bytes: u64,
    pub total_bytes: u64,
}

/// Shared entry point for run log sinks. Tracks how many log bytes are held
/// by unfinished runs so the total volume stays bounded across runs.
#[derive(Clone, Debug)]
pub struct LogCollector {
    inner: Arc<CollectorInner>,
}

#[derive(Debug)]
struct CollectorInner {
    limits: LogLimits,
    in_flight_bytes: AtomicU64,
}

impl CollectorInner {
    fn try_reserve(&self, bytes: u64) -> bool {
        self.in_flight_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(bytes)?;
                (next <= self.limits.total_bytes).then_some(next)
            })
            .is_ok()
    }

    fn release(&self, bytes: u64) {
        if bytes > 0 {
            self.in_flight_bytes.fetch_sub(bytes, Ordering::AcqRel);
        }
    }
}

impl LogCollector {
    pub fn new(limits: LogLimits) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                limits,
                in_flight_bytes: AtomicU64::new(0),
            }),
        }
    }

    pub fn open(&self, run_id: RunId) -> LogSink {
        LogSink {
            inner: Arc::new(SinkInner {
                run_id,
                collector: self.inner.clone(),
                state: Mutex::new(SinkState::default()),
            }),
        }
    }

    pub fn in_flight_bytes(&self) -> u64 {
        self.inner.in_flight_bytes.load(Ordering::Acquire)
    }
}

/// Append-only log of a single run. Clones share the same entries.
#[derive(Clone, Debug)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

#[derive(Debug)]
struct SinkInner {
    run_id: RunId,
    collector: Arc<CollectorInner>,
    state: Mutex<SinkState>,
}

#[derive(Debug, Default)]
struct SinkState {
    entries: Vec<LogEntry>,
    reserved_bytes: u64,
    truncated: bool,
    frozen: bool,
}

#[derive(Clone, Debug, Default)]
pub struct LogSnapshot {
    pub entries: Vec<LogEntry>,
    pub truncated: bool,
}

impl LogSink {
    /// Records one console call. Returns `false` when the entry was dropped.
    pub fn record(&self, mode: LogMode, args: &[Value]) -> bool {
        self.push(LogEntry::new(mode, args.iter().map(display_arg).collect()))
    }

    pub fn record_text(&self, mode: LogMode, text: impl Into<String>) -> bool {
        self.push(LogEntry::new(mode, vec![text.into()]))
    }

    pub fn record_strings(&self, mode: LogMode, args: Vec<String>) -> bool {
        self.push(LogEntry::new(mode, args))
    }

    fn push(&self, entry: LogEntry) -> bool {
        let mut state = self.lock();
        if state.frozen || state.truncated {
            return false;
        }

        let size = entry.payload_size();
        let limits = &self.inner.collector.limits;
        let exhausted = if state.reserved_bytes + size > limits.run_bytes {
            Some(format!("per-run limit of {} bytes", limits.run_bytes))
        } else if !self.inner.collector.try_reserve(size) {
            Some(format!("shared limit of {} bytes", limits.total_bytes))
        } else {
            None
        };
        if let Some(limit) = exhausted {
            tracing::warn!(
                run_id = %self.inner.run_id,
                reserved_bytes = state.reserved_bytes,
                "log output truncated: {}",
                limit
            );
            state.truncated = true;
            state.entries.push(LogEntry::new(
                LogMode::Error,
                vec![format!("[log output truncated: {limit} reached]")],
            ));
            return false;
        }

        state.reserved_bytes += size;
        state.entries.push(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_truncated(&self) -> bool {
        self.lock().truncated
    }

    /// Stops accepting entries and returns everything recorded so far.
    /// Calling it again returns the same snapshot.
    pub fn freeze(&self) -> LogSnapshot {
        let mut state = self.lock();
        state.frozen = true;
        self.inner.collector.release(state.reserved_bytes);
        state.reserved_bytes = 0;

        LogSnapshot {
            entries: state.entries.clone(),
            truncated: state.truncated,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SinkInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        self.collector.release(state.reserved_bytes);
    }
}

/// Renders one console argument the way the result panel shows it.
pub fn display_arg(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other)
            .unwrap_or_else(|_| UNSERIALIZABLE_PLACEHOLDER.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn collector(run_bytes: u64, total_bytes: u64) -> LogCollector {
        LogCollector::new(LogLimits {
            run_bytes,
            total_bytes,
        })
    }

    #[test]
    fn test_record_preserves_order() {
        let sink = collector(1024, 4096).open(Uuid::new_v4());

        sink.record(LogMode::Log, &[json!("a")]);
        sink.record(LogMode::Error, &[json!("b")]);
        sink.record(LogMode::Log, &[json!("c"), json!(1)]);

        let snapshot = sink.freeze();
        assert_eq!(
            snapshot.entries,
            vec![
                LogEntry::new(LogMode::Log, vec!["a".to_string()]),
                LogEntry::new(LogMode::Error, vec!["b".to_string()]),
                LogEntry::new(LogMode::Log, vec!["c".to_string(), "1".to_string()]),
            ]
        );
        assert!(!snapshot.truncated);
    }

    #[test]
    fn test_display_arg() {
        assert_eq!(display_arg(&json!("text")), "text");
        assert_eq!(display_arg(&json!(null)), "null");
        assert_eq!(display_arg(&json!(true)), "true");
        assert_eq!(display_arg(&json!({"a": [1, 2]})), r#"{"a":[1,2]}"#);
    }

    #[test]
    fn test_run_limit_truncates_once() {
        let sink = collector(8, 4096).open(Uuid::new_v4());

        assert!(sink.record_text(LogMode::Log, "12345"));
        assert!(!sink.record_text(LogMode::Log, "67890"));
        assert!(!sink.record_text(LogMode::Log, "x"));

        let snapshot = sink.freeze();
        assert!(snapshot.truncated);
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries[1].mode, LogMode::Error);
        assert_eq!(
            snapshot.entries[1].args[0],
            "[log output truncated: per-run limit of 8 bytes reached]"
        );
    }

    #[test]
    fn test_total_budget_shared_between_runs() {
        let collector = collector(100, 10);
        let first = collector.open(Uuid::new_v4());
        let second = collector.open(Uuid::new_v4());

        assert!(first.record_text(LogMode::Log, "123456"));
        assert!(!second.record_text(LogMode::Log, "123456"));
        assert!(second.is_truncated());
        assert_eq!(collector.in_flight_bytes(), 6);
        assert_eq!(
            second.freeze().entries[0].args[0],
            "[log output truncated: shared limit of 10 bytes reached]"
        );

        first.freeze();
        assert_eq!(collector.in_flight_bytes(), 0);

        let third = collector.open(Uuid::new_v4());
        assert!(third.record_text(LogMode::Log, "123456"));
        drop(third);
        assert_eq!(collector.in_flight_bytes(), 0);
    }

    #[test]
    fn test_frozen_sink_rejects_entries() {
        let sink = collector(1024, 4096).open(Uuid::new_v4());
        sink.record_text(LogMode::Log, "before");

        let first = sink.freeze();
        assert!(!sink.record_text(LogMode::Log, "after"));
        let second = sink.freeze();

        assert_eq!(first.entries, second.entries);
        assert_eq!(second.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_every_entry() {
        let sink = collector(1 << 20, 1 << 20).open(Uuid::new_v4());

        let handles: Vec<_> = (0..8)
            .map(|task| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    for i in 0..50 {
                        sink.record_text(LogMode::Log, format!("{task}-{i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let entries = sink.freeze().entries;
        assert_eq!(entries.len(), 400);

        // Each writer's own entries stay in the order it issued them.
        for task in 0..8 {
            let own: Vec<_> = entries
                .iter()
                .filter_map(|entry| entry.args[0].strip_prefix(&format!("{task}-")))
                .map(|i| i.parse::<usize>().unwrap())
                .collect();
            assert_eq!(own, (0..50).collect::<Vec<_>>());
        }
    }
}
