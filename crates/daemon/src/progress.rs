//! Structured progress reporting.
//!
//! Coordinators emit [`ProgressRecord`]s through a [`ProgressReporter`]; the
//! scheduler forwards them to the injected [`ProgressSink`], which owns all
//! formatting.

use crate::task::{TaskId, TaskReport};
use async_trait::async_trait;
use relay_daemon_config::ProfileName;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// What part of a task a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "profile", rename_all = "snake_case")]
pub enum Phase {
    ResolvingMetadata,
    Downloading,
    Verifying,
    Encoding(ProfileName),
    Uploading(ProfileName),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::ResolvingMetadata => f.write_str("resolving metadata"),
            Phase::Downloading => f.write_str("downloading"),
            Phase::Verifying => f.write_str("verifying"),
            Phase::Encoding(p) => write!(f, "encoding {}", p),
            Phase::Uploading(p) => write!(f, "uploading {}", p),
        }
    }
}

/// One progress observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressRecord {
    pub phase: Phase,
    /// 0.0 ..= 100.0
    pub percent: f64,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    /// Bytes per second.
    pub rate: u64,
    pub eta: Option<Duration>,
}

impl ProgressRecord {
    /// Record for a phase with no byte counts yet.
    pub fn started(phase: Phase) -> Self {
        Self {
            phase,
            percent: 0.0,
            bytes_done: 0,
            bytes_total: None,
            rate: 0,
            eta: None,
        }
    }

    /// Record derived from byte counters; percent and ETA are computed.
    pub fn from_bytes(phase: Phase, done: u64, total: Option<u64>, rate: u64) -> Self {
        Self {
            phase,
            percent: total.map(|t| percent(done, t)).unwrap_or(0.0),
            bytes_done: done,
            bytes_total: total,
            rate,
            eta: total.and_then(|t| eta(done, t, rate)),
        }
    }
}

/// Percent complete, clamped to 0..=100. An unknown (zero) total reads as 0.
pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Remaining time at the current rate; None when the rate is zero or the total unknown.
pub fn eta(done: u64, total: u64, rate: u64) -> Option<Duration> {
    if rate == 0 || total == 0 {
        return None;
    }
    let remaining = total.saturating_sub(done);
    Some(Duration::from_secs(remaining.div_ceil(rate)))
}

/// A progress record tagged with its task.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub record: ProgressRecord,
}

/// Cheap handle coordinators use to publish progress without awaiting the sink.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    pub fn new(task_id: TaskId, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            task_id,
            tx: Some(tx),
        }
    }

    /// Reporter that drops every record.
    pub fn detached() -> Self {
        Self {
            task_id: TaskId::new(),
            tx: None,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn report(&self, record: ProgressRecord) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is listening anymore.
            let _ = tx.send(ProgressEvent {
                task_id: self.task_id,
                record,
            });
        }
    }
}

/// Caller-supplied status reporting collaborator.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn progress(&self, task_id: TaskId, record: &ProgressRecord);

    /// Terminal summary for a task.
    async fn finished(&self, report: &TaskReport);
}

/// Sink that writes everything to the tracing log.
#[derive(Debug, Default, Clone)]
pub struct TracingProgressSink;

#[async_trait]
impl ProgressSink for TracingProgressSink {
    async fn progress(&self, task_id: TaskId, record: &ProgressRecord) {
        info!(
            task_id = %task_id,
            phase = %record.phase,
            percent = format_args!("{:.1}", record.percent),
            bytes_done = record.bytes_done,
            rate = record.rate,
            eta_secs = record.eta.map(|d| d.as_secs()),
            "progress"
        );
    }

    async fn finished(&self, report: &TaskReport) {
        info!(
            task_id = %report.task_id,
            status = report.status.as_str(),
            warnings = report.has_warnings(),
            "task finished\n{}",
            report
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_percent_bounded(done: u64, total: u64) {
            let p = percent(done, total);
            prop_assert!((0.0..=100.0).contains(&p));
        }

        #[test]
        fn prop_eta_covers_remaining(done in 0u64..1 << 40, total in 1u64..1 << 40, rate in 1u64..1 << 30) {
            let eta = eta(done, total, rate).unwrap();
            let remaining = total.saturating_sub(done);
            prop_assert!(eta.as_secs() * rate >= remaining);
            prop_assert!(eta.as_secs() <= remaining / rate + 1);
        }
    }

    #[test]
    fn test_eta_unknown_without_rate() {
        assert_eq!(eta(10, 100, 0), None);
        assert_eq!(eta(10, 0, 5), None);
    }

    #[test]
    fn test_record_from_bytes() {
        let record = ProgressRecord::from_bytes(Phase::Downloading, 50, Some(200), 10);
        assert!((record.percent - 25.0).abs() < 1e-9);
        assert_eq!(record.eta, Some(Duration::from_secs(15)));

        let unknown = ProgressRecord::from_bytes(Phase::Downloading, 50, None, 10);
        assert_eq!(unknown.percent, 0.0);
        assert_eq!(unknown.eta, None);
    }

    #[tokio::test]
    async fn test_reporter_tags_task() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = TaskId::new();
        let reporter = ProgressReporter::new(id, tx);
        reporter.report(ProgressRecord::started(Phase::ResolvingMetadata));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, id);
        assert_eq!(event.record.phase, Phase::ResolvingMetadata);
    }

    #[test]
    fn test_detached_reporter_is_silent() {
        ProgressReporter::detached().report(ProgressRecord::started(Phase::Verifying));
    }
}
