//! Transfer jobs, their events and handles

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use crate::s3::error::{S3Error, S3Result};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferKind {
    Upload,
    Download,
    Delete,
    RecursiveUpload,
    RecursiveDownload,
    DeleteBatch,
    DeletePrefix,
}

impl TransferKind {
    /// True for operations that change the bucket
    pub fn is_mutation(&self) -> bool {
        !matches!(self, TransferKind::Download | TransferKind::RecursiveDownload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

/// Snapshot of a job as seen by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferJob {
    pub id: JobId,
    pub kind: TransferKind,
    pub source: String,
    pub destination: String,
    pub state: JobState,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
}

/// One independent piece of a job: a file, an object or a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferUnit {
    pub source: String,
    pub destination: String,
    pub bytes: u64,
}

impl fmt::Display for TransferUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

#[derive(Debug, Clone)]
pub enum UnitOutcome {
    Succeeded { bytes: u64 },
    Failed(Arc<S3Error>),
    /// Stopped, or never started, because the job was cancelled
    Cancelled,
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Succeeded { .. })
    }

    pub fn error(&self) -> Option<&S3Error> {
        match self {
            UnitOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum JobEvent {
    Progress {
        job_id: JobId,
        bytes_transferred: u64,
        bytes_total: u64,
    },
    UnitFinished {
        job_id: JobId,
        unit: TransferUnit,
        outcome: UnitOutcome,
    },
    Finished {
        job_id: JobId,
        state: JobState,
    },
}

/// Final state of a job plus the outcome of every unit, in plan order
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: TransferJob,
    pub units: Vec<(TransferUnit, UnitOutcome)>,
}

impl JobReport {
    pub fn state(&self) -> JobState {
        self.job.state
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &TransferUnit> {
        self.units
            .iter()
            .filter(|(_, outcome)| outcome.is_success())
            .map(|(unit, _)| unit)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&TransferUnit, &S3Error)> {
        self.units
            .iter()
            .filter_map(|(unit, outcome)| outcome.error().map(|e| (unit, e)))
    }

    pub fn success_count(&self) -> usize {
        self.succeeded().count()
    }

    /// Outcome for the unit whose source matches
    pub fn outcome_for(&self, source: &str) -> Option<&UnitOutcome> {
        self.units
            .iter()
            .find(|(unit, _)| unit.source == source)
            .map(|(_, outcome)| outcome)
    }
}

/// Cooperative cancellation signal shared between a job and its handle
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> S3Result<()> {
        if self.is_cancelled() {
            Err(S3Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Emits a job's events; progress is rate limited.
///
/// The byte counter only grows, so progress events of one job are
/// non-decreasing.
#[derive(Debug)]
pub struct ProgressReporter {
    job_id: JobId,
    tx: Option<mpsc::UnboundedSender<JobEvent>>,
    interval: Duration,
    last_emit: Option<Instant>,
    transferred: u64,
    total: u64,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, tx: mpsc::UnboundedSender<JobEvent>, interval: Duration) -> Self {
        Self {
            job_id,
            tx: Some(tx),
            interval,
            last_emit: None,
            transferred: 0,
            total: 0,
        }
    }

    /// A reporter that only counts
    pub fn silent(job_id: JobId) -> Self {
        Self {
            job_id,
            tx: None,
            interval: Duration::ZERO,
            last_emit: None,
            transferred: 0,
            total: 0,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    pub fn advance(&mut self, bytes: u64) {
        self.transferred += bytes;
        let due = self
            .last_emit
            .map_or(true, |last| last.elapsed() >= self.interval);
        if due {
            self.emit_progress();
        }
    }

    /// Emit the current counters regardless of the rate limit
    pub fn emit_progress(&mut self) {
        self.last_emit = Some(Instant::now());
        self.send(JobEvent::Progress {
            job_id: self.job_id,
            bytes_transferred: self.transferred,
            bytes_total: self.total,
        });
    }

    pub fn send(&self, event: JobEvent) {
        if let Some(tx) = &self.tx {
            // The receiver is gone when the UI dropped the handle
            let _ = tx.send(event);
        }
    }
}

/// Caller's side of a running job
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    cancel: CancelFlag,
    events: mpsc::UnboundedReceiver<JobEvent>,
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    pub(crate) fn new(
        id: JobId,
        cancel: CancelFlag,
        events: mpsc::UnboundedReceiver<JobEvent>,
        task: JoinHandle<JobReport>,
    ) -> Self {
        Self {
            id,
            cancel,
            events,
            task,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Request cancellation; takes effect at the next safe point
    pub fn cancel(&self) {
        tracing::info!("Cancellation requested for job {}", self.id);
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Next event, or `None` once the job has finished and all events were read
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Non-blocking poll for UI loops
    pub fn try_next_event(&mut self) -> Option<JobEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the job to end and return its report
    pub async fn wait(self) -> Result<JobReport, JoinError> {
        self.task.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(source: &str) -> TransferUnit {
        TransferUnit {
            source: source.to_string(),
            destination: format!("dest/{}", source),
            bytes: 1,
        }
    }

    #[test]
    fn test_cancel_flag_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(flag.check().is_ok());
        other.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(S3Error::Cancelled)));
    }

    #[test]
    fn test_progress_is_throttled_and_monotonic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = ProgressReporter::new(7, tx, Duration::from_secs(3600));
        reporter.set_total(30);
        for _ in 0..10 {
            reporter.advance(3);
        }
        reporter.emit_progress();

        let mut seen = Vec::new();
        while let Ok(JobEvent::Progress {
            job_id,
            bytes_transferred,
            bytes_total,
        }) = rx.try_recv()
        {
            assert_eq!(job_id, 7);
            assert_eq!(bytes_total, 30);
            seen.push(bytes_transferred);
        }
        // First advance plus the forced final event
        assert_eq!(seen, vec![3, 30]);
    }

    #[test]
    fn test_progress_without_limit_emits_every_step() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = ProgressReporter::new(1, tx, Duration::ZERO);
        reporter.advance(1);
        reporter.advance(2);
        let mut values = Vec::new();
        while let Ok(JobEvent::Progress { bytes_transferred, .. }) = rx.try_recv() {
            values.push(bytes_transferred);
        }
        assert_eq!(values, vec![1, 3]);
    }

    #[test]
    fn test_silent_reporter_counts() {
        let mut reporter = ProgressReporter::silent(1);
        reporter.advance(5);
        reporter.advance(5);
        assert_eq!(reporter.transferred(), 10);
    }

    #[test]
    fn test_report_helpers() {
        let report = JobReport {
            job: TransferJob {
                id: 1,
                kind: TransferKind::DeleteBatch,
                source: "assets".to_string(),
                destination: String::new(),
                state: JobState::Failed,
                bytes_transferred: 0,
                bytes_total: 0,
            },
            units: vec![
                (unit("a"), UnitOutcome::Succeeded { bytes: 1 }),
                (
                    unit("b"),
                    UnitOutcome::Failed(Arc::new(S3Error::NotFound("b".to_string()))),
                ),
                (unit("c"), UnitOutcome::Cancelled),
            ],
        };
        assert_eq!(report.success_count(), 1);
        let failures: Vec<&str> = report.failures().map(|(u, _)| u.source.as_str()).collect();
        assert_eq!(failures, vec!["b"]);
        assert!(matches!(report.outcome_for("c"), Some(UnitOutcome::Cancelled)));
        assert!(report.state().is_terminal());
        assert!(!TransferKind::RecursiveDownload.is_mutation());
        assert!(TransferKind::DeletePrefix.is_mutation());
    }
}
