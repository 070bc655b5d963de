//! Analysis Scheduler
//!
//! Triggers arrive per subject. Triggers for the same subject inside the
//! debounce window coalesce into a single job, and a trigger arriving while
//! that subject is being analyzed queues one more run after the current one,
//! so a subject is never analyzed twice at the same time.
//!
//! Jobs run on a bounded pool: a semaphore caps concurrency and the
//! synchronous core analysis runs on the blocking thread pool.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_with::{serde_as, DurationMilliSeconds};
use rangewatch_core::{analyze_subject, AnalysisContext, AnalyzerError, AnalyzerRun};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_graceful_shutdown::SubsystemHandle;

use crate::error::ServerError;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(60);
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub debounce: Duration,
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            debounce: DEFAULT_DEBOUNCE,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Outcome of one job
#[derive(Debug)]
pub struct JobReport {
    pub subject_id: String,
    pub outcome: Result<Vec<AnalyzerRun>, ServerError>,
}

impl JobReport {
    /// Events created by this job
    pub fn event_count(&self) -> usize {
        match &self.outcome {
            Ok(runs) => runs
                .iter()
                .flat_map(|r| r.outcomes())
                .filter(|o| o.event.is_some())
                .count(),
            Err(_) => 0,
        }
    }
}

/// Totals of a batch of jobs, printed by `--once`
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub subjects: usize,
    pub results: usize,
    pub events: usize,
    /// Subject id and error of every failed job
    pub failures: Vec<(String, String)>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "elapsed_ms")]
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn new(reports: &[JobReport], elapsed: Duration) -> Self {
        let mut summary = RunSummary {
            subjects: reports.len(),
            results: 0,
            events: 0,
            failures: Vec::new(),
            elapsed,
        };
        for report in reports {
            match &report.outcome {
                Ok(runs) => {
                    summary.results += runs.iter().map(|r| r.outcomes().len()).sum::<usize>();
                    summary.events += report.event_count();
                }
                Err(e) => summary
                    .failures
                    .push((report.subject_id.clone(), e.to_string())),
            }
        }
        summary
    }
}

/// Debounce and single-flight bookkeeping
#[derive(Debug)]
struct TriggerQueue {
    debounce: Duration,
    /// Subject -> when its coalesced job becomes due
    pending: HashMap<String, Instant>,
    in_flight: HashSet<String>,
    /// Triggered again while in flight
    rerun: HashSet<String>,
}

impl TriggerQueue {
    fn new(debounce: Duration) -> Self {
        TriggerQueue {
            debounce,
            pending: HashMap::new(),
            in_flight: HashSet::new(),
            rerun: HashSet::new(),
        }
    }

    /// Returns false when the trigger was folded into an existing job
    fn trigger(&mut self, subject_id: String, now: Instant) -> bool {
        if self.in_flight.contains(&subject_id) {
            return self.rerun.insert(subject_id);
        }
        if self.pending.contains_key(&subject_id) {
            return false;
        }
        self.pending.insert(subject_id, now + self.debounce);
        true
    }

    fn next_due(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Due subjects, now marked in flight
    fn take_due(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();
        for id in &due {
            self.pending.remove(id);
            self.in_flight.insert(id.clone());
        }
        due
    }

    fn finished(&mut self, subject_id: &str, now: Instant) {
        self.in_flight.remove(subject_id);
        if self.rerun.remove(subject_id) {
            self.pending
                .insert(subject_id.to_string(), now + self.debounce);
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }
}

/// Handle used to request analysis of a subject
#[derive(Debug, Clone)]
pub struct AnalysisScheduler {
    tx: mpsc::UnboundedSender<String>,
}

impl AnalysisScheduler {
    pub fn trigger(&self, subject_id: &str) -> Result<(), ServerError> {
        self.tx
            .send(subject_id.to_string())
            .map_err(|_| ServerError::Shutdown)
    }
}

/// The scheduler's event loop, run as a subsystem
pub struct SchedulerLoop {
    ctx: Arc<AnalysisContext>,
    config: SchedulerConfig,
    rx: mpsc::UnboundedReceiver<String>,
    reports: Option<mpsc::UnboundedSender<JobReport>>,
}

pub fn scheduler(
    ctx: Arc<AnalysisContext>,
    config: SchedulerConfig,
) -> (AnalysisScheduler, SchedulerLoop) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        AnalysisScheduler { tx },
        SchedulerLoop {
            ctx,
            config,
            rx,
            reports: None,
        },
    )
}

impl SchedulerLoop {
    /// Forward every job report to `tx`
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<JobReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), ServerError> {
        self.run_until(subsys.on_shutdown_requested()).await
    }

    /// Run until `shutdown` completes, or until every trigger handle is gone
    /// and no work is left.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let SchedulerLoop {
            ctx,
            config,
            mut rx,
            reports,
        } = self;
        tokio::pin!(shutdown);

        let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
        let mut queue = TriggerQueue::new(config.debounce);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<JobReport>();
        let mut open = true;

        log::info!(
            "Scheduler started: debounce {:?}, {} worker(s)",
            config.debounce,
            config.workers.max(1)
        );

        loop {
            let next_due = queue.next_due();
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Scheduler shutdown requested");
                    if !queue.pending.is_empty() {
                        log::info!("Dropping {} pending analysis trigger(s)", queue.pending.len());
                    }
                    break;
                }
                msg = rx.recv(), if open => {
                    match msg {
                        Some(subject_id) => {
                            if !queue.trigger(subject_id.clone(), Instant::now()) {
                                log::debug!("Trigger for {} coalesced", subject_id);
                            }
                        }
                        None => {
                            log::debug!("Trigger channel closed");
                            open = false;
                        }
                    }
                }
                _ = sleep_until(next_due) => {
                    for subject_id in queue.take_due(Instant::now()) {
                        let ctx = ctx.clone();
                        let semaphore = semaphore.clone();
                        let done_tx = done_tx.clone();
                        tokio::spawn(async move {
                            let report = match semaphore.acquire_owned().await {
                                Ok(_permit) => run_job(ctx, subject_id).await,
                                Err(_) => JobReport {
                                    subject_id,
                                    outcome: Err(ServerError::Shutdown),
                                },
                            };
                            let _ = done_tx.send(report);
                        });
                    }
                }
                Some(report) = done_rx.recv() => {
                    queue.finished(&report.subject_id, Instant::now());
                    log_report(&report);
                    if let Some(tx) = &reports {
                        let _ = tx.send(report);
                    }
                }
            }

            if !open && queue.is_idle() {
                break;
            }
        }

        log::info!("Scheduler finished");
        Ok(())
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

async fn run_job(ctx: Arc<AnalysisContext>, subject_id: String) -> JobReport {
    let id = subject_id.clone();
    let outcome = match tokio::task::spawn_blocking(move || analyze_subject(&ctx, &id, Utc::now())).await
    {
        Ok(Ok(runs)) => Ok(runs),
        Ok(Err(err)) => Err(ServerError::Analyzer(err)),
        Err(err) => Err(ServerError::Analyzer(AnalyzerError::Store(format!(
            "analysis task failed: {}",
            err
        )))),
    };
    JobReport {
        subject_id,
        outcome,
    }
}

fn log_report(report: &JobReport) {
    match &report.outcome {
        Ok(runs) => log::debug!(
            "Analyzed {} with {} analyzer(s), {} event(s)",
            report.subject_id,
            runs.len(),
            report.event_count()
        ),
        Err(ServerError::Analyzer(err @ AnalyzerError::InactiveSubject(_))) => {
            log::warn!("Skipping {}: {}", report.subject_id, err)
        }
        Err(err) => log::error!("Analysis of {} failed: {}", report.subject_id, err),
    }
}

/// Analyze each subject once on the worker pool and wait for all of them
pub async fn run_once(
    ctx: Arc<AnalysisContext>,
    subject_ids: Vec<String>,
    workers: usize,
) -> Vec<JobReport> {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut jobs = JoinSet::new();
    for subject_id in subject_ids {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        jobs.spawn(async move {
            match semaphore.acquire_owned().await {
                Ok(_permit) => run_job(ctx, subject_id).await,
                Err(_) => JobReport {
                    subject_id,
                    outcome: Err(ServerError::Shutdown),
                },
            }
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = jobs.join_next().await {
        match joined {
            Ok(report) => {
                log_report(&report);
                reports.push(report);
            }
            Err(e) => log::error!("Analysis job failed: {}", e),
        }
    }
    reports.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangewatch_core::analyzer::SubjectGroup;
    use rangewatch_core::features::{FeatureGeometry, FeatureGroup, SpatialFeature};
    use rangewatch_core::{
        Deployment, GeofenceAnalyzerConfig, MemoryEventSink, MemoryObservationStore,
        MemoryQuietCache, MemoryResultStore, Observation, Subject,
    };

    struct Fixture {
        ctx: Arc<AnalysisContext>,
        events: Arc<MemoryEventSink>,
    }

    /// Two subjects, each walking east across a north-south fence
    fn fixture() -> Fixture {
        let mut config = GeofenceAnalyzerConfig::new("gf-1", "Fences", "herd");
        config.critical_geofence_group = Some("fences".into());
        let deployment = Arc::new(Deployment {
            features: vec![SpatialFeature::new(
                "road",
                "Boundary Road",
                FeatureGeometry::LineString(vec![[35.305, -1.22], [35.305, -1.19]]),
            )],
            feature_groups: vec![FeatureGroup {
                id: "fences".into(),
                name: "Fences".into(),
                features: vec!["road".into()],
            }],
            subjects: vec![Subject::new("dumbo", "Dumbo"), Subject::new("jolie", "Jolie")],
            subject_groups: vec![SubjectGroup {
                id: "herd".into(),
                name: "Herd".into(),
                subjects: vec!["dumbo".into(), "jolie".into()],
                parents: vec![],
            }],
            geofence_analyzers: vec![config],
            ..Default::default()
        });

        let observations = Arc::new(MemoryObservationStore::new());
        let now = Utc::now();
        for (i, subject) in ["dumbo", "jolie"].into_iter().enumerate() {
            for (hours_ago, lon) in [(3, 35.301), (2, 35.307)] {
                observations.add(Observation {
                    subject_id: subject.into(),
                    source_id: format!("collar-{}", i),
                    recorded_at: now - chrono::Duration::hours(hours_ago),
                    longitude: lon,
                    latitude: -1.205,
                });
            }
        }

        let events = Arc::new(MemoryEventSink::new());
        let ctx = Arc::new(AnalysisContext::new(
            deployment.clone(),
            deployment,
            observations,
            Arc::new(MemoryResultStore::new()),
            events.clone(),
            Arc::new(MemoryQuietCache::new()),
        ));
        Fixture { ctx, events }
    }

    fn config(debounce_ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            debounce: Duration::from_millis(debounce_ms),
            workers: 2,
        }
    }

    #[test]
    fn test_trigger_queue_coalesces() {
        let mut queue = TriggerQueue::new(Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(queue.trigger("dumbo".into(), t0));
        assert!(!queue.trigger("dumbo".into(), t0 + Duration::from_secs(10)));
        assert_eq!(queue.next_due(), Some(t0 + Duration::from_secs(60)));

        assert!(queue.take_due(t0 + Duration::from_secs(30)).is_empty());
        assert_eq!(queue.take_due(t0 + Duration::from_secs(60)), vec!["dumbo"]);
        assert!(!queue.is_idle());
    }

    #[test]
    fn test_trigger_queue_single_flight() {
        let mut queue = TriggerQueue::new(Duration::from_secs(60));
        let t0 = Instant::now();
        queue.trigger("dumbo".into(), t0);
        queue.take_due(t0 + Duration::from_secs(60));

        // Arrives mid-run: queued behind the running job, not started now
        assert!(queue.trigger("dumbo".into(), t0 + Duration::from_secs(61)));
        assert!(!queue.trigger("dumbo".into(), t0 + Duration::from_secs(62)));
        assert!(queue.next_due().is_none());

        let done = t0 + Duration::from_secs(70);
        queue.finished("dumbo", done);
        assert_eq!(queue.next_due(), Some(done + Duration::from_secs(60)));

        queue.take_due(done + Duration::from_secs(60));
        queue.finished("dumbo", done + Duration::from_secs(61));
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_repeated_triggers_run_once() {
        let f = fixture();
        let (handle, scheduler_loop) = scheduler(f.ctx.clone(), config(50));
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        for _ in 0..3 {
            handle.trigger("dumbo").unwrap();
        }
        drop(handle);

        scheduler_loop
            .with_reports(report_tx)
            .run_until(std::future::pending())
            .await
            .unwrap();

        let report = report_rx.recv().await.unwrap();
        assert_eq!(report.subject_id, "dumbo");
        assert_eq!(report.event_count(), 1);
        assert!(report_rx.recv().await.is_none());
        assert_eq!(f.events.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_subjects() {
        let f = fixture();
        let (handle, scheduler_loop) = scheduler(f.ctx.clone(), config(10));
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        handle.trigger("nobody").unwrap();
        handle.trigger("jolie").unwrap();
        drop(handle);

        scheduler_loop
            .with_reports(report_tx)
            .run_until(std::future::pending())
            .await
            .unwrap();

        let mut reports = Vec::new();
        while let Some(report) = report_rx.recv().await {
            reports.push(report);
        }
        reports.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].subject_id, "jolie");
        assert_eq!(reports[0].event_count(), 1);
        assert!(matches!(
            reports[1].outcome,
            Err(ServerError::Analyzer(AnalyzerError::NoSuchSubject(_)))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending() {
        let f = fixture();
        let (handle, scheduler_loop) = scheduler(f.ctx.clone(), config(60_000));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(scheduler_loop.run_until(async {
            let _ = stop_rx.await;
        }));

        handle.trigger("dumbo").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(()).unwrap();

        task.await.unwrap().unwrap();
        assert!(f.events.is_empty());
        assert!(matches!(handle.trigger("dumbo"), Err(ServerError::Shutdown)));
    }

    #[tokio::test]
    async fn test_run_once() {
        let f = fixture();
        let reports = run_once(
            f.ctx.clone(),
            vec!["jolie".into(), "dumbo".into()],
            DEFAULT_WORKERS,
        )
        .await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].subject_id, "dumbo");
        assert!(reports.iter().all(|r| r.event_count() == 1));
        assert_eq!(f.events.len(), 2);

        let summary = RunSummary::new(&reports, Duration::from_millis(1500));
        assert_eq!((summary.subjects, summary.results, summary.events), (2, 2, 2));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["elapsed_ms"], 1500);

        // Second pass finds nothing new
        let reports = run_once(f.ctx.clone(), vec!["dumbo".into(), "nobody".into()], 1).await;
        let summary = RunSummary::new(&reports, Duration::ZERO);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, "nobody");
        assert_eq!(reports[0].event_count(), 0);
        assert_eq!(f.events.len(), 2);
    }
}
