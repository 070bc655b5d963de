//! Geofence Analyzer
//!
//! Drives one analyzer configuration over a subject's recent observations:
//!
//! ```text
//! Idle -> FetchingObservations -> BuildingTrajectory
//!      -> DetectingCrossings -> PersistingResults -> Idle
//! ```
//!
//! Too little data ends the run early without side effects. Any other
//! failure is confined to the configuration that raised it, so one broken
//! analyzer never blocks the others of the same subject.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use strum::Display;

use crate::error::AnalyzerError;
use crate::events::{EventRef, EventRequest, EventSink};
use crate::features::FeatureProvider;
use crate::quiet::{AnalyzerKey, QuietPeriodCache, QuietPeriodGate};
use crate::results::{AnalyzerResult, ResultStore};
use crate::trajectory::{CoordinateFilter, Trajectory, TrajectoryFilter, MIN_FIXES};

mod config;
mod deployment;
mod pipeline;
mod source;
mod subject;

pub use config::{GeofenceAnalyzerConfig, DEFAULT_SEARCH_TIME_HOURS};
pub use deployment::Deployment;
pub use pipeline::GeofenceAnalyzer;
pub use source::{MemoryObservationStore, Observation, ObservationQuery, ObservationSource};
pub use subject::{Subject, SubjectGroup, TrackSegmentFilter};

/// Read access to subjects and analyzer configurations
pub trait ConfigStore: Send + Sync {
    fn subject(&self, subject_id: &str) -> Option<Subject>;

    fn subject_ids(&self) -> Vec<String>;

    fn subject_group(&self, group_id: &str) -> Option<SubjectGroup>;

    /// Groups listing the subject directly
    fn groups_containing(&self, subject_id: &str) -> Vec<SubjectGroup>;

    fn analyzer_configs(&self) -> Vec<GeofenceAnalyzerConfig>;

    fn track_filter(&self, subtype: &str) -> Option<TrackSegmentFilter>;

    /// Every group the subject belongs to, directly or through a parent
    fn ancestor_groups(&self, subject_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<SubjectGroup> = self.groups_containing(subject_id).into();
        let mut groups = Vec::new();
        while let Some(group) = queue.pop_front() {
            if !seen.insert(group.id.clone()) {
                continue;
            }
            for parent in &group.parents {
                match self.subject_group(parent) {
                    Some(parent) => queue.push_back(parent),
                    None => log::debug!("Group '{}' has unknown parent '{}'", group.id, parent),
                }
            }
            groups.push(group.id);
        }
        groups
    }

    /// Active analyzer configurations that cover the subject
    fn configs_for_subject(&self, subject_id: &str) -> Vec<GeofenceAnalyzerConfig> {
        let groups: HashSet<String> = self.ancestor_groups(subject_id).into_iter().collect();
        self.analyzer_configs()
            .into_iter()
            .filter(|c| c.is_active && groups.contains(&c.subject_group))
            .collect()
    }
}

/// Collaborators shared by every analysis
pub struct AnalysisContext {
    pub configs: Arc<dyn ConfigStore>,
    pub features: Arc<dyn FeatureProvider>,
    pub observations: Arc<dyn ObservationSource>,
    pub results: Arc<dyn ResultStore>,
    pub events: Arc<dyn EventSink>,
    pub quiet: QuietPeriodGate,
    warned: Mutex<HashSet<String>>,
}

impl AnalysisContext {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        features: Arc<dyn FeatureProvider>,
        observations: Arc<dyn ObservationSource>,
        results: Arc<dyn ResultStore>,
        events: Arc<dyn EventSink>,
        quiet_cache: Arc<dyn QuietPeriodCache>,
    ) -> Self {
        AnalysisContext {
            configs,
            features,
            observations,
            results,
            events,
            quiet: QuietPeriodGate::new(quiet_cache),
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Log a configuration problem the first time it is seen
    fn warn_once(&self, config_id: &str, err: &AnalyzerError) {
        let mut warned = self.warned.lock().unwrap_or_else(PoisonError::into_inner);
        if warned.insert(config_id.to_string()) {
            log::warn!("Analyzer {} cannot run: {}", config_id, err);
        }
    }
}

/// Phase of a single analyzer run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AnalyzerState {
    Idle,
    FetchingObservations,
    BuildingTrajectory,
    DetectingCrossings,
    PersistingResults,
}

/// A recorded finding and the event it produced
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerOutcome {
    pub result: AnalyzerResult,
    /// None when the sink already held an identical event
    pub event: Option<EventRef>,
}

/// How one analyzer configuration fared for one subject
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzerStatus {
    Completed(Vec<AnalyzerOutcome>),
    Quiet,
    InsufficientData,
    Misconfigured(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerRun {
    pub config_id: String,
    pub status: AnalyzerStatus,
}

impl AnalyzerRun {
    pub fn outcomes(&self) -> &[AnalyzerOutcome] {
        match &self.status {
            AnalyzerStatus::Completed(outcomes) => outcomes,
            _ => &[],
        }
    }
}

/// Shared contract of the analyzers that watch a subject's track
pub trait SubjectAnalyzer: Send + Sync {
    fn config_id(&self) -> &str;

    fn quiet_period(&self) -> Duration;

    fn key(&self) -> AnalyzerKey {
        AnalyzerKey::for_config(self.config_id())
    }

    fn min_fixes(&self) -> usize {
        MIN_FIXES
    }

    fn observation_query(&self, subject: &Subject, now: DateTime<Utc>) -> ObservationQuery;

    /// Candidate findings for a built trajectory, chronological
    fn detect(
        &self,
        ctx: &AnalysisContext,
        subject: &Subject,
        trajectory: &Trajectory,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnalyzerResult>, AnalyzerError>;

    fn trajectory_filter(&self, ctx: &AnalysisContext, subject: &Subject) -> TrajectoryFilter {
        TrajectoryFilter::new(
            CoordinateFilter::for_subject(subject.is_stationary),
            ctx.configs
                .track_filter(&subject.subtype)
                .map(|f| f.speed_kmhr),
        )
    }

    /// Fetch the subject's recent observations and analyze them
    fn analyze(
        &self,
        ctx: &AnalysisContext,
        subject: &Subject,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnalyzerOutcome>, AnalyzerError> {
        trace_state(self.config_id(), subject, AnalyzerState::FetchingObservations);
        let observations = ctx
            .observations
            .observations(&self.observation_query(subject, now))?;
        self.analyze_observations(ctx, subject, &observations, now)
    }

    /// Analyze an explicit observation list
    fn analyze_observations(
        &self,
        ctx: &AnalysisContext,
        subject: &Subject,
        observations: &[Observation],
        now: DateTime<Utc>,
    ) -> Result<Vec<AnalyzerOutcome>, AnalyzerError> {
        trace_state(self.config_id(), subject, AnalyzerState::BuildingTrajectory);
        let trajectory = Trajectory::build(
            observations.iter().map(Observation::position),
            &self.trajectory_filter(ctx, subject),
            self.min_fixes(),
        )?;

        trace_state(self.config_id(), subject, AnalyzerState::DetectingCrossings);
        let candidates = self.detect(ctx, subject, &trajectory, now)?;

        trace_state(self.config_id(), subject, AnalyzerState::PersistingResults);
        let mut outcomes = Vec::new();
        let persisted = persist(ctx, subject, candidates, &mut outcomes);
        // Events already raised start the quiet window even if a later one failed
        if outcomes.iter().any(|o| o.event.is_some()) {
            ctx.quiet.mark_fired(&self.key(), self.quiet_period(), now);
        }
        persisted?;

        trace_state(self.config_id(), subject, AnalyzerState::Idle);
        Ok(outcomes)
    }
}

fn trace_state(config_id: &str, subject: &Subject, state: AnalyzerState) {
    log::trace!("Analyzer {} for {}: {}", config_id, subject.id, state);
}

/// Record new findings and raise one event per finding.
///
/// A finding recorded by an earlier run has its event raised again; the
/// sink ignores events it already holds, so an event lost to a sink failure
/// is created on the next run.
fn persist(
    ctx: &AnalysisContext,
    subject: &Subject,
    candidates: Vec<AnalyzerResult>,
    outcomes: &mut Vec<AnalyzerOutcome>,
) -> Result<(), AnalyzerError> {
    let mut last_time = match candidates.first() {
        Some(first) => ctx
            .results
            .latest(&first.subject_id, &first.config_id)?
            .map(|r| r.estimated_time),
        None => None,
    };

    for candidate in candidates {
        if ctx.results.already_recorded(
            &candidate.subject_id,
            &candidate.config_id,
            &candidate.fence_id,
            candidate.estimated_time,
        )? {
            if let Some(outcome) = reraise(ctx, subject, &candidate)? {
                outcomes.push(outcome);
            }
            continue;
        }
        if last_time == Some(candidate.estimated_time) {
            log::debug!(
                "Dropping second finding for {} at {}",
                subject.name,
                candidate.estimated_time
            );
            continue;
        }

        let result = ctx.results.record(candidate)?;
        last_time = Some(result.estimated_time);
        let event = ctx
            .events
            .emit_event(EventRequest::for_result(&result, &subject.name)?)?;
        log::info!("{} ({})", result.message, result.level);
        outcomes.push(AnalyzerOutcome { result, event });
    }
    Ok(())
}

/// Raise the event of a stored finding unless the sink already has it
fn reraise(
    ctx: &AnalysisContext,
    subject: &Subject,
    candidate: &AnalyzerResult,
) -> Result<Option<AnalyzerOutcome>, AnalyzerError> {
    let stored = ctx
        .results
        .results_for(&candidate.subject_id)?
        .into_iter()
        .find(|r| {
            r.config_id == candidate.config_id
                && r.fence_id == candidate.fence_id
                && r.estimated_time == candidate.estimated_time
        });
    let Some(result) = stored else {
        return Ok(None);
    };

    match ctx
        .events
        .emit_event(EventRequest::for_result(&result, &subject.name)?)?
    {
        Some(event) => {
            log::warn!(
                "Raised missing event for result {} ({})",
                result.id,
                result.message
            );
            Ok(Some(AnalyzerOutcome {
                result,
                event: Some(event),
            }))
        }
        None => {
            log::info!(
                "Result '{}' at {} already recorded, skipping",
                result.title,
                result.estimated_time
            );
            Ok(None)
        }
    }
}

/// Analyzers configured for a subject
pub fn analyzers_for(ctx: &AnalysisContext, subject_id: &str) -> Vec<Box<dyn SubjectAnalyzer>> {
    ctx.configs
        .configs_for_subject(subject_id)
        .into_iter()
        .map(|config| Box::new(GeofenceAnalyzer::new(config)) as Box<dyn SubjectAnalyzer>)
        .collect()
}

/// Run every analyzer that covers the subject.
///
/// Fails only when the subject itself cannot be analyzed. Per-analyzer
/// problems are logged and reported in the returned runs.
pub fn analyze_subject(
    ctx: &AnalysisContext,
    subject_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<AnalyzerRun>, AnalyzerError> {
    let subject = ctx
        .configs
        .subject(subject_id)
        .ok_or_else(|| AnalyzerError::NoSuchSubject(subject_id.to_string()))?;
    if !subject.is_active {
        return Err(AnalyzerError::InactiveSubject(subject.id));
    }

    let mut runs = Vec::new();
    for analyzer in analyzers_for(ctx, subject_id) {
        let config_id = analyzer.config_id().to_string();

        if ctx.quiet.is_quiet(&analyzer.key(), analyzer.quiet_period(), now) {
            log::info!("The analyzer {} is quiet for a while", config_id);
            runs.push(AnalyzerRun {
                config_id,
                status: AnalyzerStatus::Quiet,
            });
            continue;
        }

        let status = match analyzer.analyze(ctx, &subject, now) {
            Ok(outcomes) => AnalyzerStatus::Completed(outcomes),
            Err(err) if err.is_insufficient_data() => {
                log::info!("Analyzer {} skipped {}: {}", config_id, subject.name, err);
                AnalyzerStatus::InsufficientData
            }
            Err(err @ AnalyzerError::Configuration(_)) => {
                ctx.warn_once(&config_id, &err);
                AnalyzerStatus::Misconfigured(err.to_string())
            }
            Err(err) => {
                log::error!(
                    "Analyzer {} failed for subject {} ({}): {}",
                    config_id,
                    subject.id,
                    subject.name,
                    err
                );
                AnalyzerStatus::Failed(err.to_string())
            }
        };
        runs.push(AnalyzerRun { config_id, status });
    }
    Ok(runs)
}
