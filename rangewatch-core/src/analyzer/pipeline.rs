use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{AnalysisContext, GeofenceAnalyzerConfig, ObservationQuery, Subject, SubjectAnalyzer};
use crate::crossing::CrossingDetector;
use crate::error::AnalyzerError;
use crate::features::FeatureIndex;
use crate::results::AnalyzerResult;
use crate::trajectory::Trajectory;

/// Reports fence crossings for the subjects of one configuration
#[derive(Debug, Clone)]
pub struct GeofenceAnalyzer {
    config: GeofenceAnalyzerConfig,
}

impl GeofenceAnalyzer {
    pub fn new(config: GeofenceAnalyzerConfig) -> Self {
        GeofenceAnalyzer { config }
    }

    pub fn config(&self) -> &GeofenceAnalyzerConfig {
        &self.config
    }
}

impl SubjectAnalyzer for GeofenceAnalyzer {
    fn config_id(&self) -> &str {
        &self.config.id
    }

    fn quiet_period(&self) -> Duration {
        self.config.quiet_period
    }

    fn observation_query(&self, subject: &Subject, now: DateTime<Utc>) -> ObservationQuery {
        self.config.observation_query(&subject.id, now)
    }

    fn detect(
        &self,
        ctx: &AnalysisContext,
        subject: &Subject,
        trajectory: &Trajectory,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnalyzerResult>, AnalyzerError> {
        let index = FeatureIndex::build(
            ctx.features.as_ref(),
            self.config.critical_geofence_group.as_deref(),
            self.config.warning_geofence_group.as_deref(),
            self.config.containment_regions.as_deref(),
        )?;
        let detector = CrossingDetector::new(&index, self.config.edge_tolerance_m);
        let total_fix_count = trajectory.fix_count();

        let mut results: Vec<AnalyzerResult> = trajectory
            .segments()
            .flat_map(|segment| detector.detect(&subject.name, &segment))
            .map(|crossing| {
                AnalyzerResult::from_crossing(
                    &subject.id,
                    &subject.name,
                    &self.config.id,
                    &crossing,
                    total_fix_count,
                    now,
                )
            })
            .collect();
        results.sort_by_key(|r| r.estimated_time);

        log::debug!(
            "Analyzer {} found {} crossing(s) for {} in {} fixes",
            self.config.id,
            results.len(),
            subject.name,
            total_fix_count
        );
        Ok(results)
    }
}
