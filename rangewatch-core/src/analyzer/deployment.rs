//! Static description of a deployment: features, subjects and analyzers

use serde::{Deserialize, Serialize};

use super::{ConfigStore, GeofenceAnalyzerConfig, Subject, SubjectGroup, TrackSegmentFilter};
use crate::features::{FeatureGroup, FeatureProvider, SpatialFeature};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    pub features: Vec<SpatialFeature>,
    #[serde(default)]
    pub feature_groups: Vec<FeatureGroup>,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub subject_groups: Vec<SubjectGroup>,
    #[serde(default)]
    pub track_filters: Vec<TrackSegmentFilter>,
    #[serde(default)]
    pub geofence_analyzers: Vec<GeofenceAnalyzerConfig>,
}

impl Deployment {
    /// Log references that point nowhere. Returns the number of problems.
    pub fn validate(&self) -> usize {
        let mut problems = 0;
        for group in &self.feature_groups {
            for id in &group.features {
                if !self.features.iter().any(|f| &f.id == id) {
                    log::warn!("Feature group '{}' lists unknown feature '{}'", group.id, id);
                    problems += 1;
                }
            }
        }
        for group in &self.subject_groups {
            for id in &group.subjects {
                if !self.subjects.iter().any(|s| &s.id == id) {
                    log::warn!("Subject group '{}' lists unknown subject '{}'", group.id, id);
                    problems += 1;
                }
            }
        }
        for config in &self.geofence_analyzers {
            if self.subject_group(&config.subject_group).is_none() {
                log::warn!(
                    "Analyzer '{}' applies to unknown subject group '{}'",
                    config.id,
                    config.subject_group
                );
                problems += 1;
            }
            let groups = [
                &config.critical_geofence_group,
                &config.warning_geofence_group,
                &config.containment_regions,
            ];
            for group in groups.into_iter().flatten() {
                if self.feature_group(group).is_none() {
                    log::warn!("Analyzer '{}' refers to unknown feature group '{}'", config.id, group);
                    problems += 1;
                }
            }
        }
        problems
    }
}

impl ConfigStore for Deployment {
    fn subject(&self, subject_id: &str) -> Option<Subject> {
        self.subjects.iter().find(|s| s.id == subject_id).cloned()
    }

    fn subject_ids(&self) -> Vec<String> {
        self.subjects.iter().map(|s| s.id.clone()).collect()
    }

    fn subject_group(&self, group_id: &str) -> Option<SubjectGroup> {
        self.subject_groups.iter().find(|g| g.id == group_id).cloned()
    }

    fn groups_containing(&self, subject_id: &str) -> Vec<SubjectGroup> {
        self.subject_groups
            .iter()
            .filter(|g| g.subjects.iter().any(|s| s == subject_id))
            .cloned()
            .collect()
    }

    fn analyzer_configs(&self) -> Vec<GeofenceAnalyzerConfig> {
        self.geofence_analyzers.clone()
    }

    fn track_filter(&self, subtype: &str) -> Option<TrackSegmentFilter> {
        self.track_filters.iter().find(|f| f.subtype == subtype).cloned()
    }
}

impl FeatureProvider for Deployment {
    fn feature(&self, feature_id: &str) -> Option<SpatialFeature> {
        self.features.iter().find(|f| f.id == feature_id).cloned()
    }

    fn feature_group(&self, group_id: &str) -> Option<FeatureGroup> {
        self.feature_groups.iter().find(|g| g.id == group_id).cloned()
    }
}
