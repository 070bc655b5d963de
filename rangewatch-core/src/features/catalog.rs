use std::collections::HashSet;

use geo::Point;

use super::{Fence, FeatureProvider, FeatureRole, SpatialFeature};
use crate::error::AnalyzerError;

/// Compiled fences for one analyzer configuration, by role
#[derive(Debug, Clone, Default)]
pub struct FeatureIndex {
    critical: Vec<Fence>,
    warning: Vec<Fence>,
    containment: Vec<Fence>,
}

impl FeatureIndex {
    /// Resolve and compile the groups an analyzer refers to.
    ///
    /// A missing critical group is a configuration error. Missing optional
    /// groups and malformed features are logged and left out.
    pub fn build(
        provider: &dyn FeatureProvider,
        critical_group: Option<&str>,
        warning_group: Option<&str>,
        containment_group: Option<&str>,
    ) -> Result<Self, AnalyzerError> {
        let critical_group = critical_group.ok_or_else(|| {
            AnalyzerError::Configuration("no critical geofence group configured".to_string())
        })?;
        let critical = provider.features_in_group(critical_group).ok_or_else(|| {
            AnalyzerError::Configuration(format!(
                "critical geofence group '{}' does not exist",
                critical_group
            ))
        })?;

        let optional = |group: Option<&str>, role: FeatureRole| -> Vec<SpatialFeature> {
            let Some(group) = group else {
                return Vec::new();
            };
            provider.features_in_group(group).unwrap_or_else(|| {
                log::warn!("{} feature group '{}' does not exist, ignoring it", role, group);
                Vec::new()
            })
        };
        let warning = optional(warning_group, FeatureRole::Warning);
        let containment = optional(containment_group, FeatureRole::Containment);

        Ok(FeatureIndex {
            critical: compile_group(&critical, FeatureRole::Critical),
            warning: compile_group(&warning, FeatureRole::Warning),
            containment: compile_group(&containment, FeatureRole::Containment),
        })
    }

    /// Build from already compiled fences
    pub fn from_fences(critical: Vec<Fence>, warning: Vec<Fence>, containment: Vec<Fence>) -> Self {
        FeatureIndex {
            critical,
            warning,
            containment,
        }
    }

    pub fn fences(&self, role: FeatureRole) -> &[Fence] {
        match role {
            FeatureRole::Critical => &self.critical,
            FeatureRole::Warning => &self.warning,
            FeatureRole::Containment => &self.containment,
        }
    }

    pub fn has_containment(&self) -> bool {
        !self.containment.is_empty()
    }

    /// Containment regions holding `point`, boundary included
    pub fn containing_regions(&self, point: Point<f64>) -> Vec<&Fence> {
        self.containment
            .iter()
            .filter(|region| region.contains(point))
            .collect()
    }
}

fn compile_group(features: &[SpatialFeature], role: FeatureRole) -> Vec<Fence> {
    let mut seen = HashSet::new();
    features
        .iter()
        .filter(|f| seen.insert(f.id.clone()))
        .filter_map(|feature| match Fence::compile(feature, role) {
            Ok(fence) => Some(fence),
            Err(source) => {
                let err = AnalyzerError::Geometry {
                    feature: feature.name.clone(),
                    source,
                };
                log::warn!("Skipping {} feature {}: {}", role, feature.id, err);
                None
            }
        })
        .collect()
}
