//! Crossing Detector
//!
//! Decides, per trajectory segment, whether a reportable fence crossing
//! happened. Critical fences are checked first; warning fences only when no
//! critical crossing survives for the segment. Containment regions never
//! raise crossings themselves. They describe where the subject ended up and
//! veto fence hits that are artifacts of a region's edge.

use chrono::{DateTime, Utc};
use geo::Point;
use serde::Serialize;

use crate::features::{FeatureIndex, FeatureRole, Fence};
use crate::results::Level;
use crate::trajectory::TrajectorySegment;

/// Reported when the subject ends outside every containment region
pub const UNKNOWN_REGION: &str = "Unknown region";

/// Default distance from a region edge within which a hit is an artifact
pub const DEFAULT_EDGE_TOLERANCE_M: f64 = 1.0;

/// Containment region a fix was found in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionRef {
    pub id: String,
    pub name: String,
}

impl From<&Fence> for RegionRef {
    fn from(fence: &Fence) -> Self {
        RegionRef {
            id: fence.id.clone(),
            name: fence.name.clone(),
        }
    }
}

/// A genuine crossing of one fence by one segment
#[derive(Debug, Clone, PartialEq)]
pub struct Crossing {
    pub fence_id: String,
    pub fence_name: String,
    pub level: Level,
    pub point: Point<f64>,
    pub estimated_time: DateTime<Utc>,
    pub segment: TrajectorySegment,
    pub start_regions: Vec<RegionRef>,
    pub end_regions: Vec<RegionRef>,
}

impl Crossing {
    /// Names of the regions holding the segment end, `;`-joined
    pub fn contain_regions(&self) -> String {
        if self.end_regions.is_empty() {
            UNKNOWN_REGION.to_string()
        } else {
            self.end_regions
                .iter()
                .map(|r| r.name.as_str())
                .collect::<Vec<_>>()
                .join(";")
        }
    }

    /// Did the segment enter or leave a containment region
    pub fn changed_region(&self) -> bool {
        self.start_regions != self.end_regions
    }
}

#[derive(Debug, Clone)]
pub struct CrossingDetector<'a> {
    index: &'a FeatureIndex,
    edge_tolerance_m: f64,
}

impl<'a> CrossingDetector<'a> {
    pub fn new(index: &'a FeatureIndex, edge_tolerance_m: f64) -> Self {
        CrossingDetector {
            index,
            edge_tolerance_m,
        }
    }

    /// Crossings for one segment. `subject` only labels log lines.
    pub fn detect(&self, subject: &str, segment: &TrajectorySegment) -> Vec<Crossing> {
        if segment.is_degenerate() {
            return Vec::new();
        }

        let start_regions: Vec<RegionRef> = self
            .index
            .containing_regions(segment.start.point())
            .into_iter()
            .map(RegionRef::from)
            .collect();
        let end_regions: Vec<RegionRef> = self
            .index
            .containing_regions(segment.end.point())
            .into_iter()
            .map(RegionRef::from)
            .collect();
        if start_regions != end_regions {
            log::debug!(
                "{} moved between containment regions {:?} -> {:?} at {}",
                subject,
                start_regions.iter().map(|r| &r.name).collect::<Vec<_>>(),
                end_regions.iter().map(|r| &r.name).collect::<Vec<_>>(),
                segment.end.timestamp
            );
        }
        let outside_all = start_regions.is_empty() && end_regions.is_empty();

        for (role, level) in [
            (FeatureRole::Critical, Level::Critical),
            (FeatureRole::Warning, Level::Warning),
        ] {
            let crossings: Vec<Crossing> = self
                .index
                .fences(role)
                .iter()
                .filter_map(|fence| {
                    let hit = fence.intersects(segment)?;
                    if outside_all && self.is_region_artifact(hit.point) {
                        log::info!(
                            "Ignoring illegitimate crossing of '{}' by {} at {}: near a containment region edge without entering it",
                            fence.name,
                            subject,
                            segment.end.timestamp
                        );
                        return None;
                    }
                    Some(Crossing {
                        fence_id: fence.id.clone(),
                        fence_name: fence.name.clone(),
                        level,
                        point: hit.point,
                        estimated_time: segment.interpolate_time(hit.point),
                        segment: *segment,
                        start_regions: start_regions.clone(),
                        end_regions: end_regions.clone(),
                    })
                })
                .collect();

            if !crossings.is_empty() {
                return crossings;
            }
        }
        Vec::new()
    }

    fn is_region_artifact(&self, point: Point<f64>) -> bool {
        self.index.has_containment()
            && self.index.fences(FeatureRole::Containment).iter().any(|region| {
                region.contains(point)
                    || region
                        .distance_to_edge_m(point)
                        .is_some_and(|d| d <= self.edge_tolerance_m)
            })
    }
}
