use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use super::source::ObservationQuery;
use crate::crossing::DEFAULT_EDGE_TOLERANCE_M;
use crate::quiet::AnalyzerKey;

pub const DEFAULT_SEARCH_TIME_HOURS: f64 = 24.0;

/// Geofence analyzer settings for one subject group
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceAnalyzerConfig {
    pub id: String,
    pub name: String,
    /// Applies to this group and every group nested below it
    pub subject_group: String,
    #[serde(default)]
    pub critical_geofence_group: Option<String>,
    #[serde(default)]
    pub warning_geofence_group: Option<String>,
    #[serde(default)]
    pub containment_regions: Option<String>,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default, rename = "quiet_period_secs")]
    pub quiet_period: Duration,
    /// Lookback window; zero or less means "the two latest fixes"
    #[serde(default = "default_search_time_hours")]
    pub search_time_hours: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_edge_tolerance_m")]
    pub edge_tolerance_m: f64,
}

fn default_search_time_hours() -> f64 {
    DEFAULT_SEARCH_TIME_HOURS
}

fn default_true() -> bool {
    true
}

fn default_edge_tolerance_m() -> f64 {
    DEFAULT_EDGE_TOLERANCE_M
}

impl GeofenceAnalyzerConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, subject_group: impl Into<String>) -> Self {
        GeofenceAnalyzerConfig {
            id: id.into(),
            name: name.into(),
            subject_group: subject_group.into(),
            critical_geofence_group: None,
            warning_geofence_group: None,
            containment_regions: None,
            quiet_period: Duration::ZERO,
            search_time_hours: DEFAULT_SEARCH_TIME_HOURS,
            is_active: true,
            edge_tolerance_m: DEFAULT_EDGE_TOLERANCE_M,
        }
    }

    pub fn key(&self) -> AnalyzerKey {
        AnalyzerKey::for_config(&self.id)
    }

    /// Observations this config looks at when run at `now`
    pub fn observation_query(&self, subject_id: &str, now: DateTime<Utc>) -> ObservationQuery {
        if self.search_time_hours > 0.0 {
            let window_ms = (self.search_time_hours * 3_600_000.0).round() as i64;
            ObservationQuery::since(subject_id, now - chrono::Duration::milliseconds(window_ms), now)
        } else {
            ObservationQuery::latest(subject_id, 2, now)
        }
    }
}
