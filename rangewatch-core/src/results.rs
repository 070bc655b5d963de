//! Analyzer Result Store
//!
//! Findings are immutable records. The store never updates a result; the
//! orchestrator asks [`ResultStore::already_recorded`] before writing so that
//! re-analysing an unchanged window does not report the same crossing twice.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::crossing::Crossing;
use crate::error::AnalyzerError;

/// Severity of a finding
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    Serialize_repr,
    Deserialize_repr,
)]
#[repr(u8)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Level {
    Ok = 10,
    Warning = 20,
    Critical = 30,
}

/// Descriptive values carried into the event details unchanged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultValues {
    pub geofence_name: String,
    pub contain_regions: String,
    pub total_fix_count: usize,
    pub subject_speed_kmhr: f64,
    pub subject_heading: f64,
}

/// One member of a result's geometry collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum ResultGeometry {
    Point([f64; 2]),
    LineString(Vec<[f64; 2]>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerResult {
    pub id: Uuid,
    pub subject_id: String,
    pub config_id: String,
    pub fence_id: String,
    pub title: String,
    pub message: String,
    pub level: Level,
    pub estimated_time: DateTime<Utc>,
    /// Crossing point, then the segment that crossed
    pub geometry: Vec<ResultGeometry>,
    pub values: ResultValues,
    pub created_at: DateTime<Utc>,
}

impl AnalyzerResult {
    pub fn from_crossing(
        subject_id: &str,
        subject_name: &str,
        config_id: &str,
        crossing: &Crossing,
        total_fix_count: usize,
        created_at: DateTime<Utc>,
    ) -> Self {
        let contain_regions = crossing.contain_regions();
        let title = format!("{} crossed {}.", subject_name, crossing.fence_name);
        let message = format!("{} Subject now in: {}", title, contain_regions);
        let segment = &crossing.segment;

        AnalyzerResult {
            id: Uuid::new_v4(),
            subject_id: subject_id.to_string(),
            config_id: config_id.to_string(),
            fence_id: crossing.fence_id.clone(),
            title,
            message,
            level: crossing.level,
            estimated_time: crossing.estimated_time,
            geometry: vec![
                ResultGeometry::Point([crossing.point.x(), crossing.point.y()]),
                ResultGeometry::LineString(vec![
                    [segment.start.longitude, segment.start.latitude],
                    [segment.end.longitude, segment.end.latitude],
                ]),
            ],
            values: ResultValues {
                geofence_name: crossing.fence_name.clone(),
                contain_regions,
                total_fix_count,
                subject_speed_kmhr: segment.speed_kmhr,
                subject_heading: segment.heading_degrees,
            },
            created_at,
        }
    }

    /// Where the crossing happened, `[longitude, latitude]`
    pub fn location(&self) -> Option<[f64; 2]> {
        self.geometry.iter().find_map(|g| match g {
            ResultGeometry::Point(p) => Some(*p),
            _ => None,
        })
    }
}

/// Durable record of findings
pub trait ResultStore: Send + Sync {
    /// Append a finding. There is no update path.
    fn record(&self, result: AnalyzerResult) -> Result<AnalyzerResult, AnalyzerError>;

    /// Has this exact crossing already been recorded
    fn already_recorded(
        &self,
        subject_id: &str,
        config_id: &str,
        fence_id: &str,
        estimated_time: DateTime<Utc>,
    ) -> Result<bool, AnalyzerError>;

    /// Most recent finding by estimated time
    fn latest(&self, subject_id: &str, config_id: &str) -> Result<Option<AnalyzerResult>, AnalyzerError>;

    /// All findings for a subject, oldest first
    fn results_for(&self, subject_id: &str) -> Result<Vec<AnalyzerResult>, AnalyzerError>;
}

/// In-process result store keyed by subject
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    results: RwLock<HashMap<String, Vec<AnalyzerResult>>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultStore for MemoryResultStore {
    fn record(&self, result: AnalyzerResult) -> Result<AnalyzerResult, AnalyzerError> {
        let mut results = self.results.write().unwrap_or_else(PoisonError::into_inner);
        results
            .entry(result.subject_id.clone())
            .or_default()
            .push(result.clone());
        Ok(result)
    }

    fn already_recorded(
        &self,
        subject_id: &str,
        config_id: &str,
        fence_id: &str,
        estimated_time: DateTime<Utc>,
    ) -> Result<bool, AnalyzerError> {
        let results = self.results.read().unwrap_or_else(PoisonError::into_inner);
        Ok(results.get(subject_id).is_some_and(|list| {
            list.iter().any(|r| {
                r.config_id == config_id
                    && r.fence_id == fence_id
                    && r.estimated_time == estimated_time
            })
        }))
    }

    fn latest(&self, subject_id: &str, config_id: &str) -> Result<Option<AnalyzerResult>, AnalyzerError> {
        let results = self.results.read().unwrap_or_else(PoisonError::into_inner);
        Ok(results.get(subject_id).and_then(|list| {
            list.iter()
                .filter(|r| r.config_id == config_id)
                .max_by_key(|r| r.estimated_time)
                .cloned()
        }))
    }

    fn results_for(&self, subject_id: &str) -> Result<Vec<AnalyzerResult>, AnalyzerError> {
        let results = self.results.read().unwrap_or_else(PoisonError::into_inner);
        let mut list = results.get(subject_id).cloned().unwrap_or_default();
        list.sort_by_key(|r| r.estimated_time);
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossing::RegionRef;
    use crate::trajectory::{Position, TrajectorySegment};
    use chrono::TimeZone;
    use geo::Point;

    fn crossing(minute: u32, regions: Vec<RegionRef>) -> Crossing {
        let t0 = Utc.with_ymd_and_hms(2021, 10, 9, 23, 0, 0).unwrap();
        let segment = TrajectorySegment::new(
            Position::new(t0, 35.301, -1.205),
            Position::new(t0 + chrono::Duration::hours(1), 35.309, -1.205),
        )
        .unwrap();
        Crossing {
            fence_id: "fence-1".into(),
            fence_name: "Ol Donyo Farm 2".into(),
            level: Level::Critical,
            point: Point::new(35.305, -1.205),
            estimated_time: t0 + chrono::Duration::minutes(minute as i64),
            segment,
            start_regions: vec![],
            end_regions: regions,
        }
    }

    #[test]
    fn test_level_serializes_as_number() {
        assert_eq!(serde_json::to_string(&Level::Critical).unwrap(), "30");
        assert_eq!(serde_json::from_str::<Level>("20").unwrap(), Level::Warning);
        assert_eq!(Level::Ok.to_string(), "OK");
        assert!(Level::Critical > Level::Warning);
    }

    #[test]
    fn test_title_and_message() {
        let now = Utc::now();
        let result = AnalyzerResult::from_crossing("s1", "Dumbo", "cfg", &crossing(30, vec![]), 9, now);
        assert_eq!(result.title, "Dumbo crossed Ol Donyo Farm 2.");
        assert_eq!(
            result.message,
            "Dumbo crossed Ol Donyo Farm 2. Subject now in: Unknown region"
        );
        assert_eq!(result.values.total_fix_count, 9);
        assert_eq!(result.location(), Some([35.305, -1.205]));

        let regions = vec![
            RegionRef {
                id: "a".into(),
                name: "Pardamat Conservancy".into(),
            },
            RegionRef {
                id: "b".into(),
                name: "Naboisho".into(),
            },
        ];
        let result = AnalyzerResult::from_crossing("s1", "Dumbo", "cfg", &crossing(30, regions), 9, now);
        assert_eq!(result.values.contain_regions, "Pardamat Conservancy;Naboisho");
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryResultStore::new();
        let now = Utc::now();
        let first = AnalyzerResult::from_crossing("s1", "Dumbo", "cfg", &crossing(10, vec![]), 3, now);
        let second = AnalyzerResult::from_crossing("s1", "Dumbo", "cfg", &crossing(40, vec![]), 3, now);
        store.record(second.clone()).unwrap();
        store.record(first.clone()).unwrap();

        assert_eq!(store.len(), 2);
        assert!(store
            .already_recorded("s1", "cfg", "fence-1", first.estimated_time)
            .unwrap());
        assert!(!store
            .already_recorded("s1", "other", "fence-1", first.estimated_time)
            .unwrap());
        assert_eq!(store.latest("s1", "cfg").unwrap().unwrap().id, second.id);
        assert!(store.latest("s2", "cfg").unwrap().is_none());

        let all = store.results_for("s1").unwrap();
        assert_eq!(all[0].id, first.id);
    }
}
