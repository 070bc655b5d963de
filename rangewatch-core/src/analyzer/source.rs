use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AnalyzerError;
use crate::trajectory::Position;

/// One fix reported by a tracking device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub subject_id: String,
    pub source_id: String,
    pub recorded_at: DateTime<Utc>,
    pub longitude: f64,
    pub latitude: f64,
}

impl Observation {
    pub fn position(&self) -> Position {
        Position::new(self.recorded_at, self.longitude, self.latitude)
    }
}

/// Which observations to fetch for a subject
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationQuery {
    pub subject_id: String,
    pub since: Option<DateTime<Utc>>,
    pub until: DateTime<Utc>,
    pub limit: Option<usize>,
}

impl ObservationQuery {
    pub fn since(subject_id: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        ObservationQuery {
            subject_id: subject_id.to_string(),
            since: Some(since),
            until,
            limit: None,
        }
    }

    pub fn latest(subject_id: &str, limit: usize, until: DateTime<Utc>) -> Self {
        ObservationQuery {
            subject_id: subject_id.to_string(),
            since: None,
            until,
            limit: Some(limit),
        }
    }

    pub fn matches(&self, observation: &Observation) -> bool {
        observation.subject_id == self.subject_id
            && observation.recorded_at <= self.until
            && self.since.map_or(true, |since| observation.recorded_at >= since)
    }
}

/// Supplies a subject's fixes, newest first
pub trait ObservationSource: Send + Sync {
    fn observations(&self, query: &ObservationQuery) -> Result<Vec<Observation>, AnalyzerError>;
}

/// In-process observation store
#[derive(Debug, Default)]
pub struct MemoryObservationStore {
    by_subject: RwLock<HashMap<String, Vec<Observation>>>,
}

impl MemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fix. A repeated `(source, time)` pair is rejected.
    pub fn add(&self, observation: Observation) -> bool {
        let mut by_subject = self.by_subject.write().unwrap_or_else(PoisonError::into_inner);
        let list = by_subject.entry(observation.subject_id.clone()).or_default();
        if list
            .iter()
            .any(|o| o.source_id == observation.source_id && o.recorded_at == observation.recorded_at)
        {
            return false;
        }
        list.push(observation);
        true
    }

    /// Add many fixes, returning how many were new
    pub fn extend<I: IntoIterator<Item = Observation>>(&self, observations: I) -> usize {
        observations.into_iter().filter(|o| self.add(o.clone())).count()
    }

    pub fn subject_ids(&self) -> Vec<String> {
        let by_subject = self.by_subject.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = by_subject.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl ObservationSource for MemoryObservationStore {
    fn observations(&self, query: &ObservationQuery) -> Result<Vec<Observation>, AnalyzerError> {
        let by_subject = self.by_subject.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<Observation> = by_subject
            .get(&query.subject_id)
            .map(|list| list.iter().filter(|o| query.matches(o)).cloned().collect())
            .unwrap_or_default();
        found.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}
