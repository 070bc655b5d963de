//! Event emission
//!
//! Every recorded finding becomes exactly one event. The details payload is
//! the finding's values plus the subject name, so it maps back onto
//! [`ResultValues`] without loss.

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_repr::{Deserialize_repr, Serialize_repr};
use strum::Display;
use uuid::Uuid;

use crate::error::AnalyzerError;
use crate::results::{AnalyzerResult, Level, ResultValues};

pub const GEOFENCE_EVENT_TYPE: &str = "geofence_break";

/// Provenance of events raised by analyzers
pub const ANALYZER_PROVENANCE: &str = "analyzer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize_repr, Deserialize_repr)]
#[repr(u16)]
#[strum(serialize_all = "lowercase")]
pub enum EventPriority {
    Reference = 100,
    Important = 200,
    Urgent = 300,
}

impl From<Level> for EventPriority {
    fn from(level: Level) -> Self {
        match level {
            Level::Critical => EventPriority::Urgent,
            Level::Warning => EventPriority::Important,
            Level::Ok => EventPriority::Reference,
        }
    }
}

/// Everything the sink needs to create an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRequest {
    pub event_type: String,
    pub title: String,
    pub priority: EventPriority,
    pub time: DateTime<Utc>,
    /// `[longitude, latitude]`
    pub location: Option<[f64; 2]>,
    pub subject_id: String,
    pub provenance: String,
    pub details: Map<String, Value>,
}

impl EventRequest {
    /// Geofence-break event for a recorded finding
    pub fn for_result(result: &AnalyzerResult, subject_name: &str) -> Result<Self, AnalyzerError> {
        let mut details = Map::new();
        details.insert("name".to_string(), Value::String(subject_name.to_string()));
        match serde_json::to_value(&result.values) {
            Ok(Value::Object(values)) => details.extend(values),
            Ok(other) => {
                return Err(AnalyzerError::EventSink(format!(
                    "result values serialized to {} instead of an object",
                    other
                )))
            }
            Err(e) => return Err(AnalyzerError::EventSink(e.to_string())),
        }

        Ok(EventRequest {
            event_type: GEOFENCE_EVENT_TYPE.to_string(),
            title: result.title.clone(),
            priority: result.level.into(),
            time: result.estimated_time,
            location: result.location(),
            subject_id: result.subject_id.clone(),
            provenance: ANALYZER_PROVENANCE.to_string(),
            details,
        })
    }

    /// Recover the finding's values from the details payload
    pub fn values(&self) -> Result<ResultValues, serde_json::Error> {
        serde_json::from_value(Value::Object(self.details.clone()))
    }

    /// Two requests with the same key describe the same event
    pub fn same_event(&self, other: &EventRequest) -> bool {
        self.subject_id == other.subject_id
            && self.event_type == other.event_type
            && self.time == other.time
            && self.location == other.location
    }
}

/// Handle of a created event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventRef {
    pub id: Uuid,
}

/// A created event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub request: EventRequest,
}

impl Event {
    pub fn new(request: EventRequest, created_at: DateTime<Utc>) -> Self {
        Event {
            id: Uuid::new_v4(),
            created_at,
            request,
        }
    }

    pub fn event_ref(&self) -> EventRef {
        EventRef { id: self.id }
    }
}

/// Creates events. Returns None when an identical event already exists.
pub trait EventSink: Send + Sync {
    fn emit_event(&self, request: EventRequest) -> Result<Option<EventRef>, AnalyzerError>;
}

/// In-process event sink
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemoryEventSink {
    fn emit_event(&self, request: EventRequest) -> Result<Option<EventRef>, AnalyzerError> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        if events.iter().any(|e| e.request.same_event(&request)) {
            log::debug!(
                "Event '{}' for {} at {} already exists",
                request.title,
                request.subject_id,
                request.time
            );
            return Ok(None);
        }
        let event = Event::new(request, Utc::now());
        let event_ref = event.event_ref();
        events.push(event);
        Ok(Some(event_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ResultGeometry;
    use chrono::TimeZone;

    fn result(level: Level) -> AnalyzerResult {
        let t = Utc.with_ymd_and_hms(2021, 10, 9, 23, 30, 0).unwrap();
        AnalyzerResult {
            id: Uuid::new_v4(),
            subject_id: "s1".into(),
            config_id: "cfg".into(),
            fence_id: "f1".into(),
            title: "Jolie crossed Moukalaba-Doudou.".into(),
            message: "Jolie crossed Moukalaba-Doudou. Subject now in: Unknown region".into(),
            level,
            estimated_time: t,
            geometry: vec![ResultGeometry::Point([10.5, -2.4])],
            values: ResultValues {
                geofence_name: "Moukalaba-Doudou".into(),
                contain_regions: "Unknown region".into(),
                total_fix_count: 12,
                subject_speed_kmhr: 1.75,
                subject_heading: 182.5,
            },
            created_at: t,
        }
    }

    #[test]
    fn test_priority_map() {
        assert_eq!(EventPriority::from(Level::Critical), EventPriority::Urgent);
        assert_eq!(EventPriority::from(Level::Warning), EventPriority::Important);
        assert_eq!(EventPriority::from(Level::Ok), EventPriority::Reference);
        assert_eq!(serde_json::to_string(&EventPriority::Urgent).unwrap(), "300");
    }

    #[test]
    fn test_details_round_trip_values() {
        let result = result(Level::Critical);
        let request = EventRequest::for_result(&result, "Jolie").unwrap();
        assert_eq!(request.event_type, GEOFENCE_EVENT_TYPE);
        assert_eq!(request.details["name"], "Jolie");
        assert_eq!(request.details["total_fix_count"], 12);
        assert_eq!(request.location, Some([10.5, -2.4]));
        assert_eq!(request.values().unwrap(), result.values);
    }

    #[test]
    fn test_sink_dedups_identical_events() {
        let sink = MemoryEventSink::new();
        let request = EventRequest::for_result(&result(Level::Warning), "Jolie").unwrap();
        assert!(sink.emit_event(request.clone()).unwrap().is_some());
        assert!(sink.emit_event(request.clone()).unwrap().is_none());

        let mut moved = request;
        moved.location = Some([10.6, -2.4]);
        assert!(sink.emit_event(moved).unwrap().is_some());
        assert_eq!(sink.len(), 2);
    }
}
