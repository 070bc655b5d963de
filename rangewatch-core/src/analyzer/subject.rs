use serde::{Deserialize, Serialize};

/// A tracked animal, person or vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Stationary subjects keep `(0, 0)` fixes
    #[serde(default)]
    pub is_stationary: bool,
}

fn default_true() -> bool {
    true
}

impl Subject {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Subject {
            id: id.into(),
            name: name.into(),
            subtype: String::new(),
            is_active: true,
            is_stationary: false,
        }
    }
}

/// Named set of subjects, optionally nested in parent groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub parents: Vec<String>,
}

/// Per-subtype speed limit for fixes and segments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSegmentFilter {
    pub subtype: String,
    pub speed_kmhr: f64,
}
