//! Error types for geofence analysis

use thiserror::Error;

/// Errors raised while validating a spatial feature's geometry
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// Not enough vertices to describe the shape
    #[error("{kind} needs at least {required} coordinates, got {actual}")]
    TooFewCoordinates {
        kind: &'static str,
        required: usize,
        actual: usize,
    },

    /// A coordinate is NaN or infinite
    #[error("Coordinate {index} is not finite")]
    NonFinite { index: usize },

    /// Polygon declared without any ring
    #[error("Polygon has no exterior ring")]
    MissingExterior,

    /// Feature is used in a role its geometry cannot serve
    #[error("{role} features must be polygons")]
    UnsupportedRole { role: String },
}

/// Errors that can occur while analyzing a subject
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyzerError {
    /// Fewer usable fixes than the analyzer needs
    #[error("Insufficient data: need at least {required} usable fixes, have {available}")]
    InsufficientData { required: usize, available: usize },

    /// A feature could not be compiled into a fence or region
    #[error("Feature '{feature}' is malformed: {source}")]
    Geometry {
        feature: String,
        #[source]
        source: GeometryError,
    },

    /// The analyzer configuration cannot drive any detection
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The subject is unknown to the config store
    #[error("No such subject '{0}'")]
    NoSuchSubject(String),

    /// The subject exists but is not active
    #[error("Subject '{0}' is not active")]
    InactiveSubject(String),

    /// Observation source failed
    #[error("Observation source failed: {0}")]
    Observations(String),

    /// Result store failed
    #[error("Result store failed: {0}")]
    Store(String),

    /// Event sink failed
    #[error("Event sink failed: {0}")]
    EventSink(String),
}

impl AnalyzerError {
    /// True for the expected "too little data this round" condition
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, AnalyzerError::InsufficientData { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_error_message() {
        let err = AnalyzerError::Geometry {
            feature: "Boundary Road".to_string(),
            source: GeometryError::TooFewCoordinates {
                kind: "LineString",
                required: 2,
                actual: 1,
            },
        };
        assert_eq!(
            err.to_string(),
            "Feature 'Boundary Road' is malformed: LineString needs at least 2 coordinates, got 1"
        );
    }

    #[test]
    fn test_insufficient_data_predicate() {
        let err = AnalyzerError::InsufficientData {
            required: 2,
            available: 1,
        };
        assert!(err.is_insufficient_data());
        assert!(!AnalyzerError::Configuration("x".into()).is_insufficient_data());
    }
}
