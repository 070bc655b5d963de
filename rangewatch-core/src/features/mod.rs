//! Spatial Feature Index
//!
//! Named boundary geometries grouped by role. Features arrive as plain
//! records from a [`FeatureProvider`] and are compiled into [`Fence`]s,
//! which answer crossing and containment queries for trajectory segments.
//!
//! All geometry is treated as planar in longitude/latitude. Segments between
//! consecutive fixes are short enough that no spherical correction is made
//! for intersection tests.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

mod catalog;
mod fence;

pub use catalog::FeatureIndex;
pub use fence::{CrossingPoint, Fence};

/// GeoJSON-style geometry of a spatial feature, `[longitude, latitude]` order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum FeatureGeometry {
    LineString(Vec<[f64; 2]>),
    /// Exterior ring first, then holes
    Polygon(Vec<Vec<[f64; 2]>>),
}

impl FeatureGeometry {
    pub fn kind(&self) -> &'static str {
        match self {
            FeatureGeometry::LineString(_) => "LineString",
            FeatureGeometry::Polygon(_) => "Polygon",
        }
    }
}

/// Role a feature group plays for an analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FeatureRole {
    Critical,
    Warning,
    Containment,
}

/// A named geometry, read-only to the analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialFeature {
    pub id: String,
    pub name: String,
    pub geometry: FeatureGeometry,
}

impl SpatialFeature {
    pub fn new(id: impl Into<String>, name: impl Into<String>, geometry: FeatureGeometry) -> Self {
        SpatialFeature {
            id: id.into(),
            name: name.into(),
            geometry,
        }
    }
}

/// An ordered set of features referenced by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Supplies features and feature groups
pub trait FeatureProvider: Send + Sync {
    fn feature(&self, feature_id: &str) -> Option<SpatialFeature>;

    fn feature_group(&self, group_id: &str) -> Option<FeatureGroup>;

    /// Resolve a group's members. Unknown member ids are logged and skipped.
    fn features_in_group(&self, group_id: &str) -> Option<Vec<SpatialFeature>> {
        let group = self.feature_group(group_id)?;
        let features = group
            .features
            .iter()
            .filter_map(|id| {
                let feature = self.feature(id);
                if feature.is_none() {
                    log::warn!("Feature group '{}' references unknown feature '{}'", group.name, id);
                }
                feature
            })
            .collect();
        Some(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_serde_geojson_shape() {
        let json = r#"{"id":"f1","name":"Boundary Road","geometry":{"type":"LineString","coordinates":[[35.3,-1.2],[35.31,-1.21]]}}"#;
        let feature: SpatialFeature = serde_json::from_str(json).unwrap();
        assert_eq!(feature.geometry.kind(), "LineString");
        assert_eq!(
            feature.geometry,
            FeatureGeometry::LineString(vec![[35.3, -1.2], [35.31, -1.21]])
        );

        let back = serde_json::to_value(&feature.geometry).unwrap();
        assert_eq!(back["type"], "LineString");
    }

    #[test]
    fn test_role_names() {
        assert_eq!(FeatureRole::Containment.to_string(), "containment");
        assert_eq!("warning".parse::<FeatureRole>().unwrap(), FeatureRole::Warning);
    }
}
