//! Compiled fence geometry and the segment/boundary queries

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::kernels::{Kernel, Orientation, RobustKernel};
use geo::{Closest, ClosestPoint, Coord, Distance, Haversine, Intersects, Line, LineString, Point, Polygon};

use super::{FeatureGeometry, FeatureRole, SpatialFeature};
use crate::error::GeometryError;
use crate::trajectory::TrajectorySegment;

#[derive(Debug, Clone, PartialEq)]
enum Shape {
    Line(LineString<f64>),
    Area(Polygon<f64>),
}

/// A validated feature ready for crossing queries
#[derive(Debug, Clone, PartialEq)]
pub struct Fence {
    pub id: String,
    pub name: String,
    pub role: FeatureRole,
    shape: Shape,
}

/// Where a segment crosses a fence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossingPoint {
    /// Boundary hit nearest the segment start
    pub point: Point<f64>,
    /// Distinct boundary hits along the segment
    pub hits: usize,
}

impl Fence {
    /// Validate a feature's geometry for use in `role`
    pub fn compile(feature: &SpatialFeature, role: FeatureRole) -> Result<Fence, GeometryError> {
        let shape = match &feature.geometry {
            FeatureGeometry::LineString(coords) => {
                if role == FeatureRole::Containment {
                    return Err(GeometryError::UnsupportedRole {
                        role: role.to_string(),
                    });
                }
                Shape::Line(LineString::new(to_coords(coords, "LineString", 2)?))
            }
            FeatureGeometry::Polygon(rings) => {
                let mut rings = rings.iter();
                let exterior = rings.next().ok_or(GeometryError::MissingExterior)?;
                let exterior = to_ring(exterior)?;
                let interiors = rings.map(|r| to_ring(r)).collect::<Result<Vec<_>, _>>()?;
                Shape::Area(Polygon::new(exterior, interiors))
            }
        };

        Ok(Fence {
            id: feature.id.clone(),
            name: feature.name.clone(),
            role,
            shape,
        })
    }

    pub fn is_polygon(&self) -> bool {
        matches!(self.shape, Shape::Area(_))
    }

    /// Closed-set containment: boundary points are inside
    pub fn contains(&self, point: Point<f64>) -> bool {
        match &self.shape {
            Shape::Area(polygon) => polygon.intersects(&point),
            Shape::Line(line) => line.intersects(&point),
        }
    }

    /// Does `segment` cross this fence, and where.
    ///
    /// Polygons: the segment's endpoints must differ in containment. The
    /// reported point is the first boundary hit from the start, start
    /// included.
    ///
    /// Lines: even-odd rule over distinct hits. The segment is half-open, so a
    /// fix lying exactly on the fence belongs to the segment that ends there.
    /// A hit on an interior vertex counts only when the fence passes through
    /// the segment's line there. Collinear overlap is never a crossing.
    pub fn intersects(&self, segment: &TrajectorySegment) -> Option<CrossingPoint> {
        if segment.is_degenerate() {
            return None;
        }
        let seg = segment.line();
        match &self.shape {
            Shape::Area(polygon) => {
                if self.contains(segment.start.point()) == self.contains(segment.end.point()) {
                    return None;
                }
                let hits = ring_hits(&seg, polygon);
                let point = nearest_to(seg.start, &hits);
                if point.is_none() {
                    log::debug!(
                        "Containment changes across '{}' but no boundary hit was found",
                        self.name
                    );
                }
                point.map(|point| CrossingPoint {
                    point,
                    hits: hits.len(),
                })
            }
            Shape::Line(line) => {
                let hits = match line_hits(&seg, line) {
                    Ok(hits) => hits,
                    Err(overlap) => {
                        log::debug!(
                            "Segment ending {} runs along fence '{}' from {:?} to {:?}, not a crossing",
                            segment.end.timestamp,
                            self.name,
                            overlap.start,
                            overlap.end
                        );
                        return None;
                    }
                };
                if hits.len() % 2 == 0 {
                    return None;
                }
                nearest_to(seg.start, &hits).map(|point| CrossingPoint {
                    point,
                    hits: hits.len(),
                })
            }
        }
    }

    /// Great-circle distance in meters from `point` to the nearest edge
    pub fn distance_to_edge_m(&self, point: Point<f64>) -> Option<f64> {
        let rings: Vec<&LineString<f64>> = match &self.shape {
            Shape::Area(polygon) => std::iter::once(polygon.exterior())
                .chain(polygon.interiors())
                .collect(),
            Shape::Line(line) => vec![line],
        };
        rings
            .into_iter()
            .filter_map(|ring| match ring.closest_point(&point) {
                Closest::Intersection(p) | Closest::SinglePoint(p) => {
                    Some(Haversine::distance(point, p))
                }
                Closest::Indeterminate => None,
            })
            .min_by(|a, b| a.total_cmp(b))
    }
}

fn to_coords(
    coords: &[[f64; 2]],
    kind: &'static str,
    required: usize,
) -> Result<Vec<Coord<f64>>, GeometryError> {
    if coords.len() < required {
        return Err(GeometryError::TooFewCoordinates {
            kind,
            required,
            actual: coords.len(),
        });
    }
    coords
        .iter()
        .enumerate()
        .map(|(index, [x, y])| {
            if x.is_finite() && y.is_finite() {
                Ok(Coord { x: *x, y: *y })
            } else {
                Err(GeometryError::NonFinite { index })
            }
        })
        .collect()
}

fn to_ring(coords: &[[f64; 2]]) -> Result<LineString<f64>, GeometryError> {
    let mut ring = to_coords(coords, "Polygon ring", 3)?;
    if ring.first() != ring.last() {
        if let Some(first) = ring.first().copied() {
            ring.push(first);
        }
    }
    if ring.len() < 4 {
        return Err(GeometryError::TooFewCoordinates {
            kind: "Polygon ring",
            required: 4,
            actual: ring.len(),
        });
    }
    Ok(LineString::new(ring))
}

/// Every point where the segment meets a polygon's rings, start included
fn ring_hits(seg: &Line<f64>, polygon: &Polygon<f64>) -> Vec<Coord<f64>> {
    let mut hits = Vec::new();
    for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
        for edge in ring.lines() {
            match line_intersection(*seg, edge) {
                Some(LineIntersection::SinglePoint { intersection, .. }) => {
                    push_distinct(&mut hits, intersection)
                }
                Some(LineIntersection::Collinear { intersection }) => {
                    push_distinct(&mut hits, intersection.start);
                    push_distinct(&mut hits, intersection.end);
                }
                None => {}
            }
        }
    }
    hits
}

/// Counted hits of a half-open segment on a fence line, or the overlap if
/// the two run along each other
fn line_hits(seg: &Line<f64>, line: &LineString<f64>) -> Result<Vec<Coord<f64>>, Line<f64>> {
    let vertices = &line.0;
    let last_edge = vertices.len().saturating_sub(2);
    let mut hits = Vec::new();

    for (i, edge) in line.lines().enumerate() {
        let intersection = match line_intersection(*seg, edge) {
            None => continue,
            Some(LineIntersection::Collinear { intersection }) => {
                if intersection.start != intersection.end {
                    return Err(intersection);
                }
                intersection.start
            }
            Some(LineIntersection::SinglePoint { intersection, .. }) => intersection,
        };

        if intersection == seg.start {
            continue;
        }
        // An interior vertex is judged once, as the start of the next edge
        if intersection == edge.end && i < last_edge {
            continue;
        }
        if intersection == edge.start && i > 0 {
            let before = RobustKernel::orient2d(seg.start, seg.end, vertices[i - 1]);
            let after = RobustKernel::orient2d(seg.start, seg.end, edge.end);
            if !opposite_sides(before, after) {
                continue;
            }
        }
        push_distinct(&mut hits, intersection);
    }
    Ok(hits)
}

fn opposite_sides(a: Orientation, b: Orientation) -> bool {
    matches!(
        (a, b),
        (Orientation::Clockwise, Orientation::CounterClockwise)
            | (Orientation::CounterClockwise, Orientation::Clockwise)
    )
}

fn push_distinct(hits: &mut Vec<Coord<f64>>, c: Coord<f64>) {
    if !hits.contains(&c) {
        hits.push(c);
    }
}

fn nearest_to(origin: Coord<f64>, hits: &[Coord<f64>]) -> Option<Point<f64>> {
    let dist2 = |c: &Coord<f64>| (c.x - origin.x).powi(2) + (c.y - origin.y).powi(2);
    hits.iter()
        .min_by(|a, b| dist2(*a).total_cmp(&dist2(*b)))
        .map(|c| Point::from(*c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::Position;
    use chrono::{TimeZone, Utc};

    fn segment(from: (f64, f64), to: (f64, f64)) -> TrajectorySegment {
        let t0 = Utc.with_ymd_and_hms(2021, 3, 1, 6, 0, 0).unwrap();
        TrajectorySegment::new(
            Position::new(t0, from.0, from.1),
            Position::new(t0 + chrono::Duration::hours(1), to.0, to.1),
        )
        .unwrap()
    }

    fn line_fence(coords: &[[f64; 2]]) -> Fence {
        let feature = SpatialFeature::new(
            "line",
            "Boundary Road",
            FeatureGeometry::LineString(coords.to_vec()),
        );
        Fence::compile(&feature, FeatureRole::Critical).unwrap()
    }

    /// A "U" with a notch open to the north between x=35.305 and x=35.310
    fn notched_polygon() -> Fence {
        let feature = SpatialFeature::new(
            "farm",
            "Ol Donyo Farm 2",
            FeatureGeometry::Polygon(vec![vec![
                [35.300, -1.220],
                [35.320, -1.220],
                [35.320, -1.200],
                [35.310, -1.200],
                [35.310, -1.210],
                [35.305, -1.210],
                [35.305, -1.200],
                [35.300, -1.200],
                [35.300, -1.220],
            ]]),
        );
        Fence::compile(&feature, FeatureRole::Critical).unwrap()
    }

    #[test]
    fn test_compile_rejects_bad_geometry() {
        let short = SpatialFeature::new("a", "a", FeatureGeometry::LineString(vec![[1.0, 1.0]]));
        assert!(matches!(
            Fence::compile(&short, FeatureRole::Critical),
            Err(GeometryError::TooFewCoordinates { actual: 1, .. })
        ));

        let nan = SpatialFeature::new(
            "b",
            "b",
            FeatureGeometry::LineString(vec![[1.0, 1.0], [f64::NAN, 2.0]]),
        );
        assert_eq!(
            Fence::compile(&nan, FeatureRole::Critical),
            Err(GeometryError::NonFinite { index: 1 })
        );

        let empty = SpatialFeature::new("c", "c", FeatureGeometry::Polygon(vec![]));
        assert_eq!(
            Fence::compile(&empty, FeatureRole::Warning),
            Err(GeometryError::MissingExterior)
        );

        let line = SpatialFeature::new(
            "d",
            "d",
            FeatureGeometry::LineString(vec![[1.0, 1.0], [2.0, 2.0]]),
        );
        assert!(matches!(
            Fence::compile(&line, FeatureRole::Containment),
            Err(GeometryError::UnsupportedRole { .. })
        ));
    }

    #[test]
    fn test_unclosed_ring_is_closed() {
        let feature = SpatialFeature::new(
            "sq",
            "square",
            FeatureGeometry::Polygon(vec![vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]]),
        );
        let fence = Fence::compile(&feature, FeatureRole::Containment).unwrap();
        assert!(fence.contains(Point::new(0.5, 0.5)));
        // Closed set
        assert!(fence.contains(Point::new(1.0, 0.5)));
        assert!(fence.contains(Point::new(0.0, 0.0)));
        assert!(!fence.contains(Point::new(1.5, 0.5)));
    }

    #[test]
    fn test_line_crossing() {
        let fence = line_fence(&[[35.305, -1.22], [35.305, -1.19]]);
        let hit = fence
            .intersects(&segment((35.301, -1.205), (35.307, -1.205)))
            .unwrap();
        assert_eq!(hit.hits, 1);
        assert!((hit.point.x() - 35.305).abs() < 1e-9);
        assert!((hit.point.y() + 1.205).abs() < 1e-9);

        assert!(fence
            .intersects(&segment((35.301, -1.205), (35.304, -1.205)))
            .is_none());
    }

    #[test]
    fn test_zigzag_counts_odd_hits() {
        let fence = line_fence(&[
            [35.300, -1.210],
            [35.304, -1.200],
            [35.306, -1.220],
            [35.310, -1.200],
        ]);
        let hit = fence
            .intersects(&segment((35.299, -1.205), (35.311, -1.205)))
            .unwrap();
        assert_eq!(hit.hits, 3);
        assert!((hit.point.x() - 35.302).abs() < 1e-9);

        // Across two of the three legs only
        assert!(fence
            .intersects(&segment((35.299, -1.205), (35.305, -1.205)))
            .is_none());
    }

    #[test]
    fn test_vertex_hit_counted_once() {
        // Segment passes exactly through the apex at (1, 1)
        let through = line_fence(&[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]);
        let hit = through.intersects(&segment((0.0, 2.0), (2.0, 0.0))).unwrap();
        assert_eq!(hit.hits, 1);
        assert_eq!(hit.point, Point::new(1.0, 1.0));

        // Fence touches the segment at a vertex and turns back
        let touch = line_fence(&[[0.0, 0.0], [1.0, 1.0], [2.0, 0.0]]);
        assert!(touch.intersects(&segment((0.0, 1.0), (2.0, 1.0))).is_none());
    }

    #[test]
    fn test_segment_is_half_open() {
        let fence = line_fence(&[[1.0, 0.0], [1.0, 2.0]]);
        // Ends on the fence: counted
        assert!(fence.intersects(&segment((0.0, 1.0), (1.0, 1.0))).is_some());
        // Starts on the fence: not counted again
        assert!(fence.intersects(&segment((1.0, 1.0), (2.0, 1.0))).is_none());
    }

    #[test]
    fn test_collinear_overlap_is_not_a_crossing() {
        let fence = line_fence(&[[0.0, 0.0], [2.0, 0.0]]);
        assert!(fence.intersects(&segment((0.5, 0.0), (1.5, 0.0))).is_none());
    }

    #[test]
    fn test_polygon_transition() {
        let farm = notched_polygon();
        // Leaving through the west edge
        let hit = farm
            .intersects(&segment((35.302, -1.215), (35.298, -1.215)))
            .unwrap();
        assert!((hit.point.x() - 35.300).abs() < 1e-9);

        // In and out through the notch: same containment at both ends
        assert!(farm
            .intersects(&segment((35.302, -1.205), (35.3125, -1.205)))
            .is_none());
    }

    #[test]
    fn test_degenerate_segment_never_crosses() {
        let fence = line_fence(&[[35.305, -1.22], [35.305, -1.19]]);
        let seg = segment((35.305, -1.205), (35.30500001, -1.205));
        assert!(seg.is_degenerate());
        assert!(fence.intersects(&seg).is_none());
    }

    #[test]
    fn test_distance_to_edge() {
        let farm = notched_polygon();
        let d = farm.distance_to_edge_m(Point::new(35.300, -1.215)).unwrap();
        assert!(d < 1e-6);
        // 0.001 degree of longitude at the equator is ~111 m
        let d = farm.distance_to_edge_m(Point::new(35.299, -1.215)).unwrap();
        assert!((d - 111.2).abs() < 1.0, "{}", d);
    }
}
