//! Trajectory Model
//!
//! Turns raw, possibly unordered fixes into chronological segments with
//! derived speed and heading. Geometry is treated as locally planar for
//! intersection tests; lengths and headings are great-circle values.

use chrono::{DateTime, Utc};
use geo::{Bearing, Coord, Distance, Haversine, Line, Point};
use serde::{Deserialize, Serialize};

use crate::error::AnalyzerError;

mod filter;

pub use filter::{CoordinateFilter, SpeedFilter, TrajectoryFilter};

/// Fewest fixes from which a segment can be built
pub const MIN_FIXES: usize = 2;

/// Coordinates closer than this (degrees) are considered identical
const COORDINATE_RESOLUTION: f64 = 1e-7;

/// A time-stamped location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub timestamp: DateTime<Utc>,
    pub longitude: f64,
    pub latitude: f64,
}

impl Position {
    pub fn new(timestamp: DateTime<Utc>, longitude: f64, latitude: f64) -> Self {
        Position {
            timestamp,
            longitude,
            latitude,
        }
    }

    pub fn point(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }

    pub fn coord(&self) -> Coord<f64> {
        Coord {
            x: self.longitude,
            y: self.latitude,
        }
    }
}

/// Two consecutive fixes of one subject
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrajectorySegment {
    pub start: Position,
    pub end: Position,
    /// Great-circle length in meters
    pub length_m: f64,
    pub speed_kmhr: f64,
    /// Initial bearing, 0 = north, clockwise, in [0, 360)
    pub heading_degrees: f64,
}

impl TrajectorySegment {
    /// Build a segment; None when no time elapsed between the fixes
    pub fn new(start: Position, end: Position) -> Option<Self> {
        let elapsed_ms = (end.timestamp - start.timestamp).num_milliseconds();
        if elapsed_ms <= 0 {
            return None;
        }
        let length_m = Haversine::distance(start.point(), end.point());
        let speed_kmhr = (length_m / 1000.0) / (elapsed_ms as f64 / 3_600_000.0);
        let heading_degrees = if length_m > 0.0 {
            Haversine::bearing(start.point(), end.point()).rem_euclid(360.0)
        } else {
            0.0
        };
        Some(TrajectorySegment {
            start,
            end,
            length_m,
            speed_kmhr,
            heading_degrees,
        })
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.end.timestamp - self.start.timestamp
    }

    /// Planar line between the two fixes (lon/lat)
    pub fn line(&self) -> Line<f64> {
        Line::new(self.start.coord(), self.end.coord())
    }

    /// Start and end collapse onto the same coordinate
    pub fn is_degenerate(&self) -> bool {
        let round = |v: f64| (v / COORDINATE_RESOLUTION).round();
        round(self.start.longitude) == round(self.end.longitude)
            && round(self.start.latitude) == round(self.end.latitude)
    }

    /// Estimate when the subject passed `point`, interpolating on distance
    pub fn interpolate_time(&self, point: Point<f64>) -> DateTime<Utc> {
        let fraction = if self.length_m > 0.0 {
            (Haversine::distance(self.start.point(), point) / self.length_m).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let offset_ms = (self.elapsed().num_milliseconds() as f64 * fraction).round() as i64;
        self.start.timestamp + chrono::Duration::milliseconds(offset_ms)
    }
}

/// A filtered, chronologically ordered fix sequence
#[derive(Debug, Clone)]
pub struct Trajectory {
    fixes: Vec<Position>,
    max_segment_speed_kmhr: Option<f64>,
}

impl Trajectory {
    /// Filter and order `positions`.
    ///
    /// Fails with `InsufficientData` when fewer than `min_fixes` (never less
    /// than two) fixes survive filtering.
    pub fn build<I>(
        positions: I,
        filter: &TrajectoryFilter,
        min_fixes: usize,
    ) -> Result<Self, AnalyzerError>
    where
        I: IntoIterator<Item = Position>,
    {
        let mut fixes: Vec<Position> = positions
            .into_iter()
            .filter(|p| filter.coordinates.accepts(p))
            .collect();

        fixes.sort_by_key(|p| p.timestamp);
        fixes.dedup_by_key(|p| p.timestamp);

        if let Some(max_speed) = filter.max_speed_kmhr {
            SpeedFilter::new(max_speed).apply(&mut fixes);
        }

        let required = min_fixes.max(MIN_FIXES);
        if fixes.len() < required {
            return Err(AnalyzerError::InsufficientData {
                required,
                available: fixes.len(),
            });
        }

        Ok(Trajectory {
            fixes,
            max_segment_speed_kmhr: filter.max_speed_kmhr,
        })
    }

    pub fn fixes(&self) -> &[Position] {
        &self.fixes
    }

    pub fn fix_count(&self) -> usize {
        self.fixes.len()
    }

    /// Chronological segments. Calling again restarts from the first fix.
    pub fn segments(&self) -> Segments<'_> {
        Segments {
            fixes: &self.fixes,
            index: 0,
            max_speed_kmhr: self.max_segment_speed_kmhr,
        }
    }
}

/// Iterator over the segments of a [`Trajectory`]
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    fixes: &'a [Position],
    index: usize,
    max_speed_kmhr: Option<f64>,
}

impl Iterator for Segments<'_> {
    type Item = TrajectorySegment;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index + 1 < self.fixes.len() {
            let (start, end) = (self.fixes[self.index], self.fixes[self.index + 1]);
            self.index += 1;

            let Some(segment) = TrajectorySegment::new(start, end) else {
                continue;
            };
            if let Some(max) = self.max_speed_kmhr {
                if segment.speed_kmhr > max {
                    log::debug!(
                        "Skipping segment ending {} at {:.1} km/h",
                        segment.end.timestamp,
                        segment.speed_kmhr
                    );
                    continue;
                }
            }
            return Some(segment);
        }
        None
    }
}
