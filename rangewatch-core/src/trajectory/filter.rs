//! Fix filters applied before segment construction
//!
//! Filters drop fixes, they never correct them.

use geo::{Distance, Haversine};
use serde::{Deserialize, Serialize};

use super::Position;

/// Drops fixes with out-of-range coordinates or "no fix" sentinel values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateFilter {
    pub min_longitude: f64,
    pub max_longitude: f64,
    pub min_latitude: f64,
    pub max_latitude: f64,
    /// Exact `[longitude, latitude]` pairs that mean "no fix"
    pub sentinels: Vec<[f64; 2]>,
}

impl Default for CoordinateFilter {
    fn default() -> Self {
        CoordinateFilter {
            min_longitude: -180.0,
            max_longitude: 180.0,
            min_latitude: -90.0,
            max_latitude: 90.0,
            sentinels: vec![[0.0, 0.0], [180.0, 90.0]],
        }
    }
}

impl CoordinateFilter {
    /// Filter for a subject. Stationary subjects keep `(0, 0)` locations.
    pub fn for_subject(is_stationary: bool) -> Self {
        let mut filter = CoordinateFilter::default();
        if is_stationary {
            filter.sentinels.retain(|s| *s != [0.0, 0.0]);
        }
        filter
    }

    /// Check whether a fix passes the filter
    pub fn accepts(&self, position: &Position) -> bool {
        let (lon, lat) = (position.longitude, position.latitude);
        if !lon.is_finite() || !lat.is_finite() {
            return false;
        }
        if lon < self.min_longitude
            || lon > self.max_longitude
            || lat < self.min_latitude
            || lat > self.max_latitude
        {
            return false;
        }
        !self.sentinels.iter().any(|s| s[0] == lon && s[1] == lat)
    }
}

/// Drops fixes implying a speed above `max_speed_kmhr` from the last kept fix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedFilter {
    pub max_speed_kmhr: f64,
}

impl SpeedFilter {
    pub fn new(max_speed_kmhr: f64) -> Self {
        SpeedFilter { max_speed_kmhr }
    }

    /// Filter chronologically sorted fixes in place
    pub fn apply(&self, fixes: &mut Vec<Position>) {
        let mut kept: Vec<Position> = Vec::with_capacity(fixes.len());
        for fix in fixes.drain(..) {
            match kept.last() {
                Some(last) => {
                    let speed = implied_speed_kmhr(last, &fix);
                    if speed.map_or(true, |s| s <= self.max_speed_kmhr) {
                        kept.push(fix);
                    } else {
                        log::debug!(
                            "Dropping fix at {} implying {:.1} km/h (limit {:.1})",
                            fix.timestamp,
                            speed.unwrap_or_default(),
                            self.max_speed_kmhr
                        );
                    }
                }
                None => kept.push(fix),
            }
        }
        *fixes = kept;
    }
}

/// Speed between two fixes, None when no time elapsed
pub(crate) fn implied_speed_kmhr(from: &Position, to: &Position) -> Option<f64> {
    let hours = (to.timestamp - from.timestamp).num_milliseconds() as f64 / 3_600_000.0;
    if hours <= 0.0 {
        return None;
    }
    let km = Haversine::distance(from.point(), to.point()) / 1000.0;
    Some(km / hours)
}

/// Full set of filters for one trajectory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrajectoryFilter {
    pub coordinates: CoordinateFilter,
    /// Per-subtype speed limit; also drops segments faster than this
    pub max_speed_kmhr: Option<f64>,
}

impl TrajectoryFilter {
    pub fn new(coordinates: CoordinateFilter, max_speed_kmhr: Option<f64>) -> Self {
        TrajectoryFilter {
            coordinates,
            max_speed_kmhr,
        }
    }
}
