//! # Rangewatch Core
//!
//! Platform-independent geofence analysis for tracked wildlife.
//!
//! This crate contains the detection logic with **zero I/O dependencies**:
//! observations, features, results, events and the quiet-period cache are
//! reached through traits, so the same analysis runs in-process for tests or
//! behind the file-backed stores of `rangewatch-server`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  rangewatch-core (no tokio, no filesystem)                   │
//! │  ├── trajectory/  (fix filtering, segments, speed, heading)  │
//! │  ├── features/    (fence geometry, crossing & containment)   │
//! │  ├── crossing     (per-segment crossing decision)            │
//! │  ├── results      (findings + ResultStore)                   │
//! │  ├── quiet        (per-config quiet window)                  │
//! │  ├── events       (EventSink)                                │
//! │  └── analyzer/    (configs, orchestration, Deployment)       │
//! └──────────────────────────────────────────────────────────────┘
//!                              ▲
//!                ┌─────────────┴─────────────┐
//!                │  rangewatch-server        │
//!                │  (scheduler, file stores) │
//!                └───────────────────────────┘
//! ```
//!
//! Data flows one way: observations → [`Trajectory`] → segments →
//! [`CrossingDetector`] → [`AnalyzerResult`] → event.
//!
//! ## Example: Detecting a Crossing
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use rangewatch_core::features::{FeatureGeometry, FeatureRole, Fence, SpatialFeature};
//! use rangewatch_core::{CrossingDetector, FeatureIndex, Position, TrajectorySegment};
//!
//! let road = SpatialFeature::new(
//!     "road",
//!     "Boundary Road",
//!     FeatureGeometry::LineString(vec![[35.305, -1.22], [35.305, -1.19]]),
//! );
//! let fence = Fence::compile(&road, FeatureRole::Critical).unwrap();
//! let index = FeatureIndex::from_fences(vec![fence], vec![], vec![]);
//!
//! let t0 = Utc.with_ymd_and_hms(2021, 3, 1, 6, 0, 0).unwrap();
//! let segment = TrajectorySegment::new(
//!     Position::new(t0, 35.301, -1.205),
//!     Position::new(t0 + chrono::Duration::hours(1), 35.309, -1.205),
//! )
//! .unwrap();
//!
//! let crossings = CrossingDetector::new(&index, 1.0).detect("Dumbo", &segment);
//! assert_eq!(crossings.len(), 1);
//! assert_eq!(crossings[0].fence_name, "Boundary Road");
//! ```

pub mod analyzer;
pub mod crossing;
pub mod error;
pub mod events;
pub mod features;
pub mod quiet;
pub mod results;
pub mod trajectory;

// Re-export commonly used types
pub use analyzer::{
    analyze_subject, AnalysisContext, AnalyzerOutcome, AnalyzerRun, AnalyzerStatus, ConfigStore,
    Deployment, GeofenceAnalyzer, GeofenceAnalyzerConfig, MemoryObservationStore, Observation,
    ObservationSource, Subject, SubjectAnalyzer,
};
pub use crossing::{Crossing, CrossingDetector};
pub use error::{AnalyzerError, GeometryError};
pub use events::{Event, EventRef, EventRequest, EventSink, MemoryEventSink};
pub use features::{FeatureIndex, FeatureProvider};
pub use quiet::{AnalyzerKey, MemoryQuietCache, QuietPeriodCache};
pub use results::{AnalyzerResult, Level, MemoryResultStore, ResultStore};
pub use trajectory::{Position, Trajectory, TrajectorySegment};
