//! Per-frame statistics, timing measurements and debug snapshots.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use nalgebra::{Vector2, Vector3};
use serde::Serialize;

use super::correspondences::TrackingCorrespondences;
use crate::geometry::SE3;
use crate::map::{FrameIndex, LocalizationPrecision, MapState, MapVersion, PointId};

/// Statistics of a single frame, one CSV row.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameStatistics {
    pub frame_index: FrameIndex,
    /// Points that could have been tracked from the previous frame.
    pub tracking_possible: usize,
    /// Points tracked successfully.
    pub tracking_actual: usize,
    /// Correspondences used for the pose.
    pub pose_correspondences: usize,
    /// Average projection error of the pose, in pixels.
    pub projection_error: Option<f64>,
    pub map_version: u64,
    pub tx: Option<f64>,
    pub ty: Option<f64>,
    pub tz: Option<f64>,
    pub qw: Option<f64>,
    pub qx: Option<f64>,
    pub qy: Option<f64>,
    pub qz: Option<f64>,
}

impl FrameStatistics {
    pub fn new(frame_index: FrameIndex) -> Self {
        Self {
            frame_index,
            ..Default::default()
        }
    }

    pub fn set_pose(&mut self, world_t_camera: &SE3) {
        let t = world_t_camera.translation;
        let q = world_t_camera.rotation;
        self.tx = Some(t.x);
        self.ty = Some(t.y);
        self.tz = Some(t.z);
        self.qw = Some(q.w);
        self.qx = Some(q.i);
        self.qy = Some(q.j);
        self.qz = Some(q.k);
    }

    pub fn set_map_version(&mut self, version: MapVersion) {
        self.map_version = version.0;
    }

    /// Counts must shrink along the pipeline: possible >= actual >= pose.
    pub fn is_valid(&self) -> bool {
        self.tracking_possible >= self.tracking_actual && self.tracking_actual >= self.pose_correspondences
    }
}

/// Timers of the individual processing steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timer {
    HandleFrame,
    TrackImagePoints,
    DeterminePose,
    PostFrame,
    Detection,
    Bootstrap,
    Repair,
    BundleAdjustment,
    Promotion,
    Relocalization,
    Describe,
}

impl Timer {
    fn label(&self) -> &'static str {
        match self {
            Self::HandleFrame => "Handle frame",
            Self::TrackImagePoints => "Track image points",
            Self::DeterminePose => "Determine camera pose",
            Self::PostFrame => "Post frame",
            Self::Detection => "Detect new image points",
            Self::Bootstrap => "Determine initial object points",
            Self::Repair => "Optimize imprecise object points",
            Self::BundleAdjustment => "Bundle adjustment",
            Self::Promotion => "Localize point tracks",
            Self::Relocalization => "Relocalize",
            Self::Describe => "Describe object points",
        }
    }
}

/// Accumulated measurements of one timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerStatistic {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl TimerStatistic {
    pub fn add(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

impl std::fmt::Display for TimerStatistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            return f.write_str("-");
        }
        write!(
            f,
            "{:.2}ms avg, {:.2}ms max, {} calls",
            self.average().as_secs_f64() * 1000.0,
            self.max.as_secs_f64() * 1000.0,
            self.count
        )
    }
}

/// Timing measurements of both threads.
#[derive(Debug, Clone, Default)]
pub struct PerformanceStatistics {
    timers: BTreeMap<Timer, TimerStatistic>,
}

impl PerformanceStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, timer: Timer, elapsed: Duration) {
        self.timers.entry(timer).or_default().add(elapsed);
    }

    /// Record the time elapsed since `start`.
    pub fn record_since(&mut self, timer: Timer, start: Instant) {
        self.record(timer, start.elapsed());
    }

    pub fn get(&self, timer: Timer) -> TimerStatistic {
        self.timers.get(&timer).copied().unwrap_or_default()
    }

    /// Human-readable report grouped by thread.
    pub fn report(&self) -> String {
        let sections: [(&str, &[Timer]); 3] = [
            (
                "Main thread:",
                &[Timer::HandleFrame, Timer::TrackImagePoints, Timer::DeterminePose],
            ),
            ("Background task (post frame):", &[Timer::PostFrame, Timer::Detection]),
            (
                "Background thread:",
                &[
                    Timer::Bootstrap,
                    Timer::Repair,
                    Timer::Relocalization,
                    Timer::BundleAdjustment,
                    Timer::Promotion,
                    Timer::Describe,
                ],
            ),
        ];

        let mut report = String::new();
        for (title, timers) in sections {
            if !report.is_empty() {
                report.push_str("\n\n");
            }
            report.push_str(title);
            for timer in timers {
                report.push_str(&format!("\n{}: {}", timer.label(), self.get(*timer)));
            }
        }
        report
    }
}

/// A localized point as seen in a debug snapshot.
#[derive(Debug, Clone)]
pub struct DebugPoint {
    pub position: Vector3<f64>,
    pub precision: LocalizationPrecision,
    pub bundle_adjusted: bool,
}

/// Snapshot of the tracker internals for visualization.
#[derive(Debug, Clone, Default)]
pub struct DebugData {
    /// 2D tracks of the recent frame-to-frame tracking: id -> (last frame, image points).
    pub tracks: HashMap<PointId, (FrameIndex, Vec<Vector2<f64>>)>,
    pub points: HashMap<PointId, DebugPoint>,
    /// Points used for the last pose with at least low precision.
    pub pose_precise_ids: Vec<PointId>,
    /// Points used for the last pose below low precision.
    pub pose_imprecise_ids: Vec<PointId>,
    pub inaccurate_ids: HashSet<PointId>,
}

impl DebugData {
    /// Extend the 2D tracks with the tracking results of `frame`.
    pub fn update_tracks(&mut self, frame: FrameIndex, tracking: &TrackingCorrespondences) {
        for (index, id) in tracking.point_ids().iter().enumerate() {
            if !tracking.is_valid(index) {
                self.tracks.remove(id);
                continue;
            }
            let current = tracking.current_points()[index];
            self.tracks
                .entry(*id)
                .and_modify(|(last, points)| {
                    *last = frame;
                    points.push(current);
                })
                .or_insert_with(|| (frame, vec![tracking.previous_points()[index], current]));
        }
        self.tracks.retain(|_, (last, _)| *last == frame);
    }

    /// Refresh the localized points from the map.
    pub fn update_points(&mut self, map: &MapState) {
        self.points = map
            .points
            .localized_points()
            .map(|(id, point)| {
                (
                    id,
                    DebugPoint {
                        position: point.position,
                        precision: point.precision,
                        bundle_adjusted: point.bundle_adjusted,
                    },
                )
            })
            .collect();
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_statistics_validity() {
        let mut statistics = FrameStatistics::new(4);
        statistics.tracking_possible = 100;
        statistics.tracking_actual = 90;
        statistics.pose_correspondences = 60;
        assert!(statistics.is_valid());

        statistics.pose_correspondences = 95;
        assert!(!statistics.is_valid());
    }

    #[test]
    fn test_timer_statistic() {
        let mut statistic = TimerStatistic::default();
        assert_eq!(statistic.to_string(), "-");
        statistic.add(Duration::from_millis(2));
        statistic.add(Duration::from_millis(4));
        assert_eq!(statistic.count, 2);
        assert_eq!(statistic.average(), Duration::from_millis(3));
        assert_eq!(statistic.max, Duration::from_millis(4));
    }

    #[test]
    fn test_report_sections() {
        let mut performance = PerformanceStatistics::new();
        performance.record(Timer::BundleAdjustment, Duration::from_millis(10));
        let report = performance.report();
        assert!(report.starts_with("Main thread:"));
        assert!(report.contains("Background thread:"));
        assert!(report.contains("Bundle adjustment: 10.00ms avg"));
    }
}
