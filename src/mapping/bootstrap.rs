//! Bootstrap of the initial map from two frames of the current tracks.
//!
//! 1. Choose the first frame from the typical length of the tracks alive in the
//!    latest frame
//! 2. Solve the relative pose of both frames and triangulate the shared tracks
//! 3. Reject rotational motion and too narrow viewing angles
//! 4. Reset the map and promote the triangulated tracks

use nalgebra::{Vector2, Vector3};
use rand::RngCore;
use tracing::{debug, info};

use super::worker::MappingWorker;
use crate::geometry::{Camera, TwoViewGravity, TwoViewParams, TwoViewResult, TwoViewSolver, SE3};
use crate::geometry::ransac::median;
use crate::map::{CameraPose, FrameIndex, LocalizationPrecision, MapState, MotionType, PointId, PoseQuality};

/// Tracks needed alive in the latest frame before a bootstrap is attempted.
pub const MIN_BOOTSTRAP_TRACKS: usize = 30;

/// Percentile of the track lengths the frame distance is derived from.
pub const TRACK_LENGTH_PERCENTILE: f64 = 0.95;

/// Minimal track length (at the percentile) for a bootstrap.
pub const MIN_TRACK_LENGTH: usize = 10;

/// Correspondences needed between the two bootstrap frames.
pub const MIN_BOOTSTRAP_CORRESPONDENCES: usize = 20;

/// Minimal median angle between the viewing rays of both frames, in degrees.
pub const MIN_BOOTSTRAP_ANGLE_DEG: f64 = 1.5;

/// Tracks shared by the two bootstrap frames.
#[derive(Debug, Clone)]
pub struct BootstrapInput {
    pub first_frame: FrameIndex,
    pub latest_frame: FrameIndex,
    pub ids: Vec<PointId>,
    pub points0: Vec<Vector2<f64>>,
    pub points1: Vec<Vector2<f64>>,
    pub gravity: Option<TwoViewGravity>,
}

/// A successful bootstrap, ready to be committed.
#[derive(Debug, Clone)]
pub struct BootstrapResult {
    pub first_frame: FrameIndex,
    pub world_t_first: SE3,
    pub world_t_latest: SE3,
    pub points: Vec<(PointId, Vector3<f64>)>,
}

/// Length (in frames up to `latest`) of the tracks alive at `latest`, at the given percentile.
///
/// Zero when fewer than [`MIN_BOOTSTRAP_TRACKS`] tracks are alive.
pub fn track_length_percentile(map: &MapState, latest: FrameIndex, percentile: f64) -> usize {
    let mut lengths: Vec<usize> = map
        .points
        .tracks()
        .filter(|(_, track)| track.last_frame() >= latest && track.first_frame() <= latest)
        .map(|(_, track)| (latest - track.first_frame()) as usize + 1)
        .collect();
    if lengths.len() < MIN_BOOTSTRAP_TRACKS {
        return 0;
    }
    lengths.sort_unstable();
    let index = ((lengths.len() - 1) as f64 * percentile).round() as usize;
    lengths[index.min(lengths.len() - 1)]
}

impl BootstrapInput {
    /// Gather the correspondences for a bootstrap ending at `latest`.
    pub fn gather(map: &MapState, latest: FrameIndex, world_gravity: Vector3<f64>) -> Option<Self> {
        let length = track_length_percentile(map, latest, TRACK_LENGTH_PERCENTILE);
        if length < MIN_TRACK_LENGTH {
            return None;
        }
        let first_frame = latest + 1 - (length / 2) as FrameIndex;

        let mut input = Self {
            first_frame,
            latest_frame: latest,
            ids: Vec::new(),
            points0: Vec::new(),
            points1: Vec::new(),
            gravity: None,
        };
        for (id, track) in map.points.tracks() {
            if let (Some(p0), Some(p1)) = (track.observation(first_frame), track.observation(latest)) {
                input.ids.push(id);
                input.points0.push(p0);
                input.points1.push(p1);
            }
        }
        if input.ids.len() < MIN_BOOTSTRAP_CORRESPONDENCES {
            return None;
        }

        if let (Some(g0), Some(g1)) = (map.gravities.get(&first_frame), map.gravities.get(&latest)) {
            input.gravity = Some(TwoViewGravity {
                camera_gravity0: *g0,
                camera_gravity1: *g1,
                world_gravity,
            });
        }
        Some(input)
    }
}

/// Median angle (radians) between the world rays of both views over the valid correspondences.
pub fn median_ray_angle(camera: &dyn Camera, result: &TwoViewResult, points0: &[Vector2<f64>], points1: &[Vector2<f64>]) -> f64 {
    let angles: Vec<f64> = result
        .valid_indices
        .iter()
        .map(|&index| {
            let ray0 = result.world_t_camera0.rotation * camera.unproject(&points0[index]);
            let ray1 = result.world_t_camera1.rotation * camera.unproject(&points1[index]);
            ray0.angle(&ray1)
        })
        .collect();
    median(&angles).unwrap_or(0.0)
}

/// Solve the two-view problem and check that it is fit for an initial map.
pub fn solve_bootstrap(
    camera: &dyn Camera,
    solver: &dyn TwoViewSolver,
    input: &BootstrapInput,
    rng: &mut dyn RngCore,
) -> Option<BootstrapResult> {
    let result = solver.solve(
        camera,
        &input.points0,
        &input.points1,
        input.gravity.as_ref(),
        rng,
        &TwoViewParams::default(),
    )?;

    if result.is_rotational() {
        debug!("[Bootstrap] rotational motion between frames {} and {}", input.first_frame, input.latest_frame);
        return None;
    }
    if result.valid_indices.len() < MIN_BOOTSTRAP_CORRESPONDENCES {
        return None;
    }

    let angle = median_ray_angle(camera, &result, &input.points0, &input.points1);
    if angle < MIN_BOOTSTRAP_ANGLE_DEG.to_radians() {
        debug!("[Bootstrap] median viewing angle {:.2} deg too small", angle.to_degrees());
        return None;
    }

    let points = result
        .valid_indices
        .iter()
        .zip(&result.object_points)
        .map(|(&index, position)| (input.ids[index], *position))
        .collect();

    Some(BootstrapResult {
        first_frame: input.first_frame,
        world_t_first: result.world_t_camera0,
        world_t_latest: result.world_t_camera1,
        points,
    })
}

impl MappingWorker {
    /// Try to build the initial map ending at the latest frame.
    pub(super) fn bootstrap(&mut self, latest: FrameIndex) {
        let camera = self.collaborators.camera.clone();
        let shared = self.shared.clone();

        let input = {
            let map = shared.map.read();
            BootstrapInput::gather(&map, latest, self.config.world_gravity())
        };
        let Some(input) = input else {
            return;
        };

        let Some(result) = solve_bootstrap(camera.as_ref(), self.collaborators.two_view.as_ref(), &input, &mut self.rng)
        else {
            return;
        };

        let mut map = shared.map.write();
        self.reset_map(&mut map, latest);

        let mut promoted = 0;
        for (id, position) in &result.points {
            if map.points.promote(*id, *position, LocalizationPrecision::Unknown, true) {
                self.bundle.points.insert(*id);
                promoted += 1;
            }
        }

        let version = map.commit();
        map.poses.set(
            result.first_frame,
            CameraPose::new(result.world_t_first, PoseQuality::Low, MotionType::Unknown, version),
        );
        map.poses.set(
            latest,
            CameraPose::new(result.world_t_latest, PoseQuality::Low, MotionType::Unknown, version),
        );

        self.bundle.key_frames = vec![result.first_frame, latest];
        self.bundle.sqr_baseline = (result.world_t_latest.translation - result.world_t_first.translation).norm_squared();
        shared.clear_bootstrap_request();

        info!(
            "[Bootstrap] initialized with frames {} and {}: {} points, map version {}",
            result.first_frame,
            latest,
            promoted,
            version.0
        );
    }
}
