//! Deterministic synthetic scene with oracle image collaborators.
//!
//! Landmarks are scattered in front of a camera translating sideways. Images
//! carry no content: the collaborators answer from the known geometry, keyed on
//! the frame index of the pyramid they are given.
//!
//! - flow: a point is identified with the landmark projecting onto it in the
//!   previous frame and moved to that landmark's projection in the current frame
//! - corners: projections of the visible landmarks, with a fixed per-landmark strength
//! - descriptors: a fixed random descriptor per landmark

use std::sync::Arc;

use nalgebra::{UnitQuaternion, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::geometry::{Camera, PinholeCamera, SE3};
use crate::map::{Descriptor, FrameIndex};
use crate::system::Collaborators;
use crate::tracking::FrameInput;
use crate::vision::{Corner, CornerDetector, DescriptorExtractor, FlowTracker, GrayImage, ImagePyramid, ImageRegion};

/// Projections closer than this to the image border are not visible.
const BORDER: f64 = 8.0;

/// Distance within which an image point is identified with a landmark projection.
const MATCH_RADIUS: f64 = 0.5;

/// Gravity of the synthetic world, in the y-down camera convention.
const SCENE_GRAVITY: Vector3<f64> = Vector3::new(0.0, 1.0, 0.0);

/// Parameters of a synthetic scene.
#[derive(Debug, Clone)]
pub struct SceneConfig {
    pub width: u32,
    pub height: u32,
    pub focal_length: f64,
    pub num_landmarks: usize,
    pub num_frames: FrameIndex,
    pub frame_rate: f64,
    /// Sideways camera motion per frame, in meters.
    pub speed: f64,
    /// Peak yaw of the camera's oscillation, in degrees.
    pub yaw_amplitude_deg: f64,
    /// Provide gravity hints with each frame.
    pub with_gravity: bool,
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            focal_length: 500.0,
            num_landmarks: 800,
            num_frames: 150,
            frame_rate: 30.0,
            speed: 0.02,
            yaw_amplitude_deg: 2.0,
            with_gravity: false,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone)]
struct Landmark {
    position: Vector3<f64>,
    strength: f64,
    descriptor: Descriptor,
}

/// A static scene observed along a known trajectory.
#[derive(Debug)]
pub struct SyntheticScene {
    config: SceneConfig,
    camera: PinholeCamera,
    landmarks: Vec<Landmark>,
}

impl SyntheticScene {
    pub fn new(config: SceneConfig) -> Arc<Self> {
        let camera = PinholeCamera::new(
            config.width,
            config.height,
            config.focal_length,
            config.focal_length,
            config.width as f64 * 0.5,
            config.height as f64 * 0.5,
        );
        let mut rng = StdRng::seed_from_u64(config.seed);
        let travel = config.speed * config.num_frames as f64;
        let landmarks = (0..config.num_landmarks)
            .map(|_| Landmark {
                position: Vector3::new(
                    rng.gen_range(-5.0..5.0 + travel),
                    rng.gen_range(-3.0..3.0),
                    rng.gen_range(4.0..12.0),
                ),
                strength: rng.gen_range(10.0..80.0),
                descriptor: Descriptor([rng.gen(), rng.gen(), rng.gen(), rng.gen()]),
            })
            .collect();
        Arc::new(Self {
            config,
            camera,
            landmarks,
        })
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    pub fn camera(&self) -> &PinholeCamera {
        &self.camera
    }

    pub fn num_frames(&self) -> FrameIndex {
        self.config.num_frames
    }

    pub fn timestamp(&self, frame: FrameIndex) -> f64 {
        frame as f64 / self.config.frame_rate
    }

    /// True camera pose (T_wc) at `frame`.
    pub fn pose(&self, frame: FrameIndex) -> SE3 {
        let t = frame as f64;
        let yaw = self.config.yaw_amplitude_deg.to_radians() * (t * 0.05).sin();
        let translation = Vector3::new(self.config.speed * t, 0.05 * (t * 0.1).sin(), 0.0);
        SE3::new(UnitQuaternion::from_euler_angles(0.0, yaw, 0.0), translation)
    }

    /// World position of landmark `index`.
    pub fn landmark_position(&self, index: usize) -> Vector3<f64> {
        self.landmarks[index].position
    }

    /// Projection of landmark `index` into the camera at `camera_t_world`, if visible.
    fn project(&self, index: usize, camera_t_world: &SE3) -> Option<Vector2<f64>> {
        let camera_point = camera_t_world.transform_point(&self.landmarks[index].position);
        if camera_point.z <= 0.1 {
            return None;
        }
        let image_point = self.camera.project(&camera_point);
        let inside = image_point.x >= BORDER
            && image_point.y >= BORDER
            && image_point.x < self.config.width as f64 - BORDER
            && image_point.y < self.config.height as f64 - BORDER;
        inside.then_some(image_point)
    }

    /// Visible landmarks at `frame` with their projections.
    pub fn visible(&self, frame: FrameIndex) -> Vec<(usize, Vector2<f64>)> {
        let camera_t_world = self.pose(frame).inverse();
        (0..self.landmarks.len())
            .filter_map(|index| self.project(index, &camera_t_world).map(|p| (index, p)))
            .collect()
    }

    /// Landmark of `visible` projecting closest to `image_point`, within the match radius.
    fn landmark_at(&self, visible: &[(usize, Vector2<f64>)], image_point: &Vector2<f64>) -> Option<usize> {
        visible
            .iter()
            .map(|(index, projection)| ((projection - image_point).norm_squared(), *index))
            .filter(|(sqr_distance, _)| *sqr_distance <= MATCH_RADIUS * MATCH_RADIUS)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, index)| index)
    }

    /// Input of `frame`: a blank image, its timestamp and the optional hints.
    pub fn frame_input(&self, frame: FrameIndex) -> FrameInput {
        let pose = self.pose(frame);
        let mut input = FrameInput::new(GrayImage::blank(self.config.width, self.config.height), self.timestamp(frame));
        input.world_r_camera = Some(pose.rotation);
        if self.config.with_gravity {
            input.camera_gravity = Some(pose.rotation.inverse() * SCENE_GRAVITY);
        }
        input
    }

    /// Collaborators answering from this scene.
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators::new(
            Arc::new(self.camera),
            Arc::new(SceneFlow(self.clone())),
            Arc::new(SceneCorners(self.clone())),
            Arc::new(SceneDescriptors(self.clone())),
        )
    }
}

/// Flow oracle.
pub struct SceneFlow(pub Arc<SyntheticScene>);

impl FlowTracker for SceneFlow {
    fn track(
        &self,
        previous: &ImagePyramid,
        current: &ImagePyramid,
        points: &[Vector2<f64>],
        _predictions: &[Vector2<f64>],
    ) -> Vec<Option<Vector2<f64>>> {
        let scene = &self.0;
        let visible = scene.visible(previous.frame_index);
        let camera_t_world = scene.pose(current.frame_index).inverse();
        points
            .iter()
            .map(|point| {
                let index = scene.landmark_at(&visible, point)?;
                scene.project(index, &camera_t_world)
            })
            .collect()
    }
}

/// Corner oracle.
pub struct SceneCorners(pub Arc<SyntheticScene>);

impl CornerDetector for SceneCorners {
    fn detect(&self, pyramid: &ImagePyramid, threshold: u32, region: Option<&ImageRegion>) -> Vec<Corner> {
        let scene = &self.0;
        scene
            .visible(pyramid.frame_index)
            .into_iter()
            .filter(|(index, _)| scene.landmarks[*index].strength >= threshold as f64)
            .filter(|(_, position)| region.map_or(true, |region| region.contains(position)))
            .map(|(index, position)| Corner {
                position,
                strength: scene.landmarks[index].strength,
            })
            .collect()
    }
}

/// Descriptor oracle.
pub struct SceneDescriptors(pub Arc<SyntheticScene>);

impl DescriptorExtractor for SceneDescriptors {
    fn describe(&self, pyramid: &ImagePyramid, points: &[Vector2<f64>]) -> Vec<Option<Descriptor>> {
        let scene = &self.0;
        let visible = scene.visible(pyramid.frame_index);
        points
            .iter()
            .map(|point| {
                scene
                    .landmark_at(&visible, point)
                    .map(|index| scene.landmarks[index].descriptor)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pyramid(frame: FrameIndex) -> ImagePyramid {
        ImagePyramid::new(frame, 0.0, GrayImage::blank(640, 480), 1)
    }

    #[test]
    fn test_flow_follows_landmarks() {
        let scene = SyntheticScene::new(SceneConfig::default());
        let visible = scene.visible(0);
        assert!(visible.len() > 100);

        let points: Vec<_> = visible.iter().map(|(_, p)| *p).collect();
        let flow = SceneFlow(scene.clone());
        let tracked = flow.track(&pyramid(0), &pyramid(1), &points, &points);

        let camera_t_world = scene.pose(1).inverse();
        for ((index, _), tracked) in visible.iter().zip(&tracked) {
            match scene.project(*index, &camera_t_world) {
                Some(expected) => assert_relative_eq!(tracked.unwrap(), expected),
                None => assert!(tracked.is_none()),
            }
        }

        let lost = flow.track(&pyramid(0), &pyramid(1), &[Vector2::new(-100.0, -100.0)], &[Vector2::zeros()]);
        assert_eq!(lost, vec![None]);
    }

    #[test]
    fn test_corners_respect_threshold_and_region() {
        let scene = SyntheticScene::new(SceneConfig::default());
        let corners = SceneCorners(scene.clone());
        let all = corners.detect(&pyramid(3), 10, None);
        let strong = corners.detect(&pyramid(3), 60, None);
        assert_eq!(all.len(), scene.visible(3).len());
        assert!(strong.len() < all.len());
        assert!(strong.iter().all(|c| c.strength >= 60.0));

        let region = ImageRegion {
            left: 0,
            top: 0,
            width: 320,
            height: 240,
        };
        let inside = corners.detect(&pyramid(3), 10, Some(&region));
        assert!(inside.iter().all(|c| region.contains(&c.position)));
    }

    #[test]
    fn test_descriptors_identify_landmarks_across_frames() {
        let scene = SyntheticScene::new(SceneConfig::default());
        let descriptors = SceneDescriptors(scene.clone());
        let (index, at_0) = scene.visible(0)[0];
        let at_5 = scene.project(index, &scene.pose(5).inverse());

        let first = descriptors.describe(&pyramid(0), &[at_0]);
        assert!(first[0].is_some());
        if let Some(at_5) = at_5 {
            assert_eq!(descriptors.describe(&pyramid(5), &[at_5]), first);
        }
    }

    #[test]
    fn test_gravity_hint_is_unit() {
        let scene = SyntheticScene::new(SceneConfig {
            with_gravity: true,
            ..Default::default()
        });
        let gravity = scene.frame_input(10).camera_gravity.unwrap();
        assert_relative_eq!(gravity.norm(), 1.0, epsilon = 1e-12);
    }
}
