//! Collaborators the tracker relies on: camera model, image processing and solvers.

use std::sync::Arc;

use crate::geometry::{
    Camera, DltPoseSolver, EssentialTwoViewSolver, PoseSolver, PointTriangulator, RansacPointTriangulator,
    TwoViewSolver,
};
use crate::optimizer::{BundleAdjuster, SchurBundleAdjuster};
use crate::vision::{CornerDetector, DescriptorExtractor, FlowTracker};

/// All collaborators, shared by both threads.
pub struct Collaborators {
    pub camera: Arc<dyn Camera>,
    pub flow: Arc<dyn FlowTracker>,
    pub corners: Arc<dyn CornerDetector>,
    pub descriptors: Arc<dyn DescriptorExtractor>,
    pub pose_solver: Arc<dyn PoseSolver>,
    pub triangulator: Arc<dyn PointTriangulator>,
    pub two_view: Arc<dyn TwoViewSolver>,
    pub bundle_adjuster: Arc<dyn BundleAdjuster>,
}

impl Collaborators {
    /// Image collaborators as given, reference geometric solvers.
    pub fn new(
        camera: Arc<dyn Camera>,
        flow: Arc<dyn FlowTracker>,
        corners: Arc<dyn CornerDetector>,
        descriptors: Arc<dyn DescriptorExtractor>,
    ) -> Self {
        Self {
            camera,
            flow,
            corners,
            descriptors,
            pose_solver: Arc::new(DltPoseSolver),
            triangulator: Arc::new(RansacPointTriangulator),
            two_view: Arc::new(EssentialTwoViewSolver),
            bundle_adjuster: Arc::new(SchurBundleAdjuster),
        }
    }

    /// OpenCV image processing (LK flow, FAST, ORB) and PnP.
    #[cfg(feature = "opencv")]
    pub fn opencv(camera: Arc<dyn Camera>) -> Self {
        use crate::geometry::OpenCvPoseSolver;
        use crate::vision::opencv::{FastCornerDetector, LucasKanadeTracker, OrbDescriptorExtractor};

        let mut collaborators = Self::new(
            camera,
            Arc::new(LucasKanadeTracker::default()),
            Arc::new(FastCornerDetector),
            Arc::new(OrbDescriptorExtractor),
        );
        collaborators.pose_solver = Arc::new(OpenCvPoseSolver);
        collaborators
    }

    pub fn with_pose_solver(mut self, pose_solver: Arc<dyn PoseSolver>) -> Self {
        self.pose_solver = pose_solver;
        self
    }

    pub fn with_bundle_adjuster(mut self, bundle_adjuster: Arc<dyn BundleAdjuster>) -> Self {
        self.bundle_adjuster = bundle_adjuster;
        self
    }

    pub fn camera(&self) -> &dyn Camera {
        self.camera.as_ref()
    }
}
