//! Geometry utilities: SE3 transforms, camera model, pose and point solvers.

pub mod camera;
pub mod gravity;
#[cfg(feature = "opencv")]
pub mod pnp;
pub mod pose_solver;
pub mod ransac;
pub mod se3;
pub mod triangulation;
pub mod two_view;

pub use camera::{Camera, PinholeCamera};
pub use gravity::GravityConstraint;
#[cfg(feature = "opencv")]
pub use pnp::OpenCvPoseSolver;
pub use pose_solver::{DltPoseSolver, PoseEstimate, PoseParams, PoseSolver};
pub use se3::SE3;
pub use triangulation::{PointEstimate, PointRansacParams, PointTriangulator, RansacPointTriangulator};
pub use two_view::{EssentialTwoViewSolver, TwoViewGravity, TwoViewParams, TwoViewResult, TwoViewSolver};
