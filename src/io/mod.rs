//! Input and output around the tracker: a synthetic scene for demos and tests,
//! and CSV export of per-frame statistics.

pub mod export;
pub mod synthetic;

pub use export::{write_frame_statistics, write_trajectory};
pub use synthetic::{SceneConfig, SyntheticScene};
