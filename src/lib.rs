pub mod geometry;
pub mod io;
pub mod map;
pub mod mapping;
pub mod optimizer;
pub mod system;
pub mod tracking;
pub mod vision;
