//! CSV export of per-frame statistics and trajectories.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::geometry::SE3;
use crate::map::FrameIndex;
use crate::tracking::FrameStatistics;

/// One pose of a trajectory, one CSV row.
#[derive(Debug, Clone, Serialize)]
struct TrajectoryRow {
    frame_index: FrameIndex,
    timestamp: f64,
    tx: f64,
    ty: f64,
    tz: f64,
    qw: f64,
    qx: f64,
    qy: f64,
    qz: f64,
}

/// Write one row per frame, with a header; missing values are empty fields.
pub fn write_frame_statistics<P: AsRef<Path>>(path: P, statistics: &[FrameStatistics]) -> Result<()> {
    let path = path.as_ref();
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
    for row in statistics {
        writer
            .serialize(row)
            .with_context(|| format!("Failed to write frame {} statistics", row.frame_index))?;
    }
    writer.flush().with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Write camera poses (T_wc) as `frame_index,timestamp,tx,ty,tz,qw,qx,qy,qz` rows.
pub fn write_trajectory<P: AsRef<Path>>(path: P, poses: &[(FrameIndex, f64, SE3)]) -> Result<()> {
    let path = path.as_ref();
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
    for (frame_index, timestamp, pose) in poses {
        let (t, q) = (pose.translation, pose.rotation);
        writer.serialize(TrajectoryRow {
            frame_index: *frame_index,
            timestamp: *timestamp,
            tx: t.x,
            ty: t.y,
            tz: t.z,
            qw: q.w,
            qx: q.i,
            qy: q.j,
            qz: q.k,
        })?;
    }
    writer.flush().with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("mono_vslam_{}_{}.csv", name, std::process::id()))
    }

    #[test]
    fn test_statistics_rows_with_missing_pose() {
        let mut posed = FrameStatistics::new(1);
        posed.tracking_possible = 120;
        posed.tracking_actual = 110;
        posed.pose_correspondences = 90;
        posed.set_pose(&SE3::new(UnitQuaternion::identity(), Vector3::new(1.0, 2.0, 3.0)));
        let statistics = vec![FrameStatistics::new(0), posed];

        let path = temp_path("statistics");
        write_frame_statistics(&path, &statistics).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("frame_index,tracking_possible,tracking_actual,pose_correspondences"));
        assert!(lines[1].starts_with("0,0,0,0,,"));
        assert!(lines[2].starts_with("1,120,110,90,,0,1.0,2.0,3.0,1.0"));
    }

    #[test]
    fn test_trajectory_rows() {
        let path = temp_path("trajectory");
        let pose = SE3::new(UnitQuaternion::identity(), Vector3::new(0.5, 0.0, -1.0));
        write_trajectory(&path, &[(3, 0.1, pose)]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(text.lines().nth(1), Some("3,0.1,0.5,0.0,-1.0,1.0,0.0,0.0,0.0"));
    }

    #[test]
    fn test_unwritable_path_is_an_error() {
        let path = std::env::temp_dir().join("mono_vslam_missing_dir").join("out.csv");
        assert!(write_frame_statistics(path, &[]).is_err());
    }
}
