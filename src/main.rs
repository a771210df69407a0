use std::path::PathBuf;

use anyhow::{Context, Result};

use mono_vslam::io::{write_frame_statistics, write_trajectory, SceneConfig, SyntheticScene};
use mono_vslam::system::SlamSystem;
use mono_vslam::tracking::TrackerConfig;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let output_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("output"));
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let scene = SyntheticScene::new(SceneConfig {
        with_gravity: true,
        ..Default::default()
    });
    println!(
        "Synthetic scene: {} frames, {} landmarks visible in the first frame",
        scene.num_frames(),
        scene.visible(0).len()
    );

    let config = TrackerConfig {
        frame_statistics: true,
        ..Default::default()
    };
    let mut slam_system = SlamSystem::new(config, scene.collaborators())?;

    let mut trajectory = Vec::new();
    for frame in 0..scene.num_frames() {
        let pose = slam_system.handle_frame(scene.frame_input(frame))?;
        if let Some(pose) = pose {
            trajectory.push((frame, scene.timestamp(frame), pose.world_t_camera));
        }

        if frame % 25 == 0 {
            let map = slam_system.shared_state().map.read();
            println!(
                "Frame {}/{}: state={}, {} tracks, {} localized points, map version {}",
                frame,
                scene.num_frames(),
                slam_system.state(),
                map.points.num_tracks(),
                map.points.num_localized(),
                map.version()
            );
        }
    }

    println!(
        "Done! {} of {} frames have a pose",
        trajectory.len(),
        scene.num_frames()
    );

    let statistics_path = output_dir.join("frame_statistics.csv");
    write_frame_statistics(&statistics_path, slam_system.frame_statistics())?;
    let trajectory_path = output_dir.join("trajectory.csv");
    write_trajectory(&trajectory_path, &trajectory)?;
    println!(
        "Wrote {} and {}",
        statistics_path.display(),
        trajectory_path.display()
    );

    println!("{}", slam_system.performance_report());

    // Shutdown cleanly (joins the mapping thread)
    slam_system.shutdown();

    Ok(())
}
