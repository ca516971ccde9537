use std::collections::VecDeque;

use anyhow::Result;
use nalgebra::{UnitQuaternion, Vector3};
use tracing::info;

use rust_lio::filter::{Eskf, GRAVITY_M_S2};
use rust_lio::imu::{ImuProcessor, ImuSample, SweepOutcome};
use rust_lio::sweep::{LidarPoint, MeasureGroup, PointCloud};

/// Synthetic end-to-end run: a stationary window to initialize, then a
/// yawing sweep whose points get compensated into the sweep-end frame.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut processor = ImuProcessor::new();
    let mut kf = Eskf::new();
    processor.set_extrinsic(Vector3::zeros(), UnitQuaternion::identity());
    processor.set_acc_cov(Vector3::repeat(0.1));
    processor.set_gyr_cov(Vector3::repeat(0.1));
    processor.set_acc_bias_cov(Vector3::repeat(1e-4));
    processor.set_gyr_bias_cov(Vector3::repeat(1e-4));

    // Stationary warm-up at 100 Hz.
    let warmup = MeasureGroup {
        lidar_beg_time: 0.0,
        lidar_end_time: 0.11,
        points: Vec::new(),
        imu: (0..12)
            .map(|i| {
                ImuSample::new(
                    i as f64 * 0.01,
                    Vector3::zeros(),
                    Vector3::new(0.0, 0.0, GRAVITY_M_S2),
                )
            })
            .collect::<VecDeque<_>>(),
    };

    let mut cloud = PointCloud::new();
    let outcome = processor.process(&warmup, &mut kf, &mut cloud)?;
    info!(?outcome, grav = ?kf.state().grav, "warm-up processed");

    // One 0.1 s sweep yawing at 1 rad/s, points spread across the sweep.
    let sweep = MeasureGroup {
        lidar_beg_time: 0.11,
        lidar_end_time: 0.21,
        points: (0..10)
            .map(|i| LidarPoint::new(1.0, 0.0, 0.0, i as f32 * 10.0))
            .collect(),
        imu: (0..10)
            .map(|i| {
                ImuSample::new(
                    0.11 + i as f64 * 0.01,
                    Vector3::new(0.0, 0.0, 1.0),
                    Vector3::new(0.0, 0.0, GRAVITY_M_S2),
                )
            })
            .collect::<VecDeque<_>>(),
    };

    let outcome = processor.process(&sweep, &mut kf, &mut cloud)?;
    assert_eq!(outcome, SweepOutcome::Undistorted);

    let state = kf.state();
    info!(
        yaw_rad = state.rot.angle(),
        pos = ?state.pos,
        "sweep propagated"
    );
    for (i, point) in cloud.iter().enumerate() {
        info!(
            i,
            x = point.x,
            y = point.y,
            z = point.z,
            offset_ms = point.offset_ms,
            "compensated point"
        );
    }

    Ok(())
}
