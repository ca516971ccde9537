//! Raw inertial measurements.

use nalgebra::Vector3;

/// Single IMU measurement.
///
/// The specific force is raw sensor output; the processing core rescales it
/// so that the stationary magnitude matches gravity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp_s: f64,
    /// Angular velocity, rad/s.
    pub gyro: Vector3<f64>,
    /// Specific force, m/s².
    pub acc: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp_s: f64, gyro: Vector3<f64>, acc: Vector3<f64>) -> Self {
        Self {
            timestamp_s,
            gyro,
            acc,
        }
    }
}
