//! Stationary-window IMU initialization.
//!
//! Accumulates the first few samples of a motionless sensor to estimate the
//! gravity direction, the gyro bias and the measurement noise floor, then
//! seeds the filter posterior once.

use nalgebra::{UnitQuaternion, Vector3};
use tracing::info;

use crate::filter::state::{BA, BG, EXT_POS, EXT_ROT, GRAV, GRAVITY_M_S2};
use crate::filter::{Eskf, Matrix23};
use crate::sweep::MeasureGroup;

/// Number of samples after which initialization completes.
pub const MAX_INIT_COUNT: usize = 10;

/// Running estimate of the stationary IMU statistics.
///
/// Mean and diagonal sample variance follow Welford's online recursion:
///
/// ```text
/// μ_N = μ_{N-1} + (x_N − μ_{N-1}) / N
/// σ²_N = σ²_{N-1}·(N−1)/N + (x_N − μ_N)∘(x_N − μ_N)·(N−1)/N²
/// ```
#[derive(Debug, Clone)]
pub struct ImuInitializer {
    count: usize,
    started: bool,
    mean_acc: Vector3<f64>,
    mean_gyr: Vector3<f64>,
    cov_acc: Vector3<f64>,
    cov_gyr: Vector3<f64>,
}

impl ImuInitializer {
    pub fn new() -> Self {
        Self {
            count: 1,
            started: false,
            mean_acc: Vector3::new(0.0, 0.0, -1.0),
            mean_gyr: Vector3::zeros(),
            cov_acc: Vector3::zeros(),
            cov_gyr: Vector3::zeros(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Folds one measurement group into the running statistics.
    pub fn feed(&mut self, meas: &MeasureGroup) {
        let Some(first) = meas.imu.front() else {
            return;
        };

        if !self.started {
            self.started = true;
            self.count = 1;
            self.mean_acc = first.acc;
            self.mean_gyr = first.gyro;
            self.cov_acc = Vector3::zeros();
            self.cov_gyr = Vector3::zeros();
        }

        for sample in &meas.imu {
            let n = self.count as f64;

            self.mean_acc += (sample.acc - self.mean_acc) / n;
            self.mean_gyr += (sample.gyro - self.mean_gyr) / n;

            let acc_dev = sample.acc - self.mean_acc;
            let gyr_dev = sample.gyro - self.mean_gyr;
            self.cov_acc =
                self.cov_acc * (n - 1.0) / n + acc_dev.component_mul(&acc_dev) * (n - 1.0) / (n * n);
            self.cov_gyr =
                self.cov_gyr * (n - 1.0) / n + gyr_dev.component_mul(&gyr_dev) * (n - 1.0) / (n * n);

            self.count += 1;
        }
    }

    /// True once the sample counter has crossed [`MAX_INIT_COUNT`].
    pub fn complete(&self) -> bool {
        self.count > MAX_INIT_COUNT
    }

    /// The stationary mean specific force is unusable for gravity alignment
    /// when its magnitude collapses.
    pub fn is_degenerate(&self) -> bool {
        self.mean_acc.norm() < 1e-6
    }

    pub fn mean_acc_norm(&self) -> f64 {
        self.mean_acc.norm()
    }

    pub fn cov_acc(&self) -> Vector3<f64> {
        self.cov_acc
    }

    pub fn cov_gyr(&self) -> Vector3<f64> {
        self.cov_gyr
    }

    /// Seeds the filter posterior from the accumulated statistics.
    ///
    /// Gravity points opposite to the mean specific force with its magnitude
    /// pinned; the mean angular rate becomes the gyro bias. The covariance
    /// starts at identity with tightened extrinsic, bias and gravity blocks.
    pub fn seed(
        &self,
        kf: &mut Eskf,
        extrinsic_rot: UnitQuaternion<f64>,
        extrinsic_trans: Vector3<f64>,
    ) {
        let mut x = kf.state().clone();
        x.grav = -self.mean_acc / self.mean_acc.norm() * GRAVITY_M_S2;
        x.bg = self.mean_gyr;
        x.ba = Vector3::zeros();
        x.offset_r_l_i = extrinsic_rot;
        x.offset_t_l_i = extrinsic_trans;
        kf.set_state(x);

        let mut p = Matrix23::identity();
        for i in 0..3 {
            p[(EXT_ROT + i, EXT_ROT + i)] = 1e-5;
            p[(EXT_POS + i, EXT_POS + i)] = 1e-5;
            p[(BG + i, BG + i)] = 1e-4;
            p[(BA + i, BA + i)] = 1e-3;
        }
        p[(GRAV, GRAV)] = 1e-5;
        p[(GRAV + 1, GRAV + 1)] = 1e-5;
        kf.set_covariance(p);

        info!(
            samples = self.count - 1,
            acc_norm = self.mean_acc.norm(),
            "IMU initialization done"
        );
    }
}

impl Default for ImuInitializer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::VecDeque;

    use crate::imu::ImuSample;

    fn stationary_group(n: usize, acc: Vector3<f64>, gyro: Vector3<f64>) -> MeasureGroup {
        let imu: VecDeque<ImuSample> = (0..n)
            .map(|i| ImuSample::new(i as f64 * 0.01, gyro, acc))
            .collect();
        MeasureGroup {
            lidar_beg_time: 0.0,
            lidar_end_time: (n - 1) as f64 * 0.01,
            points: Vec::new(),
            imu,
        }
    }

    #[test]
    fn test_stationary_window_estimates_gravity_and_bias() {
        let mut init = ImuInitializer::new();
        let bias = Vector3::new(0.01, -0.02, 0.005);
        init.feed(&stationary_group(12, Vector3::new(0.0, 0.0, 9.81), bias));

        assert!(init.complete());
        assert!(!init.is_degenerate());
        assert_relative_eq!(init.mean_acc_norm(), 9.81, epsilon = 1e-9);

        let mut kf = Eskf::new();
        init.seed(&mut kf, UnitQuaternion::identity(), Vector3::zeros());

        let state = kf.state();
        assert_relative_eq!(state.grav, Vector3::new(0.0, 0.0, -9.81), epsilon = 1e-9);
        assert_relative_eq!(state.bg, bias, epsilon = 1e-12);
        assert_relative_eq!(state.ba, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(state.grav.norm(), GRAVITY_M_S2, epsilon = 1e-6);
    }

    #[test]
    fn test_seeded_covariance_pattern() {
        let mut init = ImuInitializer::new();
        init.feed(&stationary_group(12, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()));

        let mut kf = Eskf::new();
        init.seed(&mut kf, UnitQuaternion::identity(), Vector3::zeros());

        let p = kf.covariance();
        assert_relative_eq!(p[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(p[(EXT_ROT, EXT_ROT)], 1e-5, epsilon = 1e-15);
        assert_relative_eq!(p[(EXT_POS, EXT_POS)], 1e-5, epsilon = 1e-15);
        assert_relative_eq!(p[(BG, BG)], 1e-4, epsilon = 1e-15);
        assert_relative_eq!(p[(BA, BA)], 1e-3, epsilon = 1e-15);
        assert_relative_eq!(p[(GRAV, GRAV)], 1e-5, epsilon = 1e-15);
    }

    #[test]
    fn test_identical_inputs_seed_identically() {
        let group = stationary_group(12, Vector3::new(0.1, 0.0, 9.8), Vector3::new(0.0, 0.01, 0.0));

        let run = |group: &MeasureGroup| {
            let mut init = ImuInitializer::new();
            init.feed(group);
            let mut kf = Eskf::new();
            init.seed(&mut kf, UnitQuaternion::identity(), Vector3::zeros());
            (kf.state().clone(), *kf.covariance())
        };

        let (x1, p1) = run(&group);
        let (x2, p2) = run(&group);

        assert_eq!(x1, x2);
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_noise_accumulates_sample_variance() {
        let mut init = ImuInitializer::new();
        let mut imu = VecDeque::new();
        for i in 0..20 {
            let wobble = if i % 2 == 0 { 0.01 } else { -0.01 };
            imu.push_back(ImuSample::new(
                i as f64 * 0.01,
                Vector3::zeros(),
                Vector3::new(wobble, 0.0, 9.81),
            ));
        }
        init.feed(&MeasureGroup {
            lidar_beg_time: 0.0,
            lidar_end_time: 0.19,
            points: Vec::new(),
            imu,
        });

        assert!(init.cov_acc().x > 0.0);
        assert!(init.cov_acc().y.abs() < 1e-12);
    }

    #[test]
    fn test_zero_specific_force_is_degenerate() {
        let mut init = ImuInitializer::new();
        init.feed(&stationary_group(12, Vector3::zeros(), Vector3::zeros()));

        assert!(init.is_degenerate());
    }
}
