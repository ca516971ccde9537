//! Forward propagation and backward motion compensation over a LiDAR sweep.
//!
//! `ImuProcessor` interleaves the two sensor streams: every inter-IMU
//! interval inside the sweep drives one filter prediction and leaves behind a
//! pose waypoint; the backward pass then walks waypoints and points in
//! reverse, re-expressing each point in the LiDAR frame at sweep end.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use nalgebra::{Matrix4, Rotation3, UnitQuaternion, Vector3};
use thiserror::Error;
use tracing::warn;

use super::initializer::ImuInitializer;
use super::sample::ImuSample;
use crate::filter::state::GRAVITY_M_S2;
use crate::filter::{Eskf, ImuInput, Matrix12, NavState};
use crate::geometry::exp_so3;
use crate::sweep::{LidarPoint, MeasureGroup, PointCloud};

/// Pose snapshot recorded at each IMU sample inside the current sweep.
#[derive(Debug, Clone, Copy)]
struct PoseWaypoint {
    /// Seconds since sweep start.
    offset_time: f64,
    /// World-frame acceleration at this sample, gravity included.
    acc: Vector3<f64>,
    /// Bias-corrected body angular velocity.
    gyr: Vector3<f64>,
    vel: Vector3<f64>,
    pos: Vector3<f64>,
    rot: UnitQuaternion<f64>,
}

/// What a `process` call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Still accumulating the stationary window; no cloud this cycle.
    Initializing,
    /// No inertial samples to integrate; the cloud is passed through raw.
    Skipped,
    /// Forward propagation ran and the cloud was undistorted.
    Undistorted,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("malformed sweep window: begin {begin}, end {end}")]
    InvalidTimestamps { begin: f64, end: f64 },
    #[error("degenerate stationary window: mean specific force norm {norm:.3e}")]
    DegenerateInit { norm: f64 },
    #[error("covariance diverged during forward propagation")]
    DivergedCovariance,
}

/// IMU forward-propagation and LiDAR undistortion engine.
///
/// Drives an [`Eskf`] through the inertial samples of each
/// [`MeasureGroup`] and compensates the bundled points into the sweep-end
/// LiDAR frame. Configuration (extrinsics, noise scales) is applied once
/// before streaming; `process` is then called serially per sweep.
pub struct ImuProcessor {
    init: ImuInitializer,
    need_init: bool,

    extrinsic_rot: UnitQuaternion<f64>,
    extrinsic_trans: Vector3<f64>,

    cov_acc: Vector3<f64>,
    cov_gyr: Vector3<f64>,
    cov_acc_scale: Vector3<f64>,
    cov_gyr_scale: Vector3<f64>,
    cov_bias_acc: Vector3<f64>,
    cov_bias_gyr: Vector3<f64>,

    /// Norm of the stationary mean specific force; rescales raw
    /// accelerometer readings to gravity units.
    mean_acc_norm: f64,

    last_imu: Option<ImuSample>,
    last_lidar_end_time: f64,
    first_lidar_time: f64,
    angvel_last: Vector3<f64>,
    acc_s_last: Vector3<f64>,

    waypoints: Vec<PoseWaypoint>,

    debug_log_path: Option<PathBuf>,
    debug_log: Option<BufWriter<File>>,
}

impl ImuProcessor {
    pub fn new() -> Self {
        Self {
            init: ImuInitializer::new(),
            need_init: true,
            extrinsic_rot: UnitQuaternion::identity(),
            extrinsic_trans: Vector3::zeros(),
            cov_acc: Vector3::repeat(0.1),
            cov_gyr: Vector3::repeat(0.1),
            cov_acc_scale: Vector3::repeat(0.1),
            cov_gyr_scale: Vector3::repeat(0.1),
            cov_bias_acc: Vector3::repeat(1e-4),
            cov_bias_gyr: Vector3::repeat(1e-4),
            mean_acc_norm: GRAVITY_M_S2,
            last_imu: None,
            last_lidar_end_time: 0.0,
            first_lidar_time: 0.0,
            angvel_last: Vector3::zeros(),
            acc_s_last: Vector3::zeros(),
            waypoints: Vec::new(),
            debug_log_path: None,
            debug_log: None,
        }
    }

    /// Returns the processor to cold start; the next groups feed the
    /// initializer again. Configuration is retained.
    pub fn reset(&mut self) {
        self.init.reset();
        self.need_init = true;
        self.cov_acc = Vector3::repeat(0.1);
        self.cov_gyr = Vector3::repeat(0.1);
        self.mean_acc_norm = GRAVITY_M_S2;
        self.last_imu = None;
        self.last_lidar_end_time = 0.0;
        self.angvel_last = Vector3::zeros();
        self.acc_s_last = Vector3::zeros();
        self.waypoints.clear();
        self.debug_log = None;
    }

    pub fn is_initialized(&self) -> bool {
        !self.need_init
    }

    pub fn set_extrinsic(&mut self, transl: Vector3<f64>, rot: UnitQuaternion<f64>) {
        self.extrinsic_trans = transl;
        self.extrinsic_rot = rot;
    }

    pub fn set_extrinsic_translation(&mut self, transl: Vector3<f64>) {
        self.extrinsic_trans = transl;
        self.extrinsic_rot = UnitQuaternion::identity();
    }

    /// Extrinsic from a homogeneous LiDAR-to-IMU transform.
    pub fn set_extrinsic_matrix(&mut self, t: &Matrix4<f64>) {
        self.extrinsic_trans = t.fixed_view::<3, 1>(0, 3).into_owned();
        let rot = Rotation3::from_matrix_unchecked(t.fixed_view::<3, 3>(0, 0).into_owned());
        self.extrinsic_rot = UnitQuaternion::from_rotation_matrix(&rot);
    }

    pub fn set_gyr_cov(&mut self, scale: Vector3<f64>) {
        self.cov_gyr_scale = scale;
    }

    pub fn set_acc_cov(&mut self, scale: Vector3<f64>) {
        self.cov_acc_scale = scale;
    }

    pub fn set_gyr_bias_cov(&mut self, cov: Vector3<f64>) {
        self.cov_bias_gyr = cov;
    }

    pub fn set_acc_bias_cov(&mut self, cov: Vector3<f64>) {
        self.cov_bias_acc = cov;
    }

    /// Requests a per-sample log of `(t, ω̄, ā)` triples, opened once
    /// initialization completes.
    pub fn set_debug_log<P: AsRef<Path>>(&mut self, path: P) {
        self.debug_log_path = Some(path.as_ref().to_path_buf());
    }

    /// Processes one measurement group.
    ///
    /// Until the stationary window completes this feeds the initializer and
    /// produces no cloud. Afterwards each call forward-propagates the filter
    /// to `lidar_end_time`, rewrites `cloud` with the undistorted points and
    /// leaves the posterior in `kf` for the downstream matcher.
    ///
    /// Calls must be monotone in `lidar_beg_time`.
    pub fn process(
        &mut self,
        meas: &MeasureGroup,
        kf: &mut Eskf,
        cloud: &mut PointCloud,
    ) -> Result<SweepOutcome, ProcessError> {
        if !meas.lidar_beg_time.is_finite()
            || !meas.lidar_end_time.is_finite()
            || meas.lidar_end_time < meas.lidar_beg_time
        {
            return Err(ProcessError::InvalidTimestamps {
                begin: meas.lidar_beg_time,
                end: meas.lidar_end_time,
            });
        }

        if meas.imu.is_empty() {
            // Nothing to integrate; hand the sweep back untouched.
            if !self.need_init {
                cloud.clear();
                cloud.extend_from_slice(&meas.points);
            }
            return Ok(SweepOutcome::Skipped);
        }

        if self.need_init {
            if self.last_imu.is_none() {
                self.first_lidar_time = meas.lidar_beg_time;
            }

            self.init.feed(meas);
            self.last_imu = meas.imu.back().copied();

            if self.init.is_degenerate() {
                let norm = self.init.mean_acc_norm();
                warn!(norm, "stationary window degenerate, restarting accumulation");
                self.init.reset();
                return Err(ProcessError::DegenerateInit { norm });
            }

            if self.init.complete() {
                // One-time rescale to gravity units, immediately superseded
                // by the configured scales.
                let gravity_ratio = GRAVITY_M_S2 / self.init.mean_acc_norm();
                self.cov_acc = self.init.cov_acc() * gravity_ratio * gravity_ratio;
                self.cov_acc = self.cov_acc_scale;
                self.cov_gyr = self.cov_gyr_scale;

                self.mean_acc_norm = self.init.mean_acc_norm();
                self.init.seed(kf, self.extrinsic_rot, self.extrinsic_trans);
                self.need_init = false;
                self.last_lidar_end_time = meas.lidar_end_time;
                self.open_debug_log();
            }

            return Ok(SweepOutcome::Initializing);
        }

        self.undistort(meas, kf, cloud)?;
        Ok(SweepOutcome::Undistorted)
    }

    /// Forward pass over the inertial series, then backward compensation of
    /// every point into the sweep-end LiDAR frame.
    fn undistort(
        &mut self,
        meas: &MeasureGroup,
        kf: &mut Eskf,
        cloud: &mut PointCloud,
    ) -> Result<(), ProcessError> {
        // Stitch the retained tail of the previous group onto the current
        // series so integration restarts where the last sweep ended.
        let mut series: Vec<ImuSample> = Vec::with_capacity(meas.imu.len() + 1);
        if let Some(last) = self.last_imu {
            series.push(last);
        }
        series.extend(meas.imu.iter().copied());

        let pcl_beg_time = meas.lidar_beg_time;
        let pcl_end_time = meas.lidar_end_time;
        let imu_end_time = series[series.len() - 1].timestamp_s;

        cloud.clear();
        cloud.extend_from_slice(&meas.points);
        cloud.sort_by(|a, b| a.offset_ms.total_cmp(&b.offset_ms));

        // Leading waypoint: the posterior at sweep start, with the rates
        // carried over from the previous sweep's tail.
        let state = kf.state().clone();
        self.waypoints.clear();
        self.waypoints.push(PoseWaypoint {
            offset_time: 0.0,
            acc: self.acc_s_last,
            gyr: self.angvel_last,
            vel: state.vel,
            pos: state.pos,
            rot: state.rot,
        });

        let q = self.process_noise();
        let mut input = ImuInput::default();

        for pair in series.windows(2) {
            let head = &pair[0];
            let tail = &pair[1];

            // Samples wholly before the previous sweep end are stale.
            if tail.timestamp_s < self.last_lidar_end_time {
                continue;
            }

            let angvel_avr = 0.5 * (head.gyro + tail.gyro);
            let acc_avr = 0.5 * (head.acc + tail.acc) * (GRAVITY_M_S2 / self.mean_acc_norm);

            // The retained head straddles the sweep boundary once per group;
            // integration then starts at the previous sweep end.
            let dt = if head.timestamp_s < self.last_lidar_end_time {
                tail.timestamp_s - self.last_lidar_end_time
            } else {
                tail.timestamp_s - head.timestamp_s
            };

            self.log_debug_sample(head.timestamp_s, &angvel_avr, &acc_avr);

            input.acc = acc_avr;
            input.gyro = angvel_avr;
            kf.predict(dt, &q, &input);

            let state = kf.state().clone();
            self.angvel_last = angvel_avr - state.bg;
            self.acc_s_last = state.rot * (acc_avr - state.ba) + state.grav;

            self.waypoints.push(PoseWaypoint {
                offset_time: tail.timestamp_s - pcl_beg_time,
                acc: self.acc_s_last,
                gyr: self.angvel_last,
                vel: state.vel,
                pos: state.pos,
                rot: state.rot,
            });
        }

        // Align the posterior with the sweep end; dt is negative when the
        // sweep ends before the last sample.
        let dt_end = pcl_end_time - imu_end_time;
        kf.predict(dt_end, &q, &input);

        if kf.covariance().iter().any(|v| !v.is_finite()) {
            warn!("covariance left finite range, returning to cold start");
            self.reset();
            return Err(ProcessError::DivergedCovariance);
        }

        self.last_imu = meas.imu.back().copied();
        self.last_lidar_end_time = pcl_end_time;

        self.compensate_cloud(kf.state(), cloud);
        Ok(())
    }

    /// Backward pass: walks waypoints newest to oldest, compensating every
    /// point whose offset falls inside the bracket.
    fn compensate_cloud(&self, end: &NavState, cloud: &mut PointCloud) {
        if cloud.is_empty() || self.waypoints.is_empty() {
            return;
        }

        let mut cursor = cloud.len();

        // Points stamped after the last sample extrapolate from the final
        // waypoint.
        let newest = self.waypoints[self.waypoints.len() - 1];
        while cursor > 0 && cloud[cursor - 1].offset_seconds() > newest.offset_time {
            compensate_point(&mut cloud[cursor - 1], &newest, &newest.gyr, &newest.acc, end);
            cursor -= 1;
        }

        for k in (1..self.waypoints.len()).rev() {
            let head = self.waypoints[k - 1];
            let tail = self.waypoints[k];
            let oldest_bracket = k == 1;

            while cursor > 0 {
                let offset = cloud[cursor - 1].offset_seconds();
                // The bracket owns (head, tail]; the oldest one also owns
                // its left boundary so an offset-zero point is compensated
                // from the leading waypoint.
                if offset <= head.offset_time && !oldest_bracket {
                    break;
                }
                compensate_point(&mut cloud[cursor - 1], &head, &tail.gyr, &tail.acc, end);
                cursor -= 1;
            }

            if cursor == 0 {
                return;
            }
        }

        // Only reachable when a sweep produced no prediction interval.
        let oldest = self.waypoints[0];
        while cursor > 0 {
            compensate_point(&mut cloud[cursor - 1], &oldest, &oldest.gyr, &oldest.acc, end);
            cursor -= 1;
        }
    }

    fn process_noise(&self) -> Matrix12 {
        let mut q = Matrix12::zeros();
        for i in 0..3 {
            q[(i, i)] = self.cov_gyr[i];
            q[(3 + i, 3 + i)] = self.cov_acc[i];
            q[(6 + i, 6 + i)] = self.cov_bias_gyr[i];
            q[(9 + i, 9 + i)] = self.cov_bias_acc[i];
        }
        q
    }

    fn open_debug_log(&mut self) {
        let Some(path) = &self.debug_log_path else {
            return;
        };
        match File::create(path) {
            Ok(file) => self.debug_log = Some(BufWriter::new(file)),
            Err(err) => warn!(path = %path.display(), %err, "could not open IMU debug log"),
        }
    }

    fn log_debug_sample(&mut self, t: f64, angvel: &Vector3<f64>, acc: &Vector3<f64>) {
        let Some(writer) = &mut self.debug_log else {
            return;
        };
        let wrote = writeln!(
            writer,
            "{:.9} {} {} {} {} {} {}",
            t - self.first_lidar_time,
            angvel.x,
            angvel.y,
            angvel.z,
            acc.x,
            acc.y,
            acc.z,
        );
        if wrote.is_err() {
            warn!("IMU debug log write failed, disabling");
            self.debug_log = None;
        }
    }
}

impl Default for ImuProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Rigidly re-expresses one point in the sweep-end LiDAR frame.
///
/// The pose at point time comes from the bracket head plus a constant-rate
/// extrapolation with the bracket tail's angular velocity and acceleration.
fn compensate_point(
    point: &mut LidarPoint,
    head: &PoseWaypoint,
    gyr: &Vector3<f64>,
    acc: &Vector3<f64>,
    end: &NavState,
) {
    let dt = point.offset_seconds() - head.offset_time;

    let rot_i = head.rot * exp_so3(&(gyr * dt));
    let pos_i = head.pos + head.vel * dt + 0.5 * acc * dt * dt;

    let p_lidar = point.position();
    let p_world = rot_i * (end.offset_r_l_i * p_lidar + end.offset_t_l_i) + pos_i;
    let p_end_imu = end.rot.inverse() * (p_world - end.pos);
    let p_end_lidar = end.offset_r_l_i.inverse() * (p_end_imu - end.offset_t_l_i);

    point.set_position(&p_end_lidar);
}
