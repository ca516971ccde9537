//! Navigation state on the product manifold SO(3) × S² × ℝⁿ.

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use super::types::Vector23;
use crate::geometry::{exp_so3, s2};

/// Gravity magnitude (m/s²). The gravity state keeps this norm for life.
pub const GRAVITY_M_S2: f64 = 9.81;

/// Tangent-space offsets of each state block. Contractual: covariance rows
/// and columns are indexed with these.
pub const POS: usize = 0;
pub const ROT: usize = 3;
pub const EXT_ROT: usize = 6;
pub const EXT_POS: usize = 9;
pub const VEL: usize = 12;
pub const BG: usize = 15;
pub const BA: usize = 18;
pub const GRAV: usize = 21;

/// Total error-state dimension.
pub const DOF: usize = 23;

/// Full navigation state estimated by the filter.
///
/// Rotations are kept as unit quaternions; `grav` is a point on the sphere
/// of radius [`GRAVITY_M_S2`] and is perturbed through the S² chart rather
/// than as a free ℝ³ vector.
#[derive(Debug, Clone, PartialEq)]
pub struct NavState {
    /// IMU position in the world frame.
    pub pos: Vector3<f64>,
    /// IMU-to-world rotation.
    pub rot: UnitQuaternion<f64>,
    /// LiDAR-to-IMU rotation extrinsic.
    pub offset_r_l_i: UnitQuaternion<f64>,
    /// LiDAR origin expressed in the IMU frame.
    pub offset_t_l_i: Vector3<f64>,
    /// Linear velocity in the world frame.
    pub vel: Vector3<f64>,
    /// Gyroscope bias.
    pub bg: Vector3<f64>,
    /// Accelerometer bias.
    pub ba: Vector3<f64>,
    /// Gravity vector, world frame, norm pinned at [`GRAVITY_M_S2`].
    pub grav: Vector3<f64>,
}

impl NavState {
    /// Identity pose at rest, gravity pointing down the world z axis.
    pub fn identity() -> Self {
        Self {
            pos: Vector3::zeros(),
            rot: UnitQuaternion::identity(),
            offset_r_l_i: UnitQuaternion::identity(),
            offset_t_l_i: Vector3::zeros(),
            vel: Vector3::zeros(),
            bg: Vector3::zeros(),
            ba: Vector3::zeros(),
            grav: Vector3::new(0.0, 0.0, -GRAVITY_M_S2),
        }
    }

    /// Applies a tangent increment in place.
    ///
    /// Euclidean blocks add; rotations compose on the right with the SO(3)
    /// exponential; gravity moves along its sphere.
    pub fn boxplus(&mut self, delta: &Vector23) {
        self.pos += delta.fixed_rows::<3>(POS).into_owned();
        self.rot *= exp_so3(&delta.fixed_rows::<3>(ROT).into_owned());
        self.offset_r_l_i *= exp_so3(&delta.fixed_rows::<3>(EXT_ROT).into_owned());
        self.offset_t_l_i += delta.fixed_rows::<3>(EXT_POS).into_owned();
        self.vel += delta.fixed_rows::<3>(VEL).into_owned();
        self.bg += delta.fixed_rows::<3>(BG).into_owned();
        self.ba += delta.fixed_rows::<3>(BA).into_owned();

        let grav_delta = Vector2::new(delta[GRAV], delta[GRAV + 1]);
        self.grav = s2::boxplus(&self.grav, &grav_delta);
    }

    /// Extracts the tangent increment `δ` with `other ⊞ δ = self`.
    pub fn boxminus(&self, other: &NavState) -> Vector23 {
        let mut delta = Vector23::zeros();

        delta
            .fixed_rows_mut::<3>(POS)
            .copy_from(&(self.pos - other.pos));
        delta
            .fixed_rows_mut::<3>(ROT)
            .copy_from(&(other.rot.inverse() * self.rot).scaled_axis());
        delta
            .fixed_rows_mut::<3>(EXT_ROT)
            .copy_from(&(other.offset_r_l_i.inverse() * self.offset_r_l_i).scaled_axis());
        delta
            .fixed_rows_mut::<3>(EXT_POS)
            .copy_from(&(self.offset_t_l_i - other.offset_t_l_i));
        delta
            .fixed_rows_mut::<3>(VEL)
            .copy_from(&(self.vel - other.vel));
        delta.fixed_rows_mut::<3>(BG).copy_from(&(self.bg - other.bg));
        delta.fixed_rows_mut::<3>(BA).copy_from(&(self.ba - other.ba));

        let grav_delta = s2::boxminus(&self.grav, &other.grav);
        delta[GRAV] = grav_delta[0];
        delta[GRAV + 1] = grav_delta[1];

        delta
    }
}

impl Default for NavState {
    fn default() -> Self {
        Self::identity()
    }
}
