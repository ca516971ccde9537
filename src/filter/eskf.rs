//! Error-state iterated Kalman filter on the product manifold.
//!
//! Owns the navigation state and its 23×23 covariance. `predict` forward
//! propagates both through one IMU interval; `update_iterated` folds in a
//! measurement supplied by an external matcher as residual + Jacobian.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use thiserror::Error;

use super::state::{NavState, BA, BG, DOF, GRAV, POS, ROT, VEL};
use super::types::{Matrix12, Matrix23, Matrix23x12, Vector23};
use crate::geometry::{exp_so3, right_jacobian_so3, s2, skew};

/// Bias-corrected IMU reading driving one prediction interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImuInput {
    /// Specific force (m/s²), already rescaled to gravity units.
    pub acc: Vector3<f64>,
    /// Angular velocity (rad/s).
    pub gyro: Vector3<f64>,
}

/// Measurement handed to [`Eskf::update_iterated`] by the matcher.
#[derive(Debug, Clone)]
pub struct Measurement {
    /// Innovation `z = observed − predicted`, length m.
    pub residual: DVector<f64>,
    /// Jacobian of the prediction w.r.t. the error state, m×23.
    pub jacobian: DMatrix<f64>,
    /// Isotropic measurement noise variance.
    pub noise: f64,
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("state covariance is not invertible")]
    SingularCovariance,
    #[error("gain system is not invertible")]
    SingularGain,
    #[error("measurement jacobian is {rows}x{cols}, expected m x 23")]
    MeasurementShape { rows: usize, cols: usize },
}

/// Error-state Kalman filter over [`NavState`].
#[derive(Debug, Clone)]
pub struct Eskf {
    x: NavState,
    p: Matrix23,
}

impl Eskf {
    pub fn new() -> Self {
        Self {
            x: NavState::identity(),
            p: Matrix23::identity(),
        }
    }

    pub fn state(&self) -> &NavState {
        &self.x
    }

    pub fn set_state(&mut self, x: NavState) {
        self.x = x;
    }

    pub fn covariance(&self) -> &Matrix23 {
        &self.p
    }

    pub fn set_covariance(&mut self, p: Matrix23) {
        self.p = p;
    }

    /// Forward propagates state and covariance over `dt` seconds.
    ///
    /// The nominal state moves by midpoint kinematics:
    ///
    /// ```text
    /// p ← p + v·dt + ½·a_w·dt²      a_w = R·(â) + g
    /// v ← v + a_w·dt
    /// R ← R · Exp(ω̂·dt)
    /// ```
    ///
    /// with `ω̂ = gyro − bg` and `â = acc − ba`. The covariance follows the
    /// discrete error-state linearization `P ← F·P·Fᵀ + G·Q·Gᵀ·dt²`, where
    /// rotation error propagates through the right Jacobian of SO(3) and
    /// gravity error through the S² chart at the current direction.
    ///
    /// `dt` may be negative; the same formulas integrate backwards.
    pub fn predict(&mut self, dt: f64, q: &Matrix12, input: &ImuInput) {
        let omega = input.gyro - self.x.bg;
        let acc_body = input.acc - self.x.ba;

        let rot_mat = self.x.rot.to_rotation_matrix().into_inner();
        let acc_world = self.x.rot * acc_body + self.x.grav;

        let phi = omega * dt;
        let rot_inc = exp_so3(&phi);
        let jr = right_jacobian_so3(&phi);

        // Discrete state transition of the error state.
        let mut f = Matrix23::identity();
        f.fixed_view_mut::<3, 3>(POS, VEL)
            .copy_from(&(Matrix3::identity() * dt));
        f.fixed_view_mut::<3, 3>(ROT, ROT)
            .copy_from(&rot_inc.to_rotation_matrix().into_inner().transpose());
        f.fixed_view_mut::<3, 3>(ROT, BG).copy_from(&(-jr * dt));
        f.fixed_view_mut::<3, 3>(VEL, ROT)
            .copy_from(&(-rot_mat * skew(&acc_body) * dt));
        f.fixed_view_mut::<3, 3>(VEL, BA).copy_from(&(-rot_mat * dt));
        f.fixed_view_mut::<3, 2>(VEL, GRAV)
            .copy_from(&(s2::chart_jacobian(&self.x.grav) * dt));

        // Noise input Jacobian; the dt factor enters once through the dt²
        // scaling of G·Q·Gᵀ.
        let mut g = Matrix23x12::zeros();
        g.fixed_view_mut::<3, 3>(ROT, 0).copy_from(&(-jr));
        g.fixed_view_mut::<3, 3>(VEL, 3).copy_from(&(-rot_mat));
        g.fixed_view_mut::<3, 3>(BG, 6)
            .copy_from(&Matrix3::identity());
        g.fixed_view_mut::<3, 3>(BA, 9)
            .copy_from(&Matrix3::identity());

        // Nominal update. Bias means and extrinsics are random-walk
        // constants; gravity never moves in prediction.
        self.x.pos += self.x.vel * dt + 0.5 * acc_world * dt * dt;
        self.x.vel += acc_world * dt;
        self.x.rot *= rot_inc;

        self.p = f * self.p * f.transpose() + g * q * g.transpose() * (dt * dt);
        self.p = (self.p + self.p.transpose()) * 0.5;
    }

    /// Iterated on-manifold measurement update.
    ///
    /// `model` is evaluated at each iterate and returns the innovation,
    /// its Jacobian and the noise variance, or `None` once no valid
    /// measurement can be formed. Each Gauss-Newton step solves
    ///
    /// ```text
    /// K = (Hᵀ·H/r + P⁻¹)⁻¹ · Hᵀ/r
    /// δ = K·z − (I − K·H)·(x ⊟ x₀)
    /// ```
    ///
    /// and retracts `x ⊞ δ`. On convergence the covariance contracts to
    /// `(I − K·H)·P`.
    pub fn update_iterated<F>(
        &mut self,
        max_iters: usize,
        epsilon: f64,
        mut model: F,
    ) -> Result<(), FilterError>
    where
        F: FnMut(&NavState) -> Option<Measurement>,
    {
        let x_prior = self.x.clone();
        let p_prior = DMatrix::from_iterator(DOF, DOF, self.p.iter().cloned());
        let p_inv = p_prior
            .clone()
            .try_inverse()
            .ok_or(FilterError::SingularCovariance)?;

        let mut final_gain: Option<(DMatrix<f64>, DMatrix<f64>)> = None;

        for _ in 0..max_iters {
            let Some(meas) = model(&self.x) else { break };

            let h = meas.jacobian;
            if h.ncols() != DOF || h.nrows() != meas.residual.len() {
                return Err(FilterError::MeasurementShape {
                    rows: h.nrows(),
                    cols: h.ncols(),
                });
            }

            let r_inv = 1.0 / meas.noise;
            let gain_sys = h.transpose() * &h * r_inv + &p_inv;
            let gain_sys_inv = gain_sys.try_inverse().ok_or(FilterError::SingularGain)?;
            let k = gain_sys_inv * h.transpose() * r_inv;

            let dx_prior = self.x.boxminus(&x_prior);
            let dx_prior = DVector::from_column_slice(dx_prior.as_slice());
            let correction =
                &k * &meas.residual - (DMatrix::identity(DOF, DOF) - &k * &h) * dx_prior;

            let delta = Vector23::from_iterator(correction.iter().cloned());
            self.x.boxplus(&delta);

            let converged = delta.norm() < epsilon;
            final_gain = Some((k, h));
            if converged {
                break;
            }
        }

        if let Some((k, h)) = final_gain {
            let contracted = (DMatrix::identity(DOF, DOF) - k * h) * p_prior;
            self.p = Matrix23::from_iterator(contracted.iter().cloned());
            self.p = (self.p + self.p.transpose()) * 0.5;
        }

        Ok(())
    }
}

impl Default for Eskf {
    fn default() -> Self {
        Self::new()
    }
}
