//! SO(3) helpers used by the error-state filter.
//!
//! Provides the skew-symmetric (hat) operator and the right Jacobian Jr(φ)
//! that propagates rotation error through the exponential map.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// SO(3) exponential map, returned as a unit quaternion.
///
/// `phi` is an axis-angle vector; the direction is the rotation axis and the
/// magnitude the angle in radians.
#[inline]
pub fn exp_so3(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// Computes the right Jacobian Jr(φ) of SO(3).
///
/// ```text
/// Jr(φ) = I - (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
///
/// For small angles (|φ| < ε):
/// ```text
/// Jr(φ) ≈ I - 0.5 [φ]×
/// ```
pub fn right_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * skew(phi);
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;
    let sin_theta = theta.sin();
    let cos_theta = theta.cos();

    let skew_phi = skew(phi);
    let skew_phi_sq = skew_phi * skew_phi;

    Matrix3::identity()
        - ((1.0 - cos_theta) / theta_sq) * skew_phi
        + ((theta - sin_theta) / theta_cu) * skew_phi_sq
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        let cross_direct = v.cross(&u);
        let cross_skew = skew(&v) * u;

        assert_relative_eq!(cross_direct, cross_skew, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let skew_v = skew(&v);

        assert_relative_eq!(skew_v, -skew_v.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_exp_so3_round_trip() {
        let phi = Vector3::new(0.1, -0.2, 0.3);
        let q = exp_so3(&phi);

        assert_relative_eq!(q.scaled_axis(), phi, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_so3_negative_angle_inverts() {
        let phi = Vector3::new(0.0, 0.0, 0.4);
        let forward = exp_so3(&phi);
        let backward = exp_so3(&-phi);

        let product = forward * backward;
        assert!(product.angle() < 1e-12);
    }

    #[test]
    fn test_right_jacobian_identity_at_zero() {
        let phi = Vector3::zeros();
        let jr = right_jacobian_so3(&phi);

        assert_relative_eq!(jr, Matrix3::identity(), epsilon = 1e-10);
    }

    #[test]
    fn test_right_jacobian_finite_difference() {
        // Jr maps tangent increments through Exp: Exp(φ + δ) ≈ Exp(φ) Exp(Jr δ)
        let phi = Vector3::new(0.2, -0.1, 0.3);
        let jr = right_jacobian_so3(&phi);
        let eps = 1e-7;

        for k in 0..3 {
            let mut delta = Vector3::zeros();
            delta[k] = eps;

            let lhs = exp_so3(&(phi + delta));
            let rhs = exp_so3(&phi) * exp_so3(&(jr * delta));
            let diff = lhs.inverse() * rhs;

            assert!(diff.angle() < 1e-9, "column {} mismatch: {}", k, diff.angle());
        }
    }
}
