//! Local chart for the gravity direction on the 2-sphere.
//!
//! The gravity vector is a 2-DOF quantity with fixed magnitude: perturbing
//! it must slide along the sphere, not stretch it. Increments live in the
//! tangent plane at the current point and are applied by rotating the
//! vector, so the norm is preserved exactly.

use nalgebra::{SMatrix, Vector2, Vector3};

use super::so3::{exp_so3, skew};

/// Orthonormal basis of the tangent plane at `g` (columns ⟂ g).
///
/// `g` must be non-zero; its magnitude is irrelevant.
pub fn tangent_basis(g: &Vector3<f64>) -> SMatrix<f64, 3, 2> {
    let u = g.normalize();

    // Reference axis least aligned with u keeps the cross product well
    // conditioned.
    let reference = if u.x.abs() < 0.707 {
        Vector3::x()
    } else {
        Vector3::y()
    };

    let b1 = u.cross(&reference).normalize();
    let b2 = u.cross(&b1);

    SMatrix::<f64, 3, 2>::from_columns(&[b1, b2])
}

/// Applies a tangent increment: `g ⊞ δ = Exp(B(g)·δ) · g`.
pub fn boxplus(g: &Vector3<f64>, delta: &Vector2<f64>) -> Vector3<f64> {
    let phi = tangent_basis(g) * delta;
    exp_so3(&phi) * g
}

/// Extracts the tangent increment `δ` such that `b ⊞ δ = a`.
///
/// Both vectors must share the same magnitude; only the direction enters.
pub fn boxminus(a: &Vector3<f64>, b: &Vector3<f64>) -> Vector2<f64> {
    let ua = a.normalize();
    let ub = b.normalize();

    let axis = ub.cross(&ua);
    let sin_angle = axis.norm();
    let cos_angle = ub.dot(&ua);
    let basis = tangent_basis(b);

    if sin_angle < 1e-12 {
        if cos_angle > 0.0 {
            return Vector2::zeros();
        }
        // Antipodal: rotate half a turn about the first basis direction.
        return Vector2::new(std::f64::consts::PI, 0.0);
    }

    let phi = axis / sin_angle * sin_angle.atan2(cos_angle);
    basis.transpose() * phi
}

/// Jacobian of the chart at `δ = 0`: `d(g ⊞ δ)/dδ = −[g]×·B(g)` (3×2).
pub fn chart_jacobian(g: &Vector3<f64>) -> SMatrix<f64, 3, 2> {
    -skew(g) * tangent_basis(g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const G: f64 = 9.81;

    #[test]
    fn test_basis_orthonormal_and_tangent() {
        let g = Vector3::new(1.0, -2.0, 3.0).normalize() * G;
        let b = tangent_basis(&g);

        let c0 = b.column(0);
        let c1 = b.column(1);
        assert_relative_eq!(c0.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(c1.norm(), 1.0, epsilon = 1e-12);
        assert!(c0.dot(&c1).abs() < 1e-12);
        assert!(c0.dot(&g).abs() < 1e-10);
        assert!(c1.dot(&g).abs() < 1e-10);
    }

    #[test]
    fn test_boxplus_preserves_norm() {
        let g = Vector3::new(0.0, 0.0, -G);
        let perturbed = boxplus(&g, &Vector2::new(0.3, -0.7));

        assert_relative_eq!(perturbed.norm(), G, epsilon = 1e-9);
    }

    #[test]
    fn test_boxplus_boxminus_round_trip() {
        let g = Vector3::new(0.1, 0.2, -1.0).normalize() * G;
        let delta = Vector2::new(0.2, -0.4);

        let moved = boxplus(&g, &delta);
        let recovered = boxminus(&moved, &g);

        assert_relative_eq!(recovered, delta, epsilon = 1e-9);
    }

    #[test]
    fn test_boxminus_identical_is_zero() {
        let g = Vector3::new(0.0, 0.0, -G);
        assert_relative_eq!(boxminus(&g, &g), Vector2::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_chart_jacobian_finite_difference() {
        let g = Vector3::new(0.3, -0.1, -1.0).normalize() * G;
        let jac = chart_jacobian(&g);
        let eps = 1e-7;

        for k in 0..2 {
            let mut delta = Vector2::zeros();
            delta[k] = eps;

            let numeric = (boxplus(&g, &delta) - g) / eps;
            assert_relative_eq!(numeric, jac.column(k).into_owned(), epsilon = 1e-6);
        }
    }
}
