//! Type aliases for the 23-DOF error state.
//!
//! The tangent layout is [δp, δθ, δθ_LI, δt_LI, δv, δbg, δba, δg] with the
//! gravity direction contributing two degrees of freedom.

use nalgebra::{SMatrix, SVector};

/// 23-dimensional error-state vector.
pub type Vector23 = SVector<f64, 23>;

/// 23×23 state covariance.
pub type Matrix23 = SMatrix<f64, 23, 23>;

/// 12×12 process noise covariance [n_g, n_a, n_bg, n_ba].
pub type Matrix12 = SMatrix<f64, 12, 12>;

/// 23×12 noise input Jacobian.
pub type Matrix23x12 = SMatrix<f64, 23, 12>;
