//! Lie group and manifold utilities: SO(3) maps, gravity sphere chart.

pub mod s2;
pub mod so3;

pub use so3::{exp_so3, right_jacobian_so3, skew};
