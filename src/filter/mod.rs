//! Error-state Kalman filtering on the 23-DOF navigation manifold.

pub mod eskf;
pub mod state;
pub mod types;

pub use eskf::{Eskf, FilterError, ImuInput, Measurement};
pub use state::{NavState, GRAVITY_M_S2};
pub use types::{Matrix12, Matrix23, Vector23};
