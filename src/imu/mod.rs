//! Inertial measurement handling: raw samples, stationary initialization,
//! sweep propagation and undistortion.

pub mod initializer;
pub mod process;
pub mod sample;

pub use initializer::{ImuInitializer, MAX_INIT_COUNT};
pub use process::{ImuProcessor, ProcessError, SweepOutcome};
pub use sample::ImuSample;
