#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

pub mod calibration;
pub mod composition;
pub mod distributions;
pub mod errors;
pub mod io;
pub(crate) mod math;
pub(crate) mod minimisation;
pub mod preparation;

pub use errors::{CalibrationError, Result};
