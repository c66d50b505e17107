//! Shared helpers

pub mod deterministic_rng;
pub mod device;

pub use deterministic_rng::Pcg32;
pub use device::select_device;
