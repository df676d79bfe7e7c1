pub mod fixed;
pub mod rng;
pub mod trig;

pub use fixed::Fixed;
pub use rng::DeterministicRng;
