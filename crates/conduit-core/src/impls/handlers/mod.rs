//! Builtin handlers.

pub mod creator;
pub mod math;
pub mod sample;

pub use self::creator::CreatorHandler;
pub use self::math::MathHandler;
pub use self::sample::SampleHandler;
