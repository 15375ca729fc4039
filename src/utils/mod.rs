//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod timer;
mod timerwheel;

pub use error::CheckpointdError;
pub use print::{logger_init, ME};
pub use timer::Timer;
pub use timerwheel::TimerWheel;
