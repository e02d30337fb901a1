//! Process-level helpers of the transfer programs.

mod signal;
mod timing;

pub use self::signal::Interrupt;
pub use self::timing::{RunStats, RunTimer};
