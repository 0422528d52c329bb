//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod lock;
mod timer;

pub use error::ClusterBenchError;
pub use print::logger_init;
pub use timer::Timer;

pub(crate) use lock::lock;
