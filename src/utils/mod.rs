//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod context;
mod error;
mod hashing;
mod timer;

pub use context::{CancelCtx, CtxError};
pub use error::TailsimError;
pub use hashing::hash_strings;
pub use print::logger_init;
pub use timer::Timer;
