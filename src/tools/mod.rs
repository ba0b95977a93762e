//! Generic helpers

mod command;
pub use command::*;
