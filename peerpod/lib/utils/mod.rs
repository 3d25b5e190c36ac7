//! Utility functions and types.

mod digest;
mod path;
mod retry;
mod signal;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use digest::*;
pub use path::*;
pub use retry::*;
pub use signal::*;
