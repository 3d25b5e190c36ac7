//! Command-line arguments of the `peerpod-adaptor` and `podvm-forwarder` binaries.

mod args;
mod styles;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::*;
pub use styles::*;
