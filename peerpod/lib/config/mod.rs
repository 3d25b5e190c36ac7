//! Configuration types and defaults.

mod defaults;
mod network;
mod server;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use network::*;
pub use server::*;
