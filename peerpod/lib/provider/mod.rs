//! The IaaS backends pod VMs are provisioned from.
//!
//! Providers implement [`Provider`] and are looked up by name in a [`ProviderRegistry`]. The
//! built-in [`PoolProvider`] hands out pre-provisioned machines.

mod implementations;
mod instance_type;
mod registry;
mod traits;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use implementations::*;
pub use instance_type::*;
pub use registry::*;
pub use traits::*;
pub use types::*;
