//! The agent protocol forwarder running inside each pod VM.
//!
//! At boot the forwarder reads the [`DaemonConfig`] the worker placed in the VM's user data,
//! rebuilds the pod network and serves the agent surface on TCP for the worker's agent proxy.
//! Requests are relayed to the local agent by the [`Interceptor`].

mod config;
mod daemon;
mod interceptor;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use config::*;
pub use daemon::*;
pub use interceptor::*;
