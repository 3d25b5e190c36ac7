//! The worker-side agent proxy.
//!
//! Each sandbox gets an [`AgentProxy`] that serves the in-VM agent's surface on a per-sandbox
//! unix socket and forwards it over TCP, optionally mutually authenticated TLS, to the forwarder
//! running in the pod VM. [`ProxyService`] applies the worker-side request policy on the way.

mod agent_proxy;
mod dialer;
mod factory;
mod service;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use agent_proxy::*;
pub use dialer::*;
pub use factory::*;
pub use service::*;
