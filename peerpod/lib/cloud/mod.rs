//! The sandbox lifecycle service.
//!
//! [`CloudService`] keeps the live sandboxes of the node and drives each of them through
//! `CreateVM`, `StartVM` and `StopVM`: reading the pod's annotations, rendering the pod VM's
//! cloud-config, provisioning the VM through a [`Provider`], connecting the pod network to it and
//! running the sandbox's agent proxy.
//!
//! [`Provider`]: crate::provider::Provider

mod annotations;
mod cloudinit;
mod create;
pub mod initdata;
mod sandbox;
mod service;
mod start;
mod stop;

#[cfg(test)]
pub(crate) mod testing;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use annotations::*;
pub use cloudinit::*;
pub use sandbox::*;
pub use service::*;
