//! The RPC surfaces the worker daemon exposes to the container runtime.
//!
//! `hypervisor.Hypervisor` drives sandboxes through `CreateVM`, `StartVM` and `StopVM`;
//! `podvminfo.PodVMInfo` tells which pod VM hosts a pod. Both are served on one unix socket by
//! [`Server`].

mod proto;
mod server;
mod service;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use proto::*;
pub use server::*;
pub use service::*;
