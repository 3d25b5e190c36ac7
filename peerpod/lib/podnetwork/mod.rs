//! Pod networking on both ends of the tunnel.
//!
//! [`WorkerNode`] inspects a pod namespace on the worker, producing the [`NetworkConfig`] that
//! travels to the pod VM, and installs the worker end of the tunnel. [`PodNode`] replays that
//! config inside the pod VM.
//!
//! [`NetworkConfig`]: crate::tunneler::NetworkConfig

mod common;
mod podnode;
mod traits;
mod workernode;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use common::*;
pub use podnode::*;
pub use traits::*;
pub use workernode::*;
