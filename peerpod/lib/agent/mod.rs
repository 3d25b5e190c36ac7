//! The in-VM agent's RPC surface: method tables, message views, request rewrites and the
//! [`Redirector`] that forwards the surface to a peer.

mod methods;
mod proto;
mod redirector;
mod rewrite;
pub mod wire;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use methods::*;
pub use proto::*;
pub use redirector::*;
pub use rewrite::*;
