//! A native implementation of ttrpc, the lightweight gRPC-alike spoken by the container runtime,
//! the hypervisor surface and the in-VM agent.
//!
//! Messages are protobuf envelopes carried in length-prefixed frames over any byte stream.

mod client;
mod codec;
mod proto;
mod server;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use client::*;
pub use codec::*;
pub use proto::*;
pub use server::*;
