//! Transport security between the worker node and the pod VMs.
//!
//! The worker dials every pod VM over mutually authenticated TLS: pod VMs present a certificate
//! issued by an in-memory [`CaService`] for their instance name and verify the worker's client
//! identity in turn.

mod ca;
mod config;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use ca::*;
pub use config::*;
