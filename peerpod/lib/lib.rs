//! `peerpod` runs Kubernetes pod sandboxes on remote cloud VMs.
//!
//! # Overview
//!
//! A worker node hands every pod sandbox to a dedicated VM provisioned from an IaaS provider, while
//! the container runtime keeps driving the sandbox as if it ran locally. The crate provides both
//! halves of that arrangement:
//!
//! - The worker daemon (`peerpod-adaptor`) serves the remote hypervisor surface the runtime calls
//!   into, provisions pod VMs, tunnels the pod network to them and proxies the agent protocol from
//!   a per-sandbox unix socket to the VM.
//! - The pod VM daemon (`podvm-forwarder`) rebuilds the pod network inside the VM and relays the
//!   agent protocol from the worker to the local agent.
//!
//! # Modules
//!
//! - [`netops`] - Network namespace, link, address, route, rule and neighbor operations
//! - [`tunneler`] - The VXLAN and routing tunnels between a worker and its pod VMs
//! - [`podnetwork`] - Inspection of the pod network on the worker and its rebuild in the pod VM
//! - [`ttrpc`] - The framed RPC transport spoken on every surface
//! - [`agent`] - Agent protocol views, method table and the redirector
//! - [`tls`] - TLS settings and the authority issuing pod VM certificates
//! - [`proxy`] - The per-sandbox agent proxy on the worker
//! - [`provider`] - The IaaS backends pod VMs come from
//! - [`cloud`] - The sandbox lifecycle service
//! - [`hypervisor`] - The RPC surfaces the container runtime calls
//! - [`forwarder`] - The agent protocol forwarder in the pod VM
//! - [`cli`] - Command-line arguments of the binaries
//! - [`config`] - Configuration types and defaults
//! - [`utils`] - Retry, digest and path helpers
//!
//! # Platform Support
//!
//! - Linux only: the pod network is built with netlink inside network namespaces.

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod agent;
pub mod cli;
pub mod cloud;
pub mod config;
pub mod forwarder;
pub mod hypervisor;
pub mod netops;
pub mod podnetwork;
pub mod provider;
pub mod proxy;
pub mod tls;
pub mod ttrpc;
pub mod tunneler;
pub mod utils;

pub use error::*;
