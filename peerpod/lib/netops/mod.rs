//! Typed operations on Linux network namespaces.
//!
//! A [`Namespace`] owns a netlink connection created inside the namespace it refers to, so links,
//! addresses, routes, rules, neighbors and tc redirects are all manipulated without switching the
//! calling thread. Only iptables and sysctl need the thread to enter the namespace, which
//! [`Namespace::run_blocking`] does on a blocking thread.
//!
//! Every failure is either `AlreadyExists`, `NotFound` or some other kernel error; callers lean on
//! the first two to make setup and teardown idempotent.

mod addr;
mod hwaddr;
mod iptables;
mod link;
mod namespace;
mod neighbor;
mod route;
mod rule;
mod sysctl;
mod tc;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use hwaddr::*;
pub use iptables::*;
pub use link::*;
pub use namespace::*;
pub use neighbor::*;
pub use route::*;
pub use rule::*;
