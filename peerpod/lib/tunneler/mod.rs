//! Tunnels that connect a pod namespace on the worker to its pod VM.
//!
//! Each [`TunnelType`] has a worker half and a pod VM half. The worker half runs inside the CRI
//! flow with the pod namespace as input; the pod VM half replays the [`NetworkConfig`] the worker
//! produced.

mod config;
mod routing;
mod vxlan;

use std::{fmt, net::Ipv4Addr, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{config::RoutingPriorities, PeerpodError, PeerpodResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The transport between a worker and a pod VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    /// A point-to-point VXLAN with a per-pod id.
    #[default]
    Vxlan,

    /// Policy routing over a dedicated secondary interface.
    Routing,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TunnelType {
    /// Connects the pod namespace at `ns_path` on the worker to the pod VM at `pod_node_ips`.
    pub async fn worker_setup(
        &self,
        ns_path: &Path,
        pod_node_ips: &[Ipv4Addr],
        config: &NetworkConfig,
        priorities: &RoutingPriorities,
    ) -> PeerpodResult<()> {
        match self {
            TunnelType::Vxlan => vxlan::worker_setup(ns_path, pod_node_ips, config).await,
            TunnelType::Routing => {
                routing::worker_setup(ns_path, pod_node_ips, config, priorities).await
            }
        }
    }

    /// Undoes [`TunnelType::worker_setup`]. Pieces that are already gone are skipped.
    pub async fn worker_teardown(
        &self,
        ns_path: &Path,
        host_interface: &str,
        config: &NetworkConfig,
        priorities: &RoutingPriorities,
    ) -> PeerpodResult<()> {
        match self {
            TunnelType::Vxlan => vxlan::worker_teardown(ns_path, config).await,
            TunnelType::Routing => {
                routing::worker_teardown(ns_path, host_interface, config, priorities).await
            }
        }
    }

    /// Builds the pod VM end of the tunnel inside the namespace at `ns_path`.
    pub async fn podvm_setup(
        &self,
        ns_path: &Path,
        pod_node_ips: &[Ipv4Addr],
        config: &NetworkConfig,
        priorities: &RoutingPriorities,
    ) -> PeerpodResult<()> {
        match self {
            TunnelType::Vxlan => vxlan::podvm_setup(ns_path, config).await,
            TunnelType::Routing => {
                routing::podvm_setup(ns_path, pod_node_ips, config, priorities).await
            }
        }
    }

    /// Undoes [`TunnelType::podvm_setup`].
    pub async fn podvm_teardown(
        &self,
        ns_path: &Path,
        host_interface: &str,
        config: &NetworkConfig,
    ) -> PeerpodResult<()> {
        match self {
            TunnelType::Vxlan => vxlan::podvm_teardown(ns_path, config).await,
            TunnelType::Routing => routing::podvm_teardown(ns_path, host_interface, config).await,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelType::Vxlan => write!(f, "vxlan"),
            TunnelType::Routing => write!(f, "routing"),
        }
    }
}

impl FromStr for TunnelType {
    type Err = PeerpodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vxlan" => Ok(TunnelType::Vxlan),
            "routing" => Ok(TunnelType::Routing),
            other => Err(PeerpodError::InvalidInput(format!(
                "unknown tunnel type: {other}"
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_type_strings() -> anyhow::Result<()> {
        assert_eq!("vxlan".parse::<TunnelType>()?, TunnelType::Vxlan);
        assert_eq!("Routing".parse::<TunnelType>()?, TunnelType::Routing);
        assert!("geneve".parse::<TunnelType>().is_err());
        assert_eq!(TunnelType::Routing.to_string(), "routing");
        assert_eq!(serde_json::to_string(&TunnelType::Vxlan)?, "\"vxlan\"");
        assert_eq!(TunnelType::default(), TunnelType::Vxlan);
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use config::*;
pub use vxlan::VXLAN_MAX_MTU;
